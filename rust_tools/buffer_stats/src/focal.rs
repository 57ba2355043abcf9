use crate::error::{AggregationError, Result};
use crate::geodesic::{haversine_distance, radius_in_cells};
use crate::grid::GridSpec;
use crate::mosaic::Mosaic;
use log::{debug, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Streaming mean and variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Bessel-corrected (N-1) standard deviation. A single sample has zero
    /// spread; no samples has none.
    pub fn sample_std_dev(&self) -> Option<f64> {
        match self.count {
            0 => None,
            1 => Some(0.0),
            n => Some((self.m2 / (n - 1) as f64).max(0.0).sqrt()),
        }
    }
}

impl FromIterator<f64> for RunningStats {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut stats = RunningStats::new();
        for v in iter {
            stats.push(v);
        }
        stats
    }
}

pub fn mean_band_name(variable: &str) -> String {
    format!("{}_mean", variable)
}

pub fn std_dev_band_name(variable: &str) -> String {
    format!("{}_stdDev", variable)
}

pub fn median_band_name(variable: &str) -> String {
    format!("{}_median", variable)
}

/// Reducer output: `<var>_mean` and `<var>_stdDev` bands per input band.
/// No-data pixels are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedSurface {
    grid: GridSpec,
    bands: BTreeMap<String, Array2<f32>>,
}

impl ReducedSurface {
    pub fn new(grid: GridSpec) -> Self {
        Self {
            grid,
            bands: BTreeMap::new(),
        }
    }

    pub fn with_band(mut self, name: impl Into<String>, data: Array2<f32>) -> Result<Self> {
        let name = name.into();
        if data.dim() != self.grid.dim() {
            return Err(AggregationError::GridMismatch(name));
        }
        self.bands.insert(name, data);
        Ok(self)
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn band(&self, name: &str) -> Option<&Array2<f32>> {
        self.bands.get(name)
    }

    pub fn bands(&self) -> impl Iterator<Item = (&str, &Array2<f32>)> {
        self.bands.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn valid_count(&self, name: &str) -> usize {
        self.bands
            .get(name)
            .map_or(0, |b| b.iter().filter(|v| !v.is_nan()).count())
    }

    pub(crate) fn bands_mut(&mut self) -> impl Iterator<Item = &mut Array2<f32>> {
        self.bands.values_mut()
    }
}

/// Gather the valid pixels whose centers lie within `radius_meters` of the
/// center of (center_row, center_col), measured on the ground.
pub fn neighborhood_stats(
    data: &Array2<f32>,
    grid: &GridSpec,
    center_row: usize,
    center_col: usize,
    radius_meters: f64,
) -> RunningStats {
    let (nrows, ncols) = data.dim();
    let (center_lon, center_lat) = grid.pixel_center(center_row, center_col);

    let (row_radius, _) =
        radius_in_cells(radius_meters, grid.pixel_width(), grid.pixel_height(), center_lat);
    // Columns span more cells on the poleward edge of the window
    let poleward_lat = center_lat.abs() + row_radius as f64 * grid.pixel_height();
    let (_, col_radius) = radius_in_cells(
        radius_meters,
        grid.pixel_width(),
        grid.pixel_height(),
        poleward_lat.min(89.9),
    );

    let row_min = center_row.saturating_sub(row_radius);
    let row_max = (center_row + row_radius + 1).min(nrows);
    let col_min = center_col.saturating_sub(col_radius);
    let col_max = (center_col + col_radius + 1).min(ncols);

    let mut stats = RunningStats::new();
    for r in row_min..row_max {
        for c in col_min..col_max {
            let value = data[[r, c]];
            if value.is_nan() {
                continue;
            }
            let (lon, lat) = grid.pixel_center(r, c);
            if haversine_distance(center_lat, center_lon, lat, lon) <= radius_meters {
                stats.push(value as f64);
            }
        }
    }
    stats
}

/// Per-pixel mean and stdDev of one band over a circular ground kernel, for
/// the `out_dim` pixels starting at `offset`. Neighbors come from all of `data`.
fn reduce_band(
    data: &Array2<f32>,
    grid: &GridSpec,
    radius_meters: f64,
    offset: (usize, usize),
    out_dim: (usize, usize),
) -> Result<(Array2<f32>, Array2<f32>)> {
    let (row_off, col_off) = offset;
    let (nrows, ncols) = out_dim;

    // Process rows in parallel
    let rows: Vec<Vec<(f32, f32)>> = (0..nrows)
        .into_par_iter()
        .map(|row| {
            (0..ncols)
                .map(|col| {
                    let stats = neighborhood_stats(data, grid, row + row_off, col + col_off, radius_meters);
                    match (stats.mean(), stats.sample_std_dev()) {
                        (Some(m), Some(s)) => (m as f32, s as f32),
                        _ => (f32::NAN, f32::NAN),
                    }
                })
                .collect()
        })
        .collect();

    let (means, std_devs): (Vec<f32>, Vec<f32>) = rows.into_iter().flatten().unzip();
    let means = Array2::from_shape_vec((nrows, ncols), means)?;
    let std_devs = Array2::from_shape_vec((nrows, ncols), std_devs)?;
    Ok((means, std_devs))
}

/// Neighborhood reduction of every band of the mosaic over a circular kernel
/// of `kernel_radius_meters`. Pixels with no valid neighbor are no-data.
pub fn reduce_neighborhood(mosaic: &Mosaic, kernel_radius_meters: f64) -> Result<ReducedSurface> {
    reduce_neighborhood_within(mosaic, kernel_radius_meters, mosaic.grid())
}

/// As [`reduce_neighborhood`], but only for the pixels of `window`, a
/// sub-grid of the mosaic. Kernels still read every mosaic pixel, so a
/// mosaic padded by the kernel radius gives full neighborhoods at the
/// window edge.
pub fn reduce_neighborhood_within(
    mosaic: &Mosaic,
    kernel_radius_meters: f64,
    window: &GridSpec,
) -> Result<ReducedSurface> {
    if !(kernel_radius_meters > 0.0) || !kernel_radius_meters.is_finite() {
        return Err(AggregationError::InvalidRadius(kernel_radius_meters));
    }

    let grid = mosaic.grid();
    let offset = grid.offset_of(window)?;
    info!(
        "Reducing {}x{} window of {}x{} mosaic with {} m circular kernel",
        window.width, window.height, grid.width, grid.height, kernel_radius_meters
    );

    let mut surface = ReducedSurface::new(window.clone());
    for (variable, data) in mosaic.bands() {
        debug!("Reducing band {}", variable);
        let (means, std_devs) = reduce_band(data, grid, kernel_radius_meters, offset, window.dim())?;

        if means.iter().all(|v| v.is_nan()) {
            warn!(
                "{}",
                AggregationError::InsufficientSamples {
                    band: variable.to_string()
                }
            );
        }

        surface = surface
            .with_band(mean_band_name(variable), means)?
            .with_band(std_dev_band_name(variable), std_devs)?;
    }

    Ok(surface)
}
