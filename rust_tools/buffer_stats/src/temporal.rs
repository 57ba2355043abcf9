//! Per-pixel statistics across acquisitions rather than across space.

use crate::error::Result;
use crate::focal::{mean_band_name, std_dev_band_name, ReducedSurface, RunningStats};
use crate::grid::GridSpec;
use crate::quality::MaskedTile;
use log::debug;
use ndarray::{Array2, Zip};

/// Valid samples of one band from every tile covering (lon, lat), in tile order.
fn samples_at(sources: &[(&MaskedTile, &Array2<f32>)], lon: f64, lat: f64) -> Vec<f32> {
    sources
        .iter()
        .filter_map(|(tile, data)| {
            let (r, c) = tile.tile().grid().index_of(lon, lat)?;
            tile.valid_value(data, r, c)
        })
        .collect()
}

fn band_sources<'a>(
    tiles: impl IntoIterator<Item = &'a MaskedTile>,
    grid: &GridSpec,
    band: &str,
) -> Result<Vec<(&'a MaskedTile, &'a Array2<f32>)>> {
    let target = grid.bounds();
    tiles
        .into_iter()
        .filter(|t| t.tile().bounds().overlaps_wrapped(&target))
        .map(|t| t.tile().band(band).map(|b| (t, b)))
        .collect()
}

/// Mean and sample stdDev of each pixel over every acquisition with a valid
/// value there. Pixels with no valid acquisition are NaN.
pub fn reduce_temporal<'a, I>(tiles: I, grid: &GridSpec, band: &str) -> Result<ReducedSurface>
where
    I: IntoIterator<Item = &'a MaskedTile>,
{
    let sources = band_sources(tiles, grid, band)?;
    debug!(
        "Temporal reduction of {} over {} acquisitions on {}x{} grid",
        band,
        sources.len(),
        grid.width,
        grid.height
    );

    let mut means = Array2::from_elem(grid.dim(), f32::NAN);
    let mut std_devs = Array2::from_elem(grid.dim(), f32::NAN);
    Zip::indexed(&mut means)
        .and(&mut std_devs)
        .par_for_each(|(row, col), mean, std_dev| {
            let (lon, lat) = grid.pixel_center(row, col);
            let stats: RunningStats = samples_at(&sources, lon, lat).into_iter().map(f64::from).collect();
            if let (Some(m), Some(s)) = (stats.mean(), stats.sample_std_dev()) {
                *mean = m as f32;
                *std_dev = s as f32;
            }
        });

    ReducedSurface::new(grid.clone())
        .with_band(mean_band_name(band), means)?
        .with_band(std_dev_band_name(band), std_devs)
}

/// Median of the values; an even count averages the two middle values.
pub fn median(values: &mut [f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f32::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

/// Per-pixel median of every valid acquisition, ignoring mosaic order.
pub fn median_composite<'a, I>(tiles: I, grid: &GridSpec, band: &str) -> Result<Array2<f32>>
where
    I: IntoIterator<Item = &'a MaskedTile>,
{
    let sources = band_sources(tiles, grid, band)?;
    let mut composite = Array2::from_elem(grid.dim(), f32::NAN);
    Zip::indexed(&mut composite).par_for_each(|(row, col), value| {
        let (lon, lat) = grid.pixel_center(row, col);
        if let Some(m) = median(&mut samples_at(&sources, lon, lat)) {
            *value = m;
        }
    });
    Ok(composite)
}
