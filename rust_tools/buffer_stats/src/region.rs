//! Whole-buffer reduction: one mean/stdDev pair per buffer.

use crate::error::{AggregationError, Result};
use crate::focal::{mean_band_name, std_dev_band_name, ReducedSurface, RunningStats};
use crate::geodesic::{intersects, Bounds, Buffer};
use crate::grid::GridSpec;
use crate::quality::MaskedTile;
use log::{debug, warn};
use ndarray::Array2;
use serde::Serialize;
use std::ops::Range;

/// Buffer-wide statistics of one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegionStats {
    pub count: usize,
    pub mean: Option<f64>,
    pub std_dev: Option<f64>,
}

impl From<RunningStats> for RegionStats {
    fn from(stats: RunningStats) -> Self {
        Self {
            count: stats.count(),
            mean: stats.mean(),
            std_dev: stats.sample_std_dev(),
        }
    }
}

/// Row and column ranges of `grid` whose pixels can fall inside `bounds`.
fn pixel_window(grid: &GridSpec, bounds: &Bounds) -> Option<(Range<usize>, Range<usize>)> {
    let gt = grid.geotransform;
    let col_start = ((bounds.min_lon - gt[0]) / gt[1]).floor().max(0.0) as usize;
    let col_end = (((bounds.max_lon - gt[0]) / gt[1]).ceil().max(0.0) as usize).min(grid.width);
    let row_start = ((bounds.max_lat - gt[3]) / gt[5]).floor().max(0.0) as usize;
    let row_end = (((bounds.min_lat - gt[3]) / gt[5]).ceil().max(0.0) as usize).min(grid.height);
    if col_start >= col_end || row_start >= row_end {
        return None;
    }
    Some((row_start..row_end, col_start..col_end))
}

/// Mean and sample stdDev of every valid pixel of every tile intersecting the
/// buffer. Overlapping tiles all contribute; no mosaicking takes place.
pub fn reduce_region(tiles: &[MaskedTile], buffer: &Buffer, band: &str) -> Result<RegionStats> {
    let bbox = buffer.polygon.bbox();
    let mut stats = RunningStats::new();
    let mut contributing = 0;

    for tile in tiles {
        if !intersects(&tile.tile().bounds(), &buffer.polygon) {
            continue;
        }
        contributing += 1;
        let data = tile.tile().band(band)?;
        let grid = tile.tile().grid();
        // Buffers near the antimeridian reach tiles a whole turn away
        for dlon in tile.tile().bounds().wrapped_overlaps(&bbox) {
            let Some((rows, cols)) = pixel_window(grid, &bbox.shifted(-dlon)) else {
                continue;
            };
            for r in rows {
                for c in cols.clone() {
                    let Some(value) = tile.valid_value(data, r, c) else {
                        continue;
                    };
                    let (lon, lat) = grid.pixel_center(r, c);
                    if buffer.polygon.contains(lon + dlon, lat) {
                        stats.push(value as f64);
                    }
                }
            }
        }
    }

    debug!(
        "Region reduction of {} around {}: {} samples from {} tiles",
        band,
        buffer.center.id,
        stats.count(),
        contributing
    );
    if stats.count() == 0 {
        warn!(
            "{} (buffer {} m around {})",
            AggregationError::InsufficientSamples {
                band: band.to_string()
            },
            buffer.radius_m,
            buffer.center.id
        );
    }

    Ok(stats.into())
}

/// Paint region statistics over a grid as constant `<var>_mean` and
/// `<var>_stdDev` bands, ready for clipping to the buffer.
pub fn region_surface(grid: &GridSpec, variable: &str, stats: &RegionStats) -> Result<ReducedSurface> {
    let fill = |v: Option<f64>| Array2::from_elem(grid.dim(), v.map_or(f32::NAN, |x| x as f32));
    ReducedSurface::new(grid.clone())
        .with_band(mean_band_name(variable), fill(stats.mean))?
        .with_band(std_dev_band_name(variable), fill(stats.std_dev))
}
