//! One parametrised run over every (buffer radius, variable) pair.
//!
//! Units share only the read-only source and point set. A failed unit is
//! reported and the rest carry on.

use crate::config::{Config, ReducerMode, VariableDescriptor};
use crate::error::{AggregationError, Result};
use crate::export::{clip, export_with_retry, ClippedSurface, Exporter};
use crate::focal::{mean_band_name, median_band_name, reduce_neighborhood_within, std_dev_band_name, ReducedSurface};
use crate::geodesic::{buffer, intersects, Bounds, Buffer, PointLocation};
use crate::grid::GridSpec;
use crate::mosaic::{mosaic, order_tiles};
use crate::quality::{self, MaskedTile};
use crate::region::{reduce_region, region_surface, RegionStats};
use crate::render::{render_rgba, Legend, RenderMetadata};
use crate::source::{fetch_with_retry, RasterSource};
use crate::temporal::{median_composite, reduce_temporal};
use log::{debug, error, info, warn};
use ndarray::Array2;
use rayon::prelude::*;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What happened to one buffer within a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BufferOutcome {
    /// `valid_pixels` counts the samples behind the statistics: clipped
    /// surface pixels, or pooled tile pixels in whole-buffer mode.
    Reduced { valid_pixels: usize },
    EmptyIntersection,
    InsufficientSamples,
    /// Reduced, but the surface could not be written.
    ExportFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferReport {
    pub point_id: String,
    pub destination: String,
    pub outcome: BufferOutcome,
    /// Buffer-wide statistics; whole-buffer mode only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub variable: String,
    pub dataset_id: String,
    pub radius_m: f64,
    pub status: UnitStatus,
    pub buffers: Vec<BufferReport>,
    pub render: Vec<RenderMetadata>,
    pub elapsed_ms: u64,
}

impl UnitReport {
    pub fn succeeded(&self) -> bool {
        self.status == UnitStatus::Succeeded
    }

    fn count(&self, pred: impl Fn(&BufferOutcome) -> bool) -> usize {
        self.buffers.iter().filter(|b| pred(&b.outcome)).count()
    }
}

/// Outcome of a whole run, one report per unit in (radius, variable) order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub units: Vec<UnitReport>,
}

impl RunSummary {
    pub fn succeeded(&self) -> usize {
        self.units.iter().filter(|u| u.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.units.len() - self.succeeded()
    }

    pub fn unit(&self, variable: &str, radius_m: f64) -> Option<&UnitReport> {
        self.units
            .iter()
            .find(|u| u.variable == variable && u.radius_m == radius_m)
    }

    pub fn log(&self) {
        info!(
            "Run finished: {} units succeeded, {} failed",
            self.succeeded(),
            self.failed()
        );
        for unit in &self.units {
            match &unit.status {
                UnitStatus::Succeeded => info!(
                    "  {} @ {} m: {} reduced, {} empty, {} without samples",
                    unit.variable,
                    unit.radius_m,
                    unit.count(|o| matches!(o, BufferOutcome::Reduced { .. })),
                    unit.count(|o| *o == BufferOutcome::EmptyIntersection),
                    unit.count(|o| *o == BufferOutcome::InsufficientSamples),
                ),
                UnitStatus::Failed(reason) => error!(
                    "  {} @ {} m failed ({} of {} buffers not exported): {}",
                    unit.variable,
                    unit.radius_m,
                    unit.count(|o| matches!(o, BufferOutcome::ExportFailed { .. })),
                    unit.buffers.len(),
                    reason
                ),
            }
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} units: {} succeeded, {} failed",
            self.units.len(),
            self.succeeded(),
            self.failed()
        )
    }
}

/// `<variable>/<radius>m`, the export prefix shared by a unit's surfaces.
pub fn unit_destination(variable: &str, radius_m: f64) -> String {
    format!("{}/{}m", variable, radius_m)
}

fn buffer_destination(variable: &str, radius_m: f64, point_id: &str) -> String {
    format!("{}/{}", unit_destination(variable, radius_m), point_id.replace('/', "_"))
}

/// Layer names and legends for a unit's output bands: mean, stdDev and,
/// when configured, the median composite.
pub fn render_metadata(variable: &VariableDescriptor, radius_m: f64) -> Vec<RenderMetadata> {
    let band = variable.band.to_uppercase();
    let mut layers = vec![
        RenderMetadata {
            layer: format!("Mean {} {} meter", band, radius_m),
            vis: variable.mean_vis.clone(),
            legend: Legend::for_vis(format!("Mean {}", variable.title), &variable.mean_vis),
        },
        RenderMetadata {
            layer: format!("StdDev {} {} meter", band, radius_m),
            vis: variable.std_dev_vis.clone(),
            legend: Legend::for_vis(format!("StdDev {}", variable.title), &variable.std_dev_vis),
        },
    ];
    if let Some(vis) = &variable.median_vis {
        layers.push(RenderMetadata {
            layer: format!("Median {} {} meter", band, radius_m),
            vis: vis.clone(),
            legend: Legend::for_vis(format!("Median {}", variable.title), vis),
        });
    }
    layers
}

/// A variable's tiles, masked and in mosaic order, or why loading failed.
type VariableTiles = std::result::Result<Vec<MaskedTile>, String>;

pub struct Pipeline {
    config: Config,
    source: Arc<dyn RasterSource>,
    exporter: Arc<dyn Exporter>,
}

impl Pipeline {
    pub fn new(config: Config, source: Arc<dyn RasterSource>, exporter: Arc<dyn Exporter>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            source,
            exporter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Every (radius, variable index) pair, radius-major.
    fn units(&self) -> Vec<(f64, usize)> {
        self.config
            .radii
            .iter()
            .flat_map(|&r| (0..self.config.variables.len()).map(move |v| (r, v)))
            .collect()
    }

    /// Run all units concurrently on the current rayon pool.
    ///
    /// Each variable's tiles are fetched and masked once, limited to the
    /// neighborhood of the points, and shared by that variable's units.
    pub fn run(&self, points: &[PointLocation]) -> RunSummary {
        let units = self.units();
        info!(
            "Running {} units ({} radii x {} variables) over {} points",
            units.len(),
            self.config.radii.len(),
            self.config.variables.len(),
            points.len()
        );

        let areas = self.fetch_areas(points);
        let tiles: Vec<VariableTiles> = self
            .config
            .variables
            .par_iter()
            .map(|variable| {
                self.load_tiles(variable, &areas).map_err(|e| {
                    error!("Loading tiles for {} failed: {}", variable.name, e);
                    e.to_string()
                })
            })
            .collect();

        let reports = units
            .par_iter()
            .map(|&(radius, v)| self.run_unit(&self.config.variables[v], radius, points, &tiles[v]))
            .collect();
        RunSummary { units: reports }
    }

    /// Extent around each point that any unit may read: the largest buffer,
    /// padded by the kernel radius in kernel mode.
    fn fetch_areas(&self, points: &[PointLocation]) -> Vec<Bounds> {
        let Some(max_radius) = self.config.radii.iter().copied().reduce(f64::max) else {
            return Vec::new();
        };
        let padding = match self.config.mode {
            ReducerMode::Kernel => self
                .config
                .radii
                .iter()
                .map(|&r| self.config.kernel_radius_for(r))
                .fold(0.0, f64::max),
            ReducerMode::WholeBuffer | ReducerMode::Temporal => 0.0,
        };

        points
            .iter()
            .filter_map(|point| match buffer(point, max_radius) {
                Ok(buf) => Some(buf.polygon.bbox().expand_meters(padding)),
                Err(e) => {
                    warn!("No fetch area for point {}: {}", point.id, e);
                    None
                }
            })
            .collect()
    }

    fn load_tiles(&self, variable: &VariableDescriptor, areas: &[Bounds]) -> Result<Vec<MaskedTile>> {
        let tiles = fetch_with_retry(
            &self.source,
            &variable.dataset_id,
            &self.config.time_range,
            areas,
            &self.config.fetch,
        )?;
        let mut masked = tiles
            .into_iter()
            .map(|t| quality::apply(t, &variable.predicates))
            .collect::<Result<Vec<_>>>()?;
        order_tiles(&mut masked, self.config.mosaic_order);
        info!(
            "Variable {}: {} tiles near {} points",
            variable.name,
            masked.len(),
            areas.len()
        );
        Ok(masked)
    }

    fn run_unit(
        &self,
        variable: &VariableDescriptor,
        radius_m: f64,
        points: &[PointLocation],
        tiles: &VariableTiles,
    ) -> UnitReport {
        let start = Instant::now();
        info!("Unit {} @ {} m: starting", variable.name, radius_m);

        let mut buffers = Vec::with_capacity(points.len());
        let status = match tiles {
            Ok(masked) => match self.process_unit(variable, radius_m, points, masked, &mut buffers) {
                Ok(()) => UnitStatus::Succeeded,
                Err(e) => {
                    error!("Unit {} @ {} m failed: {}", variable.name, radius_m, e);
                    UnitStatus::Failed(e.to_string())
                }
            },
            Err(reason) => UnitStatus::Failed(reason.clone()),
        };

        let elapsed = start.elapsed();
        info!(
            "Unit {} @ {} m: {} buffers in {:.2}s",
            variable.name,
            radius_m,
            buffers.len(),
            elapsed.as_secs_f64()
        );
        UnitReport {
            variable: variable.name.clone(),
            dataset_id: variable.dataset_id.clone(),
            radius_m,
            status,
            buffers,
            render: render_metadata(variable, radius_m),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Reduce and export every point's buffer. A failed export is recorded
    /// on its buffer and the remaining points still run; the unit then fails.
    fn process_unit(
        &self,
        variable: &VariableDescriptor,
        radius_m: f64,
        points: &[PointLocation],
        masked: &[MaskedTile],
        reports: &mut Vec<BufferReport>,
    ) -> Result<()> {
        let layers = render_metadata(variable, radius_m);
        let mut failed_exports = 0;

        for point in points {
            let buf = buffer(point, radius_m)?;
            let destination = buffer_destination(&variable.name, radius_m, &point.id);
            let (surface, mut outcome, region) = self.reduce_buffer(variable, &buf, masked)?;
            if let Err(e) = self.export(&surface, &destination, &layers) {
                error!("Buffer {}: {}", destination, e);
                failed_exports += 1;
                outcome = BufferOutcome::ExportFailed { reason: e.to_string() };
            }
            reports.push(BufferReport {
                point_id: point.id.clone(),
                destination,
                outcome,
                region,
            });
        }

        let unit = unit_destination(&variable.name, radius_m);
        self.exporter.export_metadata(&unit, &layers)?;
        if failed_exports > 0 {
            return Err(AggregationError::ExportFailure {
                destination: unit,
                reason: format!("{} of {} buffer exports failed", failed_exports, points.len()),
            });
        }
        Ok(())
    }

    /// Write the surface, then an RGBA preview of each displayed band when
    /// previews are enabled.
    fn export(&self, surface: &ClippedSurface, destination: &str, layers: &[RenderMetadata]) -> Result<()> {
        let options = &self.config.export;
        export_with_retry(
            self.exporter.as_ref(),
            surface,
            destination,
            options.retries,
            Duration::from_millis(options.backoff_ms),
        )?;
        if !options.previews {
            return Ok(());
        }
        for layer in layers {
            if surface.band(&layer.vis.band).is_none() {
                continue;
            }
            let rgba = render_rgba(surface, &layer.vis)?;
            self.exporter
                .export_preview(destination, &layer.vis.band, surface.grid(), &rgba)?;
        }
        Ok(())
    }

    /// Reduce one buffer to its clipped surface.
    fn reduce_buffer(
        &self,
        variable: &VariableDescriptor,
        buf: &Buffer,
        masked: &[MaskedTile],
    ) -> Result<(ClippedSurface, BufferOutcome, Option<RegionStats>)> {
        let band = variable.band.as_str();
        let bbox = buf.polygon.bbox();
        let window = GridSpec::window_for_bounds(&bbox, variable.pixel_size_deg)?;
        let intersecting: Vec<&MaskedTile> = masked
            .iter()
            .filter(|t| intersects(&t.tile().bounds(), &buf.polygon))
            .collect();

        if intersecting.is_empty() {
            warn!(
                "{}",
                AggregationError::EmptyIntersection {
                    point_id: buf.center.id.clone(),
                    radius: buf.radius_m
                }
            );
            let empty = nodata_surface(&window, variable)?;
            return Ok((empty, BufferOutcome::EmptyIntersection, None));
        }
        debug!(
            "Buffer {} @ {} m intersects {} of {} tiles",
            buf.center.id,
            buf.radius_m,
            intersecting.len(),
            masked.len()
        );

        let (reduced, region) = match self.config.mode {
            ReducerMode::Kernel => {
                let kernel_radius = self.config.kernel_radius_for(buf.radius_m);
                // Neighbors up to one kernel radius beyond the buffer feed its edge pixels
                let padded = GridSpec::window_for_bounds(&bbox.expand_meters(kernel_radius), variable.pixel_size_deg)?;
                let composite = mosaic(masked, &padded, &[band])?;
                (reduce_neighborhood_within(&composite, kernel_radius, &window)?, None)
            }
            ReducerMode::WholeBuffer => {
                let stats = reduce_region(masked, buf, band)?;
                (region_surface(&window, band, &stats)?, Some(stats))
            }
            ReducerMode::Temporal => (reduce_temporal(intersecting.iter().copied(), &window, band)?, None),
        };
        let reduced = match variable.median_vis {
            Some(_) => {
                let median = median_composite(intersecting.iter().copied(), &window, band)?;
                reduced.with_band(median_band_name(band), median)?
            }
            None => reduced,
        };

        let clipped = clip(&reduced, &buf.polygon);
        let valid_pixels = match &region {
            Some(stats) => stats.count,
            None => clipped.valid_count(&mean_band_name(band)),
        };
        let outcome = if valid_pixels == 0 {
            // Region reduction already warned
            if region.is_none() {
                warn!(
                    "{} (buffer {} m around {})",
                    AggregationError::InsufficientSamples {
                        band: variable.band.clone()
                    },
                    buf.radius_m,
                    buf.center.id
                );
            }
            BufferOutcome::InsufficientSamples
        } else {
            BufferOutcome::Reduced { valid_pixels }
        };
        Ok((clipped, outcome, region))
    }
}

fn nodata_surface(grid: &GridSpec, variable: &VariableDescriptor) -> Result<ReducedSurface> {
    let empty = || Array2::from_elem(grid.dim(), f32::NAN);
    let surface = ReducedSurface::new(grid.clone())
        .with_band(mean_band_name(&variable.band), empty())?
        .with_band(std_dev_band_name(&variable.band), empty())?;
    match variable.median_vis {
        Some(_) => surface.with_band(median_band_name(&variable.band), empty()),
        None => Ok(surface),
    }
}
