use crate::cog::Compression;
use crate::error::{AggregationError, Result};
use crate::focal::ReducedSurface;
use crate::geodesic::Polygon;
use crate::grid::GridSpec;
use crate::io::{write_band_raster, write_rgba_raster};
use crate::render::RenderMetadata;
use log::{debug, info, warn};
use ndarray::Zip;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// A reduced surface whose pixels outside a buffer are no-data.
pub type ClippedSurface = ReducedSurface;

/// Set every pixel whose center falls outside `polygon` to no-data.
/// Clipping twice with the same polygon changes nothing further.
pub fn clip(surface: &ReducedSurface, polygon: &Polygon) -> ClippedSurface {
    let mut clipped = surface.clone();
    let grid = surface.grid().clone();
    for band in clipped.bands_mut() {
        Zip::indexed(band).par_for_each(|(row, col), value| {
            let (lon, lat) = grid.pixel_center(row, col);
            if !polygon.contains(lon, lat) {
                *value = f32::NAN;
            }
        });
    }
    clipped
}

pub trait Exporter: Send + Sync {
    /// Persist a surface under `destination_id`.
    fn export(&self, surface: &ClippedSurface, destination_id: &str) -> Result<()>;

    /// Persist display metadata for the surfaces under `destination_id`.
    fn export_metadata(&self, _destination_id: &str, _layers: &[RenderMetadata]) -> Result<()> {
        Ok(())
    }

    /// Persist an RGBA rendering of one band of the surface under
    /// `destination_id`.
    fn export_preview(&self, _destination_id: &str, _band: &str, _grid: &GridSpec, _rgba: &[u8]) -> Result<()> {
        Ok(())
    }
}

fn export_failure(destination_id: &str, e: AggregationError) -> AggregationError {
    AggregationError::ExportFailure {
        destination: destination_id.to_string(),
        reason: e.to_string(),
    }
}

/// Writes each band as `<root>/<destination_id>/<band>.tif`.
#[derive(Debug, Clone)]
pub struct GeoTiffExporter {
    root: PathBuf,
    compression: Compression,
}

impl GeoTiffExporter {
    pub fn new<P: AsRef<Path>>(root: P, compression: Compression) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            compression,
        }
    }

    fn write_all(&self, surface: &ClippedSurface, destination_id: &str) -> Result<()> {
        let dir = self.root.join(destination_id);
        std::fs::create_dir_all(&dir)?;
        for (name, data) in surface.bands() {
            write_band_raster(&dir.join(format!("{}.tif", name)), data, surface.grid(), self.compression)?;
        }
        Ok(())
    }
}

impl Exporter for GeoTiffExporter {
    fn export(&self, surface: &ClippedSurface, destination_id: &str) -> Result<()> {
        self.write_all(surface, destination_id)
            .map_err(|e| export_failure(destination_id, e))?;
        info!(
            "Exported {} bands to {}",
            surface.band_count(),
            self.root.join(destination_id).display()
        );
        Ok(())
    }

    fn export_metadata(&self, destination_id: &str, layers: &[RenderMetadata]) -> Result<()> {
        write_render_json(&self.root.join(destination_id), layers).map_err(|e| export_failure(destination_id, e))
    }

    fn export_preview(&self, destination_id: &str, band: &str, grid: &GridSpec, rgba: &[u8]) -> Result<()> {
        write_preview(&self.root.join(destination_id), band, grid, rgba).map_err(|e| export_failure(destination_id, e))
    }
}

fn write_render_json(dir: &Path, layers: &[RenderMetadata]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let file = std::fs::File::create(dir.join("render.json"))?;
    serde_json::to_writer_pretty(file, layers)?;
    debug!("Wrote {} render layers to {}", layers.len(), dir.display());
    Ok(())
}

/// `<dir>/<band>_preview.tif`
fn write_preview(dir: &Path, band: &str, grid: &GridSpec, rgba: &[u8]) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    write_rgba_raster(&dir.join(format!("{}_preview.tif", band)), rgba, grid)
}

/// Writes one tiled multi-band GeoTIFF per destination through GDAL.
#[cfg(feature = "gdal")]
#[derive(Debug, Clone)]
pub struct GdalExporter {
    root: PathBuf,
    compression: Compression,
    tile_size: usize,
}

#[cfg(feature = "gdal")]
impl GdalExporter {
    pub fn new<P: AsRef<Path>>(root: P, compression: Compression, tile_size: usize) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            compression,
            tile_size,
        }
    }
}

#[cfg(feature = "gdal")]
impl Exporter for GdalExporter {
    fn export(&self, surface: &ClippedSurface, destination_id: &str) -> Result<()> {
        let path = self.root.join(format!("{}.tif", destination_id));
        let write = || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            crate::cog::write_multiband_gdal(&path, surface, self.compression, self.tile_size)
        };
        write().map_err(|e| export_failure(destination_id, e))
    }

    fn export_metadata(&self, destination_id: &str, layers: &[RenderMetadata]) -> Result<()> {
        write_render_json(&self.root.join(destination_id), layers).map_err(|e| export_failure(destination_id, e))
    }

    fn export_preview(&self, destination_id: &str, band: &str, grid: &GridSpec, rgba: &[u8]) -> Result<()> {
        write_preview(&self.root.join(destination_id), band, grid, rgba).map_err(|e| export_failure(destination_id, e))
    }
}

/// Keeps exported surfaces in memory, in export order.
#[derive(Debug, Default)]
pub struct MemoryExporter {
    surfaces: Mutex<Vec<(String, ClippedSurface)>>,
    metadata: Mutex<Vec<(String, Vec<RenderMetadata>)>>,
    previews: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl MemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn destinations(&self) -> Vec<String> {
        match self.surfaces.lock() {
            Ok(s) => s.iter().map(|(d, _)| d.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn get(&self, destination_id: &str) -> Option<ClippedSurface> {
        let surfaces = self.surfaces.lock().ok()?;
        surfaces
            .iter()
            .find(|(d, _)| d == destination_id)
            .map(|(_, s)| s.clone())
    }

    pub fn metadata(&self, destination_id: &str) -> Option<Vec<RenderMetadata>> {
        let metadata = self.metadata.lock().ok()?;
        metadata
            .iter()
            .find(|(d, _)| d == destination_id)
            .map(|(_, m)| m.clone())
    }

    pub fn preview(&self, destination_id: &str, band: &str) -> Option<Vec<u8>> {
        let previews = self.previews.lock().ok()?;
        previews
            .iter()
            .find(|(d, b, _)| d == destination_id && b == band)
            .map(|(_, _, rgba)| rgba.clone())
    }
}

fn poisoned(destination_id: &str) -> AggregationError {
    AggregationError::ExportFailure {
        destination: destination_id.to_string(),
        reason: "exporter lock poisoned".to_string(),
    }
}

impl Exporter for MemoryExporter {
    fn export(&self, surface: &ClippedSurface, destination_id: &str) -> Result<()> {
        let mut surfaces = self.surfaces.lock().map_err(|_| poisoned(destination_id))?;
        surfaces.push((destination_id.to_string(), surface.clone()));
        debug!("Stored surface {}", destination_id);
        Ok(())
    }

    fn export_metadata(&self, destination_id: &str, layers: &[RenderMetadata]) -> Result<()> {
        let mut metadata = self.metadata.lock().map_err(|_| poisoned(destination_id))?;
        metadata.push((destination_id.to_string(), layers.to_vec()));
        Ok(())
    }

    fn export_preview(&self, destination_id: &str, band: &str, _grid: &GridSpec, rgba: &[u8]) -> Result<()> {
        let mut previews = self.previews.lock().map_err(|_| poisoned(destination_id))?;
        previews.push((destination_id.to_string(), band.to_string(), rgba.to_vec()));
        Ok(())
    }
}

/// Export, retrying transient failures with doubling backoff.
pub fn export_with_retry(
    exporter: &dyn Exporter,
    surface: &ClippedSurface,
    destination_id: &str,
    retries: u32,
    backoff: Duration,
) -> Result<()> {
    let mut delay = backoff;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match exporter.export(surface, destination_id) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt <= retries => {
                warn!(
                    "Export attempt {} to {} failed ({}), retrying",
                    attempt, destination_id, e
                );
                thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geodesic::{buffer, PointLocation};
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn surface() -> ReducedSurface {
        let grid = GridSpec::from_origin(-77.002, 38.002, 0.0002, 20, 20).unwrap();
        ReducedSurface::new(grid)
            .with_band("rh100_mean", Array2::from_elem((20, 20), 20.0))
            .unwrap()
            .with_band("rh100_stdDev", Array2::from_elem((20, 20), 2.0))
            .unwrap()
    }

    fn site_polygon() -> Polygon {
        buffer(&PointLocation::new("serc", 38.0, -77.0), 100.0)
            .unwrap()
            .polygon
    }

    #[test]
    fn test_clip_drops_outside_pixels() {
        let clipped = clip(&surface(), &site_polygon());
        let inside = clipped.valid_count("rh100_mean");
        assert!(inside > 0);
        assert!(inside < 400);
        assert_eq!(inside, clipped.valid_count("rh100_stdDev"));

        let grid = clipped.grid();
        let (r, c) = grid.index_of(-77.0, 38.0).unwrap();
        assert_eq!(clipped.band("rh100_mean").unwrap()[[r, c]], 20.0);
        assert!(clipped.band("rh100_mean").unwrap()[[0, 0]].is_nan());
    }

    #[test]
    fn test_clip_is_idempotent() {
        let polygon = site_polygon();
        let once = clip(&surface(), &polygon);
        let twice = clip(&once, &polygon);
        for (name, band) in once.bands() {
            let again = twice.band(name).unwrap();
            for (a, b) in band.iter().zip(again.iter()) {
                assert!(a == b || (a.is_nan() && b.is_nan()));
            }
        }
        assert_eq!(once.valid_count("rh100_mean"), twice.valid_count("rh100_mean"));
    }

    #[test]
    fn test_geotiff_exporter_writes_band_files() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = GeoTiffExporter::new(dir.path(), Compression::Deflate);
        exporter.export(&surface(), "height/100m/serc").unwrap();
        assert!(dir.path().join("height/100m/serc/rh100_mean.tif").exists());
        assert!(dir.path().join("height/100m/serc/rh100_stdDev.tif").exists());
    }

    #[test]
    fn test_geotiff_exporter_writes_render_json() {
        use crate::render::{Legend, VisParams};

        let dir = tempfile::tempdir().unwrap();
        let exporter = GeoTiffExporter::new(dir.path(), Compression::None);
        let vis = VisParams::new("rh100_mean", 0.0, 100.0, &["white", "#006600"]);
        let layers = vec![RenderMetadata {
            layer: "Mean RH100 100 meter".to_string(),
            legend: Legend::for_vis("Relative height metrics at 100% (m)", &vis),
            vis,
        }];
        exporter.export_metadata("height/100m", &layers).unwrap();

        let text = std::fs::read_to_string(dir.path().join("height/100m/render.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json[0]["vis"]["max"], 100.0);
        assert_eq!(json[0]["legend"]["top"], "≥100");
    }

    #[test]
    fn test_geotiff_exporter_writes_preview() {
        let dir = tempfile::tempdir().unwrap();
        let exporter = GeoTiffExporter::new(dir.path(), Compression::None);
        let s = surface();
        let rgba = vec![0u8; 20 * 20 * 4];
        exporter.export_preview("height/100m/serc", "rh100_mean", s.grid(), &rgba).unwrap();
        let path = dir.path().join("height/100m/serc/rh100_mean_preview.tif");
        assert_eq!(crate::io::read_band_grid(&path).unwrap(), *s.grid());

        let short = exporter.export_preview("height/100m/serc", "rh100_mean", s.grid(), &rgba[..8]);
        assert!(matches!(short, Err(AggregationError::ExportFailure { .. })));
    }

    #[test]
    fn test_geotiff_exporter_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the destination directory should go
        std::fs::write(dir.path().join("blocked"), b"x").unwrap();
        let exporter = GeoTiffExporter::new(dir.path(), Compression::None);
        let result = exporter.export(&surface(), "blocked/serc");
        assert!(matches!(result, Err(AggregationError::ExportFailure { .. })));
    }

    struct FlakyExporter {
        failures_left: AtomicUsize,
        inner: MemoryExporter,
    }

    impl Exporter for FlakyExporter {
        fn export(&self, surface: &ClippedSurface, destination_id: &str) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AggregationError::ExportFailure {
                    destination: destination_id.to_string(),
                    reason: "disk full".to_string(),
                });
            }
            self.inner.export(surface, destination_id)
        }
    }

    #[test]
    fn test_export_retry() {
        let exporter = FlakyExporter {
            failures_left: AtomicUsize::new(1),
            inner: MemoryExporter::new(),
        };
        export_with_retry(&exporter, &surface(), "a", 2, Duration::from_millis(1)).unwrap();
        assert_eq!(exporter.inner.destinations(), vec!["a".to_string()]);

        let stubborn = FlakyExporter {
            failures_left: AtomicUsize::new(5),
            inner: MemoryExporter::new(),
        };
        let result = export_with_retry(&stubborn, &surface(), "b", 2, Duration::from_millis(1));
        assert!(result.is_err());
        assert!(stubborn.inner.get("b").is_none());
    }
}
