//! Raster sources: where tiles for a dataset come from.

use crate::error::{AggregationError, Result};
use crate::geodesic::Bounds;
use crate::io::{read_band_grid, read_band_raster};
use crate::tile::RasterTile;
use chrono::NaiveDate;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Lazy sequence of tiles. Each item decodes on demand.
pub type TileStream<'a> = Box<dyn Iterator<Item = Result<RasterTile>> + 'a>;

/// Inclusive acquisition-date window. Open ends are unbounded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    #[serde(default)]
    pub start: Option<NaiveDate>,
    #[serde(default)]
    pub end: Option<NaiveDate>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

pub trait RasterSource: Send + Sync {
    /// Tiles of `dataset_id` acquired within `range`.
    ///
    /// Unknown datasets fail with `SourceUnavailable`; a known dataset with no
    /// tiles in range yields an empty stream.
    fn fetch(&self, dataset_id: &str, range: &TimeRange) -> Result<TileStream<'_>>;

    /// As [`fetch`](Self::fetch), keeping only tiles that overlap one of
    /// `areas`. No areas means no spatial filter. Sources that can see tile
    /// extents before decoding should override this to skip the decode.
    fn fetch_within(&self, dataset_id: &str, range: &TimeRange, areas: &[Bounds]) -> Result<TileStream<'_>> {
        let stream = self.fetch(dataset_id, range)?;
        if areas.is_empty() {
            return Ok(stream);
        }
        let areas = areas.to_vec();
        Ok(Box::new(stream.filter(move |tile| match tile {
            Ok(t) => overlaps_any(&t.bounds(), &areas),
            Err(_) => true,
        })))
    }
}

/// True when `bounds` overlaps any of `areas`, allowing for the antimeridian.
pub fn overlaps_any(bounds: &Bounds, areas: &[Bounds]) -> bool {
    areas.iter().any(|a| bounds.overlaps_wrapped(a))
}

/// In-memory catalogue of tiles keyed by dataset id.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    datasets: HashMap<String, Vec<RasterTile>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset, possibly with no tiles.
    pub fn add_dataset(&mut self, dataset_id: impl Into<String>) {
        self.datasets.entry(dataset_id.into()).or_default();
    }

    pub fn insert(&mut self, dataset_id: impl Into<String>, tile: RasterTile) {
        self.datasets.entry(dataset_id.into()).or_default().push(tile);
    }
}

impl RasterSource for MemorySource {
    fn fetch(&self, dataset_id: &str, range: &TimeRange) -> Result<TileStream<'_>> {
        let tiles = self
            .datasets
            .get(dataset_id)
            .ok_or_else(|| AggregationError::SourceUnavailable(dataset_id.to_string()))?;
        let range = range.clone();
        Ok(Box::new(
            tiles
                .iter()
                .filter(move |t| range.contains(t.acquired))
                .cloned()
                .map(Ok),
        ))
    }
}

#[derive(Debug, Clone)]
struct TileEntry {
    name: String,
    acquired: NaiveDate,
    band_files: Vec<(String, PathBuf)>,
}

/// Tiles stored on disk as single-band GeoTIFFs:
/// `<root>/<dataset slug>/<YYYY-MM-DD>_<name>/<band>.tif`.
///
/// The directory tree is indexed up front; pixel data is read only when a
/// tile is pulled from the stream.
#[derive(Debug)]
pub struct DirectorySource {
    root: PathBuf,
    index: HashMap<String, Vec<TileEntry>>,
}

/// Directory name used for a dataset id (`/` is not allowed in names).
pub fn dataset_slug(dataset_id: &str) -> String {
    dataset_id.replace('/', "_")
}

impl DirectorySource {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        info!("Indexing tile directory: {}", root.display());

        let mut index = HashMap::new();
        for dataset_dir in std::fs::read_dir(&root)? {
            let dataset_dir = dataset_dir?.path();
            if !dataset_dir.is_dir() {
                continue;
            }
            let Some(slug) = dataset_dir.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let entries = Self::index_dataset(&dataset_dir)?;
            debug!("Dataset {}: {} tiles", slug, entries.len());
            index.insert(slug.to_string(), entries);
        }

        info!("Indexed {} datasets", index.len());
        Ok(Self { root, index })
    }

    fn index_dataset(dir: &Path) -> Result<Vec<TileEntry>> {
        let mut entries = Vec::new();
        for tile_dir in std::fs::read_dir(dir)? {
            let tile_dir = tile_dir?.path();
            if !tile_dir.is_dir() {
                continue;
            }
            let Some(name) = tile_dir.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            let acquired = match name.get(..10).map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d")) {
                Some(Ok(date)) => date,
                _ => {
                    warn!("Skipping tile directory without date prefix: {}", tile_dir.display());
                    continue;
                }
            };

            let mut band_files = Vec::new();
            for file in std::fs::read_dir(&tile_dir)? {
                let path = file?.path();
                let is_tiff = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"));
                if !is_tiff {
                    continue;
                }
                if let Some(band) = path.file_stem().and_then(|s| s.to_str()) {
                    band_files.push((band.to_string(), path.clone()));
                }
            }
            band_files.sort();

            entries.push(TileEntry {
                name: name.to_string(),
                acquired,
                band_files,
            });
        }
        entries.sort_by(|a, b| (a.acquired, &a.name).cmp(&(b.acquired, &b.name)));
        Ok(entries)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load_tile(entry: &TileEntry) -> Result<RasterTile> {
        debug!("Loading tile {}", entry.name);
        let mut tile: Option<RasterTile> = None;
        for (band, path) in &entry.band_files {
            let (data, metadata) = read_band_raster(path)?;
            tile = Some(match tile {
                None => RasterTile::new(entry.name.clone(), entry.acquired, metadata.grid)
                    .with_band(band.clone(), data)?,
                Some(t) => {
                    if t.grid() != &metadata.grid {
                        return Err(AggregationError::GridMismatch(entry.name.clone()));
                    }
                    t.with_band(band.clone(), data)?
                }
            });
        }
        tile.ok_or_else(|| AggregationError::InvalidGeoTiff(format!("tile {} has no bands", entry.name)))
    }
}

impl RasterSource for DirectorySource {
    fn fetch(&self, dataset_id: &str, range: &TimeRange) -> Result<TileStream<'_>> {
        self.fetch_within(dataset_id, range, &[])
    }

    /// Tile extents come from the first band's header, so tiles outside
    /// every area are never decoded.
    fn fetch_within(&self, dataset_id: &str, range: &TimeRange, areas: &[Bounds]) -> Result<TileStream<'_>> {
        let entries = self
            .index
            .get(&dataset_slug(dataset_id))
            .ok_or_else(|| AggregationError::SourceUnavailable(dataset_id.to_string()))?;
        let range = range.clone();
        let areas = areas.to_vec();
        Ok(Box::new(
            entries
                .iter()
                .filter(move |e| range.contains(e.acquired))
                .filter_map(move |e| {
                    if areas.is_empty() {
                        return Some(Self::load_tile(e));
                    }
                    let Some((_, path)) = e.band_files.first() else {
                        return Some(Self::load_tile(e));
                    };
                    match read_band_grid(path) {
                        Ok(grid) if overlaps_any(&grid.bounds(), &areas) => Some(Self::load_tile(e)),
                        Ok(_) => {
                            debug!("Skipping tile {} outside requested areas", e.name);
                            None
                        }
                        Err(err) => Some(Err(err)),
                    }
                }),
        ))
    }
}

/// Retry and timeout settings for tile fetches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    pub retries: u32,
    pub backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 500,
            timeout_secs: 120,
        }
    }
}

/// Drain a stream, stopping early once `cancel` is raised.
pub fn collect_tiles(
    source: &dyn RasterSource,
    dataset_id: &str,
    range: &TimeRange,
    areas: &[Bounds],
    cancel: &AtomicBool,
) -> Result<Vec<RasterTile>> {
    let mut tiles = Vec::new();
    for tile in source.fetch_within(dataset_id, range, areas)? {
        if cancel.load(Ordering::Relaxed) {
            return Err(AggregationError::Cancelled);
        }
        tiles.push(tile?);
    }
    Ok(tiles)
}

fn fetch_once(
    source: &Arc<dyn RasterSource>,
    dataset_id: &str,
    range: &TimeRange,
    areas: &[Bounds],
    timeout: Duration,
) -> Result<Vec<RasterTile>> {
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    let worker_source = Arc::clone(source);
    let worker_cancel = Arc::clone(&cancel);
    let worker_dataset = dataset_id.to_string();
    let worker_range = range.clone();
    let worker_areas = areas.to_vec();
    thread::spawn(move || {
        let result = collect_tiles(
            worker_source.as_ref(),
            &worker_dataset,
            &worker_range,
            &worker_areas,
            &worker_cancel,
        );
        // Receiver is gone if the fetch already timed out
        let _ = tx.send(result);
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Relaxed);
            Err(AggregationError::Timeout {
                dataset: dataset_id.to_string(),
                secs: timeout.as_secs(),
            })
        }
        Err(RecvTimeoutError::Disconnected) => Err(AggregationError::SourceUnavailable(format!(
            "{} (fetch worker panicked)",
            dataset_id
        ))),
    }
}

/// Fetch the tiles of a dataset overlapping `areas` (all tiles when empty),
/// retrying transient failures with exponential backoff. Each attempt is
/// bounded by the policy timeout.
pub fn fetch_with_retry(
    source: &Arc<dyn RasterSource>,
    dataset_id: &str,
    range: &TimeRange,
    areas: &[Bounds],
    policy: &FetchPolicy,
) -> Result<Vec<RasterTile>> {
    let timeout = Duration::from_secs(policy.timeout_secs);
    let mut backoff = Duration::from_millis(policy.backoff_ms);
    let mut attempt = 0;

    loop {
        attempt += 1;
        debug!("Fetch attempt {} for {}", attempt, dataset_id);
        match fetch_once(source, dataset_id, range, areas, timeout) {
            Ok(tiles) => {
                info!("Fetched {} tiles from {}", tiles.len(), dataset_id);
                return Ok(tiles);
            }
            Err(e) if e.is_transient() && attempt <= policy.retries => {
                warn!(
                    "Fetch attempt {} for {} failed ({}), retrying in {} ms",
                    attempt,
                    dataset_id,
                    e,
                    backoff.as_millis()
                );
                thread::sleep(backoff);
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cog::Compression;
    use crate::grid::GridSpec;
    use crate::io::write_band_raster;
    use ndarray::Array2;
    use std::sync::atomic::AtomicUsize;

    const HEIGHT: &str = "LARSE/GEDI/GEDI02_A_002_MONTHLY";

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn tile(id: &str, acquired: NaiveDate) -> RasterTile {
        let grid = GridSpec::from_origin(-77.01, 38.01, 0.001, 4, 4).unwrap();
        RasterTile::new(id, acquired, grid)
            .with_constant_band("rh100", 20.0)
            .unwrap()
    }

    #[test]
    fn test_time_range() {
        let range = TimeRange::between(date(2020, 1, 1), date(2020, 12, 31));
        assert!(range.contains(date(2020, 6, 1)));
        assert!(range.contains(date(2020, 12, 31)));
        assert!(!range.contains(date(2021, 1, 1)));
        assert!(TimeRange::all().contains(date(1999, 1, 1)));
    }

    #[test]
    fn test_memory_source_unknown_and_empty() {
        let mut source = MemorySource::new();
        source.add_dataset(HEIGHT);
        assert!(matches!(
            source.fetch("LARSE/UNKNOWN", &TimeRange::all()),
            Err(AggregationError::SourceUnavailable(_))
        ));
        assert_eq!(source.fetch(HEIGHT, &TimeRange::all()).unwrap().count(), 0);
    }

    #[test]
    fn test_memory_source_filters_by_time() {
        let mut source = MemorySource::new();
        source.insert(HEIGHT, tile("a", date(2020, 5, 1)));
        source.insert(HEIGHT, tile("b", date(2021, 5, 1)));
        let range = TimeRange::between(date(2021, 1, 1), date(2021, 12, 31));
        let ids: Vec<String> = source
            .fetch(HEIGHT, &range)
            .unwrap()
            .map(|t| t.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }

    #[test]
    fn test_directory_source_reads_tiles() {
        let root = tempfile::tempdir().unwrap();
        let tile_dir = root
            .path()
            .join(dataset_slug(HEIGHT))
            .join("2021-06-01_n38w077");
        std::fs::create_dir_all(&tile_dir).unwrap();

        let grid = GridSpec::from_origin(-77.01, 38.01, 0.001, 4, 3).unwrap();
        let rh100 = Array2::from_elem((3, 4), 25.0f32);
        let flags = Array2::from_elem((3, 4), 1.0f32);
        write_band_raster(&tile_dir.join("rh100.tif"), &rh100, &grid, Compression::None).unwrap();
        write_band_raster(&tile_dir.join("quality_flag.tif"), &flags, &grid, Compression::Lzw).unwrap();

        let source = DirectorySource::open(root.path()).unwrap();
        let tiles: Vec<RasterTile> = source
            .fetch(HEIGHT, &TimeRange::all())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].acquired, date(2021, 6, 1));
        assert_eq!(tiles[0].band("rh100").unwrap()[[2, 3]], 25.0);
        assert!(tiles[0].has_band("quality_flag"));

        assert!(matches!(
            source.fetch("LARSE/GEDI/GEDI04_A_002_MONTHLY", &TimeRange::all()),
            Err(AggregationError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn test_directory_source_skips_tiles_outside_areas() {
        let root = tempfile::tempdir().unwrap();
        let dataset = root.path().join(dataset_slug(HEIGHT));

        let near = dataset.join("2021-06-01_near");
        std::fs::create_dir_all(&near).unwrap();
        let grid = GridSpec::from_origin(-77.01, 38.01, 0.001, 4, 3).unwrap();
        write_band_raster(&near.join("rh100.tif"), &Array2::from_elem((3, 4), 25.0), &grid, Compression::None).unwrap();

        // Bands on different grids fail to load, so this tile must never be decoded
        let far = dataset.join("2021-06-01_far");
        std::fs::create_dir_all(&far).unwrap();
        let far_a = GridSpec::from_origin(10.0, 45.0, 0.001, 4, 3).unwrap();
        let far_b = GridSpec::from_origin(10.0, 45.0, 0.002, 4, 3).unwrap();
        write_band_raster(&far.join("a_rh100.tif"), &Array2::from_elem((3, 4), 1.0), &far_a, Compression::None).unwrap();
        write_band_raster(&far.join("b_quality.tif"), &Array2::from_elem((3, 4), 1.0), &far_b, Compression::None).unwrap();

        let source = DirectorySource::open(root.path()).unwrap();
        let area = Bounds {
            min_lon: -77.005,
            min_lat: 38.0,
            max_lon: -77.0,
            max_lat: 38.005,
        };
        let tiles: Vec<RasterTile> = source
            .fetch_within(HEIGHT, &TimeRange::all(), &[area])
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].id, "2021-06-01_near");

        // Unfiltered, the broken tile is decoded and fails
        let all: Result<Vec<RasterTile>> = source.fetch(HEIGHT, &TimeRange::all()).unwrap().collect();
        assert!(matches!(all, Err(AggregationError::GridMismatch(_))));
    }

    #[test]
    fn test_fetch_within_default_filters_by_bounds() {
        let mut source = MemorySource::new();
        source.insert(HEIGHT, tile("near", date(2021, 6, 1)));
        let far_grid = GridSpec::from_origin(179.99, -16.99, 0.001, 4, 4).unwrap();
        source.insert(HEIGHT, RasterTile::new("fiji", date(2021, 6, 1), far_grid));

        // Area in unwrapped longitudes past 180 still finds the tile west of it
        let area = Bounds {
            min_lon: 179.995,
            min_lat: -17.0,
            max_lon: 180.002,
            max_lat: -16.99,
        };
        let ids: Vec<String> = source
            .fetch_within(HEIGHT, &TimeRange::all(), &[area])
            .unwrap()
            .map(|t| t.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["fiji".to_string()]);
        assert_eq!(source.fetch_within(HEIGHT, &TimeRange::all(), &[]).unwrap().count(), 2);
    }

    struct FlakySource {
        failures_left: AtomicUsize,
        inner: MemorySource,
    }

    impl RasterSource for FlakySource {
        fn fetch(&self, dataset_id: &str, range: &TimeRange) -> Result<TileStream<'_>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AggregationError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "connection reset",
                )));
            }
            self.inner.fetch(dataset_id, range)
        }
    }

    struct SlowSource;

    impl RasterSource for SlowSource {
        fn fetch(&self, _dataset_id: &str, _range: &TimeRange) -> Result<TileStream<'_>> {
            thread::sleep(Duration::from_millis(1500));
            Ok(Box::new(std::iter::empty()))
        }
    }

    #[test]
    fn test_fetch_retries_transient_failures() {
        let mut inner = MemorySource::new();
        inner.insert(HEIGHT, tile("a", date(2021, 6, 1)));
        let source: Arc<dyn RasterSource> = Arc::new(FlakySource {
            failures_left: AtomicUsize::new(2),
            inner,
        });
        let policy = FetchPolicy {
            retries: 3,
            backoff_ms: 1,
            timeout_secs: 5,
        };
        let tiles = fetch_with_retry(&source, HEIGHT, &TimeRange::all(), &[], &policy).unwrap();
        assert_eq!(tiles.len(), 1);
    }

    #[test]
    fn test_fetch_gives_up_after_retries() {
        let source: Arc<dyn RasterSource> = Arc::new(FlakySource {
            failures_left: AtomicUsize::new(10),
            inner: MemorySource::new(),
        });
        let policy = FetchPolicy {
            retries: 2,
            backoff_ms: 1,
            timeout_secs: 5,
        };
        let result = fetch_with_retry(&source, HEIGHT, &TimeRange::all(), &[], &policy);
        assert!(matches!(result, Err(AggregationError::Io(_))));
    }

    #[test]
    fn test_fetch_times_out() {
        let source: Arc<dyn RasterSource> = Arc::new(SlowSource);
        let policy = FetchPolicy {
            retries: 0,
            backoff_ms: 1,
            timeout_secs: 1,
        };
        let result = fetch_with_retry(&source, HEIGHT, &TimeRange::all(), &[], &policy);
        assert!(matches!(result, Err(AggregationError::Timeout { .. })));
    }

    #[test]
    fn test_unknown_dataset_not_retried() {
        let source: Arc<dyn RasterSource> = Arc::new(MemorySource::new());
        let policy = FetchPolicy {
            retries: 5,
            backoff_ms: 10_000,
            timeout_secs: 5,
        };
        let result = fetch_with_retry(&source, "nope", &TimeRange::all(), &[], &policy);
        assert!(matches!(result, Err(AggregationError::SourceUnavailable(_))));
    }
}
