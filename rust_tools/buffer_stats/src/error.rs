use thiserror::Error;

#[derive(Error, Debug)]
pub enum AggregationError {
    #[cfg(feature = "gdal")]
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("Dataset unavailable: {0}")]
    SourceUnavailable(String),

    #[error("No tiles intersect the {radius} m buffer around point {point_id}")]
    EmptyIntersection { point_id: String, radius: f64 },

    #[error("No valid samples to reduce for band {band}")]
    InsufficientSamples { band: String },

    #[error("Export to {destination} failed: {reason}")]
    ExportFailure { destination: String, reason: String },

    #[error("Fetching dataset {dataset} timed out after {secs} s")]
    Timeout { dataset: String, secs: u64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid radius: {0} meters (must be positive)")]
    InvalidRadius(f64),

    #[error("Raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("Pixel size is non-positive: {0}")]
    InvalidPixelSize(f64),

    #[error("Band grids differ within tile {0}")]
    GridMismatch(String),

    #[error("Band not found: {0}")]
    MissingBand(String),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(String),

    #[error("Invalid tile size: {0} (must be multiple of 16)")]
    InvalidTileSize(usize),

    #[error("Invalid palette color: {0}")]
    InvalidPalette(String),

    #[error("Invalid GeoTIFF: {0}")]
    InvalidGeoTiff(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AggregationError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AggregationError::Io(_)
                | AggregationError::Timeout { .. }
                | AggregationError::ExportFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AggregationError>;
