// Library exports for testing and reuse

pub mod cli;
pub mod cog;
pub mod config;
pub mod error;
pub mod export;
pub mod focal;
pub mod geodesic;
pub mod grid;
pub mod io;
pub mod mosaic;
pub mod pipeline;
pub mod quality;
pub mod region;
pub mod render;
pub mod source;
pub mod temporal;
pub mod tile;

// Re-export commonly used types
pub use config::{Config, ReducerMode, VariableDescriptor};
pub use error::{AggregationError, Result};
pub use export::{clip, ClippedSurface, Exporter, GeoTiffExporter, MemoryExporter};
pub use focal::{reduce_neighborhood, reduce_neighborhood_within, ReducedSurface, RunningStats};
pub use geodesic::{buffer, intersects, Buffer, PointLocation, Polygon};
pub use grid::GridSpec;
pub use mosaic::{mosaic, Mosaic, MosaicOrder};
pub use pipeline::{BufferOutcome, Pipeline, RunSummary, UnitStatus};
pub use quality::{MaskedTile, QualityPredicate};
pub use region::{reduce_region, RegionStats};
pub use source::{DirectorySource, MemorySource, RasterSource, TimeRange};
pub use temporal::{median_composite, reduce_temporal};
pub use tile::RasterTile;
