use crate::config::ReducerMode;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    /// Per-pixel mean/stdDev over a circular kernel
    Kernel,
    /// One mean/stdDev over every valid pixel in the buffer
    WholeBuffer,
    /// Per-pixel mean/stdDev across acquisitions
    Temporal,
}

impl From<ModeArg> for ReducerMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Kernel => ReducerMode::Kernel,
            ModeArg::WholeBuffer => ReducerMode::WholeBuffer,
            ModeArg::Temporal => ReducerMode::Temporal,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "buffer-stats")]
#[command(about = "Aggregate GEDI raster statistics within buffers around point locations")]
#[command(version)]
#[command(author = "Huimori Project")]
pub struct Args {
    /// JSON configuration file (defaults: GEDI height, density and vertical profile)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// JSON array of point locations, replacing any in the config
    #[arg(short, long, value_name = "FILE")]
    pub points: Option<PathBuf>,

    /// Tile directory laid out as <dataset>/<YYYY-MM-DD>_<name>/<band>.tif
    #[arg(long, value_name = "DIR")]
    pub tiles: PathBuf,

    /// Output directory for clipped surfaces and the run summary
    #[arg(short, long, value_name = "DIR")]
    pub output: PathBuf,

    /// Buffer radii in meters, comma separated (e.g., 100,300,500,1000)
    #[arg(short, long, value_name = "METERS", value_delimiter = ',')]
    pub radii: Option<Vec<f64>>,

    /// Reducer mode
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Kernel radius in meters (default: each buffer's radius)
    #[arg(short, long, value_name = "METERS")]
    pub kernel_radius: Option<f64>,

    /// Number of threads (default: all available)
    #[arg(short, long, value_name = "N")]
    pub threads: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
