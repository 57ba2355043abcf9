use buffer_stats::cli::Args;
use buffer_stats::config::{load_points, Config};
use buffer_stats::error::{AggregationError, Result};
use buffer_stats::export::Exporter;
use buffer_stats::pipeline::Pipeline;
use buffer_stats::source::DirectorySource;
use clap::Parser;
use env_logger::Env;
use log::{error, info};
use std::sync::Arc;

fn build_exporter(args: &Args, config: &Config) -> Arc<dyn Exporter> {
    #[cfg(feature = "gdal")]
    {
        info!("Exporting multi-band GeoTIFFs through GDAL");
        Arc::new(buffer_stats::export::GdalExporter::new(
            &args.output,
            config.export.compression,
            config.export.tile_size,
        ))
    }
    #[cfg(not(feature = "gdal"))]
    {
        Arc::new(buffer_stats::export::GeoTiffExporter::new(
            &args.output,
            config.export.compression,
        ))
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logger
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level)).init();

    info!("=== GEDI Buffer Statistics ===");

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    // Command-line overrides
    if let Some(radii) = &args.radii {
        config.radii = radii.clone();
    }
    if let Some(mode) = args.mode {
        config.mode = mode.into();
    }
    if args.kernel_radius.is_some() {
        config.kernel_radius_m = args.kernel_radius;
    }
    if args.threads.is_some() {
        config.threads = args.threads;
    }
    if let Some(path) = &args.points {
        config.points = load_points(path)?;
    }
    config.validate()?;

    if config.points.is_empty() {
        return Err(AggregationError::Config(
            "no point locations given (use --points or `points` in the config)".to_string(),
        ));
    }

    // Set thread pool size if specified
    if let Some(n_threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build_global()
            .map_err(|e| AggregationError::Config(format!("failed to build thread pool: {}", e)))?;
        info!("Using {} threads", n_threads);
    } else {
        info!("Using all available threads");
    }

    info!("Radii: {:?} m, mode: {:?}", config.radii, config.mode);
    info!("Indexing tiles: {}", args.tiles.display());
    let source = Arc::new(DirectorySource::open(&args.tiles)?);
    let exporter = build_exporter(&args, &config);

    let points = config.points.clone();
    let pipeline = Pipeline::new(config, source, exporter)?;
    let summary = pipeline.run(&points);
    summary.log();

    std::fs::create_dir_all(&args.output)?;
    let summary_path = args.output.join("summary.json");
    serde_json::to_writer_pretty(std::fs::File::create(&summary_path)?, &summary)?;
    info!("Wrote run summary: {}", summary_path.display());

    if summary.failed() > 0 {
        error!("{}", summary);
        std::process::exit(1);
    }

    info!("=== Done! ===");
    Ok(())
}
