use crate::cog::{validate_tile_size, Compression};
use crate::error::{AggregationError, Result};
use crate::geodesic::PointLocation;
use crate::mosaic::MosaicOrder;
use crate::quality::QualityPredicate;
use crate::render::VisParams;
use crate::source::{FetchPolicy, TimeRange};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_RADII: [f64; 4] = [100.0, 300.0, 500.0, 1000.0];

/// GEDI monthly rasters are gridded at roughly 25 m.
pub const DEFAULT_PIXEL_SIZE_DEG: f64 = 0.00025;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerMode {
    /// Per-pixel mean/stdDev over a circular ground kernel.
    #[default]
    Kernel,
    /// One mean/stdDev pair over every valid pixel in the buffer.
    WholeBuffer,
    /// Per-pixel mean/stdDev across acquisitions.
    Temporal,
}

/// Everything that distinguishes one GEDI product from another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDescriptor {
    /// Short name used in destination ids and logs.
    pub name: String,
    pub title: String,
    pub dataset_id: String,
    /// Value band reduced into `<band>_mean` and `<band>_stdDev`.
    pub band: String,
    #[serde(default)]
    pub predicates: Vec<QualityPredicate>,
    #[serde(default = "default_pixel_size")]
    pub pixel_size_deg: f64,
    pub mean_vis: VisParams,
    pub std_dev_vis: VisParams,
    /// When set, a per-pixel median composite is exported as `<band>_median`.
    #[serde(default)]
    pub median_vis: Option<VisParams>,
}

fn default_pixel_size() -> f64 {
    DEFAULT_PIXEL_SIZE_DEG
}

fn gedi_predicates(quality_band: &str) -> Vec<QualityPredicate> {
    vec![
        QualityPredicate::new(quality_band, 1.0),
        QualityPredicate::new("degrade_flag", 0.0),
    ]
}

impl VariableDescriptor {
    pub fn gedi_height() -> Self {
        Self {
            name: "height".to_string(),
            title: "Relative height metrics at 100% (m)".to_string(),
            dataset_id: "LARSE/GEDI/GEDI02_A_002_MONTHLY".to_string(),
            band: "rh100".to_string(),
            predicates: gedi_predicates("quality_flag"),
            pixel_size_deg: DEFAULT_PIXEL_SIZE_DEG,
            mean_vis: VisParams::new("rh100_mean", 0.0, 100.0, &["white", "#006600"]),
            std_dev_vis: VisParams::new("rh100_stdDev", 0.0, 50.0, &["white", "#0000FF"]),
            median_vis: Some(VisParams::new(
                "rh100_median",
                1.0,
                60.0,
                &["darkred", "red", "orange", "green", "darkgreen"],
            )),
        }
    }

    pub fn gedi_density() -> Self {
        Self {
            name: "density".to_string(),
            title: "Aboveground biomass density (Mg/ha)".to_string(),
            dataset_id: "LARSE/GEDI/GEDI04_A_002_MONTHLY".to_string(),
            band: "agbd".to_string(),
            predicates: gedi_predicates("l4_quality_flag"),
            pixel_size_deg: DEFAULT_PIXEL_SIZE_DEG,
            mean_vis: VisParams::new("agbd_mean", 0.0, 100.0, &["white", "#006600"]),
            std_dev_vis: VisParams::new("agbd_stdDev", 0.0, 50.0, &["white", "#0000FF"]),
            median_vis: None,
        }
    }

    pub fn gedi_vertical_profile() -> Self {
        Self {
            name: "vertical_profile".to_string(),
            title: "Total canopy cover".to_string(),
            dataset_id: "LARSE/GEDI/GEDI02_B_002_MONTHLY".to_string(),
            band: "cover".to_string(),
            predicates: gedi_predicates("l2b_quality_flag"),
            pixel_size_deg: DEFAULT_PIXEL_SIZE_DEG,
            mean_vis: VisParams::new("cover_mean", 0.0, 1.0, &["white", "#006600"]),
            std_dev_vis: VisParams::new("cover_stdDev", 0.0, 1.0, &["white", "#0000FF"]),
            median_vis: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.dataset_id.is_empty() || self.band.is_empty() {
            return Err(AggregationError::Config(format!(
                "variable {:?} needs a name, dataset_id and band",
                self.name
            )));
        }
        if !(self.pixel_size_deg > 0.0) {
            return Err(AggregationError::InvalidPixelSize(self.pixel_size_deg));
        }
        self.mean_vis.validate()?;
        self.std_dev_vis.validate()?;
        match &self.median_vis {
            Some(vis) => vis.validate(),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub compression: Compression,
    pub retries: u32,
    pub backoff_ms: u64,
    /// Block size for GDAL tiled output.
    pub tile_size: usize,
    /// Also write an RGBA rendering of each displayed band.
    pub previews: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
            retries: 2,
            backoff_ms: 250,
            tile_size: 256,
            previews: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub radii: Vec<f64>,
    pub variables: Vec<VariableDescriptor>,
    pub mode: ReducerMode,
    /// Kernel radius for `kernel` mode; each unit's buffer radius when unset.
    pub kernel_radius_m: Option<f64>,
    pub mosaic_order: MosaicOrder,
    pub time_range: TimeRange,
    pub fetch: FetchPolicy,
    pub export: ExportOptions,
    pub threads: Option<usize>,
    pub points: Vec<PointLocation>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            radii: DEFAULT_RADII.to_vec(),
            variables: vec![
                VariableDescriptor::gedi_height(),
                VariableDescriptor::gedi_density(),
                VariableDescriptor::gedi_vertical_profile(),
            ],
            mode: ReducerMode::default(),
            kernel_radius_m: None,
            mosaic_order: MosaicOrder::default(),
            time_range: TimeRange::all(),
            fetch: FetchPolicy::default(),
            export: ExportOptions::default(),
            threads: None,
            points: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration: {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Kernel radius applied to a unit with the given buffer radius.
    pub fn kernel_radius_for(&self, buffer_radius: f64) -> f64 {
        self.kernel_radius_m.unwrap_or(buffer_radius)
    }

    pub fn validate(&self) -> Result<()> {
        if self.radii.is_empty() {
            return Err(AggregationError::Config("at least one buffer radius is required".to_string()));
        }
        for &r in &self.radii {
            if !(r > 0.0) || !r.is_finite() {
                return Err(AggregationError::InvalidRadius(r));
            }
        }
        if let Some(k) = self.kernel_radius_m {
            if !(k > 0.0) || !k.is_finite() {
                return Err(AggregationError::InvalidRadius(k));
            }
        }
        if self.variables.is_empty() {
            return Err(AggregationError::Config("no variables configured".to_string()));
        }
        let mut names: Vec<&str> = self.variables.iter().map(|v| v.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(AggregationError::Config("variable names must be unique".to_string()));
        }
        for variable in &self.variables {
            variable.validate()?;
        }
        for point in &self.points {
            if !(-90.0..=90.0).contains(&point.lat) || !(-180.0..=180.0).contains(&point.lon) {
                return Err(AggregationError::Config(format!(
                    "point {} has invalid coordinates ({}, {})",
                    point.id, point.lat, point.lon
                )));
            }
        }
        if self.fetch.timeout_secs == 0 {
            return Err(AggregationError::Config("fetch.timeout_secs must be positive".to_string()));
        }
        if self.threads == Some(0) {
            return Err(AggregationError::Config("threads must be positive".to_string()));
        }
        validate_tile_size(self.export.tile_size)
    }
}

/// Read a JSON array of `{ "id", "lat", "lon" }` objects.
pub fn load_points<P: AsRef<Path>>(path: P) -> Result<Vec<PointLocation>> {
    let path = path.as_ref();
    info!("Loading point locations: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let points: Vec<PointLocation> = serde_json::from_str(&text)?;
    info!("Loaded {} points", points.len());
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_gedi_scripts() {
        let config = Config::default();
        assert_eq!(config.radii, vec![100.0, 300.0, 500.0, 1000.0]);
        assert_eq!(config.variables.len(), 3);
        assert_eq!(config.mode, ReducerMode::Kernel);
        assert_eq!(config.kernel_radius_for(300.0), 300.0);

        let height = &config.variables[0];
        assert_eq!(height.band, "rh100");
        assert_eq!(height.predicates[0], QualityPredicate::new("quality_flag", 1.0));
        assert_eq!(height.predicates[1], QualityPredicate::new("degrade_flag", 0.0));
        assert_eq!(config.variables[2].mean_vis.max, 1.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "radii": [250],
                "mode": "whole_buffer",
                "points": [{ "id": "serc", "latitude": 38.0, "longitude": -77.0 }]
            }"#,
        )
        .unwrap();
        assert_eq!(config.radii, vec![250.0]);
        assert_eq!(config.mode, ReducerMode::WholeBuffer);
        assert_eq!(config.variables.len(), 3);
        assert_eq!(config.points[0].lat, 38.0);
        assert_eq!(config.fetch.retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_radii() {
        let mut config = Config::default();
        config.radii = vec![100.0, 0.0];
        assert!(matches!(config.validate(), Err(AggregationError::InvalidRadius(_))));
        config.radii = vec![];
        assert!(config.validate().is_err());
        config.radii = vec![100.0];
        config.kernel_radius_m = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_variables_and_bad_points() {
        let mut config = Config::default();
        config.variables.push(VariableDescriptor::gedi_height());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.points.push(PointLocation::new("bad", 95.0, 0.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_fetch_timeout() {
        let config: Config = serde_json::from_str(r#"{ "fetch": { "timeout_secs": 0 } }"#).unwrap();
        assert!(matches!(config.validate(), Err(AggregationError::Config(_))));

        let mut config = Config::default();
        config.fetch.timeout_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_variable_json_with_palette_string_and_median() {
        let config: Config = serde_json::from_str(
            r##"{
                "mode": "temporal",
                "export": { "previews": true },
                "variables": [{
                    "name": "height",
                    "title": "Relative height metrics at 100% (m)",
                    "dataset_id": "LARSE/GEDI/GEDI02_A_002_MONTHLY",
                    "band": "rh100",
                    "mean_vis": { "band": "rh100_mean", "min": 0, "max": 100, "palette": "white, #006600" },
                    "std_dev_vis": { "band": "rh100_stdDev", "min": 0, "max": 50, "palette": ["white", "#0000FF"] },
                    "median_vis": { "band": "rh100_median", "min": 1, "max": 60, "palette": "darkred,red,orange,green,darkgreen" }
                }]
            }"##,
        )
        .unwrap();
        assert_eq!(config.mode, ReducerMode::Temporal);
        assert!(config.export.previews);
        let height = &config.variables[0];
        assert_eq!(height.mean_vis.palette, vec!["white", "#006600"]);
        assert_eq!(height.std_dev_vis.palette, vec!["white", "#0000FF"]);
        assert_eq!(height.median_vis.as_ref().map(|v| v.palette.len()), Some(5));
        assert_eq!(height.pixel_size_deg, DEFAULT_PIXEL_SIZE_DEG);
        assert!(config.validate().is_ok());

        assert_eq!(VariableDescriptor::gedi_height().median_vis.map(|v| v.band), Some("rh100_median".to_string()));
        assert!(VariableDescriptor::gedi_density().median_vis.is_none());
    }

    #[test]
    fn test_load_points_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points.json");
        std::fs::write(
            &path,
            r#"[{"id": "a", "lat": 38.0, "lon": -77.0}, {"id": "b", "lat": 39.5, "lon": -76.5}]"#,
        )
        .unwrap();
        let points = load_points(&path).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1], PointLocation::new("b", 39.5, -76.5));
    }
}
