//! Pure rendering layer: surfaces and visualization parameters in, pixels
//! and legend labels out. Nothing here touches aggregation.

use crate::error::{AggregationError, Result};
use crate::focal::ReducedSurface;
use serde::{Deserialize, Deserializer, Serialize};

/// Linear color ramp over `[min, max]` for one band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisParams {
    pub band: String,
    pub min: f64,
    pub max: f64,
    /// A list of colors, or one comma-separated string of them.
    #[serde(deserialize_with = "deserialize_palette")]
    pub palette: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PaletteSpec {
    Joined(String),
    List(Vec<String>),
}

fn deserialize_palette<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(match PaletteSpec::deserialize(deserializer)? {
        PaletteSpec::Joined(palette) => parse_palette(&palette),
        PaletteSpec::List(colors) => colors,
    })
}

impl VisParams {
    pub fn new(band: impl Into<String>, min: f64, max: f64, palette: &[&str]) -> Self {
        Self {
            band: band.into(),
            min,
            max,
            palette: palette.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.max > self.min) {
            return Err(AggregationError::Config(format!(
                "visualization range for {} is empty ({}..{})",
                self.band, self.min, self.max
            )));
        }
        self.stops().map(|_| ())
    }

    fn stops(&self) -> Result<Vec<[u8; 3]>> {
        if self.palette.is_empty() {
            return Err(AggregationError::InvalidPalette(format!("empty palette for {}", self.band)));
        }
        self.palette.iter().map(|c| parse_color(c)).collect()
    }

    /// RGB for a value, or None for no-data.
    pub fn color_for(&self, value: f32) -> Result<Option<[u8; 3]>> {
        if value.is_nan() {
            return Ok(None);
        }
        let stops = self.stops()?;
        if stops.len() == 1 {
            return Ok(Some(stops[0]));
        }
        let t = ((value as f64 - self.min) / (self.max - self.min)).clamp(0.0, 1.0);
        let position = t * (stops.len() - 1) as f64;
        let lower = (position.floor() as usize).min(stops.len() - 2);
        let frac = position - lower as f64;
        let (a, b) = (stops[lower], stops[lower + 1]);
        let mix = |i: usize| (a[i] as f64 + (b[i] as f64 - a[i] as f64) * frac).round() as u8;
        Ok(Some([mix(0), mix(1), mix(2)]))
    }
}

/// Parse a CSS color name used by the GEDI dashboards or `#rrggbb`/`rrggbb`.
pub fn parse_color(color: &str) -> Result<[u8; 3]> {
    let color = color.trim();
    let named = match color.to_ascii_lowercase().as_str() {
        "white" => Some([255, 255, 255]),
        "black" => Some([0, 0, 0]),
        "red" => Some([255, 0, 0]),
        "darkred" => Some([139, 0, 0]),
        "orange" => Some([255, 165, 0]),
        "yellow" => Some([255, 255, 0]),
        "green" => Some([0, 128, 0]),
        "darkgreen" => Some([0, 100, 0]),
        "blue" => Some([0, 0, 255]),
        _ => None,
    };
    if let Some(rgb) = named {
        return Ok(rgb);
    }

    let hex = color.strip_prefix('#').unwrap_or(color);
    if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AggregationError::InvalidPalette(color.to_string()));
    }
    let channel = |i: usize| {
        u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| AggregationError::InvalidPalette(color.to_string()))
    };
    Ok([channel(0)?, channel(2)?, channel(4)?])
}

/// Split a comma-separated palette such as `"white, #006600"`.
pub fn parse_palette(palette: &str) -> Vec<String> {
    palette
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Row-major RGBA pixels for one band; no-data is fully transparent.
pub fn render_rgba(surface: &ReducedSurface, vis: &VisParams) -> Result<Vec<u8>> {
    let band = surface
        .band(&vis.band)
        .ok_or_else(|| AggregationError::MissingBand(vis.band.clone()))?;
    let mut pixels = Vec::with_capacity(band.len() * 4);
    for &value in band.iter() {
        match vis.color_for(value)? {
            Some([r, g, b]) => pixels.extend_from_slice(&[r, g, b, 255]),
            None => pixels.extend_from_slice(&[0, 0, 0, 0]),
        }
    }
    Ok(pixels)
}

/// Vertical color-bar legend: top, middle and bottom labels.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Legend {
    pub title: String,
    pub top: String,
    pub middle: String,
    pub bottom: String,
    pub palette: Vec<String>,
}

impl Legend {
    pub fn for_vis(title: impl Into<String>, vis: &VisParams) -> Self {
        Self {
            title: title.into(),
            top: format!("≥{}", vis.max),
            middle: format!("{}", (vis.max + vis.min) / 2.0),
            bottom: format!("{}", vis.min),
            palette: vis.palette.clone(),
        }
    }
}

/// Everything a map layer needs to display one exported band.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderMetadata {
    pub layer: String,
    pub vis: VisParams,
    pub legend: Legend,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSpec;
    use ndarray::arr2;

    fn mean_vis() -> VisParams {
        VisParams::new("rh100_mean", 0.0, 100.0, &["white", "#006600"])
    }

    #[test]
    fn test_parse_colors() {
        assert_eq!(parse_color("white").unwrap(), [255, 255, 255]);
        assert_eq!(parse_color("#006600").unwrap(), [0, 102, 0]);
        assert_eq!(parse_color("0000FF").unwrap(), [0, 0, 255]);
        assert_eq!(parse_color(" DarkGreen ").unwrap(), [0, 100, 0]);
        assert!(parse_color("#12345").is_err());
        assert!(parse_color("chartreuse").is_err());
    }

    #[test]
    fn test_parse_palette_string() {
        assert_eq!(
            parse_palette("darkred,red,orange,green,darkgreen"),
            vec!["darkred", "red", "orange", "green", "darkgreen"]
        );
        assert_eq!(parse_palette("white, #006600"), vec!["white", "#006600"]);
    }

    #[test]
    fn test_vis_palette_from_string_or_list() {
        let joined: VisParams =
            serde_json::from_str(r#"{"band": "rh100_median", "min": 1, "max": 60, "palette": "darkred, red,orange"}"#)
                .unwrap();
        assert_eq!(joined.palette, vec!["darkred", "red", "orange"]);
        assert!(joined.validate().is_ok());

        let list: VisParams =
            serde_json::from_str(r##"{"band": "rh100_mean", "min": 0, "max": 100, "palette": ["white", "#006600"]}"##)
                .unwrap();
        assert_eq!(list, mean_vis());
    }

    #[test]
    fn test_color_ramp_endpoints_and_clamp() {
        let vis = mean_vis();
        assert_eq!(vis.color_for(0.0).unwrap(), Some([255, 255, 255]));
        assert_eq!(vis.color_for(100.0).unwrap(), Some([0, 102, 0]));
        assert_eq!(vis.color_for(250.0).unwrap(), Some([0, 102, 0]));
        assert_eq!(vis.color_for(-5.0).unwrap(), Some([255, 255, 255]));
        assert_eq!(vis.color_for(50.0).unwrap(), Some([128, 179, 128]));
        assert_eq!(vis.color_for(f32::NAN).unwrap(), None);
    }

    #[test]
    fn test_render_rgba_transparent_nodata() {
        let grid = GridSpec::from_origin(-77.0, 38.0, 0.001, 2, 1).unwrap();
        let surface = ReducedSurface::new(grid)
            .with_band("rh100_mean", arr2(&[[0.0, f32::NAN]]))
            .unwrap();
        let rgba = render_rgba(&surface, &mean_vis()).unwrap();
        assert_eq!(rgba, vec![255, 255, 255, 255, 0, 0, 0, 0]);
    }

    #[test]
    fn test_legend_labels() {
        let legend = Legend::for_vis("Relative height metrics at 100% (m)", &mean_vis());
        assert_eq!(legend.top, "≥100");
        assert_eq!(legend.middle, "50");
        assert_eq!(legend.bottom, "0");

        let cover = VisParams::new("cover_mean", 0.0, 1.0, &["white", "#006600"]);
        assert_eq!(Legend::for_vis("Total canopy cover", &cover).middle, "0.5");
    }

    #[test]
    fn test_validate_rejects_bad_vis() {
        assert!(mean_vis().validate().is_ok());
        assert!(VisParams::new("x", 1.0, 1.0, &["white"]).validate().is_err());
        assert!(VisParams::new("x", 0.0, 1.0, &[]).validate().is_err());
        assert!(VisParams::new("x", 0.0, 1.0, &["nope"]).validate().is_err());
    }
}
