use crate::error::{AggregationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// GeoTIFF compression applied to exported bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Compression {
    #[default]
    Deflate,
    Lzw,
    None,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Compression::Deflate => "DEFLATE",
            Compression::Lzw => "LZW",
            Compression::None => "NONE",
        };
        f.write_str(name)
    }
}

impl FromStr for Compression {
    type Err = AggregationError;

    fn from_str(s: &str) -> Result<Self> {
        validate_compression(s)
    }
}

/// Validate compression type
pub fn validate_compression(compression: &str) -> Result<Compression> {
    match compression {
        "DEFLATE" => Ok(Compression::Deflate),
        "LZW" => Ok(Compression::Lzw),
        "NONE" => Ok(Compression::None),
        other => Err(AggregationError::InvalidCompression(other.to_string())),
    }
}

/// Validate tile size (must be multiple of 16)
pub fn validate_tile_size(tile_size: usize) -> Result<()> {
    if tile_size == 0 || tile_size % 16 != 0 {
        return Err(AggregationError::InvalidTileSize(tile_size));
    }
    Ok(())
}

/// Create dataset options for tiled output
#[cfg(feature = "gdal")]
pub fn create_dataset_options(compression: Compression, tile_size: usize) -> Vec<String> {
    vec![
        format!("COMPRESS={}", compression),
        "TILED=YES".to_string(),
        format!("BLOCKXSIZE={}", tile_size),
        format!("BLOCKYSIZE={}", tile_size),
        "BIGTIFF=IF_SAFER".to_string(),
    ]
}

/// Write every band of a surface into one tiled multi-band GeoTIFF via GDAL.
#[cfg(feature = "gdal")]
pub fn write_multiband_gdal(
    path: &std::path::Path,
    surface: &crate::focal::ReducedSurface,
    compression: Compression,
    tile_size: usize,
) -> Result<()> {
    use gdal::cpl::CslStringList;
    use gdal::spatial_ref::SpatialRef;
    use gdal::DriverManager;
    use log::{debug, info};

    validate_tile_size(tile_size)?;
    let grid = surface.grid();
    let driver = DriverManager::get_driver_by_name("GTiff")?;

    let mut options = CslStringList::new();
    for opt in create_dataset_options(compression, tile_size) {
        options.add_string(&opt)?;
    }

    let mut dataset = driver.create_with_band_type_with_options::<f32, _>(
        path,
        grid.width,
        grid.height,
        surface.band_count(),
        &options,
    )?;
    dataset.set_geo_transform(&grid.geotransform)?;
    dataset.set_spatial_ref(&SpatialRef::from_epsg(4326)?)?;

    for (i, (name, data)) in surface.bands().enumerate() {
        let band_index = i + 1;
        debug!("Writing band {} ({})", band_index, name);

        let mut raster_band = dataset.rasterband(band_index)?;
        let contiguous = data.as_standard_layout();
        let mut buffer = gdal::raster::Buffer::new(
            (grid.width, grid.height),
            contiguous.iter().copied().collect::<Vec<f32>>(),
        );
        raster_band.write((0, 0), (grid.width, grid.height), &mut buffer)?;
        raster_band.set_description(name)?;
        raster_band.set_no_data_value(Some(f64::NAN))?;
    }

    info!("Successfully wrote {} bands to {}", surface.band_count(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_compression_valid() {
        assert_eq!(validate_compression("DEFLATE").unwrap(), Compression::Deflate);
        assert_eq!(validate_compression("LZW").unwrap(), Compression::Lzw);
        assert_eq!(validate_compression("NONE").unwrap(), Compression::None);
    }

    #[test]
    fn test_validate_compression_invalid() {
        assert!(validate_compression("ZSTD").is_err());
        assert!(validate_compression("jpeg").is_err());
    }

    #[test]
    fn test_validate_tile_size() {
        assert!(validate_tile_size(256).is_ok());
        assert!(validate_tile_size(512).is_ok());
        assert!(validate_tile_size(0).is_err());
        assert!(validate_tile_size(100).is_err());
    }

    #[test]
    fn test_compression_serde_names() {
        let parsed: Compression = serde_json::from_str("\"LZW\"").unwrap();
        assert_eq!(parsed, Compression::Lzw);
        assert_eq!(Compression::Deflate.to_string(), "DEFLATE");
    }
}
