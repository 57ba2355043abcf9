use crate::cog::Compression;
use crate::error::{AggregationError, Result};
use crate::grid::GridSpec;
use log::{debug, info};
use ndarray::Array2;
use std::fs::File;
use std::io::{BufWriter, Seek, Write};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, compression as tiff_compression, TiffEncoder};
use tiff::tags::Tag;

const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

/// GeoKeyDirectory for EPSG:4326 with pixel-is-area raster space.
const GEO_KEYS_WGS84: [u16; 16] = [
    1, 1, 0, 3, // header: version, revision, minor, key count
    1024, 0, 1, 2, // GTModelType = geographic
    1025, 0, 1, 1, // GTRasterType = pixel is area
    2048, 0, 1, 4326, // GeographicType = WGS 84
];

fn geo_tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

#[derive(Debug, Clone)]
pub struct RasterMetadata {
    pub grid: GridSpec,
    pub nodata: Option<f64>,
}

fn open_decoder(path: &Path) -> Result<Decoder<File>> {
    let file = File::open(path)?;
    let decoder = Decoder::new(file)?;

    let mut limits = Limits::default();
    limits.decoding_buffer_size = 1024 * 1024 * 1024;
    limits.intermediate_buffer_size = 1024 * 1024 * 1024;
    limits.ifd_value_size = 1024 * 1024 * 1024;
    Ok(decoder.with_limits(limits))
}

fn decode_grid(decoder: &mut Decoder<File>, path: &Path) -> Result<GridSpec> {
    let (width, height) = decoder.dimensions()?;
    let (width, height) = (width as usize, height as usize);
    if width == 0 || height == 0 {
        return Err(AggregationError::InvalidDimensions(width, height));
    }

    let tiepoint = decoder.get_tag_f64_vec(geo_tag(TAG_MODEL_TIEPOINT));
    let pixel_scale = decoder.get_tag_f64_vec(geo_tag(TAG_MODEL_PIXEL_SCALE));
    match (tiepoint, pixel_scale) {
        (Ok(tiepoint), Ok(scale)) if tiepoint.len() >= 6 && scale.len() >= 2 => {
            // Tiepoint [i, j, k, x, y, z] ties pixel (i, j) to (x, y)
            let west = tiepoint[3] - tiepoint[0] * scale[0];
            let north = tiepoint[4] + tiepoint[1] * scale[1];
            GridSpec::new(width, height, [west, scale[0], 0.0, north, 0.0, -scale[1]])
        }
        _ => Err(AggregationError::InvalidGeoTiff(format!(
            "{} lacks ModelTiepoint/ModelPixelScale tags",
            path.display()
        ))),
    }
}

/// Georeferencing of a GeoTIFF from its header alone; no pixels are decoded.
pub fn read_band_grid(path: &Path) -> Result<GridSpec> {
    let mut decoder = open_decoder(path)?;
    decode_grid(&mut decoder, path)
}

/// Read a single-band GeoTIFF as f32. Source no-data values become NaN.
pub fn read_band_raster(path: &Path) -> Result<(Array2<f32>, RasterMetadata)> {
    debug!("Opening band raster: {}", path.display());
    let mut decoder = open_decoder(path)?;
    let grid = decode_grid(&mut decoder, path)?;
    let (height, width) = grid.dim();

    let nodata = decoder
        .get_tag_ascii_string(geo_tag(TAG_GDAL_NODATA))
        .ok()
        .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok());

    let values: Vec<f32> = match decoder.read_image()? {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => {
            return Err(AggregationError::InvalidGeoTiff(format!(
                "{}: unsupported 64-bit integer samples",
                path.display()
            )))
        }
    };

    let mut data = Array2::from_shape_vec((height, width), values)?;
    if let Some(nd) = nodata {
        let nd = nd as f32;
        if !nd.is_nan() {
            data.mapv_inplace(|v| if v == nd { f32::NAN } else { v });
        }
    }

    Ok((data, RasterMetadata { grid, nodata }))
}

fn encode_band<W, D>(
    encoder: &mut TiffEncoder<W>,
    data: &[f32],
    grid: &GridSpec,
    compression: D,
) -> Result<()>
where
    W: Write + Seek,
    D: tiff_compression::Compression,
{
    let gt = grid.geotransform;
    let tiepoint = [0.0, 0.0, 0.0, gt[0], gt[3], 0.0];
    let scale = [gt[1], gt[5].abs(), 0.0];

    let mut image = encoder.new_image_with_compression::<colortype::Gray32Float, D>(
        grid.width as u32,
        grid.height as u32,
        compression,
    )?;
    let directory = image.encoder();
    directory.write_tag(geo_tag(TAG_MODEL_PIXEL_SCALE), &scale[..])?;
    directory.write_tag(geo_tag(TAG_MODEL_TIEPOINT), &tiepoint[..])?;
    directory.write_tag(geo_tag(TAG_GEO_KEY_DIRECTORY), &GEO_KEYS_WGS84[..])?;
    directory.write_tag(geo_tag(TAG_GDAL_NODATA), "nan")?;
    image.write_data(data)?;
    Ok(())
}

/// Write one float32 band as a GeoTIFF with NaN no-data.
pub fn write_band_raster(
    path: &Path,
    data: &Array2<f32>,
    grid: &GridSpec,
    compression: Compression,
) -> Result<()> {
    if data.dim() != grid.dim() {
        return Err(AggregationError::GridMismatch(path.display().to_string()));
    }
    debug!("Writing band raster: {}", path.display());

    let contiguous = data.as_standard_layout();
    let slice = contiguous
        .as_slice()
        .ok_or_else(|| AggregationError::GridMismatch(path.display().to_string()))?;

    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;
    match compression {
        Compression::Deflate => encode_band(&mut encoder, slice, grid, tiff_compression::Deflate::default())?,
        Compression::Lzw => encode_band(&mut encoder, slice, grid, tiff_compression::Lzw::default())?,
        Compression::None => encode_band(&mut encoder, slice, grid, tiff_compression::Uncompressed::default())?,
    }

    info!(
        "Wrote {}x{} band to {}",
        grid.width,
        grid.height,
        path.display()
    );
    Ok(())
}

/// Write an 8-bit RGBA rendering (row-major, 4 bytes per pixel) with the
/// same georeferencing as the bands it was drawn from.
pub fn write_rgba_raster(path: &Path, rgba: &[u8], grid: &GridSpec) -> Result<()> {
    if rgba.len() != grid.width * grid.height * 4 {
        return Err(AggregationError::GridMismatch(path.display().to_string()));
    }
    let gt = grid.geotransform;
    let tiepoint = [0.0, 0.0, 0.0, gt[0], gt[3], 0.0];
    let scale = [gt[1], gt[5].abs(), 0.0];

    let file = BufWriter::new(File::create(path)?);
    let mut encoder = TiffEncoder::new(file)?;
    let mut image = encoder.new_image::<colortype::RGBA8>(grid.width as u32, grid.height as u32)?;
    let directory = image.encoder();
    directory.write_tag(geo_tag(TAG_MODEL_PIXEL_SCALE), &scale[..])?;
    directory.write_tag(geo_tag(TAG_MODEL_TIEPOINT), &tiepoint[..])?;
    directory.write_tag(geo_tag(TAG_GEO_KEY_DIRECTORY), &GEO_KEYS_WGS84[..])?;
    image.write_data(rgba)?;

    debug!("Wrote {}x{} preview to {}", grid.width, grid.height, path.display());
    Ok(())
}
