use crate::error::{AggregationError, Result};
use crate::geodesic::{Bounds, LON_SHIFTS};
use serde::{Deserialize, Serialize};

/// Georeferencing of a north-up raster in EPSG:4326.
///
/// `geotransform` follows the GDAL affine convention:
/// `[origin_lon, pixel_width, 0, origin_lat, 0, -pixel_height]`, where the
/// origin is the outer corner of the top-left pixel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub width: usize,
    pub height: usize,
    pub geotransform: [f64; 6],
}

impl GridSpec {
    pub fn new(width: usize, height: usize, geotransform: [f64; 6]) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(AggregationError::InvalidDimensions(width, height));
        }
        if geotransform[1] <= 0.0 {
            return Err(AggregationError::InvalidPixelSize(geotransform[1]));
        }
        if geotransform[5] >= 0.0 {
            return Err(AggregationError::InvalidPixelSize(geotransform[5]));
        }
        Ok(Self {
            width,
            height,
            geotransform,
        })
    }

    /// Grid with square pixels whose top-left corner is (west, north).
    pub fn from_origin(west: f64, north: f64, pixel_size: f64, width: usize, height: usize) -> Result<Self> {
        Self::new(width, height, [west, pixel_size, 0.0, north, 0.0, -pixel_size])
    }

    pub fn dim(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    pub fn pixel_width(&self) -> f64 {
        self.geotransform[1]
    }

    pub fn pixel_height(&self) -> f64 {
        self.geotransform[5].abs()
    }

    /// (lon, lat) of the center of pixel (row, col).
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        let lon = self.geotransform[0] + (col as f64 + 0.5) * self.geotransform[1];
        let lat = self.geotransform[3] + (row as f64 + 0.5) * self.geotransform[5];
        (lon, lat)
    }

    /// Latitude of the centers of the given row.
    pub fn row_lat(&self, row: usize) -> f64 {
        self.geotransform[3] + (row as f64 + 0.5) * self.geotransform[5]
    }

    /// (row, col) of the pixel containing (lon, lat), if inside the grid.
    /// Longitudes past +/-180 are matched a whole turn around.
    pub fn index_of(&self, lon: f64, lat: f64) -> Option<(usize, usize)> {
        LON_SHIFTS
            .into_iter()
            .find_map(|dlon| self.index_of_exact(lon + dlon, lat))
    }

    fn index_of_exact(&self, lon: f64, lat: f64) -> Option<(usize, usize)> {
        let col = ((lon - self.geotransform[0]) / self.geotransform[1]).floor();
        let row = ((lat - self.geotransform[3]) / self.geotransform[5]).floor();
        if col < 0.0 || row < 0.0 {
            return None;
        }
        let (row, col) = (row as usize, col as usize);
        if row >= self.height || col >= self.width {
            return None;
        }
        Some((row, col))
    }

    pub fn bounds(&self) -> Bounds {
        let west = self.geotransform[0];
        let north = self.geotransform[3];
        Bounds {
            min_lon: west,
            max_lon: west + self.width as f64 * self.geotransform[1],
            max_lat: north,
            min_lat: north + self.height as f64 * self.geotransform[5],
        }
    }

    /// (row, col) offset of `inner` within this grid. Both must share pixel
    /// size and lattice, and `inner` must lie entirely inside.
    pub fn offset_of(&self, inner: &GridSpec) -> Result<(usize, usize)> {
        let gt = self.geotransform;
        let it = inner.geotransform;
        let mismatch = || AggregationError::GridMismatch(format!("window {:?} outside {:?}", it, gt));
        if (it[1] - gt[1]).abs() > 1e-12 || (it[5] - gt[5]).abs() > 1e-12 {
            return Err(mismatch());
        }
        let col_off = ((it[0] - gt[0]) / gt[1]).round();
        let row_off = ((it[3] - gt[3]) / gt[5]).round();
        if col_off < 0.0 || row_off < 0.0 {
            return Err(mismatch());
        }
        let (row_off, col_off) = (row_off as usize, col_off as usize);
        if row_off + inner.height > self.height || col_off + inner.width > self.width {
            return Err(mismatch());
        }
        Ok((row_off, col_off))
    }

    /// Smallest grid of `pixel_size` degree cells covering `bbox`, snapped to
    /// the global lattice anchored at (-180, 90) so windows from different
    /// buffers share pixel boundaries.
    pub fn window_for_bounds(bbox: &Bounds, pixel_size: f64) -> Result<Self> {
        if !(pixel_size > 0.0) {
            return Err(AggregationError::InvalidPixelSize(pixel_size));
        }
        let col_min = ((bbox.min_lon + 180.0) / pixel_size).floor();
        let col_max = ((bbox.max_lon + 180.0) / pixel_size).ceil();
        let row_min = ((90.0 - bbox.max_lat) / pixel_size).floor();
        let row_max = ((90.0 - bbox.min_lat) / pixel_size).ceil();

        let width = ((col_max - col_min) as usize).max(1);
        let height = ((row_max - row_min) as usize).max(1);
        let west = -180.0 + col_min * pixel_size;
        let north = 90.0 - row_min * pixel_size;
        Self::from_origin(west, north, pixel_size, width, height)
    }
}
