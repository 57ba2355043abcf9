//! Georeferenced multi-band raster tiles.

use crate::error::{AggregationError, Result};
use crate::geodesic::Bounds;
use crate::grid::GridSpec;
use chrono::NaiveDate;
use ndarray::Array2;
use std::collections::BTreeMap;

/// One acquisition of a dataset over a grid. All bands share the grid.
///
/// No-data pixels are stored as NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterTile {
    pub id: String,
    pub acquired: NaiveDate,
    grid: GridSpec,
    bands: BTreeMap<String, Array2<f32>>,
}

impl RasterTile {
    pub fn new(id: impl Into<String>, acquired: NaiveDate, grid: GridSpec) -> Self {
        Self {
            id: id.into(),
            acquired,
            grid,
            bands: BTreeMap::new(),
        }
    }

    /// Add a band, rejecting data whose shape differs from the tile grid.
    pub fn with_band(mut self, name: impl Into<String>, data: Array2<f32>) -> Result<Self> {
        if data.dim() != self.grid.dim() {
            return Err(AggregationError::GridMismatch(self.id));
        }
        self.bands.insert(name.into(), data);
        Ok(self)
    }

    /// Add a band filled with a single value.
    pub fn with_constant_band(self, name: impl Into<String>, value: f32) -> Result<Self> {
        let data = Array2::from_elem(self.grid.dim(), value);
        self.with_band(name, data)
    }

    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn bounds(&self) -> Bounds {
        self.grid.bounds()
    }

    pub fn band(&self, name: &str) -> Result<&Array2<f32>> {
        self.bands
            .get(name)
            .ok_or_else(|| AggregationError::MissingBand(format!("{} (tile {})", name, self.id)))
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.contains_key(name)
    }

    pub fn band_names(&self) -> impl Iterator<Item = &str> {
        self.bands.keys().map(String::as_str)
    }

    pub(crate) fn bands_mut(&mut self) -> impl Iterator<Item = &mut Array2<f32>> {
        self.bands.values_mut()
    }
}
