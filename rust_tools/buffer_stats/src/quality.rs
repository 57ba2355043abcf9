use crate::error::Result;
use crate::tile::RasterTile;
use log::debug;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Keep a pixel only when `band` equals `equals` there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityPredicate {
    pub band: String,
    pub equals: f32,
}

impl QualityPredicate {
    pub fn new(band: impl Into<String>, equals: f32) -> Self {
        Self {
            band: band.into(),
            equals,
        }
    }
}

/// A tile together with its quality mask (`true` = pixel passes).
#[derive(Debug, Clone)]
pub struct MaskedTile {
    tile: RasterTile,
    mask: Array2<bool>,
}

impl MaskedTile {
    pub fn tile(&self) -> &RasterTile {
        &self.tile
    }

    pub fn mask(&self) -> &Array2<bool> {
        &self.mask
    }

    /// Value of `band` at (row, col) when it passes the mask and is not
    /// source no-data.
    pub fn valid_value(&self, band: &Array2<f32>, row: usize, col: usize) -> Option<f32> {
        if !self.mask[[row, col]] {
            return None;
        }
        let value = band[[row, col]];
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    pub fn valid_count(&self, band_name: &str) -> Result<usize> {
        let band = self.tile.band(band_name)?;
        Ok(Zip::from(band)
            .and(&self.mask)
            .fold(0, |acc, &v, &m| if m && !v.is_nan() { acc + 1 } else { acc }))
    }

    /// Materialise the mask: failing pixels become NaN in every band.
    pub fn to_tile(&self) -> RasterTile {
        let mut tile = self.tile.clone();
        for band in tile.bands_mut() {
            Zip::from(band).and(&self.mask).for_each(|v, &keep| {
                if !keep {
                    *v = f32::NAN;
                }
            });
        }
        tile
    }
}

/// Mask every pixel failing any predicate. Zero predicates keep every pixel.
pub fn apply(tile: RasterTile, predicates: &[QualityPredicate]) -> Result<MaskedTile> {
    let mut mask = Array2::from_elem(tile.grid().dim(), true);

    for predicate in predicates {
        let band = tile.band(&predicate.band)?;
        Zip::from(&mut mask).and(band).for_each(|keep, &v| {
            *keep = *keep && v == predicate.equals;
        });
    }

    debug!(
        "Quality mask for tile {}: {} of {} pixels pass {} predicate(s)",
        tile.id,
        mask.iter().filter(|&&m| m).count(),
        mask.len(),
        predicates.len()
    );

    Ok(MaskedTile { tile, mask })
}
