use crate::error::Result;
use crate::grid::GridSpec;
use crate::quality::MaskedTile;
use log::debug;
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tie-break applied before mosaicking. The first tile in the resulting
/// order that holds a valid value at a pixel supplies that pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MosaicOrder {
    /// Keep the order the source produced.
    Input,
    /// Oldest acquisition first; ties keep source order.
    #[default]
    AcquisitionAscending,
}

/// Put tiles into mosaic priority order. The sort is stable, so the result
/// is reproducible for a given input sequence.
pub fn order_tiles(tiles: &mut [MaskedTile], order: MosaicOrder) {
    match order {
        MosaicOrder::Input => {}
        MosaicOrder::AcquisitionAscending => tiles.sort_by_key(|t| t.tile().acquired),
    }
}

/// Composite surface on a target grid. No-data pixels are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct Mosaic {
    grid: GridSpec,
    bands: BTreeMap<String, Array2<f32>>,
}

impl Mosaic {
    pub fn grid(&self) -> &GridSpec {
        &self.grid
    }

    pub fn band(&self, name: &str) -> Option<&Array2<f32>> {
        self.bands.get(name)
    }

    pub fn bands(&self) -> impl Iterator<Item = (&str, &Array2<f32>)> {
        self.bands.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn valid_count(&self, name: &str) -> usize {
        self.bands
            .get(name)
            .map_or(0, |b| b.iter().filter(|v| !v.is_nan()).count())
    }
}

/// Merge `tiles` onto `grid` by nearest-neighbor sampling of each pixel
/// center. Tiles are consulted in slice order and the first valid value
/// wins; pixels without a valid contributor stay NaN.
pub fn mosaic<'a, I>(tiles: I, grid: &GridSpec, bands: &[&str]) -> Result<Mosaic>
where
    I: IntoIterator<Item = &'a MaskedTile>,
{
    let target = grid.bounds();
    let candidates: Vec<&MaskedTile> = tiles
        .into_iter()
        .filter(|t| t.tile().bounds().overlaps_wrapped(&target))
        .collect();
    debug!(
        "Mosaicking {} tiles onto {}x{} grid",
        candidates.len(),
        grid.width,
        grid.height
    );

    let mut out = BTreeMap::new();
    for &band_name in bands {
        // Resolve every tile's band up front so a missing band fails early
        let sources = candidates
            .iter()
            .map(|t| t.tile().band(band_name).map(|b| (*t, b)))
            .collect::<Result<Vec<_>>>()?;

        let mut composite = Array2::from_elem(grid.dim(), f32::NAN);
        Zip::indexed(&mut composite).par_for_each(|(row, col), value| {
            let (lon, lat) = grid.pixel_center(row, col);
            for (tile, data) in &sources {
                if let Some((r, c)) = tile.tile().grid().index_of(lon, lat) {
                    if let Some(v) = tile.valid_value(data, r, c) {
                        *value = v;
                        return;
                    }
                }
            }
        });
        out.insert(band_name.to_string(), composite);
    }

    Ok(Mosaic {
        grid: grid.clone(),
        bands: out,
    })
}
