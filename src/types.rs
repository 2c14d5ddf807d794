// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are
// used in one file.

use clap::ValueEnum;
use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The closed set of retrievable biophysical traits.
///
/// Leaf-level traits (`Cab`, `Cw`, `Cm`) are per-leaf-area quantities; the
/// `Lai*` products are their canopy-level counterparts, scaled by leaf area
/// index. Keeping this a closed enum (rather than an open string key) means
/// an unknown trait is unrepresentable past the parsing boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
pub enum TraitKind {
    /// Leaf area index.
    #[serde(rename = "LAI")]
    #[value(name = "LAI")]
    Lai,
    /// Leaf chlorophyll a+b content.
    #[serde(rename = "Cab")]
    #[value(name = "Cab")]
    Cab,
    /// Leaf water content.
    #[serde(rename = "Cw")]
    #[value(name = "Cw")]
    Cw,
    /// Leaf dry matter content.
    #[serde(rename = "Cm")]
    #[value(name = "Cm")]
    Cm,
    /// Canopy chlorophyll content (LAI × Cab).
    #[serde(rename = "laiCab")]
    #[value(name = "laiCab")]
    LaiCab,
    /// Canopy water content (LAI × Cw).
    #[serde(rename = "laiCw")]
    #[value(name = "laiCw")]
    LaiCw,
    /// Canopy dry matter content (LAI × Cm).
    #[serde(rename = "laiCm")]
    #[value(name = "laiCm")]
    LaiCm,
}

impl TraitKind {
    /// Every retrievable trait, in canonical presentation order.
    pub const ALL: [TraitKind; 7] = [
        TraitKind::Lai,
        TraitKind::Cab,
        TraitKind::Cw,
        TraitKind::Cm,
        TraitKind::LaiCab,
        TraitKind::LaiCw,
        TraitKind::LaiCm,
    ];

    /// The canonical identifier used in model files and on the command line.
    pub fn canonical_id(&self) -> &'static str {
        match self {
            TraitKind::Lai => "LAI",
            TraitKind::Cab => "Cab",
            TraitKind::Cw => "Cw",
            TraitKind::Cm => "Cm",
            TraitKind::LaiCab => "laiCab",
            TraitKind::LaiCw => "laiCw",
            TraitKind::LaiCm => "laiCm",
        }
    }

    /// Human-readable title for the legend/visualization layer.
    pub fn title(&self) -> &'static str {
        match self {
            TraitKind::Lai => "Leaf Area Index",
            TraitKind::Cab => "Leaf Chlorophyll Content",
            TraitKind::Cw => "Leaf Water Content",
            TraitKind::Cm => "Leaf Dry Matter Content",
            TraitKind::LaiCab => "Canopy Chlorophyll Content",
            TraitKind::LaiCw => "Canopy Water Content",
            TraitKind::LaiCm => "Canopy Dry Matter Content",
        }
    }

    /// Measurement unit for the legend/visualization layer.
    pub fn unit(&self) -> &'static str {
        match self {
            TraitKind::Lai => "m²/m²",
            TraitKind::Cab => "µg/cm²",
            TraitKind::Cw => "g/cm²",
            TraitKind::Cm => "g/cm²",
            TraitKind::LaiCab => "g/m²",
            TraitKind::LaiCw => "kg/m²",
            TraitKind::LaiCm => "g/m²",
        }
    }
}

impl fmt::Display for TraitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_id())
    }
}

impl FromStr for TraitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TraitKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.canonical_id() == s)
            .ok_or_else(|| {
                format!(
                    "Unknown trait identifier '{s}'. Expected one of: LAI, Cab, Cw, Cm, laiCab, laiCw, laiCm."
                )
            })
    }
}

/// Raster construction failures. These indicate a malformed input from the
/// acquisition collaborator, never an internal state.
#[derive(Error, Debug)]
pub enum RasterShapeError {
    #[error("Raster has {bands} band planes but {names} band names.")]
    BandCountMismatch { bands: usize, names: usize },
    #[error(
        "Raster mask shape ({mask_rows}x{mask_cols}) does not match band plane shape ({rows}x{cols})."
    )]
    MaskShapeMismatch {
        mask_rows: usize,
        mask_cols: usize,
        rows: usize,
        cols: usize,
    },
}

/// A cloud/water-masked, band-selected, reflectance-scaled input raster.
///
/// Band-major storage: `bands[[b, r, c]]` is the reflectance fraction of band
/// `b` at cell `(r, c)`. The validity mask is authoritative: a `false` cell
/// must never reach the inference engine, whatever its stored band values.
#[derive(Debug, Clone)]
pub struct SpectralRaster {
    bands: Array3<f64>,
    band_order: Vec<String>,
    mask: Array2<bool>,
}

impl SpectralRaster {
    /// Builds a raster from band planes, their ordered names, and a validity
    /// mask, validating that the three agree on shape.
    pub fn new(
        bands: Array3<f64>,
        band_order: Vec<String>,
        mask: Array2<bool>,
    ) -> Result<Self, RasterShapeError> {
        if bands.len_of(Axis(0)) != band_order.len() {
            return Err(RasterShapeError::BandCountMismatch {
                bands: bands.len_of(Axis(0)),
                names: band_order.len(),
            });
        }
        let (rows, cols) = (bands.len_of(Axis(1)), bands.len_of(Axis(2)));
        if mask.dim() != (rows, cols) {
            return Err(RasterShapeError::MaskShapeMismatch {
                mask_rows: mask.nrows(),
                mask_cols: mask.ncols(),
                rows,
                cols,
            });
        }
        Ok(Self {
            bands,
            band_order,
            mask,
        })
    }

    /// A fully-valid raster (no masked cells), for inputs already screened
    /// upstream.
    pub fn unmasked(bands: Array3<f64>, band_order: Vec<String>) -> Result<Self, RasterShapeError> {
        let (rows, cols) = (bands.len_of(Axis(1)), bands.len_of(Axis(2)));
        Self::new(bands, band_order, Array2::from_elem((rows, cols), true))
    }

    #[inline]
    pub fn band_order(&self) -> &[String] {
        &self.band_order
    }

    #[inline]
    pub fn bands(&self) -> ArrayView3<'_, f64> {
        self.bands.view()
    }

    #[inline]
    pub fn mask(&self) -> ArrayView2<'_, bool> {
        self.mask.view()
    }

    #[inline]
    pub fn num_bands(&self) -> usize {
        self.band_order.len()
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.bands.len_of(Axis(1))
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.bands.len_of(Axis(2))
    }

    /// The spectral vector of one cell, aligned with `band_order`.
    pub fn pixel(&self, row: usize, col: usize) -> ndarray::Array1<f64> {
        self.bands.slice(ndarray::s![.., row, col]).to_owned()
    }
}

/// A single-band trait raster on the same grid as its source imagery.
///
/// Masked cells hold `f64::NAN` as the no-data value; `mask` mirrors the
/// input raster's validity mask.
#[derive(Debug, Clone)]
pub struct TraitRaster {
    pub values: Array2<f64>,
    pub mask: Array2<bool>,
    pub output_name: String,
}

impl TraitRaster {
    /// Minimum and maximum over valid cells, for the legend's numeric range.
    /// `None` when every cell is no-data.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        let mut range: Option<(f64, f64)> = None;
        for (&value, &valid) in self.values.iter().zip(self.mask.iter()) {
            if !valid {
                continue;
            }
            range = Some(match range {
                None => (value, value),
                Some((lo, hi)) => (lo.min(value), hi.max(value)),
            });
        }
        range
    }
}
