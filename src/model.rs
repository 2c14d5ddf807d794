// ========================================================================================
//                       Trait model artifacts and the model store
// ========================================================================================
//
// A `TraitModel` is the complete, pre-fit parameter set of one Gaussian Process
// Regression posterior mean: the per-band normalization, the ARD kernel
// hyperparameters, and the precomputed dual-form training quantities. Models are
// static, versioned data bundled with a deployment; this module loads them from
// human-readable TOML, validates their structural invariants once, and serves
// them read-only for the lifetime of the process.

use crate::types::TraitKind;
use ahash::AHashMap;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Custom error type for model loading, validation, and lookup.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse TOML model file: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("No model is registered for trait '{0}'.")]
    UnknownTrait(TraitKind),
    #[error("Two model files both claim trait '{0}'.")]
    DuplicateTrait(TraitKind),
    #[error(
        "Model for '{trait_kind}': field '{field}' has length {found}, but band_order lists {expected} bands."
    )]
    BandDimensionMismatch {
        trait_kind: TraitKind,
        field: &'static str,
        found: usize,
        expected: usize,
    },
    #[error(
        "Model for '{trait_kind}': field '{field}' has length {found}, but train_design has {expected} rows."
    )]
    TrainingDimensionMismatch {
        trait_kind: TraitKind,
        field: &'static str,
        found: usize,
        expected: usize,
    },
    #[error(
        "Model for '{trait_kind}': std_norm[{index}] is zero. A zero per-band scale makes normalization undefined."
    )]
    ZeroStdNorm { trait_kind: TraitKind, index: usize },
    #[error("Model for '{trait_kind}': field '{field}' contains a non-finite value.")]
    NonFiniteParameter {
        trait_kind: TraitKind,
        field: &'static str,
    },
}

/// The complete blueprint of one fitted trait model.
///
/// Field semantics follow the dual/kernel-expansion form of the SE-ARD
/// posterior mean (see `kernel`): `train_self_energy` already carries the 0.5
/// scaling folded in at fit time, and `dual_coefficients` is the precomputed
/// alpha vector, so evaluation needs no matrix inversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitModel {
    /// Which trait this model retrieves.
    pub trait_kind: TraitKind,
    /// Label for the produced output band.
    pub output_name: String,
    /// The exact band names, in the exact order, the model was fit on.
    pub band_order: Vec<String>,
    /// Per-band centering offset (mx). Length D.
    pub mean_norm: Array1<f64>,
    /// Per-band scale (sx), all nonzero. Length D.
    pub std_norm: Array1<f64>,
    /// Per-band ARD kernel relevance weight. Length D.
    pub length_scale: Array1<f64>,
    /// Kernel amplitude (signal variance).
    pub signal_variance: f64,
    /// Normalized training inputs, one row per training sample. N x D.
    pub train_design: Array2<f64>,
    /// Precomputed per-row self-energy of the training design. Length N.
    pub train_self_energy: Array1<f64>,
    /// Dual weights (alpha), one per training row. Length N.
    pub dual_coefficients: Array1<f64>,
    /// Additive offset applied after the kernel combination.
    pub bias: f64,
}

impl TraitModel {
    /// Number of spectral bands (D) the model consumes.
    #[inline]
    pub fn num_bands(&self) -> usize {
        self.band_order.len()
    }

    /// Number of training samples (N) in the dual expansion.
    #[inline]
    pub fn num_train(&self) -> usize {
        self.train_design.nrows()
    }

    /// Checks every structural invariant of the parameter set.
    ///
    /// This runs once at load time so the inference engine can assume a
    /// coherent model and stay branch-free per pixel.
    pub fn validate(&self) -> Result<(), ModelError> {
        let d = self.band_order.len();
        for (field, len) in [
            ("mean_norm", self.mean_norm.len()),
            ("std_norm", self.std_norm.len()),
            ("length_scale", self.length_scale.len()),
            ("train_design columns", self.train_design.ncols()),
        ] {
            if len != d {
                return Err(ModelError::BandDimensionMismatch {
                    trait_kind: self.trait_kind,
                    field,
                    found: len,
                    expected: d,
                });
            }
        }

        let n = self.train_design.nrows();
        for (field, len) in [
            ("train_self_energy", self.train_self_energy.len()),
            ("dual_coefficients", self.dual_coefficients.len()),
        ] {
            if len != n {
                return Err(ModelError::TrainingDimensionMismatch {
                    trait_kind: self.trait_kind,
                    field,
                    found: len,
                    expected: n,
                });
            }
        }

        if let Some(index) = self.std_norm.iter().position(|&s| s == 0.0) {
            return Err(ModelError::ZeroStdNorm {
                trait_kind: self.trait_kind,
                index,
            });
        }

        for (field, finite) in [
            ("mean_norm", self.mean_norm.iter().all(|v| v.is_finite())),
            ("std_norm", self.std_norm.iter().all(|v| v.is_finite())),
            (
                "length_scale",
                self.length_scale.iter().all(|v| v.is_finite()),
            ),
            ("signal_variance", self.signal_variance.is_finite()),
            ("train_design", self.train_design.iter().all(|v| v.is_finite())),
            (
                "train_self_energy",
                self.train_self_energy.iter().all(|v| v.is_finite()),
            ),
            (
                "dual_coefficients",
                self.dual_coefficients.iter().all(|v| v.is_finite()),
            ),
            ("bias", self.bias.is_finite()),
        ] {
            if !finite {
                return Err(ModelError::NonFiniteParameter {
                    trait_kind: self.trait_kind,
                    field,
                });
            }
        }

        Ok(())
    }

    /// Saves the model to a file in a human-readable TOML format.
    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads and validates a model from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model: TraitModel = toml::from_str(&toml_string)?;
        model.validate()?;
        Ok(model)
    }
}

/// The process-wide, read-only registry of fitted trait models.
///
/// Construction is the only mutating phase; afterwards the store is `Sync`
/// and safely shared across any number of parallel workers without locking.
#[derive(Debug, Default)]
pub struct ModelStore {
    models: AHashMap<TraitKind, TraitModel>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model, validating it first. Each trait may be registered
    /// at most once.
    pub fn insert(&mut self, model: TraitModel) -> Result<(), ModelError> {
        model.validate()?;
        if self.models.contains_key(&model.trait_kind) {
            return Err(ModelError::DuplicateTrait(model.trait_kind));
        }
        self.models.insert(model.trait_kind, model);
        Ok(())
    }

    /// Loads every `*.toml` model file in a directory.
    pub fn load_dir(dir: &Path) -> Result<Self, ModelError> {
        let mut store = Self::new();
        let mut paths: Vec<_> = fs::read_dir(dir)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        // Deterministic registration order, so DuplicateTrait reports stably.
        paths.sort();
        for path in paths {
            let model = TraitModel::load(&path)?;
            log::info!(
                "Loaded model '{}' ({} bands, {} training samples) from {}",
                model.trait_kind,
                model.num_bands(),
                model.num_train(),
                path.display()
            );
            store.insert(model)?;
        }
        Ok(store)
    }

    /// Looks up the model for a trait, failing for unregistered traits.
    pub fn get(&self, trait_kind: TraitKind) -> Result<&TraitModel, ModelError> {
        self.models
            .get(&trait_kind)
            .ok_or(ModelError::UnknownTrait(trait_kind))
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}
