// ========================================================================================
//                          Public API, request config & error handling
// ========================================================================================
//
// The top-level orchestration of one retrieval: look up the trait's model,
// run the tiled batch evaluation, apply the output floor. All selection state
// (which trait, how to tile) travels in an explicit `EvaluationRequest`; the
// engine holds no ambient, process-wide selection state.

use crate::batch::{self, BatchConfig, EvaluateError};
use crate::model::{ModelError, ModelStore};
use crate::postprocess::{self, TRAIT_FLOOR};
use crate::types::{SpectralRaster, TraitKind, TraitRaster};
use thiserror::Error;

/// Everything one evaluation call needs beyond the raster itself.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    /// Which trait to retrieve.
    pub trait_kind: TraitKind,
    /// Strip height override for the batch layer; `None` lets the layer
    /// derive one from the raster size and core count.
    pub tile_rows: Option<usize>,
    /// Floor for the negative-value clamp.
    pub floor: f64,
    /// Show a progress bar over strips on stderr.
    pub show_progress: bool,
}

impl EvaluationRequest {
    pub fn new(trait_kind: TraitKind) -> Self {
        Self {
            trait_kind,
            tile_rows: None,
            floor: TRAIT_FLOOR,
            show_progress: false,
        }
    }
}

/// Failures of the full retrieval pipeline. Every variant is deterministic
/// given (store, raster, request); nothing here is retried.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Evaluate(#[from] EvaluateError),
}

/// Retrieves one trait raster: model lookup, tiled GPR evaluation, floor
/// clamp. The output shares the input's grid and validity mask.
pub fn run(
    store: &ModelStore,
    raster: &SpectralRaster,
    request: &EvaluationRequest,
) -> Result<TraitRaster, PipelineError> {
    let model = store.get(request.trait_kind)?;
    log::info!(
        "Retrieving {} ({}) over {}x{} raster",
        request.trait_kind,
        request.trait_kind.title(),
        raster.nrows(),
        raster.ncols()
    );

    let config = BatchConfig {
        tile_rows: request.tile_rows,
        show_progress: request.show_progress,
    };
    let mut output = batch::evaluate(raster, model, &config)?;
    postprocess::clamp_floor(&mut output, request.floor);
    Ok(output)
}
