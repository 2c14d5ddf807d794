// ========================================================================================
//
//                  A TILED, CONTENTION-FREE RASTER COMPUTE LAYER
//
// ========================================================================================
//
// This module applies the pure kernel across a raster without ever materializing
// the full pixel set as one matrix. The raster is partitioned into horizontal
// row strips; each strip gathers its unmasked pixels into a dense (count x D)
// batch, runs the kernel once, and scatters the results back into its own
// disjoint window of the output plane. Strips are independent, so rayon
// processes them with no shared mutable state; the join at the end of the
// parallel loop is the only synchronization point.

use crate::kernel;
use crate::model::TraitModel;
use crate::types::{SpectralRaster, TraitRaster};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::iproduct;
use ndarray::parallel::prelude::*;
use ndarray::{Array2, ArrayView2, ArrayView3, ArrayViewMut2, Axis, s};
use std::io::IsTerminal;
use thiserror::Error;

// --- Tiling parameters ---

/// Lower bound on strip height. Thinner strips spend more time on gather and
/// scatter bookkeeping than on the kernel's matrix product.
const MIN_TILE_ROWS: usize = 16;
/// Strips per core the default tiling aims for, leaving rayon slack for
/// work-stealing when strip costs are uneven (e.g. cloud masks).
const STRIPS_PER_CORE: usize = 4;

/// Tuning knobs for one evaluation call. This is deliberately an explicit
/// argument rather than ambient state.
#[derive(Debug, Clone, Default)]
pub struct BatchConfig {
    /// Strip height in rows. `None` derives a height from the raster size
    /// and the core count.
    pub tile_rows: Option<usize>,
    /// Render a progress bar over strips on stderr (hidden automatically
    /// when stderr is not a terminal).
    pub show_progress: bool,
}

/// Failures of a single evaluation call. All are deterministic functions of
/// (model, raster); none is retried.
#[derive(Error, Debug)]
pub enum EvaluateError {
    #[error(
        "Input raster bands [{}] do not match the bands the model was fit on [{}]. \
         Band alignment is positional; a silent mismatch would produce a plausible-looking but wrong trait map.",
        found.join(", "),
        expected.join(", ")
    )]
    BandMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },
    #[error(
        "Evaluation produced a non-finite value ({value}) at pixel ({row}, {col}). \
         The model parameters are degenerate for this input."
    )]
    NonFiniteOutput { row: usize, col: usize, value: f64 },
}

fn create_progress_bar(len: u64, message: &str, enabled: bool) -> ProgressBar {
    let draw_target = if enabled && std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message(message.to_string());

    pb
}

/// Derives a strip height giving each core several strips to steal.
fn default_tile_rows(rows: usize) -> usize {
    (rows / (STRIPS_PER_CORE * num_cpus::get()).max(1)).max(MIN_TILE_ROWS)
}

/// Applies `model` to every unmasked pixel of `raster`.
///
/// Masked cells never reach the kernel and come back as NaN no-data in the
/// output, which shares the input's grid and mask. Tiling is a performance
/// detail: for any strip height the result is identical to evaluating every
/// pixel independently.
pub fn evaluate(
    raster: &SpectralRaster,
    model: &TraitModel,
    config: &BatchConfig,
) -> Result<TraitRaster, EvaluateError> {
    if raster.band_order() != model.band_order.as_slice() {
        return Err(EvaluateError::BandMismatch {
            expected: model.band_order.clone(),
            found: raster.band_order().to_vec(),
        });
    }

    let (rows, cols) = (raster.nrows(), raster.ncols());
    let tile_rows = config.tile_rows.unwrap_or_else(|| default_tile_rows(rows)).max(1);
    let num_strips = rows.div_ceil(tile_rows).max(1) as u64;

    log::debug!(
        "Evaluating '{}' over {rows}x{cols} raster in strips of {tile_rows} rows",
        model.trait_kind
    );
    let progress = create_progress_bar(num_strips, "Evaluating raster", config.show_progress);

    let bands = raster.bands();
    let mask = raster.mask();
    let mut values = Array2::from_elem((rows, cols), f64::NAN);

    values
        .axis_chunks_iter_mut(Axis(0), tile_rows)
        .into_par_iter()
        .enumerate()
        .try_for_each(|(strip_idx, out_strip)| {
            let row0 = strip_idx * tile_rows;
            let height = out_strip.nrows();
            let band_strip = bands.slice(s![.., row0..row0 + height, ..]);
            let mask_strip = mask.slice(s![row0..row0 + height, ..]);
            let result = evaluate_strip(band_strip, mask_strip, model, out_strip, row0);
            progress.inc(1);
            result
        })?;

    progress.finish_and_clear();

    Ok(TraitRaster {
        values,
        mask: raster.mask().to_owned(),
        output_name: model.output_name.clone(),
    })
}

/// Gathers one strip's unmasked pixels, runs the kernel batch, and scatters
/// the results back. An all-masked strip returns without invoking the kernel.
fn evaluate_strip(
    bands: ArrayView3<'_, f64>,
    mask: ArrayView2<'_, bool>,
    model: &TraitModel,
    mut out: ArrayViewMut2<'_, f64>,
    strip_row0: usize,
) -> Result<(), EvaluateError> {
    let (height, width) = mask.dim();
    let valid: Vec<(usize, usize)> = iproduct!(0..height, 0..width)
        .filter(|&(r, c)| mask[[r, c]])
        .collect();
    if valid.is_empty() {
        return Ok(());
    }

    let d = model.num_bands();
    let mut pixels = Array2::zeros((valid.len(), d));
    for (i, &(r, c)) in valid.iter().enumerate() {
        for b in 0..d {
            pixels[[i, b]] = bands[[b, r, c]];
        }
    }

    let results = kernel::predict_batch(pixels.view(), model);

    for (i, &(r, c)) in valid.iter().enumerate() {
        let value = results[i];
        if !value.is_finite() {
            return Err(EvaluateError::NonFiniteOutput {
                row: strip_row0 + r,
                col: c,
                value,
            });
        }
        out[[r, c]] = value;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TraitKind;
    use approx::assert_relative_eq;
    use ndarray::{Array3, array};

    fn test_model() -> TraitModel {
        TraitModel {
            trait_kind: TraitKind::Lai,
            output_name: "LAI".to_string(),
            band_order: vec!["B4".to_string(), "B8".to_string()],
            mean_norm: array![0.1, 0.3],
            std_norm: array![0.05, 0.15],
            length_scale: array![0.7, 1.3],
            signal_variance: 1.8,
            train_design: array![[0.4, -0.2], [-1.1, 0.9], [0.0, 1.5]],
            train_self_energy: array![0.5, 1.2, 0.8],
            dual_coefficients: array![0.6, -0.4, 0.9],
            bias: 2.0,
        }
    }

    fn test_raster(rows: usize, cols: usize) -> SpectralRaster {
        let bands = Array3::from_shape_fn((2, rows, cols), |(b, r, c)| {
            0.1 + 0.01 * (b as f64 + 1.0) * (r as f64 + 0.5) + 0.003 * c as f64
        });
        SpectralRaster::unmasked(bands, vec!["B4".to_string(), "B8".to_string()]).unwrap()
    }

    #[test]
    fn tiled_evaluation_matches_per_pixel_prediction() {
        let model = test_model();
        let raster = test_raster(23, 7);

        // Tiling must be a pure performance detail: any strip height gives
        // the same answer as independent per-pixel evaluation.
        for tile_rows in [1, 4, 23, 100] {
            let config = BatchConfig {
                tile_rows: Some(tile_rows),
                show_progress: false,
            };
            let out = evaluate(&raster, &model, &config).unwrap();
            for r in 0..raster.nrows() {
                for c in 0..raster.ncols() {
                    let expected = kernel::predict(raster.pixel(r, c).view(), &model);
                    assert_relative_eq!(out.values[[r, c]], expected, max_relative = 1e-12);
                }
            }
        }
    }

    #[test]
    fn band_order_permutation_is_rejected() {
        let model = test_model();
        let raster = test_raster(4, 4);
        // Same band set, different order: still a contract violation.
        let permuted = SpectralRaster::unmasked(
            raster.bands().to_owned(),
            vec!["B8".to_string(), "B4".to_string()],
        )
        .unwrap();

        let err = evaluate(&permuted, &model, &BatchConfig::default()).unwrap_err();
        assert!(matches!(err, EvaluateError::BandMismatch { .. }));
    }

    #[test]
    fn masked_pixels_propagate_as_no_data() {
        let model = test_model();
        let base = test_raster(6, 3);
        let mut mask = base.mask().to_owned();
        mask[[0, 0]] = false;
        mask[[5, 2]] = false;
        let raster = SpectralRaster::new(
            base.bands().to_owned(),
            base.band_order().to_vec(),
            mask,
        )
        .unwrap();

        let out = evaluate(&raster, &model, &BatchConfig::default()).unwrap();
        assert!(out.values[[0, 0]].is_nan());
        assert!(out.values[[5, 2]].is_nan());
        assert!(!out.mask[[0, 0]]);
        assert!(out.values[[3, 1]].is_finite());
    }

    #[test]
    fn all_masked_raster_yields_all_no_data_without_kernel_calls() {
        // A model whose outputs would be non-finite for any evaluated pixel:
        // if the kernel ran at all, evaluate would fail instead of succeed.
        let mut model = test_model();
        model.bias = f64::INFINITY;

        let base = test_raster(8, 4);
        let mask = Array2::from_elem((8, 4), false);
        let raster =
            SpectralRaster::new(base.bands().to_owned(), base.band_order().to_vec(), mask)
                .unwrap();

        let out = evaluate(&raster, &model, &BatchConfig::default()).unwrap();
        assert!(out.values.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn non_finite_output_is_surfaced_not_written() {
        let mut model = test_model();
        model.bias = f64::INFINITY;
        let raster = test_raster(4, 4);

        let err = evaluate(&raster, &model, &BatchConfig::default()).unwrap_err();
        assert!(matches!(err, EvaluateError::NonFiniteOutput { .. }));
    }

    #[test]
    fn output_carries_model_output_name() {
        let model = test_model();
        let raster = test_raster(2, 2);
        let out = evaluate(&raster, &model, &BatchConfig::default()).unwrap();
        assert_eq!(out.output_name, "LAI");
    }
}
