// ========================================================================================
//
//                  The kernel: pure GPR posterior-mean evaluation
//
// ========================================================================================
//
// This module contains the innermost numeric core of the engine. It is a pure
// function of (spectral vector, model): no I/O, no allocation beyond its result,
// no decisions about tiling or masking. Those belong to `batch`.
//
// The math is the dual/kernel-expansion form of a squared-exponential ARD
// posterior mean. With z the normalized pixel and zw = z * length_scale:
//
//     k_i  = exp(train_design_i . zw - train_self_energy_i)
//     amp  = exp(-0.5 * zw . z) * signal_variance
//     mean = (k . dual_coefficients) * amp + bias
//
// `train_self_energy` and `dual_coefficients` are precomputed at fit time, so a
// pixel costs O(N*D) with no matrix inversion. The 0.5 scaling of the training
// self-energy is folded in at fit time; the engine must not re-scale it.

use crate::model::TraitModel;
use ndarray::{Array1, ArrayView1, ArrayView2, Axis};

/// Upper clamp on the log-kernel exponent before `exp`.
///
/// A pathological length-scale can push the exponent past the overflow
/// threshold of `f64::exp` (~709.78); clamping just below it turns an Inf
/// into a huge-but-finite kernel value that the batch layer's output check
/// can still reason about. Underflow is left alone: flushing to 0.0 is the
/// exact limit of the kernel.
pub const LOG_K_MAX: f64 = 700.0;

/// Evaluates the posterior mean for a single pixel.
///
/// `pixel` must be aligned 1:1 with `model.band_order`; the caller (the batch
/// layer) owns that contract. The model is assumed validated at load time, so
/// no per-pixel division-by-zero check is performed here.
pub fn predict(pixel: ArrayView1<'_, f64>, model: &TraitModel) -> f64 {
    debug_assert_eq!(pixel.len(), model.num_bands());

    let z = (&pixel - &model.mean_norm) / &model.std_norm;
    let zw = &z * &model.length_scale;
    let self_energy = -0.5 * zw.dot(&z);

    let cross = model.train_design.dot(&zw);
    let log_k = (cross - &model.train_self_energy).mapv(|v| v.min(LOG_K_MAX));
    let k = log_k.mapv(f64::exp);

    let amp = self_energy.exp() * model.signal_variance;
    k.dot(&model.dual_coefficients) * amp + model.bias
}

/// Evaluates the posterior mean for a whole batch of pixels at once.
///
/// `pixels` has shape `(P, D)`, one row per pixel, columns aligned with
/// `model.band_order`. This is the same algorithm as [`predict`] with the
/// cross term lifted to a single `(P, D) x (D, N)` matrix product, which is
/// what makes raster-scale evaluation viable. An empty batch yields an empty
/// result without touching the model.
pub fn predict_batch(pixels: ArrayView2<'_, f64>, model: &TraitModel) -> Array1<f64> {
    debug_assert_eq!(pixels.ncols(), model.num_bands());
    if pixels.nrows() == 0 {
        return Array1::zeros(0);
    }

    // Steps 1-2: per-band normalization, then ARD weighting. Broadcasts the
    // D-vectors across every row.
    let z = (&pixels - &model.mean_norm) / &model.std_norm;
    let zw = &z * &model.length_scale;

    // Step 3: per-pixel self-energy, a P-vector.
    let self_energy = (&zw * &z).sum_axis(Axis(1)).mapv(|s| -0.5 * s);

    // Steps 4-6: cross term against all training rows ((P, N) matrix), then
    // the log-kernel and its clamped exponential.
    let cross = zw.dot(&model.train_design.t());
    let log_k = (cross - &model.train_self_energy).mapv(|v| v.min(LOG_K_MAX));
    let k = log_k.mapv(f64::exp);

    // Steps 7-8: amplitude and the dual-weighted posterior mean.
    let amp = self_energy.mapv(f64::exp) * model.signal_variance;
    k.dot(&model.dual_coefficients) * amp + model.bias
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TraitKind;
    use approx::assert_relative_eq;
    use ndarray::{Array2, array};

    fn identity_model() -> TraitModel {
        TraitModel {
            trait_kind: TraitKind::Lai,
            output_name: "LAI".to_string(),
            band_order: vec!["B4".to_string(), "B8".to_string()],
            mean_norm: array![0.0, 0.0],
            std_norm: array![1.0, 1.0],
            length_scale: array![1.0, 1.0],
            signal_variance: 1.0,
            train_design: array![[0.0, 0.0]],
            train_self_energy: array![0.0],
            dual_coefficients: array![1.0],
            bias: 0.0,
        }
    }

    fn small_model() -> TraitModel {
        TraitModel {
            trait_kind: TraitKind::Cab,
            output_name: "Cab".to_string(),
            band_order: vec!["B4".to_string(), "B8".to_string(), "B11".to_string()],
            mean_norm: array![0.2, 0.4, 0.1],
            std_norm: array![0.05, 0.1, 0.02],
            length_scale: array![0.8, 1.6, 0.3],
            signal_variance: 2.5,
            train_design: array![
                [0.5, -1.0, 0.25],
                [-0.75, 0.5, 1.5],
                [1.25, 0.0, -0.5],
                [0.0, 2.0, 0.75],
            ],
            train_self_energy: array![0.9, 1.4, 0.6, 2.1],
            dual_coefficients: array![0.3, -0.8, 1.1, 0.05],
            bias: 12.5,
        }
    }

    #[test]
    fn identity_scenario_yields_exactly_one() {
        // z = 0, zw = 0, self = 0, cross = [0], log_k = [0], k = [1],
        // amp = 1, mean = 1*1 + 0 = 1. Must be exact.
        let result = predict(array![0.0, 0.0].view(), &identity_model());
        assert_eq!(result, 1.0);
    }

    #[test]
    fn predict_is_deterministic() {
        let model = small_model();
        let pixel = array![0.23, 0.51, 0.12];
        let first = predict(pixel.view(), &model);
        let second = predict(pixel.view(), &model);
        assert_eq!(first.to_bits(), second.to_bits());
    }

    #[test]
    fn predict_matches_hand_unrolled_algebra() {
        let model = small_model();
        let pixel = array![0.26, 0.38, 0.13];

        // Recompute the eight spec steps with scalar arithmetic.
        let d = model.num_bands();
        let mut z = vec![0.0; d];
        let mut zw = vec![0.0; d];
        for j in 0..d {
            z[j] = (pixel[j] - model.mean_norm[j]) / model.std_norm[j];
            zw[j] = z[j] * model.length_scale[j];
        }
        let self_energy: f64 = -0.5 * z.iter().zip(&zw).map(|(a, b)| a * b).sum::<f64>();
        let amp = self_energy.exp() * model.signal_variance;
        let mut acc = 0.0;
        for i in 0..model.num_train() {
            let cross: f64 = (0..d).map(|j| model.train_design[[i, j]] * zw[j]).sum();
            let k = (cross - model.train_self_energy[i]).exp();
            acc += k * model.dual_coefficients[i];
        }
        let expected = acc * amp + model.bias;

        assert_relative_eq!(predict(pixel.view(), &model), expected, max_relative = 1e-12);
    }

    #[test]
    fn batch_agrees_with_per_pixel_evaluation() {
        let model = small_model();
        let pixels = array![
            [0.23, 0.51, 0.12],
            [0.18, 0.33, 0.09],
            [0.31, 0.62, 0.15],
            [0.20, 0.40, 0.10],
            [0.27, 0.45, 0.11],
        ];
        let batch = predict_batch(pixels.view(), &model);
        for (row, &got) in pixels.outer_iter().zip(batch.iter()) {
            assert_relative_eq!(got, predict(row, &model), max_relative = 1e-12);
        }
    }

    #[test]
    fn empty_batch_returns_empty_result() {
        let model = small_model();
        let pixels = Array2::<f64>::zeros((0, 3));
        assert_eq!(predict_batch(pixels.view(), &model).len(), 0);
    }

    #[test]
    fn log_kernel_clamp_keeps_output_finite() {
        let mut model = identity_model();
        // A huge training row times a huge length-scale would overflow exp
        // without the clamp.
        model.length_scale = array![1e6, 1e6];
        model.train_design = array![[1e6, 1e6]];
        let result = predict(array![1.0, 1.0].view(), &model);
        assert!(result.is_finite());
    }
}
