// ========================================================================================
//                          Output post-processing: the value floor
// ========================================================================================
//
// Biophysical trait quantities are non-negative by definition, but a GP
// posterior mean is unconstrained and can dip below zero near the edge of the
// training domain. The floor replaces strictly negative predictions with a
// small positive constant rather than zero, so downstream log-scale rendering
// never sees an exact zero.

use crate::types::TraitRaster;

/// The replacement value for negative predictions.
pub const TRAIT_FLOOR: f64 = 1e-5;

/// Replaces every strictly negative value with `floor`.
///
/// Zero and positive values pass through untouched, as do NaN no-data cells
/// (NaN fails the `< 0.0` comparison).
pub fn clamp_floor(raster: &mut TraitRaster, floor: f64) {
    raster.values.mapv_inplace(|v| if v < 0.0 { floor } else { v });
}
