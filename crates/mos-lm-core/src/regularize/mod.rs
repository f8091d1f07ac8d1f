//! Dropout-family regularization mechanisms.
//!
//! Three variants, all sampling a fresh independent mask per forward call:
//!
//! - [`locked_dropout`] — one mask shared across every time step.
//! - [`embedded_dropout`] — whole vocabulary rows dropped from the
//!   embedding table before lookup.
//! - [`WeightDrop`] — dropout on a named recurrent weight matrix.

use candle_core::{DType, Device, Shape, Tensor};

use crate::error::ModelResult;

pub mod embedded;
pub mod locked;
pub mod weight_drop;

pub use embedded::embedded_dropout;
pub use locked::locked_dropout;
pub use weight_drop::{WeightDrop, WEIGHT_HH};

/// Sample a Bernoulli keep-mask with keep-probability `keep`.
///
/// Kept elements are `1/keep` when `rescale` is set (training) and `1.0`
/// otherwise (Monte-Carlo evaluation); dropped elements are `0.0`.
pub(crate) fn bernoulli_mask<S: Into<Shape>>(
    shape: S,
    keep: f64,
    rescale: bool,
    device: &Device,
) -> ModelResult<Tensor> {
    let uniform = Tensor::rand(0f32, 1f32, shape, device)?;
    let mask = uniform.lt(keep as f32)?.to_dtype(DType::F32)?;
    if rescale {
        Ok(mask.affine(1.0 / keep, 0.0)?)
    } else {
        Ok(mask)
    }
}
