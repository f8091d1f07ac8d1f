//! Embedding lookup with per-vocabulary-row dropout.
//!
//! Dropout is applied to the embedding *table*, not to the looked-up
//! activations: one Bernoulli mask of shape `(vocab, 1)` is sampled per
//! forward call and multiplied into the table before the lookup, so every
//! occurrence of a dropped token anywhere in the batch maps to the zero
//! vector for that call. The persistent table is never mutated.

use candle_core::Tensor;

use crate::config::Mode;
use crate::error::ModelResult;

use super::bernoulli_mask;

/// Look up `tokens` (shape `(time, batch)`, dtype `U32`) in `weight`
/// (shape `(vocab, width)`), with optional row-level dropout.
///
/// Returns the embedded sequence of shape `(time, batch, width)`.
pub fn embedded_dropout(
    weight: &Tensor,
    tokens: &Tensor,
    p: f64,
    mode: Mode,
) -> ModelResult<Tensor> {
    let (time, batch) = tokens.dims2()?;
    let (vocab, width) = weight.dims2()?;

    let table = if p > 0.0 && mode.masking() {
        let mask = bernoulli_mask((vocab, 1), 1.0 - p, mode.rescale(), weight.device())?;
        weight.broadcast_mul(&mask)?
    } else {
        weight.clone()
    };

    let flat = tokens.flatten_all()?;
    Ok(table.index_select(&flat, 0)?.reshape((time, batch, width))?)
}
