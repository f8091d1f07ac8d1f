//! Dropout applied to a recurrent weight matrix.
//!
//! The wrapper keeps the raw trainable weight untouched. At the start of
//! every forward call it samples a fresh element-wise mask over the target
//! weight, multiplies, and hands the transient product to the wrapped cell
//! as that call's active weight. The optimizer only ever sees the raw
//! parameter; nothing about a call persists into the next one.

use candle_core::Tensor;

use crate::config::Mode;
use crate::error::{ModelError, ModelResult};
use crate::rnn::{LayerState, LstmCell};

use super::bernoulli_mask;

/// Canonical weight-drop target: the hidden-to-hidden weight matrix.
pub const WEIGHT_HH: &str = "weight_hh";

/// An [`LstmCell`] with dropout on one named weight matrix.
pub struct WeightDrop {
    cell: LstmCell,
    target: String,
    p: f64,
}

impl WeightDrop {
    /// Wrap `cell`, dropping elements of the parameter named `target` with
    /// probability `p` on every masking forward call.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::UnknownWeight` when the cell has no parameter
    /// named `target`.
    pub fn new(cell: LstmCell, target: &str, p: f64) -> ModelResult<Self> {
        if !cell.has_weight(target) {
            return Err(ModelError::UnknownWeight {
                name: target.to_string(),
            });
        }
        Ok(Self {
            cell,
            target: target.to_string(),
            p,
        })
    }

    pub fn cell(&self) -> &LstmCell {
        &self.cell
    }

    /// Forward the wrapped cell with a freshly masked active weight.
    pub fn forward(
        &self,
        xs: &Tensor,
        state: &LayerState,
        mode: Mode,
    ) -> ModelResult<(Tensor, LayerState)> {
        // Present after construction by the UnknownWeight check.
        let raw = self
            .cell
            .weight(&self.target)
            .ok_or_else(|| ModelError::UnknownWeight {
                name: self.target.clone(),
            })?;

        let active = if self.p > 0.0 && mode.masking() {
            let mask = bernoulli_mask(raw.dims(), 1.0 - self.p, mode.rescale(), raw.device())?;
            raw.as_tensor().mul(&mask)?
        } else {
            raw.as_tensor().clone()
        };

        self.cell.forward_with(xs, state, &active)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::*;

    fn zero_state(batch: usize, hidden: usize) -> LayerState {
        let zeros = || Tensor::zeros((1, batch, hidden), DType::F32, &Device::Cpu).unwrap();
        (zeros(), zeros())
    }

    #[test]
    fn unknown_target_rejected_at_construction() {
        let cell = LstmCell::new(4, 4, &Device::Cpu).unwrap();
        let result = WeightDrop::new(cell, "weight_hh_l0", 0.5);
        assert!(matches!(result, Err(ModelError::UnknownWeight { name }) if name == "weight_hh_l0"));
    }

    #[test]
    fn raw_weight_survives_repeated_forward_calls() {
        let wrapped = WeightDrop::new(LstmCell::new(4, 8, &Device::Cpu).unwrap(), WEIGHT_HH, 0.5)
            .unwrap();
        let before = wrapped
            .cell()
            .weight(WEIGHT_HH)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        let xs = Tensor::rand(-1f32, 1f32, (3, 2, 4), &Device::Cpu).unwrap();
        for _ in 0..5 {
            wrapped.forward(&xs, &zero_state(2, 8), Mode::Train).unwrap();
        }
        let after = wrapped
            .cell()
            .weight(WEIGHT_HH)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn masking_changes_the_recurrence() {
        let wrapped = WeightDrop::new(LstmCell::new(4, 16, &Device::Cpu).unwrap(), WEIGHT_HH, 0.5)
            .unwrap();
        let xs = Tensor::rand(-1f32, 1f32, (4, 2, 4), &Device::Cpu).unwrap();
        let (masked, _) = wrapped.forward(&xs, &zero_state(2, 16), Mode::Train).unwrap();
        let (plain, _) = wrapped.cell().forward(&xs, &zero_state(2, 16)).unwrap();
        assert_ne!(
            masked.to_vec3::<f32>().unwrap(),
            plain.to_vec3::<f32>().unwrap()
        );
    }

    #[test]
    fn eval_mode_matches_the_unwrapped_cell() {
        let wrapped = WeightDrop::new(LstmCell::new(4, 8, &Device::Cpu).unwrap(), WEIGHT_HH, 0.9)
            .unwrap();
        let xs = Tensor::rand(-1f32, 1f32, (3, 2, 4), &Device::Cpu).unwrap();
        let (eval_out, _) = wrapped.forward(&xs, &zero_state(2, 8), Mode::Eval).unwrap();
        let (plain, _) = wrapped.cell().forward(&xs, &zero_state(2, 8)).unwrap();
        assert_eq!(
            eval_out.to_vec3::<f32>().unwrap(),
            plain.to_vec3::<f32>().unwrap()
        );
    }
}
