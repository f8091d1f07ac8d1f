//! Sequence-consistent ("locked") dropout.
//!
//! Standard dropout draws an independent mask per element, so a feature
//! that survives at step `t` may be dropped at step `t+1`. Locked dropout
//! draws one `(1, batch, features)` mask per forward call and broadcasts
//! it across the time dimension, which keeps the noise pattern constant
//! over the whole sequence.

use candle_core::Tensor;

use crate::config::Mode;
use crate::error::ModelResult;

use super::bernoulli_mask;

/// Apply locked dropout to a `(time, batch, features)` tensor.
///
/// Identity when `p == 0` or the mode does not mask. Otherwise one
/// Bernoulli mask with keep-probability `1-p` is sampled per call and
/// multiplied into every time step; kept values are rescaled by `1/(1-p)`
/// in `Mode::Train` and left unscaled in `Mode::EvalMonteCarlo`.
pub fn locked_dropout(xs: &Tensor, p: f64, mode: Mode) -> ModelResult<Tensor> {
    if p == 0.0 || !mode.masking() {
        return Ok(xs.clone());
    }
    let (_time, batch, features) = xs.dims3()?;
    let mask = bernoulli_mask((1, batch, features), 1.0 - p, mode.rescale(), xs.device())?;
    Ok(xs.broadcast_mul(&mask)?)
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn ones(time: usize, batch: usize, features: usize) -> Tensor {
        Tensor::ones((time, batch, features), candle_core::DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn zero_probability_is_identity() {
        let xs = Tensor::rand(-1f32, 1f32, (5, 3, 7), &Device::Cpu).unwrap();
        let out = locked_dropout(&xs, 0.0, Mode::Train).unwrap();
        assert_eq!(
            xs.to_vec3::<f32>().unwrap(),
            out.to_vec3::<f32>().unwrap()
        );
    }

    #[test]
    fn eval_mode_is_identity() {
        let xs = Tensor::rand(-1f32, 1f32, (5, 3, 7), &Device::Cpu).unwrap();
        let out = locked_dropout(&xs, 0.5, Mode::Eval).unwrap();
        assert_eq!(
            xs.to_vec3::<f32>().unwrap(),
            out.to_vec3::<f32>().unwrap()
        );
    }

    #[test]
    fn mask_is_shared_across_time_steps() {
        let out = locked_dropout(&ones(6, 4, 16), 0.5, Mode::Train).unwrap();
        let values = out.to_vec3::<f32>().unwrap();
        // Every (batch, feature) position carries the same value at all
        // time steps, either dropped or kept-and-rescaled.
        for b in 0..4 {
            for f in 0..16 {
                let first = values[0][b][f];
                assert!(first == 0.0 || first == 2.0);
                for step in &values {
                    assert_eq!(step[b][f], first);
                }
            }
        }
    }

    #[test]
    fn train_mode_rescales_kept_values() {
        let out = locked_dropout(&ones(2, 8, 32), 0.2, Mode::Train).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let kept = 1.0 / 0.8f32;
        assert!(values.iter().all(|&v| v == 0.0 || (v - kept).abs() < 1e-6));
        assert!(values.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn monte_carlo_mode_masks_without_rescale() {
        let out = locked_dropout(&ones(2, 8, 32), 0.5, Mode::EvalMonteCarlo).unwrap();
        let values = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| v == 0.0 || v == 1.0));
    }
}
