//! Single-layer LSTM cell processing a full time sequence.

use candle_core::{Device, Tensor, Var};
use candle_nn::ops::sigmoid;

use crate::error::{ModelError, ModelResult};
use crate::rnn::LayerState;

/// A single-layer LSTM.
///
/// Gate order in the packed weight matrices is input, forget, cell,
/// output. The hidden-to-hidden weight used by a forward call can be
/// supplied externally via [`LstmCell::forward_with`], which is how the
/// weight-drop wrapper installs its transient masked copy without ever
/// touching the raw parameter.
pub struct LstmCell {
    /// Input-to-hidden weight, shape `(4 * hidden, input)`.
    weight_ih: Var,
    /// Hidden-to-hidden weight, shape `(4 * hidden, hidden)`.
    weight_hh: Var,
    /// Input-to-hidden bias, shape `(4 * hidden,)`.
    bias_ih: Var,
    /// Hidden-to-hidden bias, shape `(4 * hidden,)`.
    bias_hh: Var,
    input_size: usize,
    hidden_size: usize,
}

impl LstmCell {
    /// Create a cell with all parameters drawn uniformly from
    /// `[-1/sqrt(hidden), 1/sqrt(hidden)]`.
    pub fn new(input_size: usize, hidden_size: usize, device: &Device) -> ModelResult<Self> {
        let bound = (1.0 / (hidden_size as f64).sqrt()) as f32;
        let uniform = |rows: usize, cols: usize| -> ModelResult<Var> {
            Ok(Var::from_tensor(&Tensor::rand(
                -bound,
                bound,
                (rows, cols),
                device,
            )?)?)
        };
        let uniform_vec = |len: usize| -> ModelResult<Var> {
            Ok(Var::from_tensor(&Tensor::rand(-bound, bound, len, device)?)?)
        };

        Ok(Self {
            weight_ih: uniform(4 * hidden_size, input_size)?,
            weight_hh: uniform(4 * hidden_size, hidden_size)?,
            bias_ih: uniform_vec(4 * hidden_size)?,
            bias_hh: uniform_vec(4 * hidden_size)?,
            input_size,
            hidden_size,
        })
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Look up a parameter by name.
    pub fn weight(&self, name: &str) -> Option<&Var> {
        match name {
            "weight_ih" => Some(&self.weight_ih),
            "weight_hh" => Some(&self.weight_hh),
            "bias_ih" => Some(&self.bias_ih),
            "bias_hh" => Some(&self.bias_hh),
            _ => None,
        }
    }

    pub fn has_weight(&self, name: &str) -> bool {
        self.weight(name).is_some()
    }

    /// Parameters in checkpoint order.
    pub fn named_parameters(&self) -> Vec<(&'static str, &Var)> {
        vec![
            ("weight_ih", &self.weight_ih),
            ("weight_hh", &self.weight_hh),
            ("bias_ih", &self.bias_ih),
            ("bias_hh", &self.bias_hh),
        ]
    }

    /// Process a `(time, batch, input)` sequence with the cell's own
    /// hidden-to-hidden weight.
    pub fn forward(&self, xs: &Tensor, state: &LayerState) -> ModelResult<(Tensor, LayerState)> {
        self.forward_with(xs, state, self.weight_hh.as_tensor())
    }

    /// Process a sequence with an externally supplied hidden-to-hidden
    /// weight (the weight-drop wrapper's masked copy).
    ///
    /// Returns the output sequence `(time, batch, hidden)` and the updated
    /// `(h, c)` state, each `(1, batch, hidden)`.
    pub fn forward_with(
        &self,
        xs: &Tensor,
        state: &LayerState,
        weight_hh: &Tensor,
    ) -> ModelResult<(Tensor, LayerState)> {
        let (time, batch, input) = xs.dims3()?;
        if input != self.input_size {
            return Err(ModelError::ShapeMismatch {
                what: "cell input width".to_string(),
                expected: self.input_size.to_string(),
                actual: input.to_string(),
            });
        }
        self.check_state(state, batch)?;

        let mut h = state.0.reshape((batch, self.hidden_size))?;
        let mut c = state.1.reshape((batch, self.hidden_size))?;

        // The input projection has no recurrence, so it runs over all time
        // steps in one flattened matmul.
        let x_gates = xs
            .reshape((time * batch, input))?
            .matmul(&self.weight_ih.t()?)?
            .broadcast_add(self.bias_ih.as_tensor())?
            .reshape((time, batch, 4 * self.hidden_size))?;
        let weight_hh_t = weight_hh.t()?;

        let mut steps = Vec::with_capacity(time);
        for t in 0..time {
            let gates = x_gates.get(t)?.add(
                &h.matmul(&weight_hh_t)?
                    .broadcast_add(self.bias_hh.as_tensor())?,
            )?;
            let chunks = gates.chunk(4, 1)?;
            let i = sigmoid(&chunks[0])?;
            let f = sigmoid(&chunks[1])?;
            let g = chunks[2].tanh()?;
            let o = sigmoid(&chunks[3])?;
            c = f.mul(&c)?.add(&i.mul(&g)?)?;
            h = o.mul(&c.tanh()?)?;
            steps.push(h.clone());
        }

        let output = Tensor::stack(&steps, 0)?;
        Ok((output, (h.unsqueeze(0)?, c.unsqueeze(0)?)))
    }

    fn check_state(&self, state: &LayerState, batch: usize) -> ModelResult<()> {
        for (name, part) in [("hidden", &state.0), ("cell", &state.1)] {
            let dims = part.dims();
            if dims != [1, batch, self.hidden_size] {
                return Err(ModelError::ShapeMismatch {
                    what: format!("{name} state"),
                    expected: format!("(1, {batch}, {})", self.hidden_size),
                    actual: format!("{dims:?}"),
                });
            }
        }
        Ok(())
    }
}
