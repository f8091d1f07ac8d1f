//! Multi-layer recurrent stack.
//!
//! Layers are built once from the configuration: every layer except the
//! last is `hidden_size` wide, the last is `hidden_size_last`, and each
//! layer is tagged plain or weight-dropped depending on `dropout_weight`.
//! Locked dropout runs between consecutive layers, not after the last.
//!
//! The stack returns every layer's raw output and every post-dropout
//! inter-layer output so the caller can compute activation-regularization
//! penalties outside this core.

use candle_core::{Device, Tensor};

use crate::config::{Mode, ModelConfig};
use crate::error::{ModelError, ModelResult};
use crate::regularize::{locked_dropout, WeightDrop, WEIGHT_HH};
use crate::rnn::{LayerState, LstmCell};

/// A stack layer, optionally wrapped with weight-drop.
enum RnnLayer {
    Plain(LstmCell),
    WeightDropped(WeightDrop),
}

impl RnnLayer {
    fn forward(
        &self,
        xs: &Tensor,
        state: &LayerState,
        mode: Mode,
    ) -> ModelResult<(Tensor, LayerState)> {
        match self {
            RnnLayer::Plain(cell) => cell.forward(xs, state),
            RnnLayer::WeightDropped(wrapped) => wrapped.forward(xs, state, mode),
        }
    }

    fn cell(&self) -> &LstmCell {
        match self {
            RnnLayer::Plain(cell) => cell,
            RnnLayer::WeightDropped(wrapped) => wrapped.cell(),
        }
    }
}

/// Result of one stack forward call.
pub struct StackOutput {
    /// Final layer's raw output, `(time, batch, hidden_size_last)`.
    pub output: Tensor,
    /// Updated per-layer `(h, c)` state.
    pub hidden: Vec<LayerState>,
    /// Every layer's raw (pre-dropout) output sequence.
    pub raw_outputs: Vec<Tensor>,
    /// Post-dropout inter-layer output sequences (one per non-final layer).
    pub outputs: Vec<Tensor>,
}

/// Ordered sequence of recurrent layers with inter-layer locked dropout.
pub struct RnnStack {
    layers: Vec<RnnLayer>,
    dropout_hidden: f64,
}

impl RnnStack {
    pub fn new(config: &ModelConfig, device: &Device) -> ModelResult<Self> {
        let mut layers = Vec::with_capacity(config.num_layers);
        for l in 0..config.num_layers {
            let cell = LstmCell::new(config.layer_input(l), config.layer_width(l), device)?;
            let layer = if config.dropout_weight > 0.0 {
                RnnLayer::WeightDropped(WeightDrop::new(cell, WEIGHT_HH, config.dropout_weight)?)
            } else {
                RnnLayer::Plain(cell)
            };
            layers.push(layer);
        }
        Ok(Self {
            layers,
            dropout_hidden: config.dropout_hidden,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Output width of layer `l`.
    pub fn layer_width(&self, l: usize) -> usize {
        self.layers[l].cell().hidden_size()
    }

    /// Parameters of all layers in checkpoint order.
    pub fn named_parameters(&self) -> Vec<(String, candle_core::Var)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(l, layer)| {
                layer
                    .cell()
                    .named_parameters()
                    .into_iter()
                    .map(move |(name, var)| (format!("rnn.{l}.{name}"), var.clone()))
            })
            .collect()
    }

    /// Run the full stack over an embedded sequence `(time, batch, input)`.
    pub fn forward(
        &self,
        emb: &Tensor,
        hidden: &[LayerState],
        mode: Mode,
    ) -> ModelResult<StackOutput> {
        if hidden.len() != self.layers.len() {
            return Err(ModelError::ShapeMismatch {
                what: "hidden state layer count".to_string(),
                expected: self.layers.len().to_string(),
                actual: hidden.len().to_string(),
            });
        }

        let last = self.layers.len() - 1;
        let mut current = emb.clone();
        let mut new_hidden = Vec::with_capacity(self.layers.len());
        let mut raw_outputs = Vec::with_capacity(self.layers.len());
        let mut outputs = Vec::with_capacity(last);

        for (l, layer) in self.layers.iter().enumerate() {
            let (raw, state) = layer.forward(&current, &hidden[l], mode)?;
            raw_outputs.push(raw.clone());
            new_hidden.push(state);
            current = if l != last {
                let dropped = locked_dropout(&raw, self.dropout_hidden, mode)?;
                outputs.push(dropped.clone());
                dropped
            } else {
                raw
            };
        }

        Ok(StackOutput {
            output: current,
            hidden: new_hidden,
            raw_outputs,
            outputs,
        })
    }
}
