//! Model configuration and execution mode.
//!
//! `ModelConfig` aggregates every hyperparameter the model core needs. It
//! is validated as a whole before any parameter tensor is allocated:
//! invalid values return an error, never a silent default.
//!
//! `Mode` is the execution mode threaded explicitly into every
//! dropout-capable call. No component keeps a mutable training flag; the
//! caller states the mode on each forward call.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

/// Execution mode for a forward call.
///
/// Controls how the three dropout mechanisms behave:
///
/// - `Train`: masks are sampled and kept activations are rescaled by
///   `1/(1-p)` so expectations match evaluation.
/// - `Eval`: no masking, inputs pass through unchanged.
/// - `EvalMonteCarlo`: masks are sampled but **not** rescaled — the
///   behavior used by Monte-Carlo evaluation procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    Train,
    Eval,
    EvalMonteCarlo,
}

impl Mode {
    /// Whether dropout masks are sampled in this mode.
    pub fn masking(self) -> bool {
        !matches!(self, Mode::Eval)
    }

    /// Whether kept activations are rescaled by `1/(1-p)`.
    pub fn rescale(self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Hyperparameters of the mixture-of-softmaxes language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size; token ids live in `[0, vocab_size)`.
    pub vocab_size: usize,
    /// Embedding width, also the per-expert latent width.
    pub input_size: usize,
    /// Width of every recurrent layer except the last.
    pub hidden_size: usize,
    /// Width of the last recurrent layer.
    pub hidden_size_last: usize,
    /// Number of stacked recurrent layers.
    pub num_layers: usize,
    /// Number of softmax experts in the output head.
    pub n_experts: usize,
    /// Share one tensor between the embedding table and the decoder weight.
    pub tie_weights: bool,
    /// Per-vocabulary-row dropout on the embedding table.
    pub dropout_embed: f64,
    /// Locked dropout on the embedded input sequence.
    pub dropout_input: f64,
    /// Locked dropout between consecutive recurrent layers.
    pub dropout_hidden: f64,
    /// Locked dropout on the final recurrent output.
    pub dropout_output: f64,
    /// Locked dropout on the expert latent activations.
    pub dropout_latent: f64,
    /// Dropout on the hidden-to-hidden recurrent weight matrix.
    pub dropout_weight: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 10_000,
            input_size: 280,
            hidden_size: 960,
            hidden_size_last: 620,
            num_layers: 3,
            n_experts: 10,
            tie_weights: false,
            dropout_embed: 0.1,
            dropout_input: 0.5,
            dropout_hidden: 0.5,
            dropout_output: 0.5,
            dropout_latent: 0.5,
            dropout_weight: 0.0,
        }
    }
}

impl ModelConfig {
    /// Validate the configuration as a whole.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::InvalidConfig` for non-positive sizes or layer
    /// and expert counts, or for any dropout probability outside `[0, 1)`.
    pub fn validate(&self) -> ModelResult<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("input_size", self.input_size),
            ("hidden_size", self.hidden_size),
            ("hidden_size_last", self.hidden_size_last),
            ("num_layers", self.num_layers),
            ("n_experts", self.n_experts),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ModelError::InvalidConfig(format!(
                    "{name} must be positive"
                )));
            }
        }

        let probs = [
            ("dropout_embed", self.dropout_embed),
            ("dropout_input", self.dropout_input),
            ("dropout_hidden", self.dropout_hidden),
            ("dropout_output", self.dropout_output),
            ("dropout_latent", self.dropout_latent),
            ("dropout_weight", self.dropout_weight),
        ];
        for (name, p) in probs {
            if !(0.0..1.0).contains(&p) {
                return Err(ModelError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {p}"
                )));
            }
        }

        Ok(())
    }

    /// Input width of recurrent layer `l`.
    pub fn layer_input(&self, l: usize) -> usize {
        if l == 0 {
            self.input_size
        } else {
            self.hidden_size
        }
    }

    /// Output width of recurrent layer `l`.
    pub fn layer_width(&self, l: usize) -> usize {
        if l == self.num_layers - 1 {
            self.hidden_size_last
        } else {
            self.hidden_size
        }
    }
}
