//! Mixture-of-softmaxes output head.
//!
//! A single softmax over the vocabulary limits the rank of the
//! log-probability matrix a language model can express. The MoS head
//! instead projects the final recurrent output `G` into `n_experts`
//! latent contexts `H = tanh(W_latent G)`, decodes each expert into a
//! full-vocabulary softmax, and mixes the expert distributions under a
//! context-dependent prior `softmax(W_prior G)`. The result is an exact
//! convex combination of softmaxes, so it normalizes by construction.
//!
//! The head is a pure function of `G`; both the latent path and the prior
//! path read the same post-dropout tensor.

use candle_core::{Device, Tensor, Var, D};
use candle_nn::ops::softmax;

use crate::config::{Mode, ModelConfig};
use crate::error::{ModelError, ModelResult};
use crate::regularize::locked_dropout;

/// Additive floor before the logarithm in log-probability mode.
const LOG_EPSILON: f64 = 1e-8;

/// Initialization range for the decoder weight, matching the embedding.
const INIT_RANGE: f32 = 0.1;

/// The mixture-of-softmaxes projection head.
pub struct MosHead {
    /// Latent projection weight, `(n_experts * input_size, hidden_size_last)`.
    latent_weight: Var,
    /// Latent projection bias, `(n_experts * input_size,)`.
    latent_bias: Var,
    /// Prior projection weight, `(n_experts, hidden_size_last)`; no bias.
    prior_weight: Var,
    /// Decoder weight, `(vocab_size, input_size)`. When weight tying is
    /// enabled this is the embedding `Var` itself: the two handles share
    /// one storage and writes through either are visible to both.
    decoder_weight: Var,
    /// Decoder bias, `(vocab_size,)`, initialized to zero.
    decoder_bias: Var,
    vocab_size: usize,
    input_size: usize,
    hidden_size_last: usize,
    n_experts: usize,
    dropout_latent: f64,
    tied: bool,
}

impl MosHead {
    /// Build the head, optionally tying the decoder weight to `embedding`.
    ///
    /// # Errors
    ///
    /// Returns `ModelError::TieDimMismatch` when tying is requested and the
    /// embedding width differs from `input_size`, and
    /// `ModelError::InvalidConfig` when the embedding row count differs
    /// from `vocab_size`.
    pub fn new(config: &ModelConfig, embedding: &Var, device: &Device) -> ModelResult<Self> {
        let (emb_rows, emb_width) = embedding.dims2()?;
        let decoder_weight = if config.tie_weights {
            if emb_width != config.input_size {
                return Err(ModelError::TieDimMismatch {
                    embedding: emb_width,
                    latent: config.input_size,
                });
            }
            if emb_rows != config.vocab_size {
                return Err(ModelError::InvalidConfig(format!(
                    "embedding has {emb_rows} rows but vocab_size is {}",
                    config.vocab_size
                )));
            }
            embedding.clone()
        } else {
            Var::from_tensor(&Tensor::rand(
                -INIT_RANGE,
                INIT_RANGE,
                (config.vocab_size, config.input_size),
                device,
            )?)?
        };

        let latent_out = config.n_experts * config.input_size;
        let bound = (1.0 / (config.hidden_size_last as f64).sqrt()) as f32;
        let latent_weight = Var::from_tensor(&Tensor::rand(
            -bound,
            bound,
            (latent_out, config.hidden_size_last),
            device,
        )?)?;
        let latent_bias =
            Var::from_tensor(&Tensor::rand(-bound, bound, latent_out, device)?)?;
        let prior_weight = Var::from_tensor(&Tensor::rand(
            -bound,
            bound,
            (config.n_experts, config.hidden_size_last),
            device,
        )?)?;
        let decoder_bias = Var::zeros(
            config.vocab_size,
            candle_core::DType::F32,
            device,
        )?;

        Ok(Self {
            latent_weight,
            latent_bias,
            prior_weight,
            decoder_weight,
            decoder_bias,
            vocab_size: config.vocab_size,
            input_size: config.input_size,
            hidden_size_last: config.hidden_size_last,
            n_experts: config.n_experts,
            dropout_latent: config.dropout_latent,
            tied: config.tie_weights,
        })
    }

    /// Whether the decoder weight shares storage with the embedding.
    pub fn tied(&self) -> bool {
        self.tied
    }

    /// The decoder output-projection weight.
    pub fn decoder_weight(&self) -> &Var {
        &self.decoder_weight
    }

    /// Parameters in checkpoint order. Under tying, `head.decoder.weight`
    /// names the shared embedding tensor.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        vec![
            ("head.latent.weight".to_string(), self.latent_weight.clone()),
            ("head.latent.bias".to_string(), self.latent_bias.clone()),
            ("head.prior.weight".to_string(), self.prior_weight.clone()),
            ("head.decoder.weight".to_string(), self.decoder_weight.clone()),
            ("head.decoder.bias".to_string(), self.decoder_bias.clone()),
        ]
    }

    /// Per-expert vocabulary distributions and the expert prior for a
    /// post-dropout final recurrent output `(time, batch, hidden_size_last)`.
    ///
    /// Returns `(expert_prob, prior)` with shapes
    /// `(time * batch, n_experts, vocab_size)` and `(time * batch, n_experts)`.
    fn mixture_components(
        &self,
        output: &Tensor,
        mode: Mode,
    ) -> ModelResult<(Tensor, Tensor)> {
        let (time, batch, width) = output.dims3()?;
        if width != self.hidden_size_last {
            return Err(ModelError::ShapeMismatch {
                what: "decoder input width".to_string(),
                expected: self.hidden_size_last.to_string(),
                actual: width.to_string(),
            });
        }

        let flat = output.reshape((time * batch, width))?;

        let latent = flat
            .matmul(&self.latent_weight.t()?)?
            .broadcast_add(self.latent_bias.as_tensor())?
            .tanh()?;
        // Reshape back to (time, batch, _) so the latent mask is shared
        // across time like every other locked mask.
        let latent = latent.reshape((time, batch, self.n_experts * self.input_size))?;
        let latent = locked_dropout(&latent, self.dropout_latent, mode)?;
        let latent = latent.reshape((time * batch * self.n_experts, self.input_size))?;

        let logit = latent
            .matmul(&self.decoder_weight.t()?)?
            .broadcast_add(self.decoder_bias.as_tensor())?;
        let expert_prob = softmax(&logit, D::Minus1)?.reshape((
            time * batch,
            self.n_experts,
            self.vocab_size,
        ))?;

        let prior_logit = flat.matmul(&self.prior_weight.t()?)?;
        let prior = softmax(&prior_logit, D::Minus1)?;

        Ok((expert_prob, prior))
    }

    /// Mix the expert distributions into the next-token distribution.
    ///
    /// `output` is the post-dropout final recurrent output of shape
    /// `(time, batch, hidden_size_last)`. Returns `(time, batch, vocab)`,
    /// as raw probabilities when `return_prob` is set and as
    /// `log(prob + 1e-8)` otherwise.
    pub fn forward(&self, output: &Tensor, mode: Mode, return_prob: bool) -> ModelResult<Tensor> {
        let (time, batch, _) = output.dims3()?;
        let (expert_prob, prior) = self.mixture_components(output, mode)?;

        let prob = expert_prob
            .broadcast_mul(&prior.unsqueeze(2)?)?
            .sum(1)?;

        let result = if return_prob {
            prob
        } else {
            prob.affine(1.0, LOG_EPSILON)?.log()?
        };
        Ok(result.reshape((time, batch, self.vocab_size))?)
    }
}
