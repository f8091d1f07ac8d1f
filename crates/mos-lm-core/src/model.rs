//! Model container and forward orchestration.

use candle_core::{DType, Device, Tensor, Var};

use crate::config::{Mode, ModelConfig};
use crate::error::{ModelError, ModelResult};
use crate::mos::MosHead;
use crate::regularize::{embedded_dropout, locked_dropout};
use crate::rnn::{LayerState, RnnStack};

/// Initialization range for the embedding table and decoder weight.
const INIT_RANGE: f32 = 0.1;

/// Per-call options for [`MosLm::forward`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOpts {
    /// Return raw probabilities instead of `log(prob + 1e-8)`.
    pub return_prob: bool,
    /// Collect per-layer activation sequences for external regularizers.
    pub return_intermediates: bool,
}

/// Result of one forward call.
pub struct ForwardOutput {
    /// Next-token distribution, `(time, batch, vocab)`; probabilities or
    /// log-probabilities depending on `ForwardOpts::return_prob`.
    pub output: Tensor,
    /// Updated per-layer recurrent state for the caller to carry forward.
    pub hidden: Vec<LayerState>,
    /// Raw output sequence of every recurrent layer, when requested.
    pub raw_outputs: Option<Vec<Tensor>>,
    /// Post-dropout activation sequences (inter-layer outputs plus the
    /// dropped final output), when requested.
    pub outputs: Option<Vec<Tensor>>,
}

/// Mixture-of-softmaxes LSTM language model.
///
/// Owns the embedding table, the recurrent stack and the output head.
/// Hidden state is owned by the caller between calls: `forward` reads the
/// state it is given and returns the replacement, with no implicit reset.
pub struct MosLm {
    encoder: Var,
    rnns: RnnStack,
    head: MosHead,
    config: ModelConfig,
    device: Device,
}

impl MosLm {
    /// Validate `config`, allocate and initialize all parameters.
    ///
    /// The embedding table and decoder weight are drawn uniformly from
    /// `[-0.1, 0.1]` and the decoder bias starts at zero; under weight
    /// tying the decoder weight is the embedding `Var` itself.
    pub fn new(config: ModelConfig, device: &Device) -> ModelResult<Self> {
        config.validate()?;

        let encoder = Var::from_tensor(&Tensor::rand(
            -INIT_RANGE,
            INIT_RANGE,
            (config.vocab_size, config.input_size),
            device,
        )?)?;
        let rnns = RnnStack::new(&config, device)?;
        let head = MosHead::new(&config, &encoder, device)?;

        let model = Self {
            encoder,
            rnns,
            head,
            config,
            device: device.clone(),
        };
        tracing::debug!(
            parameters = model.num_parameters(),
            layers = model.config.num_layers,
            experts = model.config.n_experts,
            tied = model.config.tie_weights,
            "constructed mixture-of-softmaxes language model"
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// The embedding table, `(vocab_size, input_size)`.
    pub fn encoder_weight(&self) -> &Var {
        &self.encoder
    }

    /// The output head.
    pub fn head(&self) -> &MosHead {
        &self.head
    }

    /// Fresh zeroed recurrent state for a sequence of `batch` elements.
    pub fn init_hidden(&self, batch: usize) -> ModelResult<Vec<LayerState>> {
        (0..self.config.num_layers)
            .map(|l| {
                let width = self.config.layer_width(l);
                let h = Tensor::zeros((1, batch, width), DType::F32, &self.device)?;
                let c = Tensor::zeros((1, batch, width), DType::F32, &self.device)?;
                Ok((h, c))
            })
            .collect()
    }

    /// Run the model over `tokens` (shape `(time, batch)`, dtype `U32`).
    ///
    /// All shape checks run before any computation; the call either
    /// completes or fails with no partial effect. Dropout masks are drawn
    /// fresh on every call according to `mode`.
    pub fn forward(
        &self,
        tokens: &Tensor,
        hidden: &[LayerState],
        mode: Mode,
        opts: &ForwardOpts,
    ) -> ModelResult<ForwardOutput> {
        let (time, batch) = tokens.dims2()?;
        self.check_hidden(hidden, batch)?;
        tracing::trace!(time, batch, ?mode, "forward");

        let emb = embedded_dropout(
            self.encoder.as_tensor(),
            tokens,
            self.config.dropout_embed,
            mode,
        )?;
        let emb = locked_dropout(&emb, self.config.dropout_input, mode)?;

        let stack_out = self.rnns.forward(&emb, hidden, mode)?;

        let output = locked_dropout(&stack_out.output, self.config.dropout_output, mode)?;
        let mut outputs = stack_out.outputs;
        outputs.push(output.clone());

        let decoded = self.head.forward(&output, mode, opts.return_prob)?;

        Ok(ForwardOutput {
            output: decoded,
            hidden: stack_out.hidden,
            raw_outputs: opts.return_intermediates.then_some(stack_out.raw_outputs),
            outputs: opts.return_intermediates.then_some(outputs),
        })
    }

    /// Number of trainable scalars; a tied decoder weight is counted once.
    pub fn num_parameters(&self) -> usize {
        let mut count: usize = self
            .named_parameters()
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum();
        if self.config.tie_weights {
            count -= self.encoder.elem_count();
        }
        count
    }

    /// Ordered named parameter collection for external checkpointing.
    ///
    /// Under weight tying, `encoder.weight` and `head.decoder.weight` both
    /// name the single shared tensor.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = vec![("encoder.weight".to_string(), self.encoder.clone())];
        params.extend(self.rnns.named_parameters());
        params.extend(self.head.named_parameters());
        params
    }

    fn check_hidden(&self, hidden: &[LayerState], batch: usize) -> ModelResult<()> {
        if hidden.len() != self.config.num_layers {
            return Err(ModelError::ShapeMismatch {
                what: "hidden state layer count".to_string(),
                expected: self.config.num_layers.to_string(),
                actual: hidden.len().to_string(),
            });
        }
        for (l, (h, c)) in hidden.iter().enumerate() {
            let width = self.config.layer_width(l);
            for (name, part) in [("hidden", h), ("cell", c)] {
                let dims = part.dims();
                if dims != [1, batch, width] {
                    return Err(ModelError::ShapeMismatch {
                        what: format!("layer {l} {name} state"),
                        expected: format!("(1, {batch}, {width})"),
                        actual: format!("{dims:?}"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 10,
            input_size: 12,
            hidden_size: 12,
            hidden_size_last: 12,
            num_layers: 2,
            n_experts: 3,
            tie_weights: false,
            dropout_embed: 0.0,
            dropout_input: 0.0,
            dropout_hidden: 0.0,
            dropout_output: 0.0,
            dropout_latent: 0.0,
            dropout_weight: 0.0,
        }
    }

    fn tokens(time: usize, batch: usize, vocab: usize) -> Tensor {
        let ids: Vec<u32> = (0..time * batch).map(|i| (i % vocab) as u32).collect();
        Tensor::from_vec(ids, (time, batch), &Device::Cpu).unwrap()
    }

    #[test]
    fn invalid_config_rejected_before_allocation() {
        let config = ModelConfig {
            n_experts: 0,
            ..test_config()
        };
        assert!(matches!(
            MosLm::new(config, &Device::Cpu),
            Err(ModelError::InvalidConfig(_))
        ));
    }

    #[test]
    fn init_hidden_is_zeroed_with_layer_widths() {
        let config = ModelConfig {
            hidden_size: 9,
            hidden_size_last: 7,
            input_size: 7,
            ..test_config()
        };
        let model = MosLm::new(config, &Device::Cpu).unwrap();
        let hidden = model.init_hidden(4).unwrap();
        assert_eq!(hidden.len(), 2);
        assert_eq!(hidden[0].0.dims(), [1, 4, 9]);
        assert_eq!(hidden[1].1.dims(), [1, 4, 7]);
        for (h, c) in &hidden {
            for part in [h, c] {
                let values = part.flatten_all().unwrap().to_vec1::<f32>().unwrap();
                assert!(values.iter().all(|&v| v == 0.0));
            }
        }
    }

    #[test]
    fn hidden_batch_mismatch_rejected() {
        let model = MosLm::new(test_config(), &Device::Cpu).unwrap();
        let hidden = model.init_hidden(4).unwrap();
        let result = model.forward(
            &tokens(5, 3, 10),
            &hidden,
            Mode::Train,
            &ForwardOpts::default(),
        );
        assert!(matches!(result, Err(ModelError::ShapeMismatch { .. })));
    }

    #[test]
    fn tied_model_shares_and_counts_once() {
        let untied = MosLm::new(test_config(), &Device::Cpu).unwrap();
        let tied_config = ModelConfig {
            tie_weights: true,
            ..test_config()
        };
        let tied = MosLm::new(tied_config, &Device::Cpu).unwrap();

        // One decoder weight (vocab * input_size = 120 scalars) fewer.
        assert_eq!(untied.num_parameters() - tied.num_parameters(), 120);

        // Writing the embedding is visible through the decoder handle.
        let zeros = Tensor::zeros((10, 12), DType::F32, &Device::Cpu).unwrap();
        tied.encoder_weight().set(&zeros).unwrap();
        let decoder = tied
            .head()
            .decoder_weight()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(decoder.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn named_parameters_are_ordered_and_complete() {
        let model = MosLm::new(test_config(), &Device::Cpu).unwrap();
        let names: Vec<String> = model
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names[0], "encoder.weight");
        assert_eq!(names[1], "rnn.0.weight_ih");
        assert!(names.contains(&"head.prior.weight".to_string()));
        assert_eq!(names.last().unwrap(), "head.decoder.bias");
        // encoder + 2 layers * 4 params + 5 head params
        assert_eq!(names.len(), 1 + 8 + 5);
    }

    #[test]
    fn intermediates_are_exposed_on_request() {
        let model = MosLm::new(test_config(), &Device::Cpu).unwrap();
        let hidden = model.init_hidden(3).unwrap();
        let opts = ForwardOpts {
            return_intermediates: true,
            ..ForwardOpts::default()
        };
        let out = model
            .forward(&tokens(5, 3, 10), &hidden, Mode::Train, &opts)
            .unwrap();
        let raw = out.raw_outputs.unwrap();
        let dropped = out.outputs.unwrap();
        assert_eq!(raw.len(), 2);
        // Inter-layer outputs plus the final dropped output.
        assert_eq!(dropped.len(), 2);
        assert_eq!(raw[1].dims(), dropped[1].dims());

        let bare = model
            .forward(
                &tokens(5, 3, 10),
                &hidden,
                Mode::Train,
                &ForwardOpts::default(),
            )
            .unwrap();
        assert!(bare.raw_outputs.is_none());
        assert!(bare.outputs.is_none());
    }
}
