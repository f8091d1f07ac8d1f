//! Mixture-of-softmaxes recurrent language model core.
//!
//! This crate implements the forward computation of an LSTM language model
//! with a mixture-of-softmaxes (MoS) output head and the regularization
//! mechanisms it depends on:
//!
//! - **Embedding dropout**: whole vocabulary rows are zeroed per forward
//!   call, so every occurrence of a dropped token embeds to zero.
//! - **Locked dropout**: one mask per forward call, shared across every
//!   time step of a `(time, batch, features)` tensor.
//! - **Weight drop**: dropout applied to the hidden-to-hidden recurrent
//!   weight matrix instead of activations.
//!
//! The output head projects the final recurrent state into several expert
//! contexts, computes a full-vocabulary softmax per expert and mixes them
//! under a learned prior, producing a next-token distribution that is an
//! exact convex combination of softmaxes.
//!
//! Data loading, the training loop, optimizers and checkpointing live with
//! the caller; this crate exposes the forward contract, hidden-state
//! initialization and the ordered parameter collection they need.
//!
//! # Example
//!
//! ```rust,ignore
//! use candle_core::Device;
//! use mos_lm_core::{ForwardOpts, Mode, ModelConfig, MosLm};
//!
//! let config = ModelConfig { vocab_size: 10_000, ..ModelConfig::default() };
//! let model = MosLm::new(config, &Device::Cpu)?;
//! let mut hidden = model.init_hidden(batch_size)?;
//! let out = model.forward(&tokens, &hidden, Mode::Train, &ForwardOpts::default())?;
//! hidden = out.hidden;
//! ```

pub mod config;
pub mod error;
pub mod model;
pub mod mos;
pub mod regularize;
pub mod rnn;

pub use config::{Mode, ModelConfig};
pub use error::{ModelError, ModelResult};
pub use model::{ForwardOpts, ForwardOutput, MosLm};
pub use mos::MosHead;
pub use regularize::{embedded_dropout, locked_dropout, WeightDrop};
pub use rnn::{LayerState, LstmCell, RnnStack};
