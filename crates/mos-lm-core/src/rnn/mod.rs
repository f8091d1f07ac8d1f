//! Recurrent encoder: single-layer LSTM cells and the multi-layer stack.

use candle_core::Tensor;

pub mod cell;
pub mod stack;

pub use cell::LstmCell;
pub use stack::{RnnStack, StackOutput};

/// Per-layer recurrent state: a `(hidden, cell)` pair, each of shape
/// `(1, batch, layer_width)`. Owned by the caller between forward calls.
pub type LayerState = (Tensor, Tensor);
