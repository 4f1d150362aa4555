//! Parameter updates for blob-based layers
//!
//! Optimizers read each parameter blob's `diff` (the accumulated gradient)
//! and update its `data` in place. Gradients accumulate across backward
//! calls, so training loops clear them after every update, e.g. with
//! [`crate::recurrent::RecurrentLayer::clear_param_diffs`].
//!
//! # Example
//!
//! ```ignore
//! use rust_recurrent_networks::optimizers::{Optimizer, SGD};
//!
//! let mut optimizer = SGD::new(0.01).with_momentum(0.9);
//! layer.backward(&top, &[true, false], &bottom)?;
//! optimizer.update(layer.params());
//! layer.clear_param_diffs();
//! ```

pub mod sgd;

pub use sgd::SGD;

use crate::blob::Blob;

/// Core trait for optimizers over parameter blobs.
pub trait Optimizer {
    /// Apply one update step to every blob in `params`, using its `diff`
    /// as the gradient.
    ///
    /// The same blobs, in the same order, must be passed on every call
    /// so per-parameter state lines up.
    fn update(&mut self, params: &[Blob]);

    /// Drop accumulated state such as momentum history.
    fn reset(&mut self);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}
