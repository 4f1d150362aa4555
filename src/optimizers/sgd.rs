//! Stochastic gradient descent with optional momentum and gradient clipping

use crate::blob::Blob;
use crate::optimizers::Optimizer;

/// Stochastic Gradient Descent optimizer.
///
/// With momentum `μ` each parameter keeps a history `v`:
///
/// `v = μ·v + η·∇L/∂w`, `w = w - v`
///
/// which reduces to plain `w = w - η·∇L/∂w` for `μ = 0`.
///
/// When a clipping threshold is set and the L2 norm of all gradients
/// exceeds it, every gradient is scaled down to that norm first. Exploding
/// gradients are the usual failure of recurrent nets trained this way.
///
/// # Example
///
/// ```
/// use rust_recurrent_networks::blob::Blob;
/// use rust_recurrent_networks::optimizers::{Optimizer, SGD};
///
/// let w = Blob::from_data(&[3], vec![1.0, 2.0, 3.0]);
/// w.copy_diff_from_slice(&[0.1, 0.2, 0.3]);
///
/// let mut optimizer = SGD::new(0.1);
/// optimizer.update(&[w.alias()]);
/// assert!((w.data_vec()[0] - 0.99).abs() < 1e-6);
/// ```
pub struct SGD {
    learning_rate: f32,
    momentum: f32,
    clip_gradients: Option<f32>,
    history: Vec<Vec<f32>>,
}

impl SGD {
    /// Creates a new SGD optimizer with the specified learning rate.
    ///
    /// # Arguments
    ///
    /// * `learning_rate` - The step size for parameter updates (must be positive)
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            clip_gradients: None,
            history: Vec::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    /// Rescale gradients whose global L2 norm exceeds `threshold`.
    pub fn with_clip_gradients(mut self, threshold: f32) -> Self {
        self.clip_gradients = Some(threshold);
        self
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Scale the gradients in place when their global norm exceeds the
    /// clipping threshold.
    fn clip(&self, params: &[Blob]) {
        let Some(threshold) = self.clip_gradients else {
            return;
        };
        let norm = params.iter().map(Blob::sumsq_diff).sum::<f32>().sqrt();
        if norm > threshold {
            log::debug!("gradient norm {:.4} clipped to {:.4}", norm, threshold);
            for blob in params {
                blob.scale_diff(threshold / norm);
            }
        }
    }
}

impl Optimizer for SGD {
    /// # Panics
    ///
    /// Panics if a parameter changed size since the previous update.
    fn update(&mut self, params: &[Blob]) {
        self.clip(params);
        self.history.resize_with(params.len(), Vec::new);
        for (blob, history) in params.iter().zip(self.history.iter_mut()) {
            if history.is_empty() {
                history.resize(blob.count(), 0.0);
            }
            assert_eq!(
                history.len(),
                blob.count(),
                "Parameter size changed between updates"
            );

            let grad = blob.diff();
            let mut data = blob.data_mut();
            for ((w, v), g) in data.iter_mut().zip(history.iter_mut()).zip(grad.iter()) {
                *v = self.momentum * *v + self.learning_rate * g;
                *w -= *v;
            }
        }
    }

    fn reset(&mut self) {
        self.history.clear();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
