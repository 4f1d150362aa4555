//! Activation functions shared by the recurrent kernels
//!
//! Derivatives are expressed in terms of the activation output, which is
//! what the layers keep around between forward and backward.

/// Logistic sigmoid: 1 / (1 + exp(-x))
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid derivative assuming `y = sigmoid(x)`.
#[inline]
pub fn sigmoid_grad(y: f32) -> f32 {
    y * (1.0 - y)
}

/// Tanh derivative assuming `y = tanh(x)`.
#[inline]
pub fn tanh_grad(y: f32) -> f32 {
    1.0 - y * y
}

/// Apply tanh to `input`, writing into `output`.
pub fn tanh_into(input: &[f32], output: &mut [f32]) {
    assert_eq!(input.len(), output.len(), "tanh_into length mismatch");
    for (o, &x) in output.iter_mut().zip(input) {
        *o = x.tanh();
    }
}
