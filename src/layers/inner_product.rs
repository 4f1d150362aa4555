//! Inner product (fully connected) layer implementation
//!
//! This module provides an InnerProductLayer that performs the transformation
//! `top = bottom × Wᵀ + b` over the trailing axes of its input.

use super::r#trait::{check_count, Layer};
use crate::blob::Blob;
use crate::fillers::{fill_padded, FillerSpec};
use crate::utils::SimpleRng;
use crate::{NetError, Result};

/// Inner product layer with a weight matrix and optional bias.
///
/// Axes before `axis` are treated as the batch (`M` rows), axes from `axis`
/// on are flattened into `K` input features.
///
/// # Fields
///
/// * `num_output` - Number of output features (`N`)
/// * `axis` - First axis flattened into the feature dimension
/// * `params` - Weight blob `[N, K]`, then the bias blob `[N]` if enabled
///
/// # Example
///
/// ```ignore
/// use rust_recurrent_networks::layers::InnerProductLayer;
///
/// // [T, N, I] -> [T, N, 8]
/// let layer = InnerProductLayer::new(8, 2, true, FillerSpec::Xavier, FillerSpec::constant(0.0), rng);
/// ```
pub struct InnerProductLayer {
    num_output: usize,
    axis: isize,
    bias_term: bool,
    weight_filler: FillerSpec,
    bias_filler: FillerSpec,
    rng: SimpleRng,
    m: usize,
    k: usize,
    params: Vec<Blob>,
}

impl InnerProductLayer {
    /// Create a new InnerProductLayer. Parameters are allocated and filled
    /// at setup, once the input width is known.
    ///
    /// # Arguments
    ///
    /// * `num_output` - Number of output features
    /// * `axis` - First feature axis; negative values count from the end
    /// * `bias_term` - Whether to learn a bias
    /// * `weight_filler` / `bias_filler` - Initialisers for the parameters
    /// * `rng` - Random source for the fillers
    pub fn new(
        num_output: usize,
        axis: isize,
        bias_term: bool,
        weight_filler: FillerSpec,
        bias_filler: FillerSpec,
        rng: SimpleRng,
    ) -> Self {
        Self {
            num_output,
            axis,
            bias_term,
            weight_filler,
            bias_filler,
            rng,
            m: 0,
            k: 0,
            params: Vec::new(),
        }
    }

    /// Input feature count seen at setup.
    pub fn input_size(&self) -> usize {
        self.k
    }

    pub fn output_size(&self) -> usize {
        self.num_output
    }

    /// Weights plus biases.
    pub fn parameter_count(&self) -> usize {
        self.params.iter().map(|p| p.count()).sum()
    }
}

impl Layer for InnerProductLayer {
    fn layer_type(&self) -> &'static str {
        "InnerProduct"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 1, bottom.len())?;
        check_count(self.layer_type(), "top", 1, top.len())?;
        if self.num_output == 0 {
            return Err(NetError::InvalidConfig(
                "inner product needs num_output > 0".to_string(),
            ));
        }
        let axis = bottom[0].canonical_axis(self.axis);
        self.k = bottom[0].count_from(axis);

        let weights = Blob::new(&[self.num_output, self.k]);
        fill_padded(&self.weight_filler, &mut weights.data_mut(), self.k, &mut self.rng)?;
        self.params = vec![weights];
        if self.bias_term {
            let bias = Blob::new(&[self.num_output]);
            fill_padded(&self.bias_filler, &mut bias.data_mut(), 1, &mut self.rng)?;
            self.params.push(bias);
        }
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        let axis = bottom[0].canonical_axis(self.axis);
        let k = bottom[0].count_from(axis);
        if k != self.k {
            return Err(NetError::ShapeMismatch(format!(
                "inner product expects {} input features, got {} (bottom {})",
                self.k,
                k,
                bottom[0].shape_string()
            )));
        }
        self.m = bottom[0].count_range(0, axis);
        let mut shape = bottom[0].shape()[..axis].to_vec();
        shape.push(self.num_output);
        top[0].reshape(&shape);
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.num_output);
        let x = bottom[0].data();
        let w = self.params[0].data();
        let mut y = top[0].data_mut();
        assert_eq!(x.len(), m * k, "Input size mismatch");
        assert_eq!(y.len(), m * n, "Output size mismatch");

        for row in 0..m {
            let x_row = &x[row * k..(row + 1) * k];
            for col in 0..n {
                let w_row = &w[col * k..(col + 1) * k];
                y[row * n + col] = x_row.iter().zip(w_row).map(|(a, b)| a * b).sum();
            }
        }
        if self.bias_term {
            let b = self.params[1].data();
            for row in y.chunks_exact_mut(n) {
                for (v, bias) in row.iter_mut().zip(b.iter()) {
                    *v += bias;
                }
            }
        }
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.num_output);
        let dy = top[0].diff();
        let x = bottom[0].data();

        {
            let mut dw = self.params[0].diff_mut();
            for row in 0..m {
                let x_row = &x[row * k..(row + 1) * k];
                for col in 0..n {
                    let g = dy[row * n + col];
                    if g == 0.0 {
                        continue;
                    }
                    for (d, xv) in dw[col * k..(col + 1) * k].iter_mut().zip(x_row) {
                        *d += g * xv;
                    }
                }
            }
        }
        if self.bias_term {
            let mut db = self.params[1].diff_mut();
            for row in dy.chunks_exact(n) {
                for (d, g) in db.iter_mut().zip(row) {
                    *d += g;
                }
            }
        }

        if propagate_down.first().copied().unwrap_or(false) {
            let w = self.params[0].data();
            let mut dx = bottom[0].diff_mut();
            dx.fill(0.0);
            for row in 0..m {
                let dx_row = &mut dx[row * k..(row + 1) * k];
                for col in 0..n {
                    let g = dy[row * n + col];
                    if g == 0.0 {
                        continue;
                    }
                    for (d, wv) in dx_row.iter_mut().zip(&w[col * k..(col + 1) * k]) {
                        *d += g * wv;
                    }
                }
            }
        }
        Ok(())
    }

    fn params(&self) -> &[Blob] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Blob] {
        &mut self.params
    }
}
