//! Element-wise layers: Scale, Eltwise (sum), TanH and Reduction (sum)

use super::r#trait::{check_count, check_min_count, Layer};
use crate::blob::Blob;
use crate::utils::activations::{tanh_grad, tanh_into};
use crate::{NetError, Result};

/// Multiply bottom 0 by bottom 1, broadcasting bottom 1 over the axes of
/// bottom 0 starting at `axis`.
///
/// With bottom 0 `[1, N, H]`, bottom 1 `[1, N]` and `axis = 0` each row
/// `n` is scaled by `bottom1[n]`.
pub struct ScaleLayer {
    axis: isize,
    outer: usize,
    scale_dim: usize,
    inner: usize,
}

impl ScaleLayer {
    pub fn new(axis: isize) -> Self {
        Self {
            axis,
            outer: 0,
            scale_dim: 0,
            inner: 0,
        }
    }
}

impl Layer for ScaleLayer {
    fn layer_type(&self) -> &'static str {
        "Scale"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 2, bottom.len())?;
        check_count(self.layer_type(), "top", 1, top.len())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        let axis = bottom[0].canonical_axis(self.axis);
        let scale_axes = bottom[1].num_axes();
        let end = axis + scale_axes;
        if end > bottom[0].num_axes() || bottom[0].shape()[axis..end] != *bottom[1].shape() {
            return Err(NetError::ShapeMismatch(format!(
                "scale factor {} does not match {} at axis {}",
                bottom[1].shape_string(),
                bottom[0].shape_string(),
                axis
            )));
        }
        self.outer = bottom[0].count_range(0, axis);
        self.scale_dim = bottom[1].count();
        self.inner = bottom[0].count_from(end);
        top[0].reshape_like(&bottom[0]);
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let x = bottom[0].data();
        let s = bottom[1].data();
        let mut y = top[0].data_mut();
        let inner = self.inner;
        for o in 0..self.outer {
            for (d, &factor) in s.iter().enumerate() {
                let base = (o * self.scale_dim + d) * inner;
                for i in base..base + inner {
                    y[i] = x[i] * factor;
                }
            }
        }
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        let dy = top[0].diff();
        let inner = self.inner;
        if propagate_down.get(1).copied().unwrap_or(false) {
            let x = bottom[0].data();
            let mut ds = bottom[1].diff_mut();
            ds.fill(0.0);
            for o in 0..self.outer {
                for d in 0..self.scale_dim {
                    let base = (o * self.scale_dim + d) * inner;
                    ds[d] += (base..base + inner).map(|i| dy[i] * x[i]).sum::<f32>();
                }
            }
        }
        if propagate_down.first().copied().unwrap_or(false) {
            let s = bottom[1].data();
            let mut dx = bottom[0].diff_mut();
            for o in 0..self.outer {
                for (d, &factor) in s.iter().enumerate() {
                    let base = (o * self.scale_dim + d) * inner;
                    for i in base..base + inner {
                        dx[i] = dy[i] * factor;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Weighted sum of equally shaped bottoms.
pub struct EltwiseLayer {
    coeffs: Vec<f32>,
}

impl EltwiseLayer {
    /// An empty coefficient list means all ones.
    pub fn new(coeffs: Vec<f32>) -> Self {
        Self { coeffs }
    }

    fn coeff(&self, i: usize) -> f32 {
        self.coeffs.get(i).copied().unwrap_or(1.0)
    }
}

impl Layer for EltwiseLayer {
    fn layer_type(&self) -> &'static str {
        "Eltwise"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_min_count(self.layer_type(), "bottom", 2, bottom.len())?;
        check_count(self.layer_type(), "top", 1, top.len())?;
        if !self.coeffs.is_empty() && self.coeffs.len() != bottom.len() {
            return Err(NetError::InvalidConfig(format!(
                "eltwise has {} coefficients for {} bottoms",
                self.coeffs.len(),
                bottom.len()
            )));
        }
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        for b in &bottom[1..] {
            if b.shape() != bottom[0].shape() {
                return Err(NetError::ShapeMismatch(format!(
                    "eltwise inputs differ: {} vs {}",
                    bottom[0].shape_string(),
                    b.shape_string()
                )));
            }
        }
        top[0].reshape_like(&bottom[0]);
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let mut y = top[0].data_mut();
        y.fill(0.0);
        for (i, b) in bottom.iter().enumerate() {
            let c = self.coeff(i);
            for (v, x) in y.iter_mut().zip(b.data().iter()) {
                *v += c * x;
            }
        }
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        let dy = top[0].diff();
        for (i, b) in bottom.iter().enumerate() {
            if !propagate_down.get(i).copied().unwrap_or(false) {
                continue;
            }
            let c = self.coeff(i);
            for (d, g) in b.diff_mut().iter_mut().zip(dy.iter()) {
                *d = c * g;
            }
        }
        Ok(())
    }
}

/// Hyperbolic tangent.
#[derive(Default)]
pub struct TanHLayer;

impl Layer for TanHLayer {
    fn layer_type(&self) -> &'static str {
        "TanH"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 1, bottom.len())?;
        check_count(self.layer_type(), "top", 1, top.len())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        top[0].reshape_like(&bottom[0]);
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        tanh_into(&bottom[0].data(), &mut top[0].data_mut());
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        if !propagate_down.first().copied().unwrap_or(false) {
            return Ok(());
        }
        let y = top[0].data();
        let dy = top[0].diff();
        let mut dx = bottom[0].diff_mut();
        for ((d, &g), &v) in dx.iter_mut().zip(dy.iter()).zip(y.iter()) {
            *d = g * tanh_grad(v);
        }
        Ok(())
    }
}

/// Sum of all elements times `coeff`, producing a scalar.
///
/// The unrolled recurrent net attaches one of these, with a loss weight, to
/// every output so that the outputs count as contributing to the loss.
pub struct ReductionLayer {
    coeff: f32,
}

impl ReductionLayer {
    pub fn new(coeff: f32) -> Self {
        Self { coeff }
    }
}

impl Layer for ReductionLayer {
    fn layer_type(&self) -> &'static str {
        "Reduction"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 1, bottom.len())?;
        check_count(self.layer_type(), "top", 1, top.len())
    }

    fn reshape(&mut self, _bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        top[0].reshape(&[]);
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let sum: f32 = bottom[0].data().iter().sum();
        top[0].data_mut()[0] = self.coeff * sum;
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        if propagate_down.first().copied().unwrap_or(false) {
            let g = self.coeff * top[0].diff()[0];
            bottom[0].set_diff(g);
        }
        Ok(())
    }
}
