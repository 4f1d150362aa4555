//! Axis permutation layer

use super::r#trait::{check_count, Layer};
use crate::blob::Blob;
use crate::{NetError, Result};

/// Permute the axes of a blob: top axis `i` is bottom axis `dims[i]`.
///
/// The batch-first adapter uses `[1, 0, ...]` to swap the time and batch
/// axes in both directions.
pub struct TransposeLayer {
    dims: Vec<usize>,
    /// Row-major strides of the bottom, permuted into top order.
    strides: Vec<usize>,
    top_shape: Vec<usize>,
}

impl TransposeLayer {
    pub fn new(dims: Vec<usize>) -> Self {
        Self {
            dims,
            strides: Vec::new(),
            top_shape: Vec::new(),
        }
    }

    /// Swap the first two axes of a blob with `num_axes` axes.
    pub fn swap_leading(num_axes: usize) -> Self {
        let mut dims: Vec<usize> = (0..num_axes).collect();
        if num_axes >= 2 {
            dims.swap(0, 1);
        }
        TransposeLayer::new(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// For each top element, its bottom offset.
    fn for_each_offset(&self, mut f: impl FnMut(usize, usize)) {
        let count: usize = self.top_shape.iter().product();
        let axes = self.top_shape.len();
        let mut index = vec![0usize; axes];
        for top_offset in 0..count {
            let bottom_offset: usize = index.iter().zip(&self.strides).map(|(i, s)| i * s).sum();
            f(top_offset, bottom_offset);
            for axis in (0..axes).rev() {
                index[axis] += 1;
                if index[axis] < self.top_shape[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
    }
}

impl Layer for TransposeLayer {
    fn layer_type(&self) -> &'static str {
        "Transpose"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 1, bottom.len())?;
        check_count(self.layer_type(), "top", 1, top.len())?;
        let mut seen = vec![false; self.dims.len()];
        for &d in &self.dims {
            if d >= self.dims.len() || std::mem::replace(&mut seen[d], true) {
                return Err(NetError::InvalidConfig(format!(
                    "transpose dims {:?} are not a permutation",
                    self.dims
                )));
            }
        }
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        let shape = bottom[0].shape();
        if shape.len() != self.dims.len() {
            return Err(NetError::ShapeMismatch(format!(
                "transpose {:?} applied to {}",
                self.dims,
                bottom[0].shape_string()
            )));
        }
        let mut bottom_strides = vec![1usize; shape.len()];
        for axis in (0..shape.len().saturating_sub(1)).rev() {
            bottom_strides[axis] = bottom_strides[axis + 1] * shape[axis + 1];
        }
        self.top_shape = self.dims.iter().map(|&d| shape[d]).collect();
        self.strides = self.dims.iter().map(|&d| bottom_strides[d]).collect();
        top[0].reshape(&self.top_shape);
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let x = bottom[0].data();
        let mut y = top[0].data_mut();
        self.for_each_offset(|t, b| y[t] = x[b]);
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        if !propagate_down.first().copied().unwrap_or(false) {
            return Ok(());
        }
        let dy = top[0].diff();
        let mut dx = bottom[0].diff_mut();
        self.for_each_offset(|t, b| dx[b] = dy[t]);
        Ok(())
    }
}
