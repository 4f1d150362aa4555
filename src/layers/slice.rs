//! Slice and concat layers
//!
//! `SliceLayer` splits one bottom along an axis into several tops;
//! `ConcatLayer` joins several bottoms along an axis. Each is the other's
//! backward pass.

use super::r#trait::{check_count, check_min_count, Layer};
use crate::blob::Blob;
use crate::{NetError, Result};

/// Copy blocks between a joined buffer and its parts.
///
/// `outer` rows; each row of `joined` holds the parts' rows back to back,
/// part `i` contributing `sizes[i]` elements.
fn scatter(joined: &[f32], parts: &mut [&mut [f32]], outer: usize, sizes: &[usize]) {
    let row: usize = sizes.iter().sum();
    for o in 0..outer {
        let mut offset = o * row;
        for (part, &size) in parts.iter_mut().zip(sizes) {
            part[o * size..(o + 1) * size].copy_from_slice(&joined[offset..offset + size]);
            offset += size;
        }
    }
}

fn gather(parts: &[&[f32]], joined: &mut [f32], outer: usize, sizes: &[usize]) {
    let row: usize = sizes.iter().sum();
    for o in 0..outer {
        let mut offset = o * row;
        for (part, &size) in parts.iter().zip(sizes) {
            joined[offset..offset + size].copy_from_slice(&part[o * size..(o + 1) * size]);
            offset += size;
        }
    }
}

/// Split one blob along `axis`.
///
/// Without slice points the axis is divided evenly between the tops.
pub struct SliceLayer {
    axis: isize,
    slice_points: Vec<usize>,
    outer: usize,
    sizes: Vec<usize>,
}

impl SliceLayer {
    pub fn new(axis: isize, slice_points: Vec<usize>) -> Self {
        Self {
            axis,
            slice_points,
            outer: 0,
            sizes: Vec::new(),
        }
    }
}

impl Layer for SliceLayer {
    fn layer_type(&self) -> &'static str {
        "Slice"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 1, bottom.len())?;
        check_min_count(self.layer_type(), "top", 1, top.len())?;
        if !self.slice_points.is_empty() {
            check_count(self.layer_type(), "top", self.slice_points.len() + 1, top.len())?;
        }
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        let axis = bottom[0].canonical_axis(self.axis);
        let dim = bottom[0].shape()[axis];
        let widths: Vec<usize> = if self.slice_points.is_empty() {
            if dim % top.len() != 0 {
                return Err(NetError::ShapeMismatch(format!(
                    "cannot slice axis of size {} into {} equal parts",
                    dim,
                    top.len()
                )));
            }
            vec![dim / top.len(); top.len()]
        } else {
            let mut widths = Vec::with_capacity(top.len());
            let mut prev = 0;
            for &p in &self.slice_points {
                if p <= prev || p >= dim {
                    return Err(NetError::InvalidConfig(format!(
                        "slice points must increase within (0, {}), got {:?}",
                        dim, self.slice_points
                    )));
                }
                widths.push(p - prev);
                prev = p;
            }
            widths.push(dim - prev);
            widths
        };

        self.outer = bottom[0].count_range(0, axis);
        let inner = bottom[0].count_from(axis + 1);
        self.sizes = widths.iter().map(|w| w * inner).collect();
        for (t, &w) in top.iter_mut().zip(&widths) {
            let mut shape = bottom[0].shape().to_vec();
            shape[axis] = w;
            t.reshape(&shape);
        }
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let src = bottom[0].data();
        let mut guards: Vec<_> = top.iter().map(|t| t.data_mut()).collect();
        let mut parts: Vec<&mut [f32]> = guards.iter_mut().map(|g| &mut **g).collect();
        scatter(&src, &mut parts, self.outer, &self.sizes);
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        if !propagate_down.first().copied().unwrap_or(false) {
            return Ok(());
        }
        let guards: Vec<_> = top.iter().map(|t| t.diff()).collect();
        let parts: Vec<&[f32]> = guards.iter().map(|g| &**g).collect();
        gather(&parts, &mut bottom[0].diff_mut(), self.outer, &self.sizes);
        Ok(())
    }
}

/// Join blobs along `axis`; all other dimensions must agree.
pub struct ConcatLayer {
    axis: isize,
    outer: usize,
    sizes: Vec<usize>,
}

impl ConcatLayer {
    pub fn new(axis: isize) -> Self {
        Self {
            axis,
            outer: 0,
            sizes: Vec::new(),
        }
    }
}

impl Layer for ConcatLayer {
    fn layer_type(&self) -> &'static str {
        "Concat"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_min_count(self.layer_type(), "bottom", 1, bottom.len())?;
        check_count(self.layer_type(), "top", 1, top.len())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        let axis = bottom[0].canonical_axis(self.axis);
        let mut shape = bottom[0].shape().to_vec();
        let mut total = 0;
        for b in bottom {
            if b.num_axes() != shape.len()
                || b.shape()
                    .iter()
                    .zip(&shape)
                    .enumerate()
                    .any(|(i, (x, y))| i != axis && x != y)
            {
                return Err(NetError::ShapeMismatch(format!(
                    "concat inputs must match outside axis {}: {} vs {}",
                    axis,
                    bottom[0].shape_string(),
                    b.shape_string()
                )));
            }
            total += b.shape()[axis];
        }
        shape[axis] = total;
        self.outer = bottom[0].count_range(0, axis);
        let inner = bottom[0].count_from(axis + 1);
        self.sizes = bottom.iter().map(|b| b.shape()[axis] * inner).collect();
        top[0].reshape(&shape);
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let guards: Vec<_> = bottom.iter().map(|b| b.data()).collect();
        let parts: Vec<&[f32]> = guards.iter().map(|g| &**g).collect();
        gather(&parts, &mut top[0].data_mut(), self.outer, &self.sizes);
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        let src = top[0].diff();
        let outer = self.outer;
        let row: usize = self.sizes.iter().sum();
        let mut offset = 0;
        for (i, b) in bottom.iter().enumerate() {
            let size = self.sizes[i];
            if propagate_down.get(i).copied().unwrap_or(false) {
                let mut dst = b.diff_mut();
                for o in 0..outer {
                    let start = o * row + offset;
                    dst[o * size..(o + 1) * size].copy_from_slice(&src[start..start + size]);
                }
            }
            offset += size;
        }
        Ok(())
    }
}
