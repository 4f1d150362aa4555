//! Layers that pass data through by aliasing storage

use super::r#trait::{check_count, check_min_count, Layer};
use crate::blob::Blob;
use crate::{NetError, Result};

/// Fan one blob out to several consumers.
///
/// Every top shares the bottom's data; each keeps its own diff, and the
/// backward pass sums them into the bottom diff.
#[derive(Default)]
pub struct SplitLayer;

impl Layer for SplitLayer {
    fn layer_type(&self) -> &'static str {
        "Split"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 1, bottom.len())?;
        check_min_count(self.layer_type(), "top", 1, top.len())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        for t in top.iter_mut() {
            t.reshape_like(&bottom[0]);
            t.share_data(&bottom[0]);
        }
        Ok(())
    }

    fn forward(&mut self, _bottom: &[Blob], _top: &[Blob]) -> Result<()> {
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        if !propagate_down.first().copied().unwrap_or(false) {
            return Ok(());
        }
        let mut dx = bottom[0].diff_mut();
        dx.copy_from_slice(&top[0].diff());
        for t in &top[1..] {
            for (d, g) in dx.iter_mut().zip(t.diff().iter()) {
                *d += g;
            }
        }
        Ok(())
    }
}

/// Change the shape without moving data.
///
/// `0` copies the corresponding bottom dimension and a single `-1` is
/// inferred from the remaining element count.
pub struct ReshapeLayer {
    shape: Vec<i64>,
}

impl ReshapeLayer {
    pub fn new(shape: Vec<i64>) -> Self {
        Self { shape }
    }

    fn top_shape(&self, bottom: &Blob) -> Result<Vec<usize>> {
        let mut out = Vec::with_capacity(self.shape.len());
        let mut inferred = None;
        for (i, &d) in self.shape.iter().enumerate() {
            match d {
                0 => {
                    let copied = bottom.shape().get(i).copied().ok_or_else(|| {
                        NetError::InvalidConfig(format!(
                            "reshape copies axis {} of {}",
                            i,
                            bottom.shape_string()
                        ))
                    })?;
                    out.push(copied);
                }
                -1 => {
                    if inferred.replace(i).is_some() {
                        return Err(NetError::InvalidConfig(
                            "reshape allows at most one -1".to_string(),
                        ));
                    }
                    out.push(1);
                }
                d if d > 0 => out.push(d as usize),
                d => {
                    return Err(NetError::InvalidConfig(format!(
                        "invalid reshape dimension {}",
                        d
                    )))
                }
            }
        }
        let known: usize = out.iter().product();
        if let Some(i) = inferred {
            if known == 0 || bottom.count() % known != 0 {
                return Err(NetError::ShapeMismatch(format!(
                    "cannot infer reshape of {} into {:?}",
                    bottom.shape_string(),
                    self.shape
                )));
            }
            out[i] = bottom.count() / known;
        }
        if out.iter().product::<usize>() != bottom.count() {
            return Err(NetError::ShapeMismatch(format!(
                "reshape of {} into {:?} changes the element count",
                bottom.shape_string(),
                out
            )));
        }
        Ok(out)
    }
}

impl Layer for ReshapeLayer {
    fn layer_type(&self) -> &'static str {
        "Reshape"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 1, bottom.len())?;
        check_count(self.layer_type(), "top", 1, top.len())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        let shape = self.top_shape(&bottom[0])?;
        top[0].reshape(&shape);
        top[0].share_data(&bottom[0]);
        top[0].share_diff(&bottom[0]);
        Ok(())
    }

    fn forward(&mut self, _bottom: &[Blob], _top: &[Blob]) -> Result<()> {
        Ok(())
    }

    fn backward(&mut self, _top: &[Blob], _propagate_down: &[bool], _bottom: &[Blob]) -> Result<()> {
        Ok(())
    }
}
