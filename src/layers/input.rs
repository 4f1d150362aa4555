//! Input layer: declares externally filled blobs

use super::r#trait::{check_count, Layer};
use crate::blob::Blob;
use crate::Result;

/// Produces one top per configured shape. The caller writes the data
/// directly into the net's blobs; forward and backward do nothing.
pub struct InputLayer {
    shapes: Vec<Vec<usize>>,
}

impl InputLayer {
    pub fn new(shapes: Vec<Vec<usize>>) -> Self {
        Self { shapes }
    }
}

impl Layer for InputLayer {
    fn layer_type(&self) -> &'static str {
        "Input"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 0, bottom.len())?;
        check_count(self.layer_type(), "top", self.shapes.len(), top.len())?;
        for (t, shape) in top.iter_mut().zip(&self.shapes) {
            t.reshape(shape);
        }
        Ok(())
    }

    /// Shapes are owned by the caller after setup.
    fn reshape(&mut self, _bottom: &[Blob], _top: &mut [Blob]) -> Result<()> {
        Ok(())
    }

    fn forward(&mut self, _bottom: &[Blob], _top: &[Blob]) -> Result<()> {
        Ok(())
    }

    fn backward(&mut self, _top: &[Blob], _propagate_down: &[bool], _bottom: &[Blob]) -> Result<()> {
        Ok(())
    }
}
