//! Layer trait definition for blob-based layers
//!
//! Every layer consumes a list of bottom blobs and produces a list of top
//! blobs. The net calls `setup` once, `reshape` whenever input shapes may
//! have changed, then `forward` and `backward` any number of times.

use crate::blob::Blob;
use crate::{NetError, Result};

/// Execution phase of a layer or net.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// Core trait for layers of the unrolled graph.
///
/// # Contract
///
/// * `forward` writes every top's `data`.
/// * `backward` overwrites the `diff` of each bottom whose `propagate_down`
///   flag is set and *accumulates* into parameter diffs, so callers clear
///   parameter gradients between updates.
/// * Top blobs are never the same blob as a bottom; layers that pass data
///   through (split, reshape) alias storage instead.
///
/// # Example
///
/// ```ignore
/// let mut top = vec![Blob::default()];
/// layer.setup(&bottom, &mut top)?;
/// layer.reshape(&bottom, &mut top)?;
/// layer.forward(&bottom, &top)?;
/// top[0].set_diff(1.0);
/// layer.backward(&top, &[true], &bottom)?;
/// ```
pub trait Layer {
    /// Short type name used in logs and errors, e.g. `"InnerProduct"`.
    fn layer_type(&self) -> &'static str;

    /// One-time initialisation from the first bottom shapes. Layers with
    /// parameters create and fill them here.
    fn setup(&mut self, _bottom: &[Blob], _top: &mut [Blob]) -> Result<()> {
        Ok(())
    }

    /// Adjust top shapes (and internal buffers) to the bottom shapes.
    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()>;

    /// Compute tops from bottoms.
    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()>;

    /// Propagate top gradients to bottoms and parameters.
    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()>;

    /// Learnable parameter blobs.
    fn params(&self) -> &[Blob] {
        &[]
    }

    fn params_mut(&mut self) -> &mut [Blob] {
        &mut []
    }
}

/// Check a blob list length against an exact count.
pub fn check_count(layer: &str, what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(NetError::BlobCount {
            layer: layer.to_string(),
            what,
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Check a blob list length against a lower bound.
pub fn check_min_count(layer: &str, what: &'static str, min: usize, actual: usize) -> Result<()> {
    if actual < min {
        return Err(NetError::BlobCount {
            layer: layer.to_string(),
            what,
            expected: format!("at least {}", min),
            actual,
        });
    }
    Ok(())
}
