//! Layer abstractions for the unrolled graph
//!
//! This module provides the Layer trait and the layer types a recurrent
//! net is unrolled into, plus [`create_layer`] which instantiates a layer
//! from its [`LayerKind`].

mod r#trait;
pub mod elementwise;
pub mod inner_product;
pub mod input;
pub mod lstm_unit;
pub mod slice;
pub mod split;
pub mod transpose;

// Re-export the Layer trait for convenience
pub use elementwise::{EltwiseLayer, ReductionLayer, ScaleLayer, TanHLayer};
pub use inner_product::InnerProductLayer;
pub use input::InputLayer;
pub use lstm_unit::LstmUnitLayer;
pub use r#trait::{check_count, check_min_count, Layer, Phase};
pub use slice::{ConcatLayer, SliceLayer};
pub use split::{ReshapeLayer, SplitLayer};
pub use transpose::TransposeLayer;

use crate::net::spec::LayerKind;
use crate::utils::SimpleRng;

/// Instantiate a layer. Layers with fillers draw from a fork of `rng`.
pub fn create_layer(kind: &LayerKind, rng: &mut SimpleRng) -> Box<dyn Layer> {
    match kind {
        LayerKind::Input { shapes, .. } => Box::new(InputLayer::new(shapes.clone())),
        LayerKind::InnerProduct {
            num_output,
            bias_term,
            axis,
            weight_filler,
            bias_filler,
        } => Box::new(InnerProductLayer::new(
            *num_output,
            *axis,
            *bias_term,
            weight_filler.clone(),
            bias_filler.clone(),
            rng.fork(*num_output as u64),
        )),
        LayerKind::Slice { axis, slice_points } => {
            Box::new(SliceLayer::new(*axis, slice_points.clone()))
        }
        LayerKind::Concat { axis } => Box::new(ConcatLayer::new(*axis)),
        LayerKind::Scale { axis } => Box::new(ScaleLayer::new(*axis)),
        LayerKind::Eltwise { coeffs } => Box::new(EltwiseLayer::new(coeffs.clone())),
        LayerKind::LstmUnit => Box::new(LstmUnitLayer::new()),
        LayerKind::Tanh => Box::new(TanHLayer),
        LayerKind::Reshape { shape } => Box::new(ReshapeLayer::new(shape.clone())),
        LayerKind::Reduction { coeff } => Box::new(ReductionLayer::new(*coeff)),
        LayerKind::Split => Box::new(SplitLayer),
        LayerKind::Transpose { dims } => Box::new(TransposeLayer::new(dims.clone())),
    }
}
