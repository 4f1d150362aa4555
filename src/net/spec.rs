//! Net description structures
//!
//! A [`NetSpec`] lists layers in execution order. Layers are wired by blob
//! name: a layer's `bottoms` name blobs produced earlier as some layer's
//! `tops`. The recurrent layer builds these programmatically; they can also
//! be loaded from JSON for experimentation.
//!
//! # Example
//!
//! ```json
//! {
//!   "name": "tiny",
//!   "layers": [
//!     { "name": "input", "type": "input", "shapes": [[2, 3]], "tops": ["x"] },
//!     { "name": "fc", "type": "inner_product", "num_output": 4,
//!       "bottoms": ["x"], "tops": ["y"], "params": ["W", "b"] },
//!     { "name": "act", "type": "tanh", "bottoms": ["y"], "tops": ["z"] }
//!   ]
//! }
//! ```

use crate::fillers::FillerSpec;
use crate::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;

fn default_true() -> bool {
    true
}

fn default_axis() -> isize {
    1
}

fn default_coeff() -> f32 {
    1.0
}

fn default_seed() -> u64 {
    1701
}

/// Layer type and its type-specific parameters, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerKind {
    /// Externally filled blobs; `need_backward` marks tops that receive
    /// gradients (default: none).
    Input {
        shapes: Vec<Vec<usize>>,
        #[serde(default)]
        need_backward: Vec<bool>,
    },
    InnerProduct {
        num_output: usize,
        #[serde(default = "default_true")]
        bias_term: bool,
        #[serde(default = "default_axis")]
        axis: isize,
        #[serde(default)]
        weight_filler: FillerSpec,
        #[serde(default = "FillerSpec::zero")]
        bias_filler: FillerSpec,
    },
    Slice {
        #[serde(default)]
        axis: isize,
        #[serde(default)]
        slice_points: Vec<usize>,
    },
    Concat {
        #[serde(default)]
        axis: isize,
    },
    Scale {
        #[serde(default)]
        axis: isize,
    },
    Eltwise {
        #[serde(default)]
        coeffs: Vec<f32>,
    },
    LstmUnit,
    Tanh,
    Reshape {
        shape: Vec<i64>,
    },
    Reduction {
        #[serde(default = "default_coeff")]
        coeff: f32,
    },
    Split,
    Transpose {
        dims: Vec<usize>,
    },
}

impl LayerKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Input { .. } => "Input",
            LayerKind::InnerProduct { .. } => "InnerProduct",
            LayerKind::Slice { .. } => "Slice",
            LayerKind::Concat { .. } => "Concat",
            LayerKind::Scale { .. } => "Scale",
            LayerKind::Eltwise { .. } => "Eltwise",
            LayerKind::LstmUnit => "LSTMUnit",
            LayerKind::Tanh => "TanH",
            LayerKind::Reshape { .. } => "Reshape",
            LayerKind::Reduction { .. } => "Reduction",
            LayerKind::Split => "Split",
            LayerKind::Transpose { .. } => "Transpose",
        }
    }
}

/// One layer of a net.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
    #[serde(default)]
    pub bottoms: Vec<String>,
    #[serde(default)]
    pub tops: Vec<String>,
    /// Parameter names; layers naming the same parameter share it.
    #[serde(default)]
    pub params: Vec<String>,
    /// Per-top loss weights; a non-zero weight makes the top a loss.
    #[serde(default)]
    pub loss_weight: Vec<f32>,
    /// Per-bottom override of gradient propagation.
    #[serde(default)]
    pub propagate_down: Vec<bool>,
}

impl LayerSpec {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            bottoms: Vec::new(),
            tops: Vec::new(),
            params: Vec::new(),
            loss_weight: Vec::new(),
            propagate_down: Vec::new(),
        }
    }

    pub fn bottoms<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.bottoms = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn tops<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.tops = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn params<S: AsRef<str>>(mut self, names: &[S]) -> Self {
        self.params = names.iter().map(|s| s.as_ref().to_string()).collect();
        self
    }

    pub fn loss_weight(mut self, weight: f32) -> Self {
        self.loss_weight = vec![weight];
        self
    }

    pub fn propagate_down(mut self, flags: &[bool]) -> Self {
        self.propagate_down = flags.to_vec();
        self
    }

    /// Loss weight of top `i` (zero when unset).
    pub fn top_loss_weight(&self, i: usize) -> f32 {
        self.loss_weight.get(i).copied().unwrap_or(0.0)
    }
}

/// A whole net: name, layers in execution order and the filler seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetSpec {
    #[serde(default)]
    pub name: String,
    pub layers: Vec<LayerSpec>,
    #[serde(default = "default_seed")]
    pub random_seed: u64,
    /// Log per-layer data and gradient magnitudes.
    #[serde(default)]
    pub debug_info: bool,
}

impl NetSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            layers: Vec::new(),
            random_seed: default_seed(),
            debug_info: false,
        }
    }

    pub fn push(&mut self, layer: LayerSpec) {
        self.layers.push(layer);
    }
}

/// Load a net description from a JSON file and validate it.
///
/// # Arguments
///
/// * `path` - Path to the JSON file
///
/// # Returns
///
/// `Ok(NetSpec)` on success, or an error if the file cannot be read, the
/// JSON is invalid or the wiring is inconsistent.
///
/// # Examples
///
/// ```no_run
/// use rust_recurrent_networks::net::spec::load_net_spec;
///
/// let spec = load_net_spec("config/tiny_net.json").unwrap();
/// assert!(!spec.layers.is_empty());
/// ```
pub fn load_net_spec(path: &str) -> Result<NetSpec> {
    let contents = fs::read_to_string(path)?;
    let spec: NetSpec = serde_json::from_str(&contents)?;
    validate_net_spec(&spec)?;
    Ok(spec)
}

/// Check names and wiring without building the net.
///
/// Every bottom must name a blob produced by an earlier layer, every top
/// must be a new name, layer names must be unique, and per-blob lists
/// (`loss_weight`, `propagate_down`) must not be longer than the blob list
/// they annotate.
pub fn validate_net_spec(spec: &NetSpec) -> Result<()> {
    if spec.layers.is_empty() {
        return Err(NetError::InvalidConfig(format!(
            "net '{}' has no layers",
            spec.name
        )));
    }
    let mut layer_names = HashSet::new();
    let mut available: HashSet<&str> = HashSet::new();
    for (i, layer) in spec.layers.iter().enumerate() {
        if !layer_names.insert(layer.name.as_str()) {
            return Err(NetError::InvalidConfig(format!(
                "layer {}: duplicate layer name '{}'",
                i, layer.name
            )));
        }
        for bottom in &layer.bottoms {
            if !available.contains(bottom.as_str()) {
                return Err(NetError::UnknownBlob(format!(
                    "{} (bottom of layer '{}')",
                    bottom, layer.name
                )));
            }
        }
        for top in &layer.tops {
            if !available.insert(top.as_str()) {
                return Err(NetError::InvalidConfig(format!(
                    "layer '{}': top '{}' is already defined; in-place layers are not supported",
                    layer.name, top
                )));
            }
        }
        if layer.loss_weight.len() > layer.tops.len() {
            return Err(NetError::InvalidConfig(format!(
                "layer '{}': {} loss weights for {} tops",
                layer.name,
                layer.loss_weight.len(),
                layer.tops.len()
            )));
        }
        if !layer.propagate_down.is_empty() && layer.propagate_down.len() != layer.bottoms.len() {
            return Err(NetError::InvalidConfig(format!(
                "layer '{}': propagate_down needs one flag per bottom",
                layer.name
            )));
        }
        if let LayerKind::Input { shapes, need_backward } = &layer.kind {
            if shapes.len() != layer.tops.len() {
                return Err(NetError::InvalidConfig(format!(
                    "input layer '{}': {} shapes for {} tops",
                    layer.name,
                    shapes.len(),
                    layer.tops.len()
                )));
            }
            if need_backward.len() > shapes.len() {
                return Err(NetError::InvalidConfig(format!(
                    "input layer '{}': too many need_backward flags",
                    layer.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, tops: &[&str]) -> LayerSpec {
        LayerSpec::new(
            name,
            LayerKind::Input {
                shapes: tops.iter().map(|_| vec![1, 2]).collect(),
                need_backward: Vec::new(),
            },
        )
        .tops(tops)
    }

    #[test]
    fn test_validate_accepts_chain() {
        let mut spec = NetSpec::new("chain");
        spec.push(input("in", &["x"]));
        spec.push(LayerSpec::new("t", LayerKind::Tanh).bottoms(&["x"]).tops(&["y"]));
        assert!(validate_net_spec(&spec).is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_bottom() {
        let mut spec = NetSpec::new("bad");
        spec.push(input("in", &["x"]));
        spec.push(LayerSpec::new("t", LayerKind::Tanh).bottoms(&["z"]).tops(&["y"]));
        assert!(matches!(validate_net_spec(&spec), Err(NetError::UnknownBlob(_))));
    }

    #[test]
    fn test_validate_rejects_in_place() {
        let mut spec = NetSpec::new("bad");
        spec.push(input("in", &["x"]));
        spec.push(LayerSpec::new("t", LayerKind::Tanh).bottoms(&["x"]).tops(&["x"]));
        assert!(validate_net_spec(&spec).is_err());
    }

    #[test]
    fn test_layer_kind_json_tags() {
        let json = r#"{ "name": "fc", "type": "inner_product", "num_output": 3,
                        "bottoms": ["x"], "tops": ["y"] }"#;
        let layer: LayerSpec = serde_json::from_str(json).unwrap();
        match layer.kind {
            LayerKind::InnerProduct {
                num_output,
                bias_term,
                axis,
                ..
            } => {
                assert_eq!(num_output, 3);
                assert!(bias_term);
                assert_eq!(axis, 1);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }
}
