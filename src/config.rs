//! Configuration structures for recurrent layers
//!
//! A [`LayerParameter`] names the layer and carries its
//! [`RecurrentParameter`]. Both deserialize from JSON; every field except
//! `num_output` has a default.
//!
//! # Example
//!
//! ```json
//! {
//!   "name": "lstm1",
//!   "recurrent_param": {
//!     "num_output": 16,
//!     "recurrent_type": "lstm",
//!     "engine": "cudnn",
//!     "use_cudnn_rnn8_if_supported": true,
//!     "weight_filler": { "type": "uniform", "min": -0.08, "max": 0.08 }
//!   }
//! }
//! ```

use crate::fillers::FillerSpec;
use crate::layers::Phase;
use crate::{NetError, Result};
use serde::{Deserialize, Serialize};
use std::fs;

fn default_num_layers() -> usize {
    1
}

fn default_seed() -> u64 {
    1701
}

/// Cell architecture of the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrentType {
    #[default]
    Lstm,
    Rnn,
}

/// Execution engine requested for the layer.
///
/// `Default` and `Caffe` both select the unrolled graph; `Cudnn` selects
/// the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    #[default]
    Default,
    Caffe,
    Cudnn,
}

/// Recurrent layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentParameter {
    /// Hidden size H.
    pub num_output: usize,

    #[serde(default)]
    pub recurrent_type: RecurrentType,

    #[serde(default)]
    pub weight_filler: FillerSpec,

    #[serde(default = "FillerSpec::zero")]
    pub bias_filler: FillerSpec,

    /// Take the initial hidden state from extra bottoms.
    #[serde(default)]
    pub expose_hidden_input: bool,

    /// Publish the final hidden state as extra tops.
    #[serde(default)]
    pub expose_hidden_output: bool,

    #[serde(default)]
    pub engine: Engine,

    /// Prefer the RNN8 API over the legacy one when the device has it.
    #[serde(default)]
    pub use_cudnn_rnn8_if_supported: bool,

    /// Stacked layers (native engine only).
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Dropout between stacked layers (native engine only).
    #[serde(default)]
    pub dropout_ratio: f32,

    #[serde(default = "default_seed")]
    pub dropout_seed: u64,

    /// Inputs and outputs are `[N, T, ...]` instead of `[T, N, ...]`.
    #[serde(default)]
    pub batch_first: bool,

    /// Log per-layer statistics of the unrolled net.
    #[serde(default)]
    pub debug_info: bool,
}

impl RecurrentParameter {
    /// Settings with every optional field at its default.
    pub fn new(num_output: usize, recurrent_type: RecurrentType) -> Self {
        Self {
            num_output,
            recurrent_type,
            weight_filler: FillerSpec::default(),
            bias_filler: FillerSpec::zero(),
            expose_hidden_input: false,
            expose_hidden_output: false,
            engine: Engine::Default,
            use_cudnn_rnn8_if_supported: false,
            num_layers: default_num_layers(),
            dropout_ratio: 0.0,
            dropout_seed: default_seed(),
            batch_first: false,
            debug_info: false,
        }
    }

    pub fn use_native(&self) -> bool {
        self.engine == Engine::Cudnn
    }
}

/// Layer configuration: name, phase and recurrent settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParameter {
    pub name: String,

    #[serde(default)]
    pub phase: Phase,

    pub recurrent_param: RecurrentParameter,

    /// Seed for weight fillers.
    #[serde(default = "default_seed")]
    pub random_seed: u64,
}

impl LayerParameter {
    pub fn new(name: impl Into<String>, recurrent_param: RecurrentParameter) -> Self {
        Self {
            name: name.into(),
            phase: Phase::Train,
            recurrent_param,
            random_seed: default_seed(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }
}

/// Loads a recurrent layer configuration from a JSON file.
///
/// # Returns
///
/// `Ok(LayerParameter)` on success, or an error if the file cannot be read,
/// the JSON is invalid or a value is out of range.
///
/// # Examples
///
/// ```no_run
/// use rust_recurrent_networks::config::load_layer_config;
///
/// let cfg = load_layer_config("config/lstm_caffe.json").unwrap();
/// assert!(cfg.recurrent_param.num_output > 0);
/// ```
pub fn load_layer_config(path: &str) -> Result<LayerParameter> {
    let contents = fs::read_to_string(path)?;
    let config: LayerParameter = serde_json::from_str(&contents)?;
    validate_layer_config(&config)?;
    Ok(config)
}

/// Range checks that do not depend on the input shapes.
pub fn validate_layer_config(config: &LayerParameter) -> Result<()> {
    let p = &config.recurrent_param;
    if p.num_output == 0 {
        return Err(NetError::InvalidConfig(format!(
            "layer '{}': num_output must be positive",
            config.name
        )));
    }
    if p.num_layers == 0 {
        return Err(NetError::InvalidConfig(format!(
            "layer '{}': num_layers must be positive",
            config.name
        )));
    }
    if !(0.0..1.0).contains(&p.dropout_ratio) {
        return Err(NetError::InvalidConfig(format!(
            "layer '{}': dropout_ratio must be in [0, 1), got {}",
            config.name, p.dropout_ratio
        )));
    }
    Ok(())
}
