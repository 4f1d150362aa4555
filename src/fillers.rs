//! Weight fillers
//!
//! A filler initialises a parameter region. Gaussian fills draw samples in
//! Box-Muller pairs and therefore only accept even element counts;
//! [`fill_padded`] works around that by over-filling one element and
//! copying back the requested range.

use crate::utils::SimpleRng;
use crate::{NetError, Result};
use serde::{Deserialize, Serialize};

/// Filler configuration, tagged by `"type"` in JSON.
///
/// ```json
/// { "type": "uniform", "min": -0.08, "max": 0.08 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FillerSpec {
    Constant {
        #[serde(default)]
        value: f32,
    },
    Uniform {
        min: f32,
        max: f32,
    },
    Gaussian {
        #[serde(default)]
        mean: f32,
        std: f32,
    },
    /// Uniform in ±sqrt(3 / fan_in).
    Xavier,
}

impl Default for FillerSpec {
    fn default() -> Self {
        FillerSpec::Xavier
    }
}

impl FillerSpec {
    pub fn constant(value: f32) -> Self {
        FillerSpec::Constant { value }
    }

    pub fn zero() -> Self {
        FillerSpec::Constant { value: 0.0 }
    }

    /// Whether the filler only accepts even element counts.
    pub fn requires_even_count(&self) -> bool {
        matches!(self, FillerSpec::Gaussian { .. })
    }
}

/// Fill `data` in place. `fan_in` is used by the Xavier filler.
pub fn fill(spec: &FillerSpec, data: &mut [f32], fan_in: usize, rng: &mut SimpleRng) -> Result<()> {
    match *spec {
        FillerSpec::Constant { value } => data.iter_mut().for_each(|v| *v = value),
        FillerSpec::Uniform { min, max } => {
            if max < min {
                return Err(NetError::InvalidConfig(format!(
                    "uniform filler needs min <= max, got {} > {}",
                    min, max
                )));
            }
            for v in data.iter_mut() {
                *v = rng.gen_range_f32(min, max);
            }
        }
        FillerSpec::Gaussian { mean, std } => {
            if data.len() % 2 != 0 {
                return Err(NetError::InvalidConfig(format!(
                    "gaussian filler requires an even count, got {}",
                    data.len()
                )));
            }
            for pair in data.chunks_exact_mut(2) {
                let (a, b) = rng.gaussian_pair();
                pair[0] = mean + std * a;
                pair[1] = mean + std * b;
            }
        }
        FillerSpec::Xavier => {
            let limit = (3.0f32 / fan_in.max(1) as f32).sqrt();
            for v in data.iter_mut() {
                *v = rng.gen_range_f32(-limit, limit);
            }
        }
    }
    Ok(())
}

/// Fill `data`, padding odd counts to even for fillers that need it.
///
/// The result equals an even-length fill of `data.len() + 1` elements
/// truncated to `data.len()`.
pub fn fill_padded(
    spec: &FillerSpec,
    data: &mut [f32],
    fan_in: usize,
    rng: &mut SimpleRng,
) -> Result<()> {
    if data.len() % 2 == 1 && spec.requires_even_count() {
        let mut padded = vec![0.0f32; data.len() + 1];
        fill(spec, &mut padded, fan_in, rng)?;
        let n = data.len();
        data.copy_from_slice(&padded[..n]);
        return Ok(());
    }
    fill(spec, data, fan_in, rng)
}
