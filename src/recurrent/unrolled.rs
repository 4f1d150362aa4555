//! Unrolled LSTM and RNN architectures
//!
//! Each architecture appends one timestep's worth of layers per step to a
//! [`NetSpec`] whose input layer already provides:
//!
//! * `x` `[T, N, ...]`: the input sequence,
//! * `cont` `[T, N]`: continuation indicators, zero where a sequence starts,
//! * `x_static` `[N, ...]` (optional): input shared by every timestep,
//! * the recurrent inputs at timestep 0 (`h_0`, and `c_0` for LSTM).
//!
//! Timesteps are numbered from 1; `h_{t-1}` is multiplied by `cont_t`
//! before the recurrent transform so a zero indicator drops the carried
//! state. Parameters are named so every timestep shares them.

use crate::config::RecurrentType;
use crate::fillers::FillerSpec;
use crate::net::spec::{LayerKind, LayerSpec, NetSpec};

/// Sizes and fillers of one unrolling.
#[derive(Debug, Clone)]
pub struct UnrollSettings {
    pub num_output: usize,
    pub timesteps: usize,
    pub static_input: bool,
    pub weight_filler: FillerSpec,
    pub bias_filler: FillerSpec,
}

impl UnrollSettings {
    fn inner_product(&self, num_output: usize, bias_term: bool, axis: isize) -> LayerKind {
        LayerKind::InnerProduct {
            num_output,
            bias_term,
            axis,
            weight_filler: self.weight_filler.clone(),
            bias_filler: self.bias_filler.clone(),
        }
    }
}

/// A recurrent cell that knows how to unroll itself.
pub trait Architecture {
    /// Type name used in logs, e.g. `"LSTM"`.
    fn layer_type(&self) -> &'static str;

    /// Blobs carrying state into timestep 1.
    fn recurrent_input_names(&self) -> Vec<String>;

    /// Blobs carrying state out of timestep `timesteps`, paired index by
    /// index with [`Architecture::recurrent_input_names`].
    fn recurrent_output_names(&self, timesteps: usize) -> Vec<String>;

    /// Sequence outputs, `[T, N, H]` each.
    fn output_names(&self) -> Vec<String>;

    /// Append the per-timestep layers to `net`.
    fn fill_unrolled_net(&self, settings: &UnrollSettings, net: &mut NetSpec);

    fn num_recurrent_blobs(&self) -> usize {
        self.recurrent_input_names().len()
    }
}

pub fn architecture(kind: RecurrentType) -> Box<dyn Architecture> {
    match kind {
        RecurrentType::Lstm => Box::new(LstmArchitecture),
        RecurrentType::Rnn => Box::new(RnnArchitecture),
    }
}

fn numbered(prefix: &str, from: usize, to: usize) -> Vec<String> {
    (from..=to).map(|t| format!("{}{}", prefix, t)).collect()
}

/// Slices shared by both architectures: `cont_t` and the per-step input
/// transform `{transformed}_t`.
fn push_input_slices(
    settings: &UnrollSettings,
    net: &mut NetSpec,
    weight: &str,
    bias: &str,
    gates: usize,
) -> (String, Option<String>) {
    let t_max = settings.timesteps;
    let h = settings.num_output;
    let x_name = format!("{}_x", weight);

    net.push(
        LayerSpec::new("cont_slice", LayerKind::Slice { axis: 0, slice_points: Vec::new() })
            .bottoms(&["cont"])
            .tops(&numbered("cont_", 1, t_max)),
    );
    net.push(
        LayerSpec::new("x_transform", settings.inner_product(gates * h, true, 2))
            .bottoms(&["x"])
            .tops(&[x_name.as_str()])
            .params(&[weight, bias]),
    );

    let static_name = if settings.static_input {
        let static_weight = format!("{}_static", weight);
        let transformed = format!("{}_x_static", weight);
        let preshape = format!("{}_preshape", transformed);
        net.push(
            LayerSpec::new(transformed.clone(), settings.inner_product(gates * h, false, 1))
                .bottoms(&["x_static"])
                .tops(&[preshape.as_str()])
                .params(&[static_weight]),
        );
        net.push(
            LayerSpec::new(
                format!("{}_reshape", transformed),
                LayerKind::Reshape {
                    shape: vec![1, -1, (gates * h) as i64],
                },
            )
            .bottoms(&[preshape])
            .tops(&[transformed.as_str()]),
        );
        Some(transformed)
    } else {
        None
    };

    net.push(
        LayerSpec::new("x_slice", LayerKind::Slice { axis: 0, slice_points: Vec::new() })
            .bottoms(&[x_name.as_str()])
            .tops(&numbered(&format!("{}_", x_name), 1, t_max)),
    );
    (x_name, static_name)
}

/// Caffe-style LSTM: gates computed as `W_xc·x_t + W_hc·(cont_t ⊙ h_{t-1})`
/// (+ `W_xc_static·x_static`), fed to an LSTM unit.
pub struct LstmArchitecture;

impl Architecture for LstmArchitecture {
    fn layer_type(&self) -> &'static str {
        "LSTM"
    }

    fn recurrent_input_names(&self) -> Vec<String> {
        vec!["h_0".to_string(), "c_0".to_string()]
    }

    fn recurrent_output_names(&self, timesteps: usize) -> Vec<String> {
        vec![format!("h_{}", timesteps), "c_T".to_string()]
    }

    fn output_names(&self) -> Vec<String> {
        vec!["h".to_string()]
    }

    fn fill_unrolled_net(&self, settings: &UnrollSettings, net: &mut NetSpec) {
        let t_max = settings.timesteps;
        let (x_name, static_name) = push_input_slices(settings, net, "W_xc", "b_c", 4);

        for t in 1..=t_max {
            let tm1 = t - 1;
            let h_conted = format!("h_conted_{}", tm1);
            let w_hc_h = format!("W_hc_h_{}", tm1);
            let gate_input = format!("gate_input_{}", t);

            net.push(
                LayerSpec::new(h_conted.clone(), LayerKind::Scale { axis: 0 })
                    .bottoms(&[format!("h_{}", tm1), format!("cont_{}", t)])
                    .tops(&[h_conted.as_str()]),
            );
            net.push(
                LayerSpec::new(
                    format!("transform_{}", t),
                    settings.inner_product(4 * settings.num_output, false, 2),
                )
                .bottoms(&[h_conted.as_str()])
                .tops(&[w_hc_h.as_str()])
                .params(&["W_hc"]),
            );

            let mut sum_inputs = vec![w_hc_h, format!("{}_{}", x_name, t)];
            if let Some(s) = &static_name {
                sum_inputs.push(s.clone());
            }
            net.push(
                LayerSpec::new(gate_input.clone(), LayerKind::Eltwise { coeffs: Vec::new() })
                    .bottoms(&sum_inputs)
                    .tops(&[gate_input.as_str()]),
            );
            net.push(
                LayerSpec::new(format!("unit_{}", t), LayerKind::LstmUnit)
                    .bottoms(&[
                        format!("c_{}", tm1),
                        gate_input,
                        format!("cont_{}", t),
                    ])
                    .tops(&[format!("c_{}", t), format!("h_{}", t)]),
            );
        }

        net.push(
            LayerSpec::new("c_T", LayerKind::Split)
                .bottoms(&[format!("c_{}", t_max)])
                .tops(&["c_T"]),
        );
        net.push(
            LayerSpec::new("h_concat", LayerKind::Concat { axis: 0 })
                .bottoms(&numbered("h_", 1, t_max))
                .tops(&["h"]),
        );
    }
}

/// Elman RNN: `h_t = tanh(W_hh·(cont_t ⊙ h_{t-1}) + W_xh·x_t + b_h)` and
/// output `o_t = tanh(W_ho·h_t + b_o)`.
pub struct RnnArchitecture;

impl Architecture for RnnArchitecture {
    fn layer_type(&self) -> &'static str {
        "RNN"
    }

    fn recurrent_input_names(&self) -> Vec<String> {
        vec!["h_0".to_string()]
    }

    fn recurrent_output_names(&self, timesteps: usize) -> Vec<String> {
        vec![format!("h_{}", timesteps)]
    }

    fn output_names(&self) -> Vec<String> {
        vec!["o".to_string()]
    }

    fn fill_unrolled_net(&self, settings: &UnrollSettings, net: &mut NetSpec) {
        let t_max = settings.timesteps;
        let h = settings.num_output;
        let (x_name, static_name) = push_input_slices(settings, net, "W_xh", "b_h", 1);

        for t in 1..=t_max {
            let tm1 = t - 1;
            let h_conted = format!("h_conted_{}", tm1);
            let w_hh_h = format!("W_hh_h_{}", tm1);
            let neuron_input = format!("h_neuron_input_{}", t);
            let h_t = format!("h_{}", t);
            let w_ho_h = format!("W_ho_h_{}", t);
            let o_t = format!("o_{}", t);

            net.push(
                LayerSpec::new(h_conted.clone(), LayerKind::Scale { axis: 0 })
                    .bottoms(&[format!("h_{}", tm1), format!("cont_{}", t)])
                    .tops(&[h_conted.as_str()]),
            );
            net.push(
                LayerSpec::new(w_hh_h.clone(), settings.inner_product(h, false, 2))
                    .bottoms(&[h_conted.as_str()])
                    .tops(&[w_hh_h.as_str()])
                    .params(&["W_hh"]),
            );

            let mut sum_inputs = vec![w_hh_h, format!("{}_{}", x_name, t)];
            if let Some(s) = &static_name {
                sum_inputs.push(s.clone());
            }
            net.push(
                LayerSpec::new(neuron_input.clone(), LayerKind::Eltwise { coeffs: Vec::new() })
                    .bottoms(&sum_inputs)
                    .tops(&[neuron_input.as_str()]),
            );
            net.push(
                LayerSpec::new(format!("h_neuron_{}", t), LayerKind::Tanh)
                    .bottoms(&[neuron_input])
                    .tops(&[h_t.as_str()]),
            );
            net.push(
                LayerSpec::new(w_ho_h.clone(), settings.inner_product(h, true, 2))
                    .bottoms(&[h_t])
                    .tops(&[w_ho_h.as_str()])
                    .params(&["W_ho", "b_o"]),
            );
            net.push(
                LayerSpec::new(format!("o_neuron_{}", t), LayerKind::Tanh)
                    .bottoms(&[w_ho_h])
                    .tops(&[o_t]),
            );
        }

        net.push(
            LayerSpec::new("o_concat", LayerKind::Concat { axis: 0 })
                .bottoms(&numbered("o_", 1, t_max))
                .tops(&["o"]),
        );
    }
}
