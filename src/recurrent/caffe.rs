//! CaffeGraph backend: run the recurrence as an unrolled [`Net`]
//!
//! The net is rebuilt whenever the number of timesteps changes and only
//! reshaped when the batch size changes. Its input blobs alias the layer's
//! bottoms and the layer's tops alias its outputs, so no data is copied
//! except the recurrent state carried from one batch to the next.

use super::unrolled::{Architecture, UnrollSettings};
use crate::blob::Blob;
use crate::config::LayerParameter;
use crate::fillers::FillerSpec;
use crate::layers::Phase;
use crate::net::spec::{LayerKind, LayerSpec, NetSpec};
use crate::net::Net;
use crate::utils::CancelEvent;
use crate::{NetError, Result};
use log::debug;

fn pseudo_loss_name(blob: &str) -> String {
    format!("{}_pseudoloss", blob)
}

pub struct CaffeBackend {
    arch: Box<dyn Architecture>,
    name: String,
    phase: Phase,
    num_output: usize,
    weight_filler: FillerSpec,
    bias_filler: FillerSpec,
    random_seed: u64,
    debug_info: bool,
    static_input: bool,
    expose_hidden_input: bool,
    expose_hidden_output: bool,
    cancel: Option<CancelEvent>,

    net: Option<Net>,
    timesteps: usize,
    batch: usize,
    recur_input_names: Vec<String>,
    recur_output_names: Vec<String>,
    /// Blobs the layer's tops alias: outputs first, then exposed
    /// recurrent outputs.
    top_blob_names: Vec<String>,
    last_layer_index: usize,
}

impl CaffeBackend {
    pub fn new(
        param: &LayerParameter,
        arch: Box<dyn Architecture>,
        static_input: bool,
        cancel: Option<CancelEvent>,
    ) -> Self {
        let p = &param.recurrent_param;
        Self {
            arch,
            name: param.name.clone(),
            phase: param.phase,
            num_output: p.num_output,
            weight_filler: p.weight_filler.clone(),
            bias_filler: p.bias_filler.clone(),
            random_seed: param.random_seed,
            debug_info: p.debug_info,
            static_input,
            expose_hidden_input: p.expose_hidden_input,
            expose_hidden_output: p.expose_hidden_output,
            cancel,
            net: None,
            timesteps: 0,
            batch: 0,
            recur_input_names: Vec::new(),
            recur_output_names: Vec::new(),
            top_blob_names: Vec::new(),
            last_layer_index: 0,
        }
    }

    fn net(&self) -> Result<&Net> {
        self.net.as_ref().ok_or(NetError::NotSetUp)
    }

    fn net_mut(&mut self) -> Result<&mut Net> {
        self.net.as_mut().ok_or(NetError::NotSetUp)
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }

    pub fn unrolled_net(&self) -> Option<&Net> {
        self.net.as_ref()
    }

    /// Describe the unrolled computation for `timesteps` steps.
    fn net_spec(&self, bottom: &[Blob], timesteps: usize) -> NetSpec {
        let batch = bottom[0].shape()[1];
        let mut spec = NetSpec::new(format!("{}_unrolled", self.name));
        spec.random_seed = self.random_seed;
        spec.debug_info = self.debug_info;

        let hidden_shape = vec![1, batch, self.num_output];
        let mut tops = vec!["x".to_string(), "cont".to_string()];
        let mut shapes = vec![bottom[0].shape().to_vec(), bottom[1].shape().to_vec()];
        let mut need_backward = vec![true, false];
        if self.static_input {
            tops.push("x_static".to_string());
            shapes.push(bottom[2].shape().to_vec());
            need_backward.push(true);
        }
        for name in self.arch.recurrent_input_names() {
            tops.push(name);
            shapes.push(hidden_shape.clone());
            need_backward.push(true);
        }
        spec.push(
            LayerSpec::new(
                "input",
                LayerKind::Input {
                    shapes,
                    need_backward,
                },
            )
            .tops(&tops),
        );

        let settings = UnrollSettings {
            num_output: self.num_output,
            timesteps,
            static_input: self.static_input,
            weight_filler: self.weight_filler.clone(),
            bias_filler: self.bias_filler.clone(),
        };
        self.arch.fill_unrolled_net(&settings, &mut spec);

        let mut outputs = self.arch.output_names();
        if self.expose_hidden_output {
            outputs.extend(self.arch.recurrent_output_names(timesteps));
        }
        for name in &outputs {
            let loss = pseudo_loss_name(name);
            spec.push(
                LayerSpec::new(loss.clone(), LayerKind::Reduction { coeff: 1.0 })
                    .bottoms(&[name.as_str()])
                    .tops(&[loss])
                    .loss_weight(1.0),
            );
        }
        spec
    }

    /// Build a fresh unrolled net for the current timestep count.
    ///
    /// An empty `params` is filled with the new net's parameters; otherwise
    /// the new net is pointed at the existing ones.
    fn build(&mut self, bottom: &[Blob], params: &mut Vec<Blob>) -> Result<()> {
        let timesteps = bottom[0].shape()[0];
        let spec = self.net_spec(bottom, timesteps);
        debug!(
            "{}: unrolling {} over {} timesteps ({} layers)",
            self.name,
            self.arch.layer_type(),
            timesteps,
            spec.layers.len()
        );
        let mut net = Net::new(&spec, self.phase, self.cancel.clone())?;
        if params.is_empty() {
            *params = net.params().iter().map(Blob::alias).collect();
        } else {
            net.share_params(params)?;
        }

        let outputs = self.arch.output_names().len()
            + if self.expose_hidden_output {
                self.arch.num_recurrent_blobs()
            } else {
                0
            };
        let first_loss = net.num_layers() - outputs;
        let mut top_blob_names = Vec::with_capacity(outputs);
        for li in first_loss..net.num_layers() {
            top_blob_names.push(net.layer_spec(li).bottoms[0].clone());
        }

        // Carry the recurrent state over a rebuild with the same batch size.
        let carried: Vec<Vec<f32>> = match &self.net {
            Some(old) => self
                .recur_output_names
                .iter()
                .map(|name| old.blob_by_name(name).map(Blob::data_vec))
                .collect::<Result<_>>()?,
            None => Vec::new(),
        };
        let recur_output_names = self.arch.recurrent_output_names(timesteps);
        for (name, values) in recur_output_names.iter().zip(&carried) {
            let blob = net.blob_by_name(name)?;
            if blob.count() == values.len() {
                blob.copy_data_from_slice(values);
            }
        }

        self.recur_input_names = self.arch.recurrent_input_names();
        self.recur_output_names = recur_output_names;
        self.top_blob_names = top_blob_names;
        self.last_layer_index = first_loss - 1;
        self.timesteps = timesteps;
        self.batch = bottom[0].shape()[1];
        self.net = Some(net);
        Ok(())
    }

    pub fn setup(&mut self, bottom: &[Blob], params: &mut Vec<Blob>) -> Result<()> {
        self.build(bottom, params)
    }

    /// Point the net's inputs at the bottoms and propagate their shapes.
    fn bind_inputs(&mut self, bottom: &[Blob]) -> Result<()> {
        let hidden_shape = [1, bottom[0].shape()[1], self.num_output];
        let static_input = self.static_input;
        let expose = self.expose_hidden_input;
        let recur_inputs = self.recur_input_names.clone();
        let net = self.net_mut()?;

        let x = net.blob_by_name_mut("x")?;
        x.reshape_like(&bottom[0]);
        x.share_data(&bottom[0]);
        x.share_diff(&bottom[0]);

        let cont = net.blob_by_name_mut("cont")?;
        cont.reshape_like(&bottom[1]);
        cont.share_data(&bottom[1]);

        let mut next = 2;
        if static_input {
            let x_static = net.blob_by_name_mut("x_static")?;
            x_static.reshape_like(&bottom[next]);
            x_static.share_data(&bottom[next]);
            x_static.share_diff(&bottom[next]);
            next += 1;
        }
        for name in &recur_inputs {
            let blob = net.blob_by_name_mut(name)?;
            if expose {
                blob.reshape_like(&bottom[next]);
                blob.share_data(&bottom[next]);
                blob.share_diff(&bottom[next]);
                next += 1;
            } else {
                blob.reshape(&hidden_shape);
            }
        }
        net.reshape()
    }

    fn inputs_bound(&self, bottom: &[Blob]) -> Result<bool> {
        let net = self.net()?;
        let mut names = vec!["x", "cont"];
        if self.static_input {
            names.push("x_static");
        }
        if self.expose_hidden_input {
            names.extend(self.recur_input_names.iter().map(String::as_str));
        }
        for (name, blob) in names.into_iter().zip(bottom) {
            if !net.blob_by_name(name)?.shares_data_with(blob) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Re-point the net at `params` if they were replaced since the build.
    pub fn sync_params(&mut self, params: &[Blob]) -> Result<()> {
        let net = self.net_mut()?;
        let stale = net.params().len() != params.len()
            || net
                .params()
                .iter()
                .zip(params)
                .any(|(own, given)| !own.shares_data_with(given) || !own.shares_diff_with(given));
        if stale {
            net.share_params(params)?;
        }
        Ok(())
    }

    fn share_tops(&self, top: &mut [Blob]) -> Result<()> {
        let net = self.net()?;
        for (t, name) in top.iter_mut().zip(&self.top_blob_names) {
            let source = net.blob_by_name(name)?;
            t.reshape_like(source);
            t.share_data(source);
            t.share_diff(source);
        }
        Ok(())
    }

    /// Returns whether the net was rebuilt.
    pub fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob], params: &mut Vec<Blob>) -> Result<bool> {
        let timesteps = bottom[0].shape()[0];
        let batch = bottom[0].shape()[1];
        let rebuilt = timesteps != self.timesteps || self.net.is_none();
        if rebuilt {
            self.build(bottom, params)?;
        }
        self.bind_inputs(bottom)?;
        if batch != self.batch {
            debug!("{}: batch size {} -> {}, state reset", self.name, self.batch, batch);
            self.batch = batch;
            self.reset()?;
        }
        self.share_tops(top)?;
        Ok(rebuilt)
    }

    pub fn forward(&mut self, bottom: &[Blob]) -> Result<()> {
        if !self.inputs_bound(bottom)? {
            self.bind_inputs(bottom)?;
        }
        if !self.expose_hidden_input {
            let net = self.net()?;
            for (input, output) in self.recur_input_names.iter().zip(&self.recur_output_names) {
                let src = net.blob_by_name(output)?;
                let dst = net.blob_by_name(input)?;
                if src.count() != dst.count() {
                    return Err(NetError::ShapeMismatch(format!(
                        "recurrent blobs {} {} and {} {} differ",
                        output,
                        src.shape_string(),
                        input,
                        dst.shape_string()
                    )));
                }
                dst.copy_data_from_slice(&src.data());
            }
        }
        let last = self.last_layer_index;
        self.net_mut()?.forward_to(last)?;
        Ok(())
    }

    /// The net shares diff storage with the bottoms, so bottoms with a
    /// false `propagate_down` get their previous diff restored.
    pub fn backward(&mut self, propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        let kept: Vec<(usize, Vec<f32>)> = bottom
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != 1 && !propagate_down.get(i).copied().unwrap_or(false))
            .map(|(i, b)| (i, b.diff_vec()))
            .collect();
        let last = self.last_layer_index;
        self.net_mut()?.backward_from(last)?;
        for (i, diff) in kept {
            bottom[i].copy_diff_from_slice(&diff);
        }
        Ok(())
    }

    /// Zero the state carried into the next batch.
    pub fn reset(&mut self) -> Result<()> {
        let net = self.net()?;
        for name in &self.recur_output_names {
            net.blob_by_name(name)?.set_data(0.0);
        }
        Ok(())
    }

    pub fn initial_state(&self) -> Result<Vec<Blob>> {
        let net = self.net()?;
        self.recur_input_names
            .iter()
            .map(|n| net.blob_by_name(n).map(Blob::alias))
            .collect()
    }

    pub fn final_state(&self) -> Result<Vec<Blob>> {
        let net = self.net()?;
        self.recur_output_names
            .iter()
            .map(|n| net.blob_by_name(n).map(Blob::alias))
            .collect()
    }
}
