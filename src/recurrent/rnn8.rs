//! NativeRnn8 backend: the persistent-state RNN8 API

use super::native_state::{problem_size, NativeState, F32};
use crate::blob::Blob;
use crate::config::LayerParameter;
use crate::device::{Device, LayerContext};
use crate::native::{DropoutDescriptor, Rnn8Config, Rnn8Descriptor};
use crate::utils::SimpleRng;
use crate::{NetError, Result};
use log::debug;

pub struct Rnn8Backend {
    name: String,
    desc: Rnn8Descriptor,
    sized: bool,
    pub(crate) state: NativeState,
}

impl Rnn8Backend {
    pub fn new(param: &LayerParameter, device: &Device, context: &LayerContext) -> Result<Self> {
        let p = &param.recurrent_param;
        let dropout = DropoutDescriptor::new(device, p.dropout_ratio, p.dropout_seed)?;
        let desc = Rnn8Descriptor::new(device, dropout)?;
        Ok(Self {
            name: param.name.clone(),
            desc,
            sized: false,
            state: NativeState::new(param, device, context),
        })
    }

    fn config(&self, seq_len: usize, batch: usize, input: usize) -> Rnn8Config {
        Rnn8Config {
            mode: self.state.mode,
            input,
            hidden: self.state.hidden,
            layers: self.state.layers,
            max_seq_len: seq_len,
            batch,
        }
    }

    pub fn setup(
        &mut self,
        param: &LayerParameter,
        bottom: &[Blob],
        params: &mut Vec<Blob>,
        rng: &mut SimpleRng,
    ) -> Result<()> {
        let (seq_len, batch, input) = problem_size(&bottom[0])?;
        self.desc.set_rnn8(self.config(seq_len, batch, input))?;
        let count = self.desc.weight_space_size()? / F32;
        debug!("{}: rnn8 weight space {} floats", self.name, count);
        let desc = &self.desc;
        self.state.init_weights(count, params, &param.recurrent_param, rng, |layer, lin_id| {
            desc.lin_layer_params(layer, lin_id)
        })?;
        self.state.input = input;
        Ok(())
    }

    /// Apply `set_rnn8` for the new problem size and resize scratch memory
    /// if it took effect. Returns whether the descriptor was reconfigured.
    pub fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<bool> {
        let (seq_len, batch, input) = problem_size(&bottom[0])?;
        if input != self.state.input {
            return Err(NetError::ShapeMismatch(format!(
                "{}: input width changed from {} to {}",
                self.name, self.state.input, input
            )));
        }

        let changed = self.desc.set_rnn8(self.config(seq_len, batch, input))? || !self.sized;
        if changed {
            let (workspace, reserve) = self.desc.memory_sizes(self.state.training)?;
            debug!(
                "{}: T={} N={} workspace {} bytes, reserve {} bytes",
                self.name, seq_len, batch, workspace, reserve
            );
            self.state.workspace.ensure(workspace)?;
            self.state.reserve.ensure(reserve)?;
            self.sized = true;
        }
        self.state.reshape(seq_len, batch, top);
        Ok(changed)
    }

    pub fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let desc = &mut self.desc;
        self.state.forward(bottom, top, |w, io, workspace, reserve| {
            desc.forward(reserve.is_some(), w, io, workspace, reserve)
        })
    }

    pub fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        let desc = &self.desc;
        self.state.backward(
            top,
            propagate_down,
            bottom,
            |w, io, workspace, reserve| desc.backward_data(w, io, workspace, reserve),
            |x, hx, dw, reserve| desc.backward_weights(x, hx, dw, reserve),
        )
    }

    /// Number of effective `set_rnn8` reconfigurations.
    pub fn reconfigurations(&self) -> usize {
        self.desc.reconfigurations()
    }

    pub fn handle_ids(&self) -> Vec<u64> {
        vec![self.desc.handle_id()]
    }
}
