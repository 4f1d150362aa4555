//! NativeLegacy backend: the descriptor-based native RNN API

use super::native_state::{problem_size, NativeState, F32};
use crate::blob::Blob;
use crate::config::LayerParameter;
use crate::device::{Device, LayerContext};
use crate::native::{DropoutDescriptor, FilterDescriptor, NativeRnn, RnnDescriptor, TensorDescriptor};
use crate::utils::SimpleRng;
use crate::{NetError, Result};
use log::debug;

pub struct LegacyBackend {
    name: String,
    lib: NativeRnn,
    rnn: RnnDescriptor,
    filter: Option<FilterDescriptor>,
    x_desc: Option<TensorDescriptor>,
    pub(crate) state: NativeState,
}

impl LegacyBackend {
    /// Open the library and create the RNN and dropout descriptors.
    pub fn new(param: &LayerParameter, device: &Device, context: &LayerContext) -> Result<Self> {
        let p = &param.recurrent_param;
        let lib = NativeRnn::new(device)?;
        let state = NativeState::new(param, device, context);
        let dropout = DropoutDescriptor::new(device, p.dropout_ratio, p.dropout_seed)?;
        let rnn = RnnDescriptor::new(device, state.mode, p.num_output, p.num_layers, dropout)?;
        Ok(Self {
            name: param.name.clone(),
            lib,
            rnn,
            filter: None,
            x_desc: None,
            state,
        })
    }

    /// Query the weight size and fill (or share) the weights.
    pub fn setup(
        &mut self,
        param: &LayerParameter,
        bottom: &[Blob],
        params: &mut Vec<Blob>,
        rng: &mut SimpleRng,
    ) -> Result<()> {
        let (seq_len, batch, input) = problem_size(&bottom[0])?;
        let x_desc = TensorDescriptor::new(self.lib.device(), &[seq_len, batch, input]);
        let count = self.lib.params_size(&self.rnn, &x_desc)? / F32;
        debug!(
            "{}: native weights {} floats ({} layer(s), input {})",
            self.name,
            count,
            self.rnn.layers(),
            input
        );
        let (lib, rnn) = (&self.lib, &self.rnn);
        self.state.init_weights(count, params, &param.recurrent_param, rng, |layer, lin_id| {
            lib.lin_layer_params(rnn, &x_desc, layer, lin_id)
        })?;
        self.filter = Some(FilterDescriptor::new(self.lib.device(), count));
        self.state.input = input;
        Ok(())
    }

    /// Recreate the input descriptor and resize scratch memory when the
    /// problem size changed. Returns whether anything was recreated.
    pub fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<bool> {
        let (seq_len, batch, input) = problem_size(&bottom[0])?;
        if input != self.state.input {
            return Err(NetError::ShapeMismatch(format!(
                "{}: input width changed from {} to {}",
                self.name, self.state.input, input
            )));
        }

        let current = matches!(&self.x_desc, Some(d) if d.dims() == [seq_len, batch, input]);
        if !current {
            let x_desc = TensorDescriptor::new(self.lib.device(), &[seq_len, batch, input]);
            let workspace = self.lib.workspace_size(&self.rnn, &x_desc)?;
            let reserve = if self.state.training {
                self.lib.reserve_size(&self.rnn, &x_desc)?
            } else {
                0
            };
            debug!(
                "{}: T={} N={} workspace {} bytes, reserve {} bytes",
                self.name, seq_len, batch, workspace, reserve
            );
            self.state.workspace.ensure(workspace)?;
            self.state.reserve.ensure(reserve)?;
            self.x_desc = Some(x_desc);
        }
        self.state.reshape(seq_len, batch, top);
        Ok(!current)
    }

    pub fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let x_desc = self.x_desc.as_ref().ok_or(NetError::NotSetUp)?;
        let lib = &self.lib;
        let rnn = &mut self.rnn;
        self.state.forward(bottom, top, |w, io, workspace, reserve| match reserve {
            Some(reserve) => lib.forward_training(rnn, x_desc, w, io, workspace, reserve),
            None => lib.forward_inference(rnn, x_desc, w, io, workspace),
        })
    }

    pub fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        let x_desc = self.x_desc.as_ref().ok_or(NetError::NotSetUp)?;
        let lib = &self.lib;
        let rnn = &self.rnn;
        self.state.backward(
            top,
            propagate_down,
            bottom,
            |w, io, workspace, reserve| lib.backward_data(rnn, x_desc, w, io, workspace, reserve),
            |x, hx, dw, reserve| lib.backward_weights(rnn, x_desc, x, hx, dw, reserve),
        )
    }

    /// Ids of the live descriptors, for checking that reshapes reuse them.
    pub fn handle_ids(&self) -> Vec<u64> {
        let mut ids = vec![self.rnn.handle_id()];
        ids.extend(self.x_desc.as_ref().map(TensorDescriptor::handle_id));
        ids.extend(self.filter.as_ref().map(FilterDescriptor::handle_id));
        ids
    }
}
