//! Persistent-state RNN8 API
//!
//! One descriptor carries the whole problem size. Callers reconfigure it
//! with [`Rnn8Descriptor::set_rnn8`] whenever the sequence length or batch
//! changes and query workspace and reserve sizes with
//! [`Rnn8Descriptor::memory_sizes`]. Weights live in one flat weight space.

use super::kernels::{self, BackwardBuffers, ForwardBuffers, Region, RnnDims};
use super::{check_backward, check_exact, check_forward, check_len, DropoutDescriptor, RnnMode};
use crate::device::{Device, HandleKind, NativeHandle};
use crate::{NetError, Result};
use log::debug;

const F32: usize = std::mem::size_of::<f32>();

/// Problem size handed to `set_rnn8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rnn8Config {
    pub mode: RnnMode,
    pub input: usize,
    pub hidden: usize,
    pub layers: usize,
    pub max_seq_len: usize,
    pub batch: usize,
}

impl Rnn8Config {
    fn dims(&self) -> RnnDims {
        RnnDims {
            mode: self.mode,
            seq_len: self.max_seq_len,
            batch: self.batch,
            input: self.input,
            hidden: self.hidden,
            layers: self.layers,
        }
    }
}

/// RNN8 descriptor with its dropout descriptor.
#[derive(Debug)]
pub struct Rnn8Descriptor {
    handle: NativeHandle,
    dropout: DropoutDescriptor,
    config: Option<Rnn8Config>,
    reconfigurations: usize,
}

impl Rnn8Descriptor {
    /// Create an unconfigured descriptor; the device must support RNN8.
    pub fn new(device: &Device, dropout: DropoutDescriptor) -> Result<Self> {
        if !device.capabilities().rnn8 {
            return Err(NetError::Unsupported(format!(
                "device '{}' has no RNN8 support",
                device.name()
            )));
        }
        Ok(Self {
            handle: device.create_handle(HandleKind::Rnn8),
            dropout,
            config: None,
            reconfigurations: 0,
        })
    }

    /// Apply a configuration. Returns `false` if it is already current.
    pub fn set_rnn8(&mut self, config: Rnn8Config) -> Result<bool> {
        if config.hidden == 0 || config.layers == 0 {
            return Err(NetError::InvalidConfig(format!(
                "rnn8 needs hidden > 0 and layers > 0, got {} and {}",
                config.hidden, config.layers
            )));
        }
        if self.config == Some(config) {
            return Ok(false);
        }
        debug!(
            "set_rnn8: T={} N={} I={} H={} L={}",
            config.max_seq_len, config.batch, config.input, config.hidden, config.layers
        );
        self.config = Some(config);
        self.reconfigurations += 1;
        Ok(true)
    }

    pub fn config(&self) -> Option<Rnn8Config> {
        self.config
    }

    /// Number of effective `set_rnn8` calls so far.
    pub fn reconfigurations(&self) -> usize {
        self.reconfigurations
    }

    pub fn handle_id(&self) -> u64 {
        self.handle.id()
    }

    pub fn dropout(&self) -> &DropoutDescriptor {
        &self.dropout
    }

    fn dims(&self) -> Result<RnnDims> {
        self.config
            .map(|c| c.dims())
            .ok_or_else(|| NetError::Native("rnn8 descriptor used before set_rnn8".to_string()))
    }

    /// Weight space size in bytes.
    pub fn weight_space_size(&self) -> Result<usize> {
        Ok(self.dims()?.weight_count() * F32)
    }

    pub fn lin_layer_params(&self, layer: usize, lin_id: usize) -> Result<(Region, Region)> {
        let dims = self.dims()?;
        if layer >= dims.layers || lin_id >= 2 * dims.mode.gates() {
            return Err(NetError::Native(format!(
                "no linear layer {} in layer {}",
                lin_id, layer
            )));
        }
        Ok(dims.lin_layer_regions(layer, lin_id))
    }

    /// Workspace and reserve sizes in bytes; inference needs no reserve.
    pub fn memory_sizes(&self, training: bool) -> Result<(usize, usize)> {
        let dims = self.dims()?;
        let reserve = if training { dims.reserve_floats() * F32 } else { 0 };
        Ok((dims.workspace_floats() * F32, reserve))
    }

    /// Forward pass; `reserve` is required when `training` is set.
    pub fn forward(
        &mut self,
        training: bool,
        w: &[f32],
        io: ForwardBuffers<'_>,
        workspace: &mut [f32],
        reserve: Option<&mut [f32]>,
    ) -> Result<()> {
        let dims = self.dims()?;
        check_forward(&dims, w, &io)?;
        check_len("workspace", workspace.len(), dims.workspace_floats())?;
        if training {
            let reserve = reserve.ok_or_else(|| {
                NetError::Native("training forward needs a reserve buffer".to_string())
            })?;
            check_len("reserve", reserve.len(), dims.reserve_floats())?;
            let dropout = self.dropout.state();
            kernels::forward(&dims, w, io, workspace, Some(reserve), dropout);
        } else {
            kernels::forward(&dims, w, io, workspace, None, None);
        }
        Ok(())
    }

    pub fn backward_data(
        &self,
        w: &[f32],
        io: BackwardBuffers<'_>,
        workspace: &mut [f32],
        reserve: &mut [f32],
    ) -> Result<()> {
        let dims = self.dims()?;
        check_backward(&dims, w, &io)?;
        check_len("workspace", workspace.len(), dims.workspace_floats())?;
        check_len("reserve", reserve.len(), dims.reserve_floats())?;
        kernels::backward_data(&dims, w, io, workspace, reserve);
        Ok(())
    }

    /// Accumulate into the weight-space gradient.
    pub fn backward_weights(
        &self,
        x: &[f32],
        hx: Option<&[f32]>,
        dw: &mut [f32],
        reserve: &[f32],
    ) -> Result<()> {
        let dims = self.dims()?;
        check_exact("x", x.len(), dims.seq_len * dims.batch * dims.input)?;
        check_exact("dw", dw.len(), dims.weight_count())?;
        check_len("reserve", reserve.len(), dims.reserve_floats())?;
        kernels::backward_weights(&dims, x, hx, dw, reserve);
        Ok(())
    }
}
