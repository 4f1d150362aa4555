//! Reference native RNN library
//!
//! Two API generations over the same kernels:
//!
//! * the legacy descriptor API ([`NativeRnn`] plus [`RnnDescriptor`],
//!   [`TensorDescriptor`], [`DropoutDescriptor`], [`FilterDescriptor`]):
//!   the caller queries parameter, workspace and reserve sizes and passes
//!   every buffer explicitly;
//! * the persistent RNN8 API ([`rnn8::Rnn8Descriptor`]): one descriptor is
//!   reconfigured with `set_rnn8` whenever the problem size changes.
//!
//! Every descriptor wraps a [`NativeHandle`] and is destroyed on drop.
//! Sizes returned by the query functions are in bytes, weight regions in
//! floats.

pub mod kernels;
pub mod rnn8;

use crate::device::{Device, DeviceMemory, HandleKind, NativeHandle};
use crate::utils::SimpleRng;
use crate::{NetError, Result};
use log::debug;
use serde::{Deserialize, Serialize};

pub use kernels::{BackwardBuffers, DropoutState, ForwardBuffers, Region, RnnDims};
pub use rnn8::{Rnn8Config, Rnn8Descriptor};

const F32: usize = std::mem::size_of::<f32>();

/// Cell type computed by the native library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RnnMode {
    Lstm,
    RnnTanh,
}

impl RnnMode {
    /// Number of gate matrices per direction.
    pub fn gates(self) -> usize {
        match self {
            RnnMode::Lstm => 4,
            RnnMode::RnnTanh => 1,
        }
    }
}

/// Shape of a dense tensor.
#[derive(Debug)]
pub struct TensorDescriptor {
    handle: NativeHandle,
    dims: Vec<usize>,
}

impl TensorDescriptor {
    pub fn new(device: &Device, dims: &[usize]) -> Self {
        Self {
            handle: device.create_handle(HandleKind::Tensor),
            dims: dims.to_vec(),
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn handle_id(&self) -> u64 {
        self.handle.id()
    }
}

/// Describes the flat weight buffer.
#[derive(Debug)]
pub struct FilterDescriptor {
    handle: NativeHandle,
    count: usize,
}

impl FilterDescriptor {
    pub fn new(device: &Device, count: usize) -> Self {
        Self {
            handle: device.create_handle(HandleKind::Filter),
            count,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn handle_id(&self) -> u64 {
        self.handle.id()
    }
}

/// Inter-layer dropout configuration and its random state.
#[derive(Debug)]
pub struct DropoutDescriptor {
    _handle: NativeHandle,
    ratio: f32,
    seed: u64,
    rng: SimpleRng,
    _states: Option<DeviceMemory>,
}

impl DropoutDescriptor {
    /// Bytes of generator state a dropout descriptor keeps on the device.
    pub const STATE_BYTES: usize = 64;

    pub fn new(device: &Device, ratio: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&ratio) {
            return Err(NetError::InvalidConfig(format!(
                "dropout ratio must be in [0, 1), got {}",
                ratio
            )));
        }
        let states = if ratio > 0.0 {
            Some(device.alloc(Self::STATE_BYTES)?)
        } else {
            None
        };
        Ok(Self {
            _handle: device.create_handle(HandleKind::Dropout),
            ratio,
            seed,
            rng: SimpleRng::new(seed),
            _states: states,
        })
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn state(&mut self) -> Option<DropoutState<'_>> {
        if self.ratio > 0.0 {
            Some(DropoutState {
                ratio: self.ratio,
                rng: &mut self.rng,
            })
        } else {
            None
        }
    }
}

/// Cell configuration of a legacy RNN.
#[derive(Debug)]
pub struct RnnDescriptor {
    handle: NativeHandle,
    mode: RnnMode,
    hidden: usize,
    layers: usize,
    dropout: DropoutDescriptor,
}

impl RnnDescriptor {
    pub fn new(
        device: &Device,
        mode: RnnMode,
        hidden: usize,
        layers: usize,
        dropout: DropoutDescriptor,
    ) -> Result<Self> {
        if hidden == 0 || layers == 0 {
            return Err(NetError::InvalidConfig(format!(
                "rnn descriptor needs hidden > 0 and layers > 0, got {} and {}",
                hidden, layers
            )));
        }
        Ok(Self {
            handle: device.create_handle(HandleKind::Rnn),
            mode,
            hidden,
            layers,
            dropout,
        })
    }

    pub fn mode(&self) -> RnnMode {
        self.mode
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    pub fn dropout(&self) -> &DropoutDescriptor {
        &self.dropout
    }

    pub fn handle_id(&self) -> u64 {
        self.handle.id()
    }

    /// Problem size for an input described as `[T, N, I]`.
    pub fn dims(&self, x_desc: &TensorDescriptor) -> Result<RnnDims> {
        match x_desc.dims() {
            &[seq_len, batch, input] => Ok(RnnDims {
                mode: self.mode,
                seq_len,
                batch,
                input,
                hidden: self.hidden,
                layers: self.layers,
            }),
            other => Err(NetError::Native(format!(
                "x descriptor must be [T, N, I], got {:?}",
                other
            ))),
        }
    }
}

pub(crate) fn check_len(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual < expected {
        return Err(NetError::Native(format!(
            "{} holds {} floats, {} required",
            what, actual, expected
        )));
    }
    Ok(())
}

pub(crate) fn check_exact(what: &str, actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(NetError::Native(format!(
            "{} holds {} floats, expected {}",
            what, actual, expected
        )));
    }
    Ok(())
}

pub(crate) fn check_forward(dims: &RnnDims, w: &[f32], io: &ForwardBuffers<'_>) -> Result<()> {
    let state = dims.layers * dims.batch * dims.hidden;
    check_exact("weights", w.len(), dims.weight_count())?;
    check_exact("x", io.x.len(), dims.seq_len * dims.batch * dims.input)?;
    check_exact("y", io.y.len(), dims.seq_len * dims.batch * dims.hidden)?;
    check_exact("hy", io.hy.len(), state)?;
    if let Some(hx) = io.hx {
        check_exact("hx", hx.len(), state)?;
    }
    if dims.mode == RnnMode::Lstm {
        check_exact("cy", io.cy.len(), state)?;
        if let Some(cx) = io.cx {
            check_exact("cx", cx.len(), state)?;
        }
    }
    Ok(())
}

pub(crate) fn check_backward(dims: &RnnDims, w: &[f32], io: &BackwardBuffers<'_>) -> Result<()> {
    let state = dims.layers * dims.batch * dims.hidden;
    check_exact("weights", w.len(), dims.weight_count())?;
    check_exact("dy", io.dy.len(), dims.seq_len * dims.batch * dims.hidden)?;
    check_exact("dx", io.dx.len(), dims.seq_len * dims.batch * dims.input)?;
    check_exact("dhx", io.dhx.len(), state)?;
    if dims.mode == RnnMode::Lstm {
        check_exact("dcx", io.dcx.len(), state)?;
    }
    Ok(())
}

/// Library context for the legacy descriptor API.
#[derive(Debug)]
pub struct NativeRnn {
    device: Device,
    _handle: NativeHandle,
}

impl NativeRnn {
    /// Open the library on a device; fails if the device has no native RNN.
    pub fn new(device: &Device) -> Result<Self> {
        if !device.capabilities().native_rnn {
            return Err(NetError::Unsupported(format!(
                "device '{}' has no native RNN support",
                device.name()
            )));
        }
        Ok(Self {
            device: device.clone(),
            _handle: device.create_handle(HandleKind::Rnn),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Size of the flat weight buffer in bytes.
    pub fn params_size(&self, rnn: &RnnDescriptor, x_desc: &TensorDescriptor) -> Result<usize> {
        Ok(rnn.dims(x_desc)?.weight_count() * F32)
    }

    /// Matrix and bias regions (in floats) of one linear layer.
    pub fn lin_layer_params(
        &self,
        rnn: &RnnDescriptor,
        x_desc: &TensorDescriptor,
        layer: usize,
        lin_id: usize,
    ) -> Result<(Region, Region)> {
        let dims = rnn.dims(x_desc)?;
        if layer >= dims.layers || lin_id >= 2 * rnn.mode.gates() {
            return Err(NetError::Native(format!(
                "no linear layer {} in layer {} of a {:?} rnn",
                lin_id, layer, rnn.mode
            )));
        }
        Ok(dims.lin_layer_regions(layer, lin_id))
    }

    pub fn workspace_size(&self, rnn: &RnnDescriptor, x_desc: &TensorDescriptor) -> Result<usize> {
        Ok(rnn.dims(x_desc)?.workspace_floats() * F32)
    }

    pub fn reserve_size(&self, rnn: &RnnDescriptor, x_desc: &TensorDescriptor) -> Result<usize> {
        Ok(rnn.dims(x_desc)?.reserve_floats() * F32)
    }

    /// Forward pass that records activations into `reserve`.
    pub fn forward_training(
        &self,
        rnn: &mut RnnDescriptor,
        x_desc: &TensorDescriptor,
        w: &[f32],
        io: ForwardBuffers<'_>,
        workspace: &mut [f32],
        reserve: &mut [f32],
    ) -> Result<()> {
        let dims = rnn.dims(x_desc)?;
        check_forward(&dims, w, &io)?;
        check_len("workspace", workspace.len(), dims.workspace_floats())?;
        check_len("reserve", reserve.len(), dims.reserve_floats())?;
        debug!(
            "native forward (training): T={} N={} I={} H={} L={}",
            dims.seq_len, dims.batch, dims.input, dims.hidden, dims.layers
        );
        let dropout = rnn.dropout.state();
        kernels::forward(&dims, w, io, workspace, Some(reserve), dropout);
        Ok(())
    }

    pub fn forward_inference(
        &self,
        rnn: &RnnDescriptor,
        x_desc: &TensorDescriptor,
        w: &[f32],
        io: ForwardBuffers<'_>,
        workspace: &mut [f32],
    ) -> Result<()> {
        let dims = rnn.dims(x_desc)?;
        check_forward(&dims, w, &io)?;
        check_len("workspace", workspace.len(), dims.workspace_floats())?;
        kernels::forward(&dims, w, io, workspace, None, None);
        Ok(())
    }

    /// Gradients for inputs and initial state; needs the training reserve.
    pub fn backward_data(
        &self,
        rnn: &RnnDescriptor,
        x_desc: &TensorDescriptor,
        w: &[f32],
        io: BackwardBuffers<'_>,
        workspace: &mut [f32],
        reserve: &mut [f32],
    ) -> Result<()> {
        let dims = rnn.dims(x_desc)?;
        check_backward(&dims, w, &io)?;
        check_len("workspace", workspace.len(), dims.workspace_floats())?;
        check_len("reserve", reserve.len(), dims.reserve_floats())?;
        kernels::backward_data(&dims, w, io, workspace, reserve);
        Ok(())
    }

    /// Accumulate weight gradients into `dw`; must follow `backward_data`.
    pub fn backward_weights(
        &self,
        rnn: &RnnDescriptor,
        x_desc: &TensorDescriptor,
        x: &[f32],
        hx: Option<&[f32]>,
        dw: &mut [f32],
        reserve: &[f32],
    ) -> Result<()> {
        let dims = rnn.dims(x_desc)?;
        check_exact("x", x.len(), dims.seq_len * dims.batch * dims.input)?;
        check_exact("dw", dw.len(), dims.weight_count())?;
        check_len("reserve", reserve.len(), dims.reserve_floats())?;
        kernels::backward_weights(&dims, x, hx, dw, reserve);
        Ok(())
    }
}
