//! Recurrent layer with three interchangeable execution backends
//!
//! [`RecurrentLayer`] picks its backend once, at setup:
//!
//! * **CaffeGraph**: the recurrence is unrolled into a [`crate::net::Net`]
//!   of simple layers, rebuilt whenever the number of timesteps changes.
//! * **NativeLegacy**: the descriptor-based native RNN API.
//! * **NativeRnn8**: the persistent-state RNN8 API, chosen over the legacy
//!   API when `use_cudnn_rnn8_if_supported` is set and the device has it.
//!
//! Bottoms are `x` `[T, N, ...]`, `cont` `[T, N]`, an optional `x_static`
//! `[N, ...]` (CaffeGraph only) and, with `expose_hidden_input`, the
//! initial hidden (and cell) state `[L, N, H]`. Tops are the sequence
//! output `[T, N, H]` and, with `expose_hidden_output`, the final state.
//! With `batch_first` the caller's `x`, `cont` and output swap their two
//! leading axes and the layer transposes around the backend.

mod caffe;
mod legacy;
mod native_state;
mod rnn8;
pub mod unrolled;

pub use caffe::CaffeBackend;
pub use legacy::LegacyBackend;
pub use rnn8::Rnn8Backend;
pub use unrolled::{architecture, Architecture, LstmArchitecture, RnnArchitecture, UnrollSettings};

use crate::blob::Blob;
use crate::config::{validate_layer_config, LayerParameter, RecurrentType};
use crate::device::{Device, LayerContext};
use crate::layers::{check_count, check_min_count, Layer, Phase, TransposeLayer};
use crate::net::Net;
use crate::utils::SimpleRng;
use crate::{NetError, Result};
use log::{debug, info, warn};
use std::slice;

/// Execution strategy chosen at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    CaffeGraph,
    NativeLegacy,
    NativeRnn8,
}

enum Backend {
    CaffeGraph(CaffeBackend),
    NativeLegacy(LegacyBackend),
    NativeRnn8(Rnn8Backend),
}

impl Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::CaffeGraph(_) => BackendKind::CaffeGraph,
            Backend::NativeLegacy(_) => BackendKind::NativeLegacy,
            Backend::NativeRnn8(_) => BackendKind::NativeRnn8,
        }
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob], params: &mut Vec<Blob>) -> Result<bool> {
        match self {
            Backend::CaffeGraph(b) => b.reshape(bottom, top, params),
            Backend::NativeLegacy(b) => b.reshape(bottom, top),
            Backend::NativeRnn8(b) => b.reshape(bottom, top),
        }
    }

    /// Follow parameter blobs replaced from outside since the last call.
    fn sync_params(&mut self, params: &[Blob]) -> Result<()> {
        match self {
            Backend::CaffeGraph(b) => b.sync_params(params),
            Backend::NativeLegacy(LegacyBackend { state, .. })
            | Backend::NativeRnn8(Rnn8Backend { state, .. }) => {
                if let Some(w) = params.first() {
                    if !state.weights.shares_data_with(w) || !state.weights.shares_diff_with(w) {
                        state.weights = w.alias();
                    }
                }
                Ok(())
            }
        }
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        match self {
            Backend::CaffeGraph(b) => b.forward(bottom),
            Backend::NativeLegacy(b) => b.forward(bottom, top),
            Backend::NativeRnn8(b) => b.forward(bottom, top),
        }
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        match self {
            Backend::CaffeGraph(b) => b.backward(propagate_down, bottom),
            Backend::NativeLegacy(b) => b.backward(top, propagate_down, bottom),
            Backend::NativeRnn8(b) => b.backward(top, propagate_down, bottom),
        }
    }
}

enum LayerState {
    Uninitialized,
    Ready(Backend),
    Disposed,
}

fn ready(state: &mut LayerState) -> Result<&mut Backend> {
    match state {
        LayerState::Ready(backend) => Ok(backend),
        LayerState::Uninitialized => Err(NetError::NotSetUp),
        LayerState::Disposed => Err(NetError::Disposed),
    }
}

/// Transposes between the caller's batch-major blobs and the time-major
/// blobs the backends work on.
struct BatchFirst {
    x: TransposeLayer,
    cont: TransposeLayer,
    output: TransposeLayer,
    x_tm: Blob,
    cont_tm: Blob,
    y_tm: Blob,
}

impl BatchFirst {
    fn new(x_axes: usize) -> Self {
        Self {
            x: TransposeLayer::swap_leading(x_axes),
            cont: TransposeLayer::swap_leading(2),
            output: TransposeLayer::swap_leading(3),
            x_tm: Blob::default(),
            cont_tm: Blob::default(),
            y_tm: Blob::default(),
        }
    }

    fn setup_inputs(&mut self, bottom: &[Blob]) -> Result<()> {
        self.x.setup(&bottom[..1], slice::from_mut(&mut self.x_tm))?;
        self.cont.setup(&bottom[1..2], slice::from_mut(&mut self.cont_tm))?;
        self.reshape_inputs(bottom)
    }

    fn reshape_inputs(&mut self, bottom: &[Blob]) -> Result<()> {
        self.x.reshape(&bottom[..1], slice::from_mut(&mut self.x_tm))?;
        self.cont.reshape(&bottom[1..2], slice::from_mut(&mut self.cont_tm))
    }

    fn forward_inputs(&mut self, bottom: &[Blob]) -> Result<()> {
        self.x.forward(&bottom[..1], slice::from_ref(&self.x_tm))?;
        self.cont.forward(&bottom[1..2], slice::from_ref(&self.cont_tm))
    }
}

/// LSTM or RNN layer over a whole sequence.
///
/// # Example
///
/// ```
/// use rust_recurrent_networks::blob::Blob;
/// use rust_recurrent_networks::config::{LayerParameter, RecurrentParameter, RecurrentType};
/// use rust_recurrent_networks::device::Device;
/// use rust_recurrent_networks::layers::Layer;
/// use rust_recurrent_networks::recurrent::RecurrentLayer;
///
/// let param = LayerParameter::new("lstm", RecurrentParameter::new(4, RecurrentType::Lstm));
/// let mut layer = RecurrentLayer::new(param, &Device::reference()).unwrap();
///
/// let bottom = vec![Blob::new(&[5, 2, 3]), Blob::from_data(&[5, 2], vec![1.0; 10])];
/// let mut top = vec![Blob::default()];
/// layer.setup(&bottom, &mut top).unwrap();
/// layer.reshape(&bottom, &mut top).unwrap();
/// layer.forward(&bottom, &top).unwrap();
/// assert_eq!(top[0].shape(), &[5, 2, 4]);
/// ```
pub struct RecurrentLayer {
    param: LayerParameter,
    device: Device,
    context: LayerContext,
    state: LayerState,
    params: Vec<Blob>,
    batch_first: Option<BatchFirst>,
    static_input: bool,
    /// Aliases of bottom 0 and 1 at the last reshape.
    last_inputs: Option<(Blob, Blob)>,
    rebuilds: usize,
    warned_cont: bool,
}

impl RecurrentLayer {
    /// Create an uninitialised layer; the backend is chosen by `setup`.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the parameter fails validation.
    pub fn new(param: LayerParameter, device: &Device) -> Result<Self> {
        validate_layer_config(&param)?;
        Ok(Self {
            param,
            device: device.clone(),
            context: LayerContext::new(),
            state: LayerState::Uninitialized,
            params: Vec::new(),
            batch_first: None,
            static_input: false,
            last_inputs: None,
            rebuilds: 0,
            warned_cont: false,
        })
    }

    /// Use shared workspace/reserve buffers and a cancel event.
    pub fn with_context(mut self, context: LayerContext) -> Result<Self> {
        context.validate()?;
        self.context = context;
        Ok(self)
    }

    /// Start from existing parameter blobs instead of filling new ones.
    pub fn with_params(mut self, params: Vec<Blob>) -> Self {
        self.params = params;
        self
    }

    pub fn param(&self) -> &LayerParameter {
        &self.param
    }

    pub fn phase(&self) -> Phase {
        self.param.phase
    }

    /// Backend chosen at setup, `None` before setup or after dispose.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        match &self.state {
            LayerState::Ready(backend) => Some(backend.kind()),
            _ => None,
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.state, LayerState::Disposed)
    }

    /// Reshapes that rebuilt the unrolled net or recreated native
    /// descriptors and scratch memory.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    fn recurrent_blobs(&self) -> usize {
        match self.param.recurrent_param.recurrent_type {
            RecurrentType::Lstm => 2,
            RecurrentType::Rnn => 1,
        }
    }

    fn hidden_bottoms(&self) -> usize {
        if self.param.recurrent_param.expose_hidden_input {
            self.recurrent_blobs()
        } else {
            0
        }
    }

    fn hidden_tops(&self) -> usize {
        if self.param.recurrent_param.expose_hidden_output {
            self.recurrent_blobs()
        } else {
            0
        }
    }

    /// Whether bottom 0 or 1 changed shape or storage since the last
    /// reshape.
    pub fn reshape_needed(&self, bottom: &[Blob]) -> bool {
        match &self.last_inputs {
            Some((x, cont)) if bottom.len() >= 2 => {
                x.shape() != bottom[0].shape()
                    || !x.shares_data_with(&bottom[0])
                    || cont.shape() != bottom[1].shape()
                    || !cont.shares_data_with(&bottom[1])
            }
            _ => true,
        }
    }

    /// Check the bottom shapes against each other.
    fn check_inputs(&self, bottom: &[Blob]) -> Result<()> {
        let p = &self.param.recurrent_param;
        let x = &bottom[0];
        if x.num_axes() < 3 {
            return Err(NetError::ShapeMismatch(format!(
                "{}: bottom[0] must have at least 3 axes, got {}",
                self.param.name,
                x.shape_string()
            )));
        }
        let (seq_len, batch) = if p.batch_first {
            (x.shape()[1], x.shape()[0])
        } else {
            (x.shape()[0], x.shape()[1])
        };
        if seq_len == 0 || batch == 0 {
            return Err(NetError::ShapeMismatch(format!(
                "{}: bottom[0] needs at least one timestep and one sequence, got {}",
                self.param.name,
                x.shape_string()
            )));
        }
        let cont_shape = if p.batch_first {
            [batch, seq_len]
        } else {
            [seq_len, batch]
        };
        if bottom[1].shape() != cont_shape {
            return Err(NetError::ShapeMismatch(format!(
                "{}: bottom[1] must be {:?} to match bottom[0] {}, got {}",
                self.param.name,
                cont_shape,
                x.shape_string(),
                bottom[1].shape_string()
            )));
        }

        let mut next = 2;
        if self.static_input {
            let x_static = &bottom[next];
            if x_static.num_axes() < 1 || x_static.shape()[0] != batch {
                return Err(NetError::ShapeMismatch(format!(
                    "{}: static input must be [{}, ...], got {}",
                    self.param.name,
                    batch,
                    x_static.shape_string()
                )));
            }
            next += 1;
        }
        let state_shape = [p.num_layers, batch, p.num_output];
        for blob in &bottom[next..next + self.hidden_bottoms()] {
            if blob.shape() != state_shape {
                return Err(NetError::ShapeMismatch(format!(
                    "{}: hidden state input must be {:?}, got {}",
                    self.param.name,
                    state_shape,
                    blob.shape_string()
                )));
            }
        }
        Ok(())
    }

    fn select_backend(&self) -> Result<Backend> {
        let p = &self.param.recurrent_param;
        if p.use_native() {
            if self.static_input {
                return Err(NetError::Unsupported(format!(
                    "{}: static input needs the caffe engine",
                    self.param.name
                )));
            }
            if p.use_cudnn_rnn8_if_supported && self.device.capabilities().rnn8 {
                return Ok(Backend::NativeRnn8(Rnn8Backend::new(
                    &self.param,
                    &self.device,
                    &self.context,
                )?));
            }
            return Ok(Backend::NativeLegacy(LegacyBackend::new(
                &self.param,
                &self.device,
                &self.context,
            )?));
        }

        if p.num_layers > 1 || p.dropout_ratio > 0.0 {
            return Err(NetError::Unsupported(format!(
                "{}: stacked layers and dropout need the cudnn engine",
                self.param.name
            )));
        }
        Ok(Backend::CaffeGraph(CaffeBackend::new(
            &self.param,
            architecture(p.recurrent_type),
            self.static_input,
            self.context.cancel.clone(),
        )))
    }

    /// Bottoms as the backend sees them: time-major `x` and `cont`.
    fn inner_bottoms(&self, bottom: &[Blob]) -> Vec<Blob> {
        let mut inner: Vec<Blob> = bottom.iter().map(Blob::alias).collect();
        if let Some(bf) = &self.batch_first {
            inner[0] = bf.x_tm.alias();
            inner[1] = bf.cont_tm.alias();
        }
        inner
    }

    fn inner_tops(&self, top: &[Blob]) -> Vec<Blob> {
        let mut inner: Vec<Blob> = top.iter().map(Blob::alias).collect();
        if let Some(bf) = &self.batch_first {
            inner[0] = bf.y_tm.alias();
        }
        inner
    }

    /// Zero the carried hidden state so the next forward starts fresh.
    pub fn reset(&mut self) -> Result<()> {
        match ready(&mut self.state)? {
            Backend::CaffeGraph(b) => b.reset(),
            Backend::NativeLegacy(b) => {
                b.state.reset();
                Ok(())
            }
            Backend::NativeRnn8(b) => {
                b.state.reset();
                Ok(())
            }
        }
    }

    /// State fed into the first timestep: `[h_0, c_0]` for LSTM, `[h_0]`
    /// for RNN. The blobs alias the live state.
    pub fn initial_state(&mut self) -> Result<Vec<Blob>> {
        let lstm = self.recurrent_blobs() == 2;
        match ready(&mut self.state)? {
            Backend::CaffeGraph(b) => b.initial_state(),
            Backend::NativeLegacy(LegacyBackend { state, .. })
            | Backend::NativeRnn8(Rnn8Backend { state, .. }) => {
                let mut blobs = vec![state.hx.alias()];
                if lstm {
                    blobs.push(state.cx.alias());
                }
                Ok(blobs)
            }
        }
    }

    /// State after the last timestep, in the same order as
    /// [`RecurrentLayer::initial_state`].
    pub fn final_state(&mut self) -> Result<Vec<Blob>> {
        let lstm = self.recurrent_blobs() == 2;
        match ready(&mut self.state)? {
            Backend::CaffeGraph(b) => b.final_state(),
            Backend::NativeLegacy(LegacyBackend { state, .. })
            | Backend::NativeRnn8(Rnn8Backend { state, .. }) => {
                let mut blobs = vec![state.hy.alias()];
                if lstm {
                    blobs.push(state.cy.alias());
                }
                Ok(blobs)
            }
        }
    }

    /// Ids of the native descriptors; empty for the CaffeGraph backend.
    pub fn native_handle_ids(&mut self) -> Result<Vec<u64>> {
        Ok(match ready(&mut self.state)? {
            Backend::CaffeGraph(_) => Vec::new(),
            Backend::NativeLegacy(b) => b.handle_ids(),
            Backend::NativeRnn8(b) => b.handle_ids(),
        })
    }

    /// Effective RNN8 reconfigurations, `None` for the other backends.
    pub fn rnn8_reconfigurations(&self) -> Option<usize> {
        match &self.state {
            LayerState::Ready(Backend::NativeRnn8(b)) => Some(b.reconfigurations()),
            _ => None,
        }
    }

    /// The unrolled net of the CaffeGraph backend.
    pub fn unrolled_net(&self) -> Option<&Net> {
        match &self.state {
            LayerState::Ready(Backend::CaffeGraph(b)) => b.unrolled_net(),
            _ => None,
        }
    }

    pub fn clear_param_diffs(&self) {
        for p in &self.params {
            p.set_diff(0.0);
        }
    }

    /// Release the backend's handles and scratch memory. Further calls
    /// return [`NetError::Disposed`]; disposing twice is a no-op.
    pub fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }
        debug!("{}: disposing", self.param.name);
        self.state = LayerState::Disposed;
        self.batch_first = None;
        self.last_inputs = None;
    }
}

impl Drop for RecurrentLayer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Layer for RecurrentLayer {
    fn layer_type(&self) -> &'static str {
        match self.param.recurrent_param.recurrent_type {
            RecurrentType::Lstm => "LSTM",
            RecurrentType::Rnn => "RNN",
        }
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        match self.state {
            LayerState::Uninitialized => {}
            LayerState::Ready(_) => {
                return Err(NetError::InvalidConfig(format!(
                    "{}: setup called twice",
                    self.param.name
                )))
            }
            LayerState::Disposed => return Err(NetError::Disposed),
        }

        let hidden_bottoms = self.hidden_bottoms();
        check_min_count(self.layer_type(), "bottom", 2 + hidden_bottoms, bottom.len())?;
        if bottom.len() > 3 + hidden_bottoms {
            return Err(NetError::BlobCount {
                layer: self.layer_type().to_string(),
                what: "bottom",
                expected: format!("{} or {}", 2 + hidden_bottoms, 3 + hidden_bottoms),
                actual: bottom.len(),
            });
        }
        self.static_input = bottom.len() == 3 + hidden_bottoms;
        check_count(self.layer_type(), "top", 1 + self.hidden_tops(), top.len())?;
        self.check_inputs(bottom)?;

        if self.param.recurrent_param.batch_first {
            let mut bf = BatchFirst::new(bottom[0].num_axes());
            bf.setup_inputs(bottom)?;
            self.batch_first = Some(bf);
        }

        let inner_bottom = self.inner_bottoms(bottom);
        let mut backend = self.select_backend()?;
        let mut rng = SimpleRng::new(self.param.random_seed);
        match &mut backend {
            Backend::CaffeGraph(b) => b.setup(&inner_bottom, &mut self.params)?,
            Backend::NativeLegacy(b) => b.setup(&self.param, &inner_bottom, &mut self.params, &mut rng)?,
            Backend::NativeRnn8(b) => b.setup(&self.param, &inner_bottom, &mut self.params, &mut rng)?,
        }
        info!(
            "{}: {} with {} hidden units on the {:?} backend",
            self.param.name,
            self.layer_type(),
            self.param.recurrent_param.num_output,
            backend.kind()
        );
        self.state = LayerState::Ready(backend);
        Ok(())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        ready(&mut self.state)?;
        if !self.reshape_needed(bottom) {
            return Ok(());
        }
        self.check_inputs(bottom)?;
        if let Some(bf) = &mut self.batch_first {
            bf.reshape_inputs(bottom)?;
        }

        let inner_bottom = self.inner_bottoms(bottom);
        let mut inner_top: Vec<Blob> = top.iter_mut().map(std::mem::take).collect();
        if let Some(bf) = &mut self.batch_first {
            inner_top[0] = std::mem::replace(&mut bf.y_tm, Blob::default());
        }
        let result = match ready(&mut self.state) {
            Ok(backend) => backend.reshape(&inner_bottom, &mut inner_top, &mut self.params),
            Err(e) => Err(e),
        };
        let mut inner_top = inner_top.into_iter();
        if let Some(bf) = &mut self.batch_first {
            if let Some(y_tm) = inner_top.next() {
                bf.y_tm = y_tm;
            }
            for (slot, blob) in top[1..].iter_mut().zip(inner_top) {
                *slot = blob;
            }
        } else {
            for (slot, blob) in top.iter_mut().zip(inner_top) {
                *slot = blob;
            }
        }
        if result? {
            self.rebuilds += 1;
        }

        if let Some(bf) = &mut self.batch_first {
            bf.output.reshape(slice::from_ref(&bf.y_tm), &mut top[..1])?;
        }
        self.last_inputs = Some((bottom[0].alias(), bottom[1].alias()));
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        ready(&mut self.state)?;
        if let Some(bf) = &mut self.batch_first {
            bf.forward_inputs(bottom)?;
        }
        let inner_bottom = self.inner_bottoms(bottom);
        let inner_top = self.inner_tops(top);
        let backend = ready(&mut self.state)?;
        backend.sync_params(&self.params)?;
        backend.forward(&inner_bottom, &inner_top)?;
        if let Some(bf) = &mut self.batch_first {
            bf.output.forward(slice::from_ref(&bf.y_tm), &top[..1])?;
        }
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        ready(&mut self.state)?;
        let mut propagate = propagate_down.to_vec();
        propagate.resize(bottom.len(), false);
        if propagate[1] {
            if !self.warned_cont {
                warn!(
                    "{}: cannot backpropagate to the sequence continuation indicators",
                    self.param.name
                );
                self.warned_cont = true;
            }
            propagate[1] = false;
        }

        if let Some(bf) = &mut self.batch_first {
            bf.output.backward(&top[..1], &[true], slice::from_ref(&bf.y_tm))?;
        }
        let inner_bottom = self.inner_bottoms(bottom);
        let inner_top = self.inner_tops(top);
        let backend = ready(&mut self.state)?;
        backend.sync_params(&self.params)?;
        backend.backward(&inner_top, &propagate, &inner_bottom)?;
        if let Some(bf) = &mut self.batch_first {
            if propagate[0] {
                bf.x.backward(slice::from_ref(&bf.x_tm), &[true], &bottom[..1])?;
            }
        }
        Ok(())
    }

    fn params(&self) -> &[Blob] {
        &self.params
    }

    fn params_mut(&mut self) -> &mut [Blob] {
        &mut self.params
    }
}
