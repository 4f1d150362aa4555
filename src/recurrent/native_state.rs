//! Buffers shared by the two native backends
//!
//! Both native backends keep the same host-side state: the flat weight
//! blob, the initial and final hidden (and cell) state `[L, N, H]`, and the
//! workspace and reserve scratch buffers. Only the library calls differ,
//! so forward and backward take them as closures.

use crate::blob::Blob;
use crate::config::{LayerParameter, RecurrentParameter, RecurrentType};
use crate::device::{Device, LayerContext, ScratchBuffer};
use crate::fillers::fill_padded;
use crate::layers::Phase;
use crate::native::{BackwardBuffers, ForwardBuffers, Region, RnnMode};
use crate::utils::SimpleRng;
use crate::{NetError, Result};

pub(crate) const F32: usize = std::mem::size_of::<f32>();

/// `(T, N, I)` of a time-major input, trailing axes flattened into `I`.
pub(crate) fn problem_size(x: &Blob) -> Result<(usize, usize, usize)> {
    if x.num_axes() < 3 {
        return Err(NetError::ShapeMismatch(format!(
            "native recurrent input must be [T, N, ...], got {}",
            x.shape_string()
        )));
    }
    Ok((x.shape()[0], x.shape()[1], x.count_from(2)))
}

pub(crate) struct NativeState {
    pub mode: RnnMode,
    pub hidden: usize,
    pub layers: usize,
    pub input: usize,
    pub batch: usize,
    pub training: bool,
    pub expose_hidden_input: bool,
    pub expose_hidden_output: bool,
    pub weights: Blob,
    pub hx: Blob,
    pub cx: Blob,
    pub hy: Blob,
    pub cy: Blob,
    pub workspace: ScratchBuffer,
    pub reserve: ScratchBuffer,
    reserve_stamp: Option<u64>,
    dx_scratch: Vec<f32>,
}

impl NativeState {
    pub fn new(param: &LayerParameter, device: &Device, context: &LayerContext) -> Self {
        let p = &param.recurrent_param;
        let mode = match p.recurrent_type {
            RecurrentType::Lstm => RnnMode::Lstm,
            RecurrentType::Rnn => RnnMode::RnnTanh,
        };
        Self {
            mode,
            hidden: p.num_output,
            layers: p.num_layers,
            input: 0,
            batch: 0,
            training: param.phase == Phase::Train,
            expose_hidden_input: p.expose_hidden_input,
            expose_hidden_output: p.expose_hidden_output,
            weights: Blob::default(),
            hx: Blob::default(),
            cx: Blob::default(),
            hy: Blob::default(),
            cy: Blob::default(),
            workspace: ScratchBuffer::from_context(context.workspace.as_ref(), device, "workspace"),
            reserve: ScratchBuffer::from_context(context.reserved.as_ref(), device, "reserve"),
            reserve_stamp: None,
            dx_scratch: Vec::new(),
        }
    }

    fn is_lstm(&self) -> bool {
        self.mode == RnnMode::Lstm
    }

    /// Share preset weights or create and fill a fresh weight blob.
    ///
    /// `regions(layer, lin_id)` locates each matrix and bias inside the
    /// flat buffer; every region is filled on its own so fillers see the
    /// right fan-in.
    pub fn init_weights(
        &mut self,
        count: usize,
        params: &mut Vec<Blob>,
        param: &RecurrentParameter,
        rng: &mut SimpleRng,
        regions: impl Fn(usize, usize) -> Result<(Region, Region)>,
    ) -> Result<()> {
        if let Some(preset) = params.first() {
            if params.len() != 1 || preset.count() != count {
                return Err(NetError::ShapeMismatch(format!(
                    "native weights need one blob of {} values, got {} blob(s) starting with {}",
                    count,
                    params.len(),
                    preset.shape_string()
                )));
            }
            self.weights = preset.alias();
            return Ok(());
        }

        let weights = Blob::new(&[count]);
        {
            let mut w = weights.data_mut();
            for layer in 0..self.layers {
                for lin_id in 0..2 * self.mode.gates() {
                    let (matrix, bias) = regions(layer, lin_id)?;
                    let fan_in = matrix.len / self.hidden;
                    fill_padded(&param.weight_filler, &mut w[matrix.range()], fan_in, rng)?;
                    fill_padded(&param.bias_filler, &mut w[bias.range()], fan_in, rng)?;
                }
            }
        }
        params.push(weights.alias());
        self.weights = weights;
        Ok(())
    }

    /// Size the state blobs and tops for `T` steps of batch `N`.
    pub fn reshape(&mut self, seq_len: usize, batch: usize, top: &mut [Blob]) {
        let state = [self.layers, batch, self.hidden];
        for blob in [&mut self.hx, &mut self.cx, &mut self.hy, &mut self.cy] {
            blob.reshape(&state);
        }
        if batch != self.batch {
            self.batch = batch;
            self.reset();
        }
        top[0].reshape(&[seq_len, batch, self.hidden]);
        if self.expose_hidden_output {
            top[1].reshape(&state);
            top[1].share_data(&self.hy);
            top[1].share_diff(&self.hy);
            if self.is_lstm() {
                top[2].reshape(&state);
                top[2].share_data(&self.cy);
                top[2].share_diff(&self.cy);
            }
        }
    }

    /// Zero the state carried into the next batch.
    pub fn reset(&mut self) {
        for blob in [&self.hx, &self.cx, &self.hy, &self.cy] {
            blob.set_data(0.0);
            blob.set_diff(0.0);
        }
    }

    /// Batch rows whose first continuation indicator is zero.
    fn restarted_rows(&self, cont: &Blob) -> Vec<usize> {
        let cont = cont.data();
        (0..self.batch).filter(|&n| cont[n] == 0.0).collect()
    }

    fn zero_rows(&self, values: &mut [f32], rows: &[usize]) {
        let step = self.batch * self.hidden;
        for l in 0..self.layers {
            for &n in rows {
                let start = l * step + n * self.hidden;
                values[start..start + self.hidden].fill(0.0);
            }
        }
    }

    /// Fill `hx`/`cx` from the exposed bottoms or the previous final state,
    /// then clear rows that start a new sequence.
    fn load_initial_state(&mut self, bottom: &[Blob]) {
        if self.expose_hidden_input {
            self.hx.copy_data_from_slice(&bottom[2].data());
            if self.is_lstm() {
                self.cx.copy_data_from_slice(&bottom[3].data());
            }
        } else {
            self.hx.copy_data_from_slice(&self.hy.data());
            self.cx.copy_data_from_slice(&self.cy.data());
        }
        let rows = self.restarted_rows(&bottom[1]);
        if !rows.is_empty() {
            self.zero_rows(&mut self.hx.data_mut(), &rows);
            self.zero_rows(&mut self.cx.data_mut(), &rows);
        }
    }

    pub fn forward(
        &mut self,
        bottom: &[Blob],
        top: &[Blob],
        run: impl FnOnce(&[f32], ForwardBuffers<'_>, &mut [f32], Option<&mut [f32]>) -> Result<()>,
    ) -> Result<()> {
        self.load_initial_state(bottom);
        let lstm = self.is_lstm();
        let w = self.weights.data();
        let x = bottom[0].data();
        let hx = self.hx.data();
        let cx = self.cx.data();
        let mut y = top[0].data_mut();
        let mut hy = self.hy.data_mut();
        let mut cy = self.cy.data_mut();
        let io = ForwardBuffers {
            x: &x,
            hx: Some(&hx[..]),
            cx: if lstm { Some(&cx[..]) } else { None },
            y: &mut y,
            hy: &mut hy,
            cy: &mut cy,
        };
        {
            let mut workspace = self.workspace.borrow_mut();
            let mut reserve = self.reserve.borrow_mut();
            let reserve = if self.training {
                Some(&mut *reserve)
            } else {
                None
            };
            run(&w[..], io, &mut workspace[..], reserve)?;
        }
        if self.training {
            self.reserve_stamp = Some(self.reserve.claim());
        }
        Ok(())
    }

    /// The reserve must still hold this layer's last training forward.
    fn check_reserve(&self) -> Result<()> {
        match self.reserve_stamp {
            Some(stamp) if stamp == self.reserve.stamp() => Ok(()),
            Some(_) => Err(NetError::ReserveOverwritten(
                "another layer wrote the shared reserve; run backward before the next forward".to_string(),
            )),
            None => Err(NetError::ReserveOverwritten(
                "backward called without a training forward".to_string(),
            )),
        }
    }

    pub fn backward(
        &mut self,
        top: &[Blob],
        propagate_down: &[bool],
        bottom: &[Blob],
        run_data: impl FnOnce(&[f32], BackwardBuffers<'_>, &mut [f32], &mut [f32]) -> Result<()>,
        run_weights: impl FnOnce(&[f32], Option<&[f32]>, &mut [f32], &[f32]) -> Result<()>,
    ) -> Result<()> {
        if !self.training {
            return Err(NetError::Unsupported(
                "native backward needs the training phase reserve".to_string(),
            ));
        }
        self.check_reserve()?;
        let lstm = self.is_lstm();
        let expose_out = self.expose_hidden_output;
        {
            let w = self.weights.data();
            let dy = top[0].diff();
            let dhy = self.hy.diff();
            let dcy = self.cy.diff();
            let cx = self.cx.data();
            let mut dhx = self.hx.diff_mut();
            let mut dcx = self.cx.diff_mut();
            let mut bottom_diff;
            let dx: &mut [f32] = if propagate_down.first().copied().unwrap_or(false) {
                bottom_diff = bottom[0].diff_mut();
                &mut bottom_diff
            } else {
                self.dx_scratch.resize(bottom[0].count(), 0.0);
                &mut self.dx_scratch
            };
            let io = BackwardBuffers {
                dy: &dy,
                dhy: if expose_out { Some(&dhy[..]) } else { None },
                dcy: if expose_out && lstm { Some(&dcy[..]) } else { None },
                cx: if lstm { Some(&cx[..]) } else { None },
                dx,
                dhx: &mut dhx,
                dcx: &mut dcx,
            };
            let mut workspace = self.workspace.borrow_mut();
            let mut reserve = self.reserve.borrow_mut();
            run_data(&w[..], io, &mut workspace[..], &mut reserve[..])?;
        }
        {
            let x = bottom[0].data();
            let hx = self.hx.data();
            let mut dw = self.weights.diff_mut();
            let reserve = self.reserve.borrow_mut();
            run_weights(&x[..], Some(&hx[..]), &mut dw[..], &reserve[..])?;
        }

        let rows = self.restarted_rows(&bottom[1]);
        if !rows.is_empty() {
            self.zero_rows(&mut self.hx.diff_mut(), &rows);
            self.zero_rows(&mut self.cx.diff_mut(), &rows);
        }
        if self.expose_hidden_input {
            if propagate_down.get(2).copied().unwrap_or(false) {
                bottom[2].copy_diff_from_slice(&self.hx.diff());
            }
            if lstm && propagate_down.get(3).copied().unwrap_or(false) {
                bottom[3].copy_diff_from_slice(&self.cx.diff());
            }
        }
        Ok(())
    }
}
