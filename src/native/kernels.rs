//! Reference kernels behind the native RNN API
//!
//! Plain loops over time-major buffers. Shapes: `x` is `[T, N, I]`, `y` is
//! `[T, N, H]`, hidden and cell state are `[L, N, H]`.
//!
//! Flat weight layout, per layer `l` with input width `in_l`:
//! `G` input matrices `[H, in_l]`, `G` recurrent matrices `[H, H]`, then `G`
//! input biases and `G` recurrent biases of `H` each. LSTM gates are ordered
//! input, forget, cell, output.
//!
//! The reserve buffer keeps, per layer and timestep, the gate activations,
//! cell state, hidden state, inter-layer dropout masks and the gate
//! gradients produced by `backward_data` for `backward_weights`.

use super::RnnMode;
use crate::utils::activations::{sigmoid, sigmoid_grad, tanh_grad};
use crate::utils::SimpleRng;

/// Problem size of one RNN configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RnnDims {
    pub mode: RnnMode,
    pub seq_len: usize,
    pub batch: usize,
    pub input: usize,
    pub hidden: usize,
    pub layers: usize,
}

/// Offset and length inside a flat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

impl RnnDims {
    fn gates(&self) -> usize {
        self.mode.gates()
    }

    pub fn layer_input(&self, layer: usize) -> usize {
        if layer == 0 {
            self.input
        } else {
            self.hidden
        }
    }

    fn layer_weight_count(&self, layer: usize) -> usize {
        let g = self.gates();
        let h = self.hidden;
        g * h * (self.layer_input(layer) + h) + 2 * g * h
    }

    pub fn weight_count(&self) -> usize {
        (0..self.layers).map(|l| self.layer_weight_count(l)).sum()
    }

    fn layer_offset(&self, layer: usize) -> usize {
        (0..layer).map(|l| self.layer_weight_count(l)).sum()
    }

    /// Matrix and bias regions of one linear layer. Ids `0..G` address the
    /// input matrices, `G..2G` the recurrent ones.
    pub fn lin_layer_regions(&self, layer: usize, lin_id: usize) -> (Region, Region) {
        let g = self.gates();
        let h = self.hidden;
        let in_l = self.layer_input(layer);
        let base = self.layer_offset(layer);
        let matrix = if lin_id < g {
            Region {
                offset: base + lin_id * h * in_l,
                len: h * in_l,
            }
        } else {
            Region {
                offset: base + g * h * in_l + (lin_id - g) * h * h,
                len: h * h,
            }
        };
        let bias = Region {
            offset: base + g * h * (in_l + h) + lin_id * h,
            len: h,
        };
        (matrix, bias)
    }

    fn step(&self) -> usize {
        self.batch * self.hidden
    }

    pub fn workspace_floats(&self) -> usize {
        let seq = self.seq_len * self.step();
        2 * seq + self.batch * self.gates() * self.hidden + 2 * self.step()
    }

    fn acts_len(&self) -> usize {
        self.layers * self.seq_len * self.batch * self.gates() * self.hidden
    }

    fn state_len(&self) -> usize {
        self.layers * self.seq_len * self.step()
    }

    fn masks_len(&self) -> usize {
        self.layers.saturating_sub(1) * self.seq_len * self.step()
    }

    pub fn reserve_floats(&self) -> usize {
        2 * self.acts_len() + 2 * self.state_len() + self.masks_len()
    }

    fn acts_at(&self, layer: usize, t: usize) -> usize {
        (layer * self.seq_len + t) * self.batch * self.gates() * self.hidden
    }

    fn state_at(&self, layer: usize, t: usize) -> usize {
        (layer * self.seq_len + t) * self.step()
    }

    fn cells_base(&self) -> usize {
        self.acts_len()
    }

    fn hiddens_base(&self) -> usize {
        self.acts_len() + self.state_len()
    }

    fn masks_base(&self) -> usize {
        self.acts_len() + 2 * self.state_len()
    }

    fn dgates_base(&self) -> usize {
        self.masks_base() + self.masks_len()
    }
}

/// Dropout applied to the output of every layer but the last, in training.
pub struct DropoutState<'a> {
    pub ratio: f32,
    pub rng: &'a mut SimpleRng,
}

/// Inputs and outputs of one forward call.
pub struct ForwardBuffers<'a> {
    pub x: &'a [f32],
    pub hx: Option<&'a [f32]>,
    pub cx: Option<&'a [f32]>,
    pub y: &'a mut [f32],
    pub hy: &'a mut [f32],
    pub cy: &'a mut [f32],
}

/// Inputs and outputs of one backward-data call.
pub struct BackwardBuffers<'a> {
    pub dy: &'a [f32],
    pub dhy: Option<&'a [f32]>,
    pub dcy: Option<&'a [f32]>,
    pub cx: Option<&'a [f32]>,
    pub dx: &'a mut [f32],
    pub dhx: &'a mut [f32],
    pub dcx: &'a mut [f32],
}

fn state_slice(state: Option<&[f32]>, layer: usize, step: usize) -> Option<&[f32]> {
    state.map(|s| &s[layer * step..(layer + 1) * step])
}

/// Pre-activations for one timestep: bias + W·input + R·h_prev.
fn gate_preactivations(
    dims: &RnnDims,
    layer: usize,
    w: &[f32],
    input: &[f32],
    h_prev: &[f32],
    pre: &mut [f32],
) {
    let g = dims.gates();
    let h = dims.hidden;
    let in_l = dims.layer_input(layer);
    for n in 0..dims.batch {
        let x_n = &input[n * in_l..(n + 1) * in_l];
        let h_n = &h_prev[n * h..(n + 1) * h];
        for k in 0..g {
            let (wm, wb) = dims.lin_layer_regions(layer, k);
            let (rm, rb) = dims.lin_layer_regions(layer, g + k);
            for j in 0..h {
                let mut acc = w[wb.offset + j] + w[rb.offset + j];
                let w_row = &w[wm.offset + j * in_l..wm.offset + (j + 1) * in_l];
                for (wv, xv) in w_row.iter().zip(x_n) {
                    acc += wv * xv;
                }
                let r_row = &w[rm.offset + j * h..rm.offset + (j + 1) * h];
                for (rv, hv) in r_row.iter().zip(h_n) {
                    acc += rv * hv;
                }
                pre[n * g * h + k * h + j] = acc;
            }
        }
    }
}

/// Run the stacked RNN over the whole sequence.
///
/// With `reserve` present the call is a training forward: activations are
/// stored for the backward pass and dropout (if any) is applied.
pub fn forward(
    dims: &RnnDims,
    w: &[f32],
    buffers: ForwardBuffers<'_>,
    workspace: &mut [f32],
    mut reserve: Option<&mut [f32]>,
    mut dropout: Option<DropoutState<'_>>,
) {
    let step = dims.step();
    let seq = dims.seq_len * step;
    let g = dims.gates();
    let hdim = dims.hidden;
    let ForwardBuffers {
        x,
        hx,
        cx,
        y,
        hy,
        cy,
    } = buffers;
    assert_eq!(x.len(), dims.seq_len * dims.batch * dims.input, "x length mismatch");
    assert_eq!(y.len(), seq, "y length mismatch");
    assert!(workspace.len() >= dims.workspace_floats(), "workspace too small");
    if let Some(r) = reserve.as_deref() {
        assert!(r.len() >= dims.reserve_floats(), "reserve too small");
    }

    let (seq_a, rest) = workspace.split_at_mut(seq);
    let (seq_b, rest) = rest.split_at_mut(seq);
    let (pre, rest) = rest.split_at_mut(dims.batch * g * hdim);
    let (h_cur, rest) = rest.split_at_mut(step);
    let c_cur = &mut rest[..step];

    for l in 0..dims.layers {
        let in_l = dims.layer_input(l);
        let (input, output): (&[f32], &mut [f32]) = if l == 0 {
            (x, &mut *seq_a)
        } else if l % 2 == 1 {
            (&*seq_a, &mut *seq_b)
        } else {
            (&*seq_b, &mut *seq_a)
        };

        match state_slice(hx, l, step) {
            Some(s) => h_cur.copy_from_slice(s),
            None => h_cur.fill(0.0),
        }
        match state_slice(cx, l, step) {
            Some(s) if dims.mode == RnnMode::Lstm => c_cur.copy_from_slice(s),
            _ => c_cur.fill(0.0),
        }

        for t in 0..dims.seq_len {
            let input_t = &input[t * dims.batch * in_l..(t + 1) * dims.batch * in_l];
            gate_preactivations(dims, l, w, input_t, h_cur, pre);

            for n in 0..dims.batch {
                let p = &mut pre[n * g * hdim..(n + 1) * g * hdim];
                for j in 0..hdim {
                    let idx = n * hdim + j;
                    match dims.mode {
                        RnnMode::Lstm => {
                            let i = sigmoid(p[j]);
                            let f = sigmoid(p[hdim + j]);
                            let gg = p[2 * hdim + j].tanh();
                            let o = sigmoid(p[3 * hdim + j]);
                            p[j] = i;
                            p[hdim + j] = f;
                            p[2 * hdim + j] = gg;
                            p[3 * hdim + j] = o;
                            c_cur[idx] = f * c_cur[idx] + i * gg;
                            h_cur[idx] = o * c_cur[idx].tanh();
                        }
                        RnnMode::RnnTanh => {
                            p[j] = p[j].tanh();
                            h_cur[idx] = p[j];
                        }
                    }
                }
            }
            output[t * step..(t + 1) * step].copy_from_slice(h_cur);

            if let Some(r) = reserve.as_deref_mut() {
                let a = dims.acts_at(l, t);
                r[a..a + pre.len()].copy_from_slice(pre);
                let s = dims.state_at(l, t);
                let cb = dims.cells_base() + s;
                r[cb..cb + step].copy_from_slice(c_cur);
                let hb = dims.hiddens_base() + s;
                r[hb..hb + step].copy_from_slice(h_cur);
            }
        }

        hy[l * step..(l + 1) * step].copy_from_slice(h_cur);
        if dims.mode == RnnMode::Lstm {
            cy[l * step..(l + 1) * step].copy_from_slice(c_cur);
        }

        // Dropout on the hand-off to the next layer, training only.
        if l + 1 < dims.layers {
            if let Some(r) = reserve.as_deref_mut() {
                let mb = dims.masks_base() + dims.state_at(l, 0);
                let mask = &mut r[mb..mb + seq];
                match dropout.as_mut() {
                    Some(d) if d.ratio > 0.0 => {
                        let scale = if d.ratio < 1.0 { 1.0 / (1.0 - d.ratio) } else { 0.0 };
                        for (m, v) in mask.iter_mut().zip(output.iter_mut()) {
                            *m = if d.rng.next_f32() >= d.ratio { scale } else { 0.0 };
                            *v *= *m;
                        }
                    }
                    _ => mask.fill(1.0),
                }
            }
        }
    }

    let last = if dims.layers % 2 == 1 { &*seq_a } else { &*seq_b };
    y.copy_from_slice(last);
}

/// Backward pass of one layer over time. Writes gate gradients to `dgates`.
#[allow(clippy::too_many_arguments)]
fn backward_layer(
    dims: &RnnDims,
    l: usize,
    w: &[f32],
    dout: &[f32],
    mask: Option<&[f32]>,
    din: &mut [f32],
    front: &[f32],
    dgates: &mut [f32],
    scratch: &mut [f32],
    init: (Option<&[f32]>, Option<&[f32]>, Option<&[f32]>),
) -> (Vec<f32>, Vec<f32>) {
    let step = dims.step();
    let g = dims.gates();
    let hdim = dims.hidden;
    let in_l = dims.layer_input(l);
    let (dhy, dcy, cx) = init;

    let (dh, rest) = scratch.split_at_mut(step);
    let (dh_next, rest) = rest.split_at_mut(step);
    let dc_next = &mut rest[..step];
    match dhy {
        Some(s) => dh_next.copy_from_slice(s),
        None => dh_next.fill(0.0),
    }
    match dcy {
        Some(s) if dims.mode == RnnMode::Lstm => dc_next.copy_from_slice(s),
        _ => dc_next.fill(0.0),
    }
    din.fill(0.0);

    let zeros = vec![0.0f32; step];
    for t in (0..dims.seq_len).rev() {
        for i in 0..step {
            let m = mask.map_or(1.0, |m| m[t * step + i]);
            dh[i] = dout[t * step + i] * m + dh_next[i];
        }

        let a = dims.acts_at(l, t) - dims.acts_at(l, 0);
        let dg = &mut dgates[a..a + dims.batch * g * hdim];
        let acts_base = dims.acts_at(l, t);
        let acts = &front[acts_base..acts_base + dims.batch * g * hdim];
        let s = dims.state_at(l, t);
        match dims.mode {
            RnnMode::Lstm => {
                let c_t = &front[dims.cells_base() + s..dims.cells_base() + s + step];
                let c_prev: &[f32] = if t > 0 {
                    let sp = dims.state_at(l, t - 1);
                    &front[dims.cells_base() + sp..dims.cells_base() + sp + step]
                } else {
                    cx.unwrap_or(&zeros[..])
                };
                for n in 0..dims.batch {
                    for j in 0..hdim {
                        let idx = n * hdim + j;
                        let base = n * g * hdim;
                        let i = acts[base + j];
                        let f = acts[base + hdim + j];
                        let gg = acts[base + 2 * hdim + j];
                        let o = acts[base + 3 * hdim + j];
                        let tanh_c = c_t[idx].tanh();
                        let dc = dc_next[idx] + dh[idx] * o * tanh_grad(tanh_c);
                        dg[base + j] = dc * gg * sigmoid_grad(i);
                        dg[base + hdim + j] = dc * c_prev[idx] * sigmoid_grad(f);
                        dg[base + 2 * hdim + j] = dc * i * tanh_grad(gg);
                        dg[base + 3 * hdim + j] = dh[idx] * tanh_c * sigmoid_grad(o);
                        dc_next[idx] = dc * f;
                    }
                }
            }
            RnnMode::RnnTanh => {
                for n in 0..dims.batch {
                    for j in 0..hdim {
                        let idx = n * hdim + j;
                        dg[n * hdim + j] = dh[idx] * tanh_grad(acts[n * hdim + j]);
                    }
                }
            }
        }

        dh_next.fill(0.0);
        let din_t = &mut din[t * dims.batch * in_l..(t + 1) * dims.batch * in_l];
        for k in 0..g {
            let (wm, _) = dims.lin_layer_regions(l, k);
            let (rm, _) = dims.lin_layer_regions(l, g + k);
            for n in 0..dims.batch {
                for j in 0..hdim {
                    let d = dg[n * g * hdim + k * hdim + j];
                    if d == 0.0 {
                        continue;
                    }
                    let w_row = &w[wm.offset + j * in_l..wm.offset + (j + 1) * in_l];
                    for (i, wv) in w_row.iter().enumerate() {
                        din_t[n * in_l + i] += d * wv;
                    }
                    let r_row = &w[rm.offset + j * hdim..rm.offset + (j + 1) * hdim];
                    for (i, rv) in r_row.iter().enumerate() {
                        dh_next[n * hdim + i] += d * rv;
                    }
                }
            }
        }
    }
    (dh_next.to_vec(), dc_next.to_vec())
}

fn split_pair<'a>(a: &'a mut [f32], b: &'a mut [f32], read_a: bool) -> (&'a [f32], &'a mut [f32]) {
    if read_a {
        (&*a, b)
    } else {
        (&*b, a)
    }
}

/// Gradients with respect to inputs and initial state.
///
/// Requires the reserve written by a training [`forward`]; stores gate
/// gradients back into it for [`backward_weights`].
pub fn backward_data(
    dims: &RnnDims,
    w: &[f32],
    buffers: BackwardBuffers<'_>,
    workspace: &mut [f32],
    reserve: &mut [f32],
) {
    let step = dims.step();
    let seq = dims.seq_len * step;
    assert_eq!(buffers.dy.len(), seq, "dy length mismatch");
    assert_eq!(buffers.dx.len(), dims.seq_len * dims.batch * dims.input, "dx length mismatch");
    assert!(workspace.len() >= dims.workspace_floats(), "workspace too small");
    assert!(reserve.len() >= dims.reserve_floats(), "reserve too small");

    let (front, dgates_all) = reserve.split_at_mut(dims.dgates_base());
    let front: &[f32] = front;
    let (seq_a, rest) = workspace.split_at_mut(seq);
    let (seq_b, scratch) = rest.split_at_mut(seq);
    let layer_gates = dims.seq_len * dims.batch * dims.gates() * dims.hidden;

    let BackwardBuffers {
        dy,
        dhy,
        dcy,
        cx,
        dx,
        dhx,
        dcx,
    } = buffers;

    for l in (0..dims.layers).rev() {
        let dgates = &mut dgates_all[l * layer_gates..(l + 1) * layer_gates];
        let mask = if l + 1 < dims.layers {
            let mb = dims.masks_base() + dims.state_at(l, 0);
            Some(&front[mb..mb + seq])
        } else {
            None
        };
        let init = (
            state_slice(dhy, l, step),
            state_slice(dcy, l, step),
            state_slice(cx, l, step),
        );

        let (dh0, dc0) = if dims.layers == 1 {
            backward_layer(dims, l, w, dy, mask, dx, front, dgates, scratch, init)
        } else if l == dims.layers - 1 {
            backward_layer(dims, l, w, dy, mask, seq_a, front, dgates, scratch, init)
        } else {
            let read_a = (dims.layers - 2 - l) % 2 == 0;
            if l == 0 {
                let src: &[f32] = if read_a { &*seq_a } else { &*seq_b };
                backward_layer(dims, l, w, src, mask, dx, front, dgates, scratch, init)
            } else {
                let (src, dst) = split_pair(seq_a, seq_b, read_a);
                backward_layer(dims, l, w, src, mask, dst, front, dgates, scratch, init)
            }
        };
        dhx[l * step..(l + 1) * step].copy_from_slice(&dh0);
        if dims.mode == RnnMode::Lstm {
            dcx[l * step..(l + 1) * step].copy_from_slice(&dc0);
        }
    }
}

/// Accumulate weight gradients into `dw` from the gate gradients in the
/// reserve.
pub fn backward_weights(
    dims: &RnnDims,
    x: &[f32],
    hx: Option<&[f32]>,
    dw: &mut [f32],
    reserve: &[f32],
) {
    assert_eq!(dw.len(), dims.weight_count(), "dw length mismatch");
    let step = dims.step();
    let g = dims.gates();
    let hdim = dims.hidden;
    let zeros = vec![0.0f32; step];
    let layer_gates = dims.seq_len * dims.batch * g * hdim;
    let mut masked = vec![0.0f32; step];

    for l in 0..dims.layers {
        let in_l = dims.layer_input(l);
        for t in 0..dims.seq_len {
            let input: &[f32] = if l == 0 {
                &x[t * dims.batch * in_l..(t + 1) * dims.batch * in_l]
            } else {
                let hb = dims.hiddens_base() + dims.state_at(l - 1, t);
                let mb = dims.masks_base() + dims.state_at(l - 1, t);
                for i in 0..step {
                    masked[i] = reserve[hb + i] * reserve[mb + i];
                }
                &masked
            };
            let h_prev: &[f32] = if t > 0 {
                let hb = dims.hiddens_base() + dims.state_at(l, t - 1);
                &reserve[hb..hb + step]
            } else {
                state_slice(hx, l, step).unwrap_or(&zeros[..])
            };
            let dg_base = dims.dgates_base() + l * layer_gates + t * dims.batch * g * hdim;
            let dg = &reserve[dg_base..dg_base + dims.batch * g * hdim];

            for k in 0..g {
                let (wm, wb) = dims.lin_layer_regions(l, k);
                let (rm, rb) = dims.lin_layer_regions(l, g + k);
                for n in 0..dims.batch {
                    for j in 0..hdim {
                        let d = dg[n * g * hdim + k * hdim + j];
                        dw[wb.offset + j] += d;
                        dw[rb.offset + j] += d;
                        for i in 0..in_l {
                            dw[wm.offset + j * in_l + i] += d * input[n * in_l + i];
                        }
                        for i in 0..hdim {
                            dw[rm.offset + j * hdim + i] += d * h_prev[n * hdim + i];
                        }
                    }
                }
            }
        }
    }
}
