//! Single-timestep LSTM cell
//!
//! Bottoms: previous cell state `c_prev` `[1, N, H]`, gate pre-activations
//! `[1, N, 4H]` ordered input, forget, output, cell-candidate, and the
//! continuation indicators `[1, N]`. Tops: cell state `c` and hidden state
//! `h`, both `[1, N, H]`.
//!
//! Where the indicator is zero the forget gate is forced to zero, which
//! starts a fresh sequence for that batch row.

use super::r#trait::{check_count, Layer};
use crate::blob::Blob;
use crate::utils::activations::{sigmoid, sigmoid_grad, tanh_grad};
use crate::{NetError, Result};

/// LSTM cell update `c = f ⊙ c_prev + i ⊙ g`, `h = o ⊙ tanh(c)`.
#[derive(Default)]
pub struct LstmUnitLayer {
    hidden: usize,
    /// Gate activations saved by forward, `[N, 4H]`.
    acts: Vec<f32>,
}

impl LstmUnitLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for LstmUnitLayer {
    fn layer_type(&self) -> &'static str {
        "LSTMUnit"
    }

    fn setup(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        check_count(self.layer_type(), "bottom", 3, bottom.len())?;
        check_count(self.layer_type(), "top", 2, top.len())
    }

    fn reshape(&mut self, bottom: &[Blob], top: &mut [Blob]) -> Result<()> {
        let c_shape = bottom[0].shape();
        if c_shape.len() != 3 || c_shape[0] != 1 {
            return Err(NetError::ShapeMismatch(format!(
                "LSTM unit expects c_prev [1, N, H], got {}",
                bottom[0].shape_string()
            )));
        }
        let (n, h) = (c_shape[1], c_shape[2]);
        if bottom[1].shape() != [1, n, 4 * h] || bottom[2].shape() != [1, n] {
            return Err(NetError::ShapeMismatch(format!(
                "LSTM unit inputs {} / {} / {} are inconsistent",
                bottom[0].shape_string(),
                bottom[1].shape_string(),
                bottom[2].shape_string()
            )));
        }
        self.hidden = h;
        self.acts.resize(n * 4 * h, 0.0);
        top[0].reshape_like(&bottom[0]);
        top[1].reshape_like(&bottom[0]);
        Ok(())
    }

    fn forward(&mut self, bottom: &[Blob], top: &[Blob]) -> Result<()> {
        let h = self.hidden;
        let c_prev = bottom[0].data();
        let x = bottom[1].data();
        let cont = bottom[2].data();
        let mut c = top[0].data_mut();
        let mut hid = top[1].data_mut();

        for (n, &flag) in cont.iter().enumerate() {
            let xs = &x[n * 4 * h..(n + 1) * 4 * h];
            let acts = &mut self.acts[n * 4 * h..(n + 1) * 4 * h];
            for d in 0..h {
                let i = sigmoid(xs[d]);
                let f = if flag != 0.0 { sigmoid(xs[h + d]) } else { 0.0 };
                let o = sigmoid(xs[2 * h + d]);
                let g = xs[3 * h + d].tanh();
                let idx = n * h + d;
                c[idx] = f * c_prev[idx] + i * g;
                hid[idx] = o * c[idx].tanh();
                acts[d] = i;
                acts[h + d] = f;
                acts[2 * h + d] = o;
                acts[3 * h + d] = g;
            }
        }
        Ok(())
    }

    fn backward(&mut self, top: &[Blob], propagate_down: &[bool], bottom: &[Blob]) -> Result<()> {
        if propagate_down.get(2).copied().unwrap_or(false) {
            return Err(NetError::InvalidConfig(
                "LSTM unit cannot backpropagate to sequence indicators".to_string(),
            ));
        }
        let want_c = propagate_down.first().copied().unwrap_or(false);
        let want_x = propagate_down.get(1).copied().unwrap_or(false);
        if !want_c && !want_x {
            return Ok(());
        }
        let h = self.hidden;
        let c = top[0].data();
        let dc_top = top[0].diff();
        let dh_top = top[1].diff();
        let c_prev = bottom[0].data();
        let mut dc_prev = bottom[0].diff_mut();
        let mut dx = bottom[1].diff_mut();
        let n_rows = bottom[2].count();

        for n in 0..n_rows {
            let acts = &self.acts[n * 4 * h..(n + 1) * 4 * h];
            for d in 0..h {
                let idx = n * h + d;
                let (i, f, o, g) = (acts[d], acts[h + d], acts[2 * h + d], acts[3 * h + d]);
                let tanh_c = c[idx].tanh();
                let dc = dc_top[idx] + dh_top[idx] * o * tanh_grad(tanh_c);
                if want_c {
                    dc_prev[idx] = dc * f;
                }
                if want_x {
                    let base = n * 4 * h;
                    dx[base + d] = dc * g * sigmoid_grad(i);
                    dx[base + h + d] = dc * c_prev[idx] * sigmoid_grad(f);
                    dx[base + 2 * h + d] = dh_top[idx] * tanh_c * sigmoid_grad(o);
                    dx[base + 3 * h + d] = dc * i * tanh_grad(g);
                }
            }
        }
        Ok(())
    }
}
