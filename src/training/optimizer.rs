//! Adam over a flat weight buffer, plus global-norm gradient clipping.

use serde::{Deserialize, Serialize};

/// Moment estimates carried between steps and across checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    pub m: Vec<f32>,
    pub v: Vec<f32>,
    /// Number of updates applied so far
    pub t: u64,
}

impl AdamState {
    pub fn zeros(len: usize) -> Self {
        Self { m: vec![0.0; len], v: vec![0.0; len], t: 0 }
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    state: AdamState,
}

impl Adam {
    pub fn new(num_params: usize, lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            state: AdamState::zeros(num_params),
        }
    }

    /// Resume from saved moments. Falls back to fresh moments when the saved
    /// buffers do not match `num_params`.
    pub fn with_state(num_params: usize, lr: f32, state: AdamState) -> Self {
        let mut adam = Self::new(num_params, lr);
        if state.m.len() == num_params && state.v.len() == num_params {
            adam.state = state;
        }
        adam
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn state(&self) -> &AdamState {
        &self.state
    }

    /// Apply one bias-corrected update in place.
    pub fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        let s = &mut self.state;
        s.t += 1;
        let t = s.t.min(i32::MAX as u64) as i32;
        let c1 = 1.0 - self.beta1.powi(t);
        let c2 = 1.0 - self.beta2.powi(t);
        for (((p, &g), m), v) in params.iter_mut().zip(grads).zip(s.m.iter_mut()).zip(s.v.iter_mut()) {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / c1;
            let v_hat = *v / c2;
            *p -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}

/// Scale `grads` so their L2 norm is at most `max_norm`. Returns the norm
/// before clipping.
pub fn clip_grad_norm(grads: &mut [f32], max_norm: f32) -> f32 {
    let norm = grads.iter().map(|g| (*g as f64) * (*g as f64)).sum::<f64>().sqrt() as f32;
    if norm > max_norm && norm > 0.0 {
        let scale = max_norm / norm;
        grads.iter_mut().for_each(|g| *g *= scale);
    }
    norm
}

/// Learning rate after `epoch` multiplicative decays.
pub fn decayed_lr(base: f32, decay: f32, epoch: u32) -> f32 {
    base * decay.powi(epoch.min(i32::MAX as u32) as i32)
}
