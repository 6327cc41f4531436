//! Running averages and per-step metric records.

use std::fmt;

/// Incremental mean. Epoch boundaries start a fresh one.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    sum: f64,
    count: u64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1;
    }

    pub fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }
}

/// Metrics of one completed training step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMetrics {
    pub step: u64,
    pub epoch: u32,
    /// Samples that contributed to the objective
    pub samples: usize,
    /// Samples dropped for shape, dataset or codec errors
    pub skipped: usize,
    pub mean_bits: f32,
    /// Bits per sub-pixel
    pub bpp: f32,
    pub detection_loss: f32,
    pub objective: f32,
    pub lambda: f32,
    pub mean_sigma: f32,
    pub learning_rate: f32,
}

impl fmt::Display for StepMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch {} step {}: L={:.5} det={:.5} bits={:.0} bpp={:.4} lambda={:.4} sigma={:.3} lr={:.2e} n={} skipped={}",
            self.epoch,
            self.step,
            self.objective,
            self.detection_loss,
            self.mean_bits,
            self.bpp,
            self.lambda,
            self.mean_sigma,
            self.learning_rate,
            self.samples,
            self.skipped
        )
    }
}
