//! Training state carried between steps.
//!
//! The loop is an explicit state machine. Each step walks
//! `FetchBatch → Forward → ComputeObjective → Backward → OptimizerStep`,
//! with `Checkpoint` entered on the configured interval and at the end.
//! Skipped batches return from `Forward` straight to `FetchBatch`.

use log::trace;

use super::optimizer::Adam;
use crate::core::metrics::RunningMean;
use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainPhase {
    Init,
    FetchBatch,
    Forward,
    ComputeObjective,
    Backward,
    OptimizerStep,
    Checkpoint,
    Terminal,
}

impl TrainPhase {
    /// Whether the loop may move from `self` to `next`.
    pub fn can_transition(self, next: TrainPhase) -> bool {
        use TrainPhase::*;
        matches!(
            (self, next),
            (Init, FetchBatch)
                | (Init, Checkpoint)
                | (FetchBatch, Forward)
                | (FetchBatch, FetchBatch)
                | (FetchBatch, Checkpoint)
                | (Forward, ComputeObjective)
                | (Forward, FetchBatch)
                | (ComputeObjective, Backward)
                | (Backward, OptimizerStep)
                | (OptimizerStep, FetchBatch)
                | (OptimizerStep, Checkpoint)
                | (Checkpoint, FetchBatch)
                | (Checkpoint, Checkpoint)
                | (Checkpoint, Terminal)
        )
    }
}

/// Per-epoch running means for the summary line.
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    pub objective: RunningMean,
    pub detection: RunningMean,
    pub bits: RunningMean,
    pub steps: u64,
    pub skipped_steps: u64,
    pub skipped_samples: usize,
}

#[derive(Debug, Clone)]
pub struct TrainingContext {
    /// Global step; advances on completed and skipped steps alike
    pub step: u64,
    pub epoch: u32,
    /// Lambda used by the latest objective evaluation
    pub lambda: f32,
    pub predictor_opt: Adam,
    /// Present when the detector is fine-tuned
    pub detector_opt: Option<Adam>,
    pub epoch_stats: EpochStats,
    phase: TrainPhase,
}

impl TrainingContext {
    pub fn new(predictor_opt: Adam, detector_opt: Option<Adam>) -> Self {
        Self {
            step: 0,
            epoch: 0,
            lambda: 0.0,
            predictor_opt,
            detector_opt,
            epoch_stats: EpochStats::default(),
            phase: TrainPhase::Init,
        }
    }

    pub fn phase(&self) -> TrainPhase {
        self.phase
    }

    /// Move to `next`, rejecting changes [`TrainPhase::can_transition`]
    /// does not allow.
    pub fn transition(&mut self, next: TrainPhase) -> PipelineResult<()> {
        if !self.phase.can_transition(next) {
            return Err(PipelineError::invalid_state("training phase", self.phase, next));
        }
        trace!("phase {:?} -> {:?} at step {}", self.phase, next, self.step);
        self.phase = next;
        Ok(())
    }

    /// Reset the per-epoch means.
    pub fn begin_epoch(&mut self) {
        self.epoch_stats = EpochStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_cycle_is_legal() {
        use TrainPhase::*;
        let cycle = [Init, FetchBatch, Forward, ComputeObjective, Backward, OptimizerStep, Checkpoint, Terminal];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(Forward.can_transition(FetchBatch));
        assert!(!Forward.can_transition(OptimizerStep));
        assert!(!Terminal.can_transition(FetchBatch));
    }

    #[test]
    fn test_context_starts_at_init() {
        let mut ctx = TrainingContext::new(Adam::new(4, 1e-3), None);
        assert_eq!(ctx.phase(), TrainPhase::Init);
        ctx.transition(TrainPhase::FetchBatch).unwrap();
        assert_eq!(ctx.phase(), TrainPhase::FetchBatch);
        assert_eq!(ctx.step, 0);
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut ctx = TrainingContext::new(Adam::new(4, 1e-3), None);
        let err = ctx.transition(TrainPhase::OptimizerStep).unwrap_err();
        assert_eq!(err.category(), "invalid_state");
        assert_eq!(ctx.phase(), TrainPhase::Init);

        ctx.transition(TrainPhase::Checkpoint).unwrap();
        ctx.transition(TrainPhase::Terminal).unwrap();
        assert!(ctx.transition(TrainPhase::Checkpoint).is_err());
        assert!(ctx.transition(TrainPhase::Forward).is_err());
        assert_eq!(ctx.phase(), TrainPhase::Terminal);
    }
}
