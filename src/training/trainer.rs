//! # Training Loop
//!
//! One step:
//!
//! 1. drop samples whose shape differs from the configured input
//! 2. predict Parameter Vectors and apply the Tone-Blur Transform
//! 3. run the codec surrogate per image; images it rejects are dropped
//! 4. run the detector on the reconstructions
//! 5. combine detection loss and bits into the objective
//! 6. backpropagate detector → codec → transform → predictor
//! 7. clip and apply Adam
//!
//! A step with no surviving sample skips the optimizer but still advances the
//! global step, so lambda schedules and checkpoint intervals keep moving.

use std::path::PathBuf;

use log::{info, warn};
use ndarray::parallel::prelude::*;
use ndarray::{Array4, Axis};

use super::checkpoint::{Checkpoint, CheckpointStore, CHECKPOINT_VERSION};
use super::context::{TrainPhase, TrainingContext};
use super::dataset::{BatchLoader, Dataset, Sample};
use super::optimizer::{clip_grad_norm, decayed_lr, Adam};
use crate::codec::{build_surrogate, CodecPass, CodecSurrogate};
use crate::config::PipelineConfig;
use crate::core::metrics::StepMetrics;
use crate::core::tensor::stack_images;
use crate::detector::{BoxAnnotation, DetectionBackbone};
use crate::error::{PipelineError, PipelineResult, Recoverable, RecoveryStrategy};
use crate::objective::RateAccuracyObjective;
use crate::processing::{ParameterPredictor, ToneBlurTransform};

/// Why a step did not update the weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Every sample was dropped before the predictor
    NoValidSamples,
    /// The codec rejected every transformed image
    AllCodecFailures,
    /// An error asked for the whole batch to be dropped
    BatchRejected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(StepMetrics),
    Skipped { reason: SkipReason, skipped: usize },
}

/// Result of [`Trainer::run`].
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub steps: u64,
    pub epochs: u32,
    pub skipped_steps: u64,
    pub last_metrics: Option<StepMetrics>,
    pub checkpoint: PathBuf,
}

pub struct Trainer {
    config: PipelineConfig,
    predictor: ParameterPredictor,
    transform: ToneBlurTransform,
    codec: Box<dyn CodecSurrogate>,
    detector: Box<dyn DetectionBackbone>,
    objective: RateAccuracyObjective,
    store: Box<dyn CheckpointStore>,
    ctx: TrainingContext,
}

impl Trainer {
    pub fn new(
        config: PipelineConfig,
        predictor: ParameterPredictor,
        detector: Box<dyn DetectionBackbone>,
        store: Box<dyn CheckpointStore>,
    ) -> PipelineResult<Self> {
        config.validate()?;
        if predictor.input_shape() != config.input_shape() || predictor.param_arity() != config.param_arity() {
            return Err(PipelineError::config(
                "predictor",
                format!("{:?}/{}", predictor.input_shape(), predictor.param_arity()),
                "predictor was built for a different configuration",
            ));
        }
        let tr = &config.training;
        let predictor_opt = Adam::new(predictor.num_params(), tr.learning_rate);
        let detector_opt = tr
            .fine_tune_detector
            .then(|| Adam::new(detector.weights().len(), tr.detector_learning_rate));
        Ok(Self {
            transform: ToneBlurTransform::new(&config),
            codec: build_surrogate(&config.codec),
            objective: RateAccuracyObjective::new(config.objective.clone())?,
            ctx: TrainingContext::new(predictor_opt, detector_opt),
            config,
            predictor,
            detector,
            store,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn context(&self) -> &TrainingContext {
        &self.ctx
    }

    pub fn predictor(&self) -> &ParameterPredictor {
        &self.predictor
    }

    pub fn detector(&self) -> &dyn DetectionBackbone {
        self.detector.as_ref()
    }

    /// Swap the codec surrogate.
    pub fn with_codec(mut self, codec: Box<dyn CodecSurrogate>) -> Self {
        self.codec = codec;
        self
    }

    /// Load weights from a checkpoint. With `resume`, also restore the step,
    /// epoch and optimizer moments.
    pub fn restore(&mut self, checkpoint: &Checkpoint, resume: bool) -> PipelineResult<()> {
        checkpoint.check_compatible(&self.config)?;
        self.predictor.load_weights(checkpoint.predictor.clone())?;
        if let Some(weights) = &checkpoint.detector {
            let dst = self.detector.weights_mut();
            if dst.len() != weights.len() {
                return Err(PipelineError::config(
                    "detector.weights",
                    weights.len(),
                    format!("expected {} values for this detector", dst.len()),
                ));
            }
            dst.copy_from_slice(weights);
        }
        if resume {
            self.ctx.step = checkpoint.step;
            self.ctx.epoch = checkpoint.epoch;
            let tr = &self.config.training;
            if let Some(state) = &checkpoint.predictor_optimizer {
                self.ctx.predictor_opt = Adam::with_state(self.predictor.num_params(), tr.learning_rate, state.clone());
            }
            if let (Some(opt), Some(state)) = (self.ctx.detector_opt.as_mut(), &checkpoint.detector_optimizer) {
                *opt = Adam::with_state(self.detector.weights().len(), tr.detector_learning_rate, state.clone());
            }
            info!("resuming at epoch {} step {}", self.ctx.epoch, self.ctx.step);
        }
        Ok(())
    }

    /// Snapshot of the current weights and position.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            step: self.ctx.step,
            epoch: self.ctx.epoch,
            predictor: self.predictor.weights().to_vec(),
            detector: self.config.training.fine_tune_detector.then(|| self.detector.weights().to_vec()),
            predictor_optimizer: Some(self.ctx.predictor_opt.state().clone()),
            detector_optimizer: self.ctx.detector_opt.as_ref().map(|o| o.state().clone()),
            config: self.config.clone(),
        }
    }

    pub fn save_checkpoint(&mut self, name: &str) -> PipelineResult<PathBuf> {
        self.ctx.transition(TrainPhase::Checkpoint)?;
        self.store.save(&self.checkpoint(), name)
    }

    /// Drop a failing sample when its error allows it, else return the error.
    fn sample_failure(id: &str, error: PipelineError) -> PipelineResult<()> {
        let reason = error.recovery_strategies().into_iter().find_map(|s| match s {
            RecoveryStrategy::SkipSample { reason } => Some(reason),
            _ => None,
        });
        match reason {
            Some(reason) => {
                warn!("⚠️  skipping sample '{id}' ({reason}): {error}");
                Ok(())
            }
            None => Err(error),
        }
    }

    /// Skip the step when a batch-level error allows it, else return the error.
    fn batch_failure(&mut self, error: PipelineError, skipped: usize) -> PipelineResult<StepOutcome> {
        let reason = error.recovery_strategies().into_iter().find_map(|s| match s {
            RecoveryStrategy::SkipBatch { reason } => Some(reason),
            _ => None,
        });
        match reason {
            Some(reason) => {
                warn!("⚠️  dropping batch ({reason}): {error}");
                self.skip_step(SkipReason::BatchRejected, skipped)
            }
            None => Err(error),
        }
    }

    fn skip_step(&mut self, reason: SkipReason, skipped: usize) -> PipelineResult<StepOutcome> {
        warn!("⚠️  step {} skipped ({reason:?}, {skipped} samples dropped)", self.ctx.step);
        self.ctx.transition(TrainPhase::FetchBatch)?;
        self.ctx.step += 1;
        self.ctx.epoch_stats.skipped_steps += 1;
        self.ctx.epoch_stats.skipped_samples += skipped;
        Ok(StepOutcome::Skipped { reason, skipped })
    }

    /// Run one optimization step on `samples`.
    ///
    /// `skipped` counts samples already dropped while loading the batch.
    /// Per-sample errors drop the sample when they offer
    /// [`RecoveryStrategy::SkipSample`]; errors from the detector skip the
    /// step when they offer [`RecoveryStrategy::SkipBatch`]. Anything else is
    /// returned.
    pub fn train_step(&mut self, samples: Vec<Sample>, mut skipped: usize) -> PipelineResult<StepOutcome> {
        self.ctx.transition(TrainPhase::Forward)?;

        let total = samples.len() + skipped;
        let mut valid = Vec::with_capacity(samples.len());
        for sample in samples {
            match self.predictor.check_shape(&sample.id, sample.image.view()) {
                Ok(()) => valid.push(sample),
                Err(e) => {
                    Self::sample_failure(&sample.id, e)?;
                    skipped += 1;
                }
            }
        }
        if valid.is_empty() {
            return self.skip_step(SkipReason::NoValidSamples, skipped);
        }

        let batch = stack_images(valid.iter().map(|s| s.image.view()))?;
        let prediction = self.predictor.forward(batch.view())?;
        let transformed = self.transform.forward(batch.view(), prediction.params.view(), true);

        let quality = self.config.codec.quality;
        let codec = self.codec.as_ref();
        let coded: Vec<PipelineResult<CodecPass>> = transformed
            .output
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|image| codec.forward(image, quality, true))
            .collect();

        let mut survivors = Vec::with_capacity(coded.len());
        let mut passes = Vec::with_capacity(coded.len());
        for (i, result) in coded.into_iter().enumerate() {
            match result {
                Ok(pass) => {
                    survivors.push(i);
                    passes.push(pass);
                }
                Err(e) => {
                    Self::sample_failure(&valid[i].id, e)?;
                    skipped += 1;
                }
            }
        }
        if survivors.is_empty() {
            return self.skip_step(SkipReason::AllCodecFailures, skipped);
        }

        let reconstructions = stack_images(passes.iter().map(|p| p.reconstruction.view()))?;
        let targets: Vec<Vec<BoxAnnotation>> = survivors.iter().map(|&i| valid[i].targets.clone()).collect();
        let detection = match self.detector.forward(reconstructions.view(), &targets) {
            Ok(detection) => detection,
            Err(e) => return self.batch_failure(e, total),
        };

        self.ctx.transition(TrainPhase::ComputeObjective)?;
        let bits: Vec<f32> = passes.iter().map(|p| p.bits).collect();
        let [c, h, w] = self.config.input_shape();
        let terms = self.objective.evaluate(detection.loss, &bits, c * h * w, self.ctx.step);
        self.ctx.lambda = terms.lambda;

        self.ctx.transition(TrainPhase::Backward)?;
        let mut grad_output = Array4::<f32>::zeros(transformed.output.raw_dim());
        for (k, &i) in survivors.iter().enumerate() {
            let grad = passes[k].backward(detection.image_grads.index_axis(Axis(0), k), terms.grad_bits[k]);
            grad_output.index_axis_mut(Axis(0), i).assign(&grad);
        }
        let grad_params = self.transform.backward(&transformed, grad_output.view());
        let mut grads = self.predictor.backward(&prediction, grad_params.view())?;

        self.ctx.transition(TrainPhase::OptimizerStep)?;
        let clip = self.config.training.grad_clip;
        clip_grad_norm(&mut grads, clip);
        self.ctx.predictor_opt.step(self.predictor.weights_mut(), &grads);
        if let Some(opt) = self.ctx.detector_opt.as_mut() {
            let mut detector_grads = detection.weight_grads;
            clip_grad_norm(&mut detector_grads, clip);
            opt.step(self.detector.weights_mut(), &detector_grads);
        }

        let mean_sigma = survivors
            .iter()
            .map(|&i| prediction.params[[i, self.predictor.tone_arity()]])
            .sum::<f32>()
            / survivors.len() as f32;
        let metrics = StepMetrics {
            step: self.ctx.step,
            epoch: self.ctx.epoch,
            samples: survivors.len(),
            skipped,
            mean_bits: terms.mean_bits,
            bpp: terms.mean_bits / (h * w) as f32,
            detection_loss: terms.detection,
            objective: terms.total,
            lambda: terms.lambda,
            mean_sigma,
            learning_rate: self.ctx.predictor_opt.lr(),
        };

        let stats = &mut self.ctx.epoch_stats;
        stats.objective.update(terms.total);
        stats.detection.update(terms.detection);
        stats.bits.update(terms.mean_bits);
        stats.steps += 1;
        stats.skipped_samples += skipped;
        self.ctx.step += 1;
        Ok(StepOutcome::Completed(metrics))
    }

    /// Train for the configured number of epochs, then write `last.json`.
    pub fn run<D: Dataset>(&mut self, loader: &mut BatchLoader<D>) -> PipelineResult<TrainSummary> {
        let tr = self.config.training.clone();
        info!(
            "🚀 training {} epochs over {} images ({} batches/epoch), codec {} q{}",
            tr.epochs,
            loader.dataset().len(),
            loader.batches_per_epoch(),
            self.codec.name(),
            self.config.codec.quality
        );
        if loader.epoch() != self.ctx.epoch {
            loader.set_epoch(self.ctx.epoch);
        }

        let mut skipped_steps = 0;
        let mut last_metrics = None;
        while self.ctx.epoch < tr.epochs {
            let lr = decayed_lr(tr.learning_rate, tr.lr_decay, self.ctx.epoch);
            self.ctx.predictor_opt.set_lr(lr);
            if let Some(opt) = self.ctx.detector_opt.as_mut() {
                opt.set_lr(decayed_lr(tr.detector_learning_rate, tr.lr_decay, self.ctx.epoch));
            }
            self.ctx.begin_epoch();

            loop {
                self.ctx.transition(TrainPhase::FetchBatch)?;
                let Some(batch) = loader.next_batch() else {
                    break;
                };
                match self.train_step(batch.samples, batch.failed)? {
                    StepOutcome::Completed(metrics) => {
                        if metrics.step % tr.log_interval == 0 {
                            info!("{metrics}");
                        }
                        last_metrics = Some(metrics);
                    }
                    StepOutcome::Skipped { .. } => skipped_steps += 1,
                }
                if self.ctx.step % tr.checkpoint_interval == 0 {
                    self.save_checkpoint(&format!("step_{:08}.json", self.ctx.step))?;
                }
            }

            let stats = &self.ctx.epoch_stats;
            info!(
                "epoch {} done: L={:.5} det={:.5} bits={:.0} steps={} skipped_steps={} skipped_samples={}",
                self.ctx.epoch,
                stats.objective.mean(),
                stats.detection.mean(),
                stats.bits.mean(),
                stats.steps,
                stats.skipped_steps,
                stats.skipped_samples
            );
            self.ctx.epoch += 1;
        }

        let checkpoint = self.save_checkpoint("last.json")?;
        self.ctx.transition(TrainPhase::Terminal)?;
        info!("✅ training finished at step {}", self.ctx.step);
        Ok(TrainSummary {
            steps: self.ctx.step,
            epochs: self.ctx.epoch,
            skipped_steps,
            last_metrics,
            checkpoint,
        })
    }
}
