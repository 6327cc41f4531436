//! Checkpoint persistence.
//!
//! A checkpoint is one JSON document holding the predictor weights, the
//! detector weights when they were trained, optimizer moments, the position
//! in the run and the configuration it was produced with. Writes go to a
//! temporary file in the destination directory and are renamed into place,
//! so a crash never leaves a truncated checkpoint behind.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::optimizer::AdamState;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub step: u64,
    pub epoch: u32,
    pub predictor: Vec<f32>,
    pub detector: Option<Vec<f32>>,
    pub predictor_optimizer: Option<AdamState>,
    pub detector_optimizer: Option<AdamState>,
    pub config: PipelineConfig,
}

impl Checkpoint {
    /// Check that `config` reads the weights the way they were trained.
    ///
    /// The predictor head is laid out per tone curve, so a different curve
    /// is rejected even when its parameter count matches.
    pub fn check_compatible(&self, config: &PipelineConfig) -> PipelineResult<()> {
        let trained = self.config.transform.tone_curve;
        let requested = config.transform.tone_curve;
        if trained != requested {
            return Err(PipelineError::config(
                "transform.tone_curve",
                format!("{requested:?}"),
                format!("checkpoint was trained with {trained:?}"),
            )
            .with_recovery_suggestion("drop --tone-curve or retrain with the requested curve"));
        }
        Ok(())
    }
}

/// Where checkpoints are written to and read from.
pub trait CheckpointStore: Send + Sync {
    fn save(&self, checkpoint: &Checkpoint, name: &str) -> PipelineResult<PathBuf>;

    fn load(&self, path: &Path) -> PipelineResult<Checkpoint>;
}

/// JSON files under one directory.
#[derive(Debug, Clone)]
pub struct JsonCheckpointStore {
    dir: PathBuf,
}

impl JsonCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn save(&self, checkpoint: &Checkpoint, name: &str) -> PipelineResult<PathBuf> {
        let path = self.dir.join(name);
        std::fs::create_dir_all(&self.dir).map_err(|e| PipelineError::checkpoint_with_source("save", &self.dir, e))?;

        let tmp = NamedTempFile::new_in(&self.dir).map_err(|e| PipelineError::checkpoint_with_source("save", &path, e))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer(&mut writer, checkpoint)
                .map_err(|e| PipelineError::checkpoint_with_source("serialize", &path, e))?;
            writer.flush().map_err(|e| PipelineError::checkpoint_with_source("save", &path, e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| PipelineError::checkpoint_with_source("save", &path, e))?;
        tmp.persist(&path)
            .map_err(|e| PipelineError::checkpoint_with_source("save", &path, e.error))?;
        info!("💾 checkpoint step {} -> {}", checkpoint.step, path.display());
        Ok(path)
    }

    fn load(&self, path: &Path) -> PipelineResult<Checkpoint> {
        load_checkpoint(path)
    }
}

/// Read and version-check a checkpoint file.
pub fn load_checkpoint(path: &Path) -> PipelineResult<Checkpoint> {
    let file = File::open(path).map_err(|e| PipelineError::checkpoint_with_source("load", path, e))?;
    let checkpoint: Checkpoint = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| PipelineError::checkpoint_with_source("parse", path, e))?;
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(PipelineError::checkpoint(
            "load",
            path,
            format!("format version {} is not supported (expected {CHECKPOINT_VERSION})", checkpoint.version),
        ));
    }
    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tone_blur::tone::ToneCurve;

    fn checkpoint() -> Checkpoint {
        Checkpoint {
            version: CHECKPOINT_VERSION,
            step: 42,
            epoch: 3,
            predictor: vec![0.1, -2.5e-7, 3.25],
            detector: Some(vec![0.5, 0.75]),
            predictor_optimizer: Some(AdamState { m: vec![0.0; 3], v: vec![1e-9; 3], t: 42 }),
            detector_optimizer: None,
            config: PipelineConfig::default(),
        }
    }

    #[test]
    fn test_save_then_load_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonCheckpointStore::new(dir.path().join("nested"));
        let path = store.save(&checkpoint(), "last.json").unwrap();
        assert!(path.ends_with("last.json"));
        assert_eq!(store.load(&path).unwrap(), checkpoint());
    }

    #[test]
    fn test_missing_file_is_checkpoint_error() {
        let err = load_checkpoint(Path::new("/no/such/ckpt.json")).unwrap_err();
        assert_eq!(err.category(), "checkpoint_io");
    }

    #[test]
    fn test_corrupt_and_foreign_versions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "{\"version\": 1, \"step\": ").unwrap();
        assert_eq!(load_checkpoint(&garbage).unwrap_err().category(), "checkpoint_io");

        let mut future = checkpoint();
        future.version = 99;
        let path = JsonCheckpointStore::new(dir.path()).save(&future, "future.json").unwrap();
        assert_eq!(load_checkpoint(&path).unwrap_err().category(), "checkpoint_io");
    }

    #[test]
    fn test_different_tone_curve_is_incompatible() {
        let ckpt = checkpoint();
        ckpt.check_compatible(&PipelineConfig::default()).unwrap();

        let mut config = PipelineConfig::default();
        config.transform.tone_curve = match ckpt.config.transform.tone_curve {
            ToneCurve::Gamma => ToneCurve::Reinhard,
            _ => ToneCurve::Gamma,
        };
        let err = ckpt.check_compatible(&config).unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert!(err.to_string().contains("tone_curve"));
    }

    #[test]
    fn test_unwritable_directory_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let store = JsonCheckpointStore::new(blocker.join("sub"));
        assert_eq!(store.save(&checkpoint(), "last.json").unwrap_err().category(), "checkpoint_io");
    }
}
