//! Deployed pipeline: weights trained here, frames encoded at the edge and
//! decoded on the server, plus the `tonecast` binary's commands and exit codes.

mod common;

use std::process::Command;

use common::fixtures::{small_config, trainer, write_image_folder};
use tonecast::detector::{DetectionBackbone, EdgeEnergyDetector};
use tonecast::inference::{validate, EdgeEncoder, EncodedFrame, ServerDecoder};
use tonecast::processing::ParameterPredictor;
use tonecast::training::{load_checkpoint, BatchLoader, Dataset, ImageFolderDataset};

fn tonecast() -> Command {
    Command::new(env!("CARGO_BIN_EXE_tonecast"))
}

#[test]
fn test_trained_weights_drive_the_deployed_split() {
    let data = tempfile::tempdir().unwrap();
    write_image_folder(data.path(), 3, 32, 32);
    let runs = tempfile::tempdir().unwrap();
    let config = small_config(16, runs.path());

    let summary = trainer(&config)
        .run(&mut BatchLoader::new(ImageFolderDataset::open(data.path(), 16).unwrap(), 2, 0))
        .unwrap();
    let ckpt = load_checkpoint(&summary.checkpoint).unwrap();

    let mut predictor = ParameterPredictor::new(&ckpt.config).unwrap();
    predictor.load_weights(ckpt.predictor.clone()).unwrap();
    let encoder = EdgeEncoder::new(predictor, &ckpt.config);
    let decoder = ServerDecoder::new(Box::new(EdgeEnergyDetector::new(&ckpt.config.detector)));

    let dataset = ImageFolderDataset::open(data.path(), 16).unwrap();
    let sample = dataset.get(0).unwrap();
    let frame = encoder.encode(&sample.id, sample.image.view()).unwrap();
    assert_eq!(frame.params, encoder.predictor().predict(sample.image.view()).unwrap());

    let packets = tempfile::tempdir().unwrap();
    let path = frame.write_packet(packets.path()).unwrap();
    let received = EncodedFrame::read_packet(&path).unwrap();
    let (image, _) = decoder.decode(&received).unwrap();
    assert_eq!(image.dim(), (3, 16, 16));
    assert_eq!(decoder.detector().name(), "edge-energy");

    let report = validate(&encoder, &decoder, &dataset, 0.5).unwrap();
    assert_eq!(report.images, 3);
    assert_eq!(report.skipped, 0);
    assert!(report.bpp > 0.0);
    assert_eq!(report.metrics.counts().true_positives + report.metrics.counts().false_negatives, 3);
}

#[test]
fn test_cli_train_val_infer() {
    let data = tempfile::tempdir().unwrap();
    write_image_folder(data.path(), 2, 24, 24);
    let runs = tempfile::tempdir().unwrap();
    let packets = tempfile::tempdir().unwrap();
    let weights = runs.path().join("last.json");

    let status = tonecast()
        .args(["train", "--image-size", "16", "--epochs", "1", "--batch-size", "2", "--device", "cpu:2", "-q"])
        .arg("--data")
        .arg(data.path())
        .arg("--output")
        .arg(runs.path())
        .status()
        .unwrap();
    assert!(status.success());
    assert!(weights.exists());

    let status = tonecast()
        .args(["val", "-q"])
        .arg("--data")
        .arg(data.path())
        .arg("--weights")
        .arg(&weights)
        .status()
        .unwrap();
    assert!(status.success());

    let output = tonecast()
        .args(["val", "-q", "--tone-curve", "gamma"])
        .arg("--data")
        .arg(data.path())
        .arg("--weights")
        .arg(&weights)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("tone_curve"));

    let output = tonecast()
        .args(["infer", "-q"])
        .arg("--source")
        .arg(data.path().join("images").join("img_0.png"))
        .arg("--weights")
        .arg(&weights)
        .arg("--packets")
        .arg(packets.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).starts_with("img_0:"));
    assert!(packets.path().join("img_0.json").exists());
}

#[test]
fn test_cli_exit_codes_follow_error_category() {
    let output = tonecast()
        .args(["--device", "gpu:0", "train", "--data", "."])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("configuration"));

    let output = tonecast()
        .args(["train", "--data", "/no/such/dataset", "-q"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("dataset"));

    let output = tonecast()
        .args(["val", "--data", ".", "--weights", "/no/such/last.json", "-q"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
}
