//! Common test utilities and helpers for the tonecast tests
//!
//! Frame builders, small configurations that train in milliseconds, and a
//! few assertions shared by the integration tests.

#![allow(dead_code)]

use std::path::Path;

use ndarray::{Array3, ArrayView3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tonecast::config::{PipelineConfig, PredictorConfig};
use tonecast::detector::{BoxAnnotation, EdgeEnergyDetector};
use tonecast::processing::ParameterPredictor;
use tonecast::training::{JsonCheckpointStore, Sample, Trainer};

/// Test frame generators
pub mod test_frames {
    use super::*;

    pub fn gray(channels: usize, size: usize, value: f32) -> Array3<f32> {
        Array3::from_elem((channels, size, size), value)
    }

    /// Square checkerboard with `cell`-pixel squares.
    pub fn checkerboard(channels: usize, size: usize, cell: usize, lo: f32, hi: f32) -> Array3<f32> {
        Array3::from_shape_fn((channels, size, size), |(_, y, x)| {
            if (x / cell + y / cell) % 2 == 0 { hi } else { lo }
        })
    }

    /// Smooth diagonal ramp inside `[0.1, 0.9]`, tilted differently per channel.
    pub fn gradient(channels: usize, size: usize) -> Array3<f32> {
        let span = (size - 1) as f32;
        Array3::from_shape_fn((channels, size, size), |(c, y, x)| {
            let a = 1.0 + c as f32;
            0.1 + 0.8 * (x as f32 * a + y as f32 * 2.0) / (span * (a + 2.0))
        })
    }

    /// Uniform noise in `[0, 1]`, reproducible from `seed`.
    pub fn noise(channels: usize, size: usize, seed: u64) -> Array3<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array3::from_shape_fn((channels, size, size), |_| rng.gen_range(0.0..=1.0))
    }
}

/// Configurations and builders
pub mod fixtures {
    use super::*;

    /// A configuration that trains in milliseconds.
    pub fn small_config(image_size: usize, checkpoint_dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig {
            image_size,
            predictor: PredictorConfig { grid: 2, hidden: 8, seed: 1 },
            ..PipelineConfig::default()
        };
        config.detector.num_classes = 2;
        config.training.batch_size = 2;
        config.training.epochs = 1;
        config.training.checkpoint_dir = checkpoint_dir.to_path_buf();
        config
    }

    pub fn centre_box() -> BoxAnnotation {
        BoxAnnotation { class: 0, cx: 0.5, cy: 0.5, w: 0.5, h: 0.5 }
    }

    pub fn sample(id: &str, image: Array3<f32>, targets: Vec<BoxAnnotation>) -> Sample {
        Sample { id: id.to_string(), image, targets }
    }

    /// Trainer with the built-in detector and a JSON store under the
    /// configured checkpoint directory.
    pub fn trainer(config: &PipelineConfig) -> Trainer {
        let predictor = ParameterPredictor::new(config).unwrap();
        let detector = Box::new(EdgeEnergyDetector::new(&config.detector));
        let store = Box::new(JsonCheckpointStore::new(&config.training.checkpoint_dir));
        Trainer::new(config.clone(), predictor, detector, store).unwrap()
    }

    /// Write a YOLO tree with `count` colour images of `width`x`height`,
    /// each with one centred box.
    pub fn write_image_folder(root: &Path, count: usize, width: u32, height: u32) {
        let images = root.join("images");
        let labels = root.join("labels");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::create_dir_all(&labels).unwrap();
        let mut rng = StdRng::seed_from_u64(count as u64);
        for i in 0..count {
            let img = image::RgbImage::from_fn(width, height, |_, _| {
                image::Rgb([rng.r#gen::<u8>(), rng.r#gen::<u8>(), rng.r#gen::<u8>()])
            });
            img.save(images.join(format!("img_{i}.png"))).unwrap();
            std::fs::write(labels.join(format!("img_{i}.txt")), "0 0.5 0.5 0.4 0.4\n").unwrap();
        }
    }
}

/// Custom assertions for numeric results
pub mod assertions {
    use super::*;

    pub fn assert_close(actual: f32, expected: f32, rel: f32, abs: f32, what: &str) {
        let tol = rel * actual.abs().max(expected.abs()) + abs;
        assert!(
            (actual - expected).abs() <= tol,
            "{what}: {actual} vs {expected} (tolerance {tol})"
        );
    }

    pub fn assert_images_close(actual: ArrayView3<f32>, expected: ArrayView3<f32>, tol: f32) {
        assert_eq!(actual.dim(), expected.dim(), "shape differs");
        let worst = actual
            .iter()
            .zip(expected.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(worst <= tol, "max pixel difference {worst} exceeds {tol}");
    }
}
