//! Image datasets and the shuffling batch loader.
//!
//! [`ImageFolderDataset`] reads a YOLO-style tree:
//!
//! ```text
//! root/images/**/name.jpg     root/labels/**/name.txt
//! ```
//!
//! or a flat directory with `name.txt` beside `name.jpg`. Each label line is
//! `class cx cy w h` normalized to the source image. Images are letterboxed
//! onto a square canvas with YOLO gray and the boxes are mapped onto it.
//! Grayscale files stay single-channel so the predictor can reject them.

use std::path::{Path, PathBuf};

use fast_image_resize::Resizer;
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use tone_blur::cpu::letterbox_rgb;
use tone_blur::layout::interleaved_to_planar;
use tone_blur::presets::{build_plan, Size, LETTERBOX_GRAY};

use crate::core::tensor::Image;
use crate::detector::BoxAnnotation;
use crate::error::{PipelineError, PipelineResult};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp", "tif", "tiff"];

/// One image with its annotations.
#[derive(Debug, Clone)]
pub struct Sample {
    pub id: String,
    pub image: Image,
    pub targets: Vec<BoxAnnotation>,
}

/// Random-access source of samples.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load sample `index`. Errors for one sample are recoverable.
    fn get(&self, index: usize) -> PipelineResult<Sample>;
}

/// Samples already in memory, mostly for tests and synthetic runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDataset {
    samples: Vec<Sample>,
}

impl InMemoryDataset {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }
}

impl Dataset for InMemoryDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> PipelineResult<Sample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| PipelineError::dataset(format!("memory[{index}]"), "index out of range"))
    }
}

#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    root: PathBuf,
    images: Vec<PathBuf>,
    /// Root of the `images/` tree when the YOLO layout is used
    images_dir: Option<PathBuf>,
    image_size: u32,
}

impl ImageFolderDataset {
    /// Index a dataset root, an `images/` tree, or a single image file.
    ///
    /// A missing root or one without images is fatal.
    pub fn open(root: &Path, image_size: u32) -> PipelineResult<Self> {
        let display = root.display().to_string();
        if !root.exists() {
            return Err(PipelineError::dataset_fatal(display, "path does not exist"));
        }
        if root.is_file() {
            return Ok(Self {
                root: root.to_path_buf(),
                images: vec![root.to_path_buf()],
                images_dir: None,
                image_size,
            });
        }

        let yolo = root.join("images");
        let images_dir = yolo.is_dir().then_some(yolo);
        let scan_root = images_dir.as_deref().unwrap_or(root);
        let mut images = Vec::new();
        collect_images(scan_root, &mut images).map_err(|e| PipelineError::io("scan dataset", Some(scan_root), e))?;
        images.sort();
        if images.is_empty() {
            return Err(PipelineError::dataset_fatal(display, "no images found")
                .with_recovery_suggestion("point --data at a directory with images/ and labels/"));
        }
        debug!("indexed {} images under {}", images.len(), scan_root.display());
        Ok(Self { root: root.to_path_buf(), images, images_dir, image_size })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_paths(&self) -> &[PathBuf] {
        &self.images
    }

    /// Label file for an image path.
    pub fn label_path(&self, image: &Path) -> PathBuf {
        if let Some(images_dir) = &self.images_dir {
            if let Ok(relative) = image.strip_prefix(images_dir) {
                return self.root.join("labels").join(relative).with_extension("txt");
            }
        }
        image.with_extension("txt")
    }

    fn load(&self, path: &Path) -> PipelineResult<Sample> {
        let display = path.display().to_string();
        let decoded = image::open(path).map_err(|e| PipelineError::dataset(&display, format!("cannot decode: {e}")))?;
        let color = decoded.color().has_color();
        let src = Size { w: decoded.width(), h: decoded.height() };
        let plan = build_plan(src, self.image_size, LETTERBOX_GRAY);

        let rgb = decoded.to_rgb8();
        let mut resizer = Resizer::new();
        let canvas = letterbox_rgb(&mut resizer, rgb.as_raw(), src, &plan)
            .map_err(|e| PipelineError::dataset(&display, format!("letterbox failed: {e}")))?;
        let side = self.image_size as usize;
        let planar = interleaved_to_planar(&canvas, side, side, 3)
            .map_err(|e| PipelineError::dataset(&display, e.to_string()))?;
        let image = if color {
            planar
        } else {
            planar.slice(ndarray::s![0..1, .., ..]).to_owned()
        };

        let targets = self
            .read_labels(&self.label_path(path))?
            .into_iter()
            .map(|b| {
                let (cx, cy, w, h) = plan.map_box(b.cx, b.cy, b.w, b.h);
                BoxAnnotation { class: b.class, cx, cy, w, h }
            })
            .collect();

        let id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or(display);
        Ok(Sample { id, image, targets })
    }

    fn read_labels(&self, path: &Path) -> PipelineResult<Vec<BoxAnnotation>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::dataset(path.display().to_string(), format!("cannot read labels: {e}")))?;
        let mut boxes = Vec::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match BoxAnnotation::parse_yolo_line(line) {
                Some(b) => boxes.push(b),
                None => warn!("⚠️  {}:{}: ignoring malformed label line", path.display(), n + 1),
            }
        }
        Ok(boxes)
    }
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        {
            out.push(path);
        }
    }
    Ok(())
}

impl Dataset for ImageFolderDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> PipelineResult<Sample> {
        let path = self
            .images
            .get(index)
            .ok_or_else(|| PipelineError::dataset(self.root.display().to_string(), format!("index {index} out of range")))?;
        self.load(path)
    }
}

/// Samples of one batch plus the count that failed to load.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub samples: Vec<Sample>,
    pub failed: usize,
}

/// Lazy, restartable batches over a dataset.
///
/// Order is reshuffled with a seed derived from the epoch, so a run resumed
/// at a given epoch sees the same order. The call that exhausts an epoch
/// returns `None` and prepares the next one.
pub struct BatchLoader<D> {
    dataset: D,
    batch_size: usize,
    seed: u64,
    epoch: u32,
    order: Vec<usize>,
    cursor: usize,
}

impl<D: Dataset> BatchLoader<D> {
    pub fn new(dataset: D, batch_size: usize, seed: u64) -> Self {
        let mut loader = Self {
            dataset,
            batch_size: batch_size.max(1),
            seed,
            epoch: 0,
            order: Vec::new(),
            cursor: 0,
        };
        loader.reset_order();
        loader
    }

    fn reset_order(&mut self) {
        self.order = (0..self.dataset.len()).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch as u64));
        self.order.shuffle(&mut rng);
        self.cursor = 0;
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Jump to the start of `epoch`.
    pub fn set_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
        self.reset_order();
    }

    /// Next batch of the current epoch, or `None` at the epoch boundary.
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            self.epoch += 1;
            self.reset_order();
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let dataset = &self.dataset;
        let loaded: Vec<PipelineResult<Sample>> = indices.par_iter().map(|&i| dataset.get(i)).collect();
        let mut batch = Batch::default();
        for result in loaded {
            match result {
                Ok(sample) => batch.samples.push(sample),
                Err(e) => {
                    warn!("⚠️  skipping sample: {e}");
                    batch.failed += 1;
                }
            }
        }
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use ndarray::Array3;

    fn sample(id: usize) -> Sample {
        Sample { id: format!("s{id}"), image: Array3::from_elem((3, 8, 8), id as f32 / 10.0), targets: vec![] }
    }

    #[test]
    fn test_loader_covers_each_sample_once_per_epoch() {
        let data = InMemoryDataset::new((0..7).map(sample).collect());
        let mut loader = BatchLoader::new(data, 3, 11);
        assert_eq!(loader.batches_per_epoch(), 3);

        let mut first = Vec::new();
        while let Some(batch) = loader.next_batch() {
            first.extend(batch.samples.into_iter().map(|s| s.id));
        }
        assert_eq!(loader.epoch(), 1);
        let mut sorted = first.clone();
        sorted.sort();
        assert_eq!(sorted, (0..7).map(|i| format!("s{i}")).collect::<Vec<_>>());

        let mut second = Vec::new();
        while let Some(batch) = loader.next_batch() {
            second.extend(batch.samples.into_iter().map(|s| s.id));
        }
        assert_eq!(second.len(), 7);
    }

    #[test]
    fn test_order_is_reproducible() {
        let ids = |seed| {
            let mut loader = BatchLoader::new(InMemoryDataset::new((0..10).map(sample).collect()), 10, seed);
            loader.next_batch().unwrap().samples.into_iter().map(|s| s.id).collect::<Vec<_>>()
        };
        assert_eq!(ids(3), ids(3));
    }

    #[test]
    fn test_image_folder_letterboxes_and_maps_labels() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::create_dir_all(dir.path().join("labels")).unwrap();
        RgbImage::from_pixel(64, 32, Rgb([200, 10, 10]))
            .save(dir.path().join("images/wide.png"))
            .unwrap();
        std::fs::write(dir.path().join("labels/wide.txt"), "3 0.5 0.5 0.5 1.0\nnot a box\n").unwrap();
        GrayImage::from_pixel(16, 16, Luma([90]))
            .save(dir.path().join("images/gray.png"))
            .unwrap();

        let ds = ImageFolderDataset::open(dir.path(), 32).unwrap();
        assert_eq!(ds.len(), 2);
        let gray = ds.get(0).unwrap();
        assert_eq!(gray.id, "gray");
        assert_eq!(gray.image.dim(), (1, 32, 32));
        assert!(gray.targets.is_empty());

        let wide = ds.get(1).unwrap();
        assert_eq!(wide.image.dim(), (3, 32, 32));
        assert_eq!(wide.targets.len(), 1);
        let b = wide.targets[0];
        assert_eq!(b.class, 3);
        assert!((b.h - 0.5).abs() < 1e-6, "box height maps onto the 16-pixel band: {b:?}");
        // top rows are letterbox padding
        assert!((wide.image[[0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let err = ImageFolderDataset::open(Path::new("/no/such/dataset"), 32).unwrap_err();
        assert_eq!(err.category(), "dataset");
        assert!(!err.context().recoverable);

        let empty = tempfile::tempdir().unwrap();
        assert!(ImageFolderDataset::open(empty.path(), 32).is_err());
    }

    #[test]
    fn test_undecodable_file_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        let ds = ImageFolderDataset::open(dir.path(), 32).unwrap();
        let err = ds.get(0).unwrap_err();
        assert!(err.context().recoverable);

        let mut loader = BatchLoader::new(ds, 4, 0);
        let batch = loader.next_batch().unwrap();
        assert!(batch.samples.is_empty());
        assert_eq!(batch.failed, 1);
    }
}
