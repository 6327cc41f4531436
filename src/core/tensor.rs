//! Planar image tensors.
//!
//! An [`Image`] is `(channels, height, width)` with values in `[0, 1]`; a batch
//! adds a leading sample axis.

use ndarray::{Array3, Array4, ArrayView3, Axis};

use crate::error::{PipelineError, PipelineResult};

/// Planar `(C, H, W)` image in `[0, 1]`.
pub type Image = Array3<f32>;

/// `(N, C, H, W)` batch of images.
pub type ImageBatch = Array4<f32>;

/// Shape of an image as a vector, for error reports.
pub fn shape_of(image: ArrayView3<f32>) -> Vec<usize> {
    image.shape().to_vec()
}

/// Stack equally shaped images into a batch.
pub fn stack_images<'a, I>(images: I) -> PipelineResult<ImageBatch>
where
    I: IntoIterator<Item = ArrayView3<'a, f32>>,
{
    let views: Vec<ArrayView3<f32>> = images.into_iter().collect();
    let Some(first) = views.first() else {
        return Ok(Array4::zeros((0, 0, 0, 0)));
    };
    let (c, h, w) = first.dim();
    let mut batch = Array4::<f32>::zeros((views.len(), c, h, w));
    for (i, view) in views.iter().enumerate() {
        if view.dim() != (c, h, w) {
            return Err(PipelineError::shape_mismatch(
                format!("batch[{i}]"),
                vec![c, h, w],
                shape_of(*view),
            ));
        }
        batch.index_axis_mut(Axis(0), i).assign(view);
    }
    Ok(batch)
}

/// Largest absolute element-wise difference of two equally shaped images.
pub fn max_abs_diff(a: ArrayView3<f32>, b: ArrayView3<f32>) -> f32 {
    a.iter().zip(b.iter()).fold(0.0f32, |m, (x, y)| m.max((x - y).abs()))
}

/// Mean absolute element-wise difference of two equally shaped images.
pub fn mean_abs_diff(a: ArrayView3<f32>, b: ArrayView3<f32>) -> f32 {
    let n = a.len().max(1) as f32;
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).sum::<f32>() / n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_preserves_order() {
        let a = Array3::<f32>::from_elem((3, 2, 2), 0.25);
        let b = Array3::<f32>::from_elem((3, 2, 2), 0.75);
        let batch = stack_images([a.view(), b.view()]).unwrap();
        assert_eq!(batch.dim(), (2, 3, 2, 2));
        assert_eq!(batch[[0, 1, 1, 1]], 0.25);
        assert_eq!(batch[[1, 0, 0, 0]], 0.75);
    }

    #[test]
    fn test_stack_rejects_mixed_shapes() {
        let a = Array3::<f32>::zeros((3, 2, 2));
        let b = Array3::<f32>::zeros((1, 2, 2));
        let err = stack_images([a.view(), b.view()]).unwrap_err();
        assert_eq!(err.category(), "shape_mismatch");
    }

    #[test]
    fn test_diff_helpers() {
        let a = Array3::<f32>::zeros((1, 1, 4));
        let b = Array3::from_shape_vec((1, 1, 4), vec![0.0, 0.1, 0.2, 0.5]).unwrap();
        assert!((max_abs_diff(a.view(), b.view()) - 0.5).abs() < 1e-6);
        assert!((mean_abs_diff(a.view(), b.view()) - 0.2).abs() < 1e-6);
    }
}
