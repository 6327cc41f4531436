//! Transform and codec properties across module boundaries: identity,
//! rate monotonicity in blur, gradient agreement through the whole chain,
//! and real JPEG behaviour.

mod common;

use common::assertions::{assert_close, assert_images_close};
use common::test_frames::{checkerboard, gradient, gray, noise};
use ndarray::{Array2, Array3, ArrayView3, Axis};
use tonecast::codec::{build_surrogate, jpeg, CodecStrategy, DctEntropyProxy, Reconstruction};
use tonecast::config::{CodecConfig, PipelineConfig, PredictorConfig, TransformConfig};
use tonecast::objective::{ObjectiveConfig, RateAccuracyObjective};
use tonecast::processing::{ParameterPredictor, ToneBlurTransform};
use tonecast::CodecSurrogate;
use tone_blur::tone::ToneCurve;

const QUALITY: u8 = 80;

fn config(curve: ToneCurve, tone_min: f32) -> PipelineConfig {
    PipelineConfig {
        image_size: 16,
        predictor: PredictorConfig { grid: 2, hidden: 8, seed: 5 },
        transform: TransformConfig { tone_curve: curve, tone_min, ..TransformConfig::default() },
        ..PipelineConfig::default()
    }
}

fn identity_params(curve: ToneCurve, channels: usize, sigma: f32) -> Vec<f32> {
    let mut params = curve.identity_params(channels);
    params.push(sigma);
    params
}

fn inner(a: ArrayView3<f32>, b: ArrayView3<f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| *x as f64 * *y as f64).sum::<f64>() as f32
}

fn upstream(dim: (usize, usize, usize)) -> Array3<f32> {
    Array3::from_shape_fn(dim, |(c, y, x)| ((c + 2 * y + 3 * x) % 7) as f32 / 7.0 - 0.4)
}

/// Detection term is a fixed linear functional of the reconstruction.
struct Chain {
    transform: ToneBlurTransform,
    codec: DctEntropyProxy,
    objective: RateAccuracyObjective,
    upstream: Array3<f32>,
}

impl Chain {
    fn new(config: &PipelineConfig, lambda: f32) -> Self {
        let [c, h, w] = config.input_shape();
        Self {
            transform: ToneBlurTransform::new(config),
            codec: DctEntropyProxy::new(&CodecConfig { reconstruction: Reconstruction::Identity, ..config.codec.clone() }),
            objective: RateAccuracyObjective::new(ObjectiveConfig { lambda, ..ObjectiveConfig::default() }).unwrap(),
            upstream: upstream((c, h, w)),
        }
    }

    fn pixels(&self) -> usize {
        self.upstream.len()
    }

    fn loss(&self, image: ArrayView3<f32>, params: &[f32]) -> f32 {
        let out = self.transform.apply(image, params);
        let pass = self.codec.forward(out.view(), QUALITY, false).unwrap();
        let det = inner(self.upstream.view(), pass.reconstruction.view());
        self.objective.evaluate(det, &[pass.bits], self.pixels(), 0).total
    }

    /// `dL/d(params)` for a single-image batch.
    fn param_grads(&self, image: ArrayView3<f32>, params: &Array2<f32>) -> Array2<f32> {
        let tp = self.transform.forward(image.insert_axis(Axis(0)), params.view(), true);
        let out = tp.output.index_axis(Axis(0), 0);
        let cp = self.codec.forward(out, QUALITY, true).unwrap();
        let det = inner(self.upstream.view(), cp.reconstruction.view());
        let terms = self.objective.evaluate(det, &[cp.bits], self.pixels(), 0);
        let grad = cp.backward(self.upstream.view(), terms.grad_bits[0]);
        self.transform.backward(&tp, grad.view().insert_axis(Axis(0)))
    }
}

#[test]
fn test_identity_transform_returns_input() {
    for (curve, lo) in [(ToneCurve::Reinhard, 0.0), (ToneCurve::Gamma, 0.5), (ToneCurve::ChannelGamma, 0.5)] {
        let t = ToneBlurTransform::new(&config(curve, lo));
        let image = noise(3, 16, 9);
        let out = t.apply(image.view(), &identity_params(curve, 3, 0.0));
        assert_eq!(out, image, "{curve:?}");
    }
}

#[test]
fn test_more_blur_never_costs_more_bits() {
    let cfg = config(ToneCurve::Reinhard, 0.0);
    let t = ToneBlurTransform::new(&cfg);
    let proxy = build_surrogate(&cfg.codec);
    for image in [noise(3, 32, 1), checkerboard(3, 32, 1, 0.1, 0.9)] {
        let mut last = f32::INFINITY;
        for sigma in [0.0, 0.5, 1.0, 1.5, 2.0] {
            let out = t.apply(image.view(), &identity_params(ToneCurve::Reinhard, 3, sigma));
            let bits = proxy.forward(out.view(), QUALITY, false).unwrap().bits;
            assert!(bits <= last, "sigma {sigma}: {bits} > {last}");
            last = bits;
        }
    }

    let jpeg = build_surrogate(&CodecConfig { strategy: CodecStrategy::Jpeg, ..cfg.codec.clone() });
    let sharp = noise(3, 32, 2);
    let blurred = t.apply(sharp.view(), &identity_params(ToneCurve::Reinhard, 3, 2.0));
    let sharp_bits = jpeg.forward(sharp.view(), QUALITY, false).unwrap().bits;
    let blurred_bits = jpeg.forward(blurred.view(), QUALITY, false).unwrap().bits;
    assert!(blurred_bits < sharp_bits);
}

#[test]
fn test_chain_gradient_matches_finite_difference() {
    for (curve, lo, params) in [
        (ToneCurve::Reinhard, 0.0, vec![0.6f32, 0.85]),
        (ToneCurve::ChannelGamma, 0.5, vec![0.8, 1.1, 1.3, 0.85]),
    ] {
        let cfg = config(curve, lo);
        let chain = Chain::new(&cfg, 1.0);
        let image = gradient(3, 16);
        let prow = Array2::from_shape_vec((1, params.len()), params.clone()).unwrap();
        let grads = chain.param_grads(image.view(), &prow);

        let h = 1e-3f32;
        for j in 0..params.len() {
            let mut up = params.clone();
            up[j] += h;
            let mut down = params.clone();
            down[j] -= h;
            let fd = (chain.loss(image.view(), &up) - chain.loss(image.view(), &down)) / (2.0 * h);
            assert_close(grads[[0, j]], fd, 0.05, 2e-2, &format!("{curve:?} param {j}"));
        }
    }
}

#[test]
fn test_predictor_gradient_through_chain() {
    let cfg = config(ToneCurve::Reinhard, 0.0);
    let chain = Chain::new(&cfg, 1.0);
    let mut predictor = ParameterPredictor::new(&cfg).unwrap();
    let image = gradient(3, 16);
    let batch = image.view().insert_axis(Axis(0));

    let pass = predictor.forward(batch).unwrap();
    let grad_params = chain.param_grads(image.view(), &pass.params);
    let grads = predictor.backward(&pass, grad_params.view()).unwrap();

    // output-layer biases sit at the end of the flat buffer
    let h = 1e-3f32;
    let p = cfg.param_arity();
    for idx in predictor.num_params() - p..predictor.num_params() {
        let original = predictor.weights()[idx];
        predictor.weights_mut()[idx] = original + h;
        let up = chain.loss(image.view(), &predictor.predict(image.view()).unwrap());
        predictor.weights_mut()[idx] = original - h;
        let down = chain.loss(image.view(), &predictor.predict(image.view()).unwrap());
        predictor.weights_mut()[idx] = original;
        assert_close(grads[idx], (up - down) / (2.0 * h), 0.05, 2e-2, &format!("weight {idx}"));
    }
}

#[test]
fn test_jpeg_quality_100_roundtrip() {
    let image = gradient(3, 32);
    let bitstream = jpeg::encode_jpeg(image.view(), 100).unwrap();
    let back = jpeg::decode_jpeg(&bitstream, 3).unwrap();
    assert_images_close(back.view(), image.view(), 0.05);
}

#[test]
fn test_flat_gray_costs_about_the_header() {
    let cfg = PipelineConfig { image_size: 64, ..PipelineConfig::default() };
    let t = ToneBlurTransform::new(&cfg);
    let flat = gray(3, 64, 0.5);
    let out = t.apply(flat.view(), &identity_params(ToneCurve::Reinhard, 3, 0.0));
    assert_eq!(out, flat);

    let proxy = DctEntropyProxy::new(&cfg.codec);
    let bits = proxy.forward(out.view(), QUALITY, false).unwrap().bits;
    assert_close(bits, proxy.floor_bits(3, 64, 64), 0.0, 16.0, "proxy bits");

    let real = build_surrogate(&CodecConfig { strategy: CodecStrategy::Jpeg, ..cfg.codec.clone() });
    let real_bits = real.forward(out.view(), QUALITY, false).unwrap().bits;
    assert!(real_bits < 8.0 * 1000.0, "flat frame took {real_bits} bits");
}
