use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::Verbosity;
use env_logger::{Builder, Env};
use log::{info, warn};
use tone_blur::tone::ToneCurve;

use tonecast::codec::CodecStrategy;
use tonecast::config::PipelineConfig;
use tonecast::detector::{DetectionBackbone, EdgeEnergyDetector};
use tonecast::error::{classify, HasRecoverySuggestion, PipelineError, PipelineResult};
use tonecast::inference::{validate, EdgeEncoder, ServerDecoder};
use tonecast::processing::ParameterPredictor;
use tonecast::training::{
    load_checkpoint, BatchLoader, Checkpoint, Dataset, ImageFolderDataset, JsonCheckpointStore, Trainer,
};

/// Learn per-image tone and blur parameters that make JPEG frames cheaper
/// without hurting detection.
#[derive(Parser, Debug)]
#[command(name = "tonecast", version)]
#[command(about = "📉 Codec-aware tone and blur preprocessing for edge detection")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// JSON config file; for val/infer the checkpoint's config is used when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// cpu, or cpu:N for a pool of N worker threads
    #[arg(long, global = true, default_value = "cpu")]
    device: String,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv for info/debug/trace)
    #[command(flatten)]
    verbosity: Verbosity,
}

/// Values that override the config file.
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Square input side, multiple of 8
    #[arg(long)]
    image_size: Option<usize>,

    /// JPEG quality factor 1-100
    #[arg(long)]
    quality: Option<u8>,

    #[arg(long, value_enum)]
    codec: Option<CodecStrategy>,

    #[arg(long, value_enum)]
    tone_curve: Option<ToneCurve>,

    /// Weight on the rate term
    #[arg(long)]
    lambda: Option<f32>,
}

impl Overrides {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(size) = self.image_size {
            config.image_size = size;
        }
        if let Some(quality) = self.quality {
            config.codec.quality = quality;
        }
        if let Some(strategy) = self.codec {
            config.codec.strategy = strategy;
        }
        if let Some(curve) = self.tone_curve {
            config.transform.tone_curve = curve;
        }
        if let Some(lambda) = self.lambda {
            config.objective.lambda = lambda;
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the parameter predictor end to end
    Train(TrainArgs),
    /// Encode, decode and score a labelled dataset with trained weights
    Val(ValArgs),
    /// Encode images and report detections, optionally writing packets
    Infer(InferArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Dataset root with images/ and labels/
    #[arg(long)]
    data: PathBuf,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    epochs: Option<u32>,

    /// Start from these predictor weights
    #[arg(long, conflicts_with = "resume")]
    weights: Option<PathBuf>,

    /// Continue a run from its checkpoint, including step and optimizer state
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Directory for checkpoints
    #[arg(long)]
    output: Option<PathBuf>,

    /// Also train the detector thresholds
    #[arg(long)]
    fine_tune_detector: bool,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Debug)]
struct ValArgs {
    #[arg(long)]
    data: PathBuf,

    /// Checkpoint with trained weights
    #[arg(long)]
    weights: PathBuf,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Debug)]
struct InferArgs {
    /// Image file or directory
    #[arg(long)]
    source: PathBuf,

    #[arg(long)]
    weights: PathBuf,

    /// Write one JSON packet per image here
    #[arg(long)]
    packets: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

/// Map clap-verbosity levels one step up so the default shows warnings.
fn log_level(verbosity: &Verbosity) -> log::LevelFilter {
    if verbosity.is_silent() {
        return log::LevelFilter::Error;
    }
    match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug | log::LevelFilter::Trace => log::LevelFilter::Trace,
    }
}

fn init_logging(verbosity: &Verbosity) {
    // RUST_LOG wins only when no -v/-q was given
    let use_env = !verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();
    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(log_level(verbosity));
        b
    };
    logger
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .init();
}

/// `cpu` keeps rayon's default pool; `cpu:N` builds one with N threads.
fn parse_device(device: &str) -> PipelineResult<Option<usize>> {
    match device.split_once(':') {
        None if device == "cpu" => Ok(None),
        Some(("cpu", n)) => match n.parse::<usize>() {
            Ok(threads) if threads > 0 => Ok(Some(threads)),
            _ => Err(PipelineError::config("device", device, "thread count must be a positive integer")),
        },
        _ => Err(PipelineError::config("device", device, "expected 'cpu' or 'cpu:N'")),
    }
}

fn configure_device(device: &str) -> PipelineResult<()> {
    if let Some(threads) = parse_device(device)? {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .map_err(|e| PipelineError::config("device", device, e.to_string()))?;
        info!("using {threads} worker threads");
    }
    Ok(())
}

fn load_config(path: Option<&Path>, fallback: Option<&Checkpoint>) -> PipelineResult<PipelineConfig> {
    match (path, fallback) {
        (Some(path), _) => PipelineConfig::from_json_file(path),
        (None, Some(checkpoint)) => Ok(checkpoint.config.clone()),
        (None, None) => Ok(PipelineConfig::default()),
    }
}

/// Predictor and detector restored from a checkpoint under `config`.
fn restore_models(config: &PipelineConfig, checkpoint: &Checkpoint) -> PipelineResult<(EdgeEncoder, ServerDecoder)> {
    let mut predictor = ParameterPredictor::new(config)?;
    predictor.load_weights(checkpoint.predictor.clone())?;

    let mut detector = EdgeEnergyDetector::new(&config.detector);
    if let Some(weights) = &checkpoint.detector {
        let dst = detector.weights_mut();
        if dst.len() != weights.len() {
            return Err(PipelineError::config(
                "detector.num_classes",
                config.detector.num_classes,
                format!("checkpoint holds {} detector weights", weights.len()),
            ));
        }
        dst.copy_from_slice(weights);
    }
    Ok((EdgeEncoder::new(predictor, config), ServerDecoder::new(Box::new(detector))))
}

fn train(global: &GlobalArgs, args: &TrainArgs) -> PipelineResult<()> {
    let resume = args.resume.as_deref().map(load_checkpoint).transpose()?;
    let mut config = load_config(global.config.as_deref(), resume.as_ref())?;
    args.overrides.apply(&mut config);
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }
    if let Some(output) = &args.output {
        config.training.checkpoint_dir = output.clone();
    }
    if args.fine_tune_detector {
        config.training.fine_tune_detector = true;
    }
    config.validate()?;

    let dataset = ImageFolderDataset::open(&args.data, config.image_size as u32)?;
    let predictor = ParameterPredictor::new(&config)?;
    let detector = Box::new(EdgeEnergyDetector::new(&config.detector));
    let store = Box::new(JsonCheckpointStore::new(&config.training.checkpoint_dir));
    let mut trainer = Trainer::new(config.clone(), predictor, detector, store)?;
    if let Some(checkpoint) = &resume {
        trainer.restore(checkpoint, true)?;
    } else if let Some(path) = &args.weights {
        trainer.restore(&load_checkpoint(path)?, false)?;
    }

    let mut loader = BatchLoader::new(dataset, config.training.batch_size, config.training.seed);
    let summary = trainer.run(&mut loader)?;
    println!(
        "trained {} epochs, {} steps ({} skipped) -> {}",
        summary.epochs,
        summary.steps,
        summary.skipped_steps,
        summary.checkpoint.display()
    );
    if let Some(metrics) = summary.last_metrics {
        println!("{metrics}");
    }
    Ok(())
}

fn val(global: &GlobalArgs, args: &ValArgs) -> PipelineResult<()> {
    let checkpoint = load_checkpoint(&args.weights)?;
    let mut config = load_config(global.config.as_deref(), Some(&checkpoint))?;
    args.overrides.apply(&mut config);
    checkpoint.check_compatible(&config)?;
    config.validate()?;

    let dataset = ImageFolderDataset::open(&args.data, config.image_size as u32)?;
    let (encoder, decoder) = restore_models(&config, &checkpoint)?;
    info!("🔍 validating {} images at q{}", dataset.len(), config.codec.quality);
    let report = validate(&encoder, &decoder, &dataset, config.detector.iou_threshold)?;
    println!(
        "{} | skipped={} bits={:.0} bpp={:.4} det={:.5}",
        report.metrics, report.skipped, report.mean_bits, report.bpp, report.detection_loss
    );
    Ok(())
}

fn infer(global: &GlobalArgs, args: &InferArgs) -> PipelineResult<()> {
    let checkpoint = load_checkpoint(&args.weights)?;
    let mut config = load_config(global.config.as_deref(), Some(&checkpoint))?;
    args.overrides.apply(&mut config);
    checkpoint.check_compatible(&config)?;
    config.validate()?;

    let dataset = ImageFolderDataset::open(&args.source, config.image_size as u32)?;
    let (encoder, decoder) = restore_models(&config, &checkpoint)?;
    for index in 0..dataset.len() {
        let frame = match dataset.get(index).and_then(|s| encoder.encode(&s.id, s.image.view())) {
            Ok(frame) => frame,
            Err(e) if e.context().recoverable => {
                warn!("⚠️  skipping image: {e}");
                continue;
            }
            Err(e) => return Err(e),
        };
        let (_, detections) = decoder.decode(&frame)?;
        println!("{}: {} bytes, {} detections", frame.id, frame.bitstream.len(), detections.len());
        for d in &detections {
            println!(
                "  class {} score {:.3} box [{:.3}, {:.3}, {:.3}, {:.3}]",
                d.bbox.class, d.score, d.bbox.cx, d.bbox.cy, d.bbox.w, d.bbox.h
            );
        }
        if let Some(dir) = &args.packets {
            let path = frame.write_packet(dir)?;
            info!("packet -> {}", path.display());
        }
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    configure_device(&cli.global.device)?;
    match &cli.command {
        Command::Train(args) => train(&cli.global, args)?,
        Command::Val(args) => val(&cli.global, args)?,
        Command::Infer(args) => infer(&cli.global, args)?,
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.global.verbosity);

    if let Err(err) = run(&cli) {
        match err.downcast_ref::<PipelineError>() {
            Some(e) => {
                eprintln!("error [{}]: {e}", classify::category(e));
                if let Some(hint) = e.recovery_suggestion() {
                    eprintln!("  hint: {hint}");
                }
                std::process::exit(classify::exit_code(e));
            }
            None => {
                eprintln!("error: {err:#}");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device() {
        assert_eq!(parse_device("cpu").unwrap(), None);
        assert_eq!(parse_device("cpu:4").unwrap(), Some(4));
        assert_eq!(parse_device("cpu:0").unwrap_err().category(), "configuration");
        assert_eq!(parse_device("cuda:0").unwrap_err().category(), "configuration");
        assert_eq!(parse_device("gpu").unwrap_err().category(), "configuration");
    }

    #[test]
    fn test_cli_parses_train_overrides() {
        let cli = Cli::parse_from([
            "tonecast", "train", "--data", "coco8", "--epochs", "3", "--lambda", "0.5", "--codec", "jpeg", "-v",
        ]);
        let Command::Train(args) = &cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.epochs, Some(3));
        let mut config = PipelineConfig::default();
        args.overrides.apply(&mut config);
        assert_eq!(config.objective.lambda, 0.5);
        assert_eq!(config.codec.strategy, CodecStrategy::Jpeg);
        assert_eq!(log_level(&cli.global.verbosity), log::LevelFilter::Info);
    }

    #[test]
    fn test_weights_and_resume_conflict() {
        let parsed = Cli::try_parse_from([
            "tonecast", "train", "--data", "d", "--weights", "a.json", "--resume", "b.json",
        ]);
        assert!(parsed.is_err());
    }
}
