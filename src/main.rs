//! 手書き記号認識 CLI
//!
//! - `train`   : サンプルディレクトリから分類器を学習し、モデルアーカイブを書き出す
//! - `predict` : 学習済みモデルで画像を分類する
//! - `collect` : 画像を命名規則に従ってサンプルディレクトリへ保存する

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::backend::{Autodiff, NdArray};
use burn::tensor::backend::{AutodiffBackend, Backend};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use symbol_recognizer_lib::ml::{train_from_directory, EpochMetrics, InferenceEngine};
use symbol_recognizer_lib::model::{AppConfig, DecodePolicy, DeviceType};
use symbol_recognizer_lib::SampleStore;

#[derive(Parser, Debug)]
#[command(name = "symbol_recognizer", version, about = "Hand-drawn math symbol recognizer")]
struct Cli {
    /// Path of the JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a classifier from a directory of labeled samples
    Train(TrainArgs),
    /// Classify one or more images with a trained model
    Predict(PredictArgs),
    /// Store an image as a labeled sample
    Collect(CollectArgs),
}

#[derive(Args, Debug)]
struct TrainArgs {
    /// Directory containing `<label>_<index>.<ext>` samples
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Output model archive (.tar.gz)
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// cpu | wgpu
    #[arg(long)]
    device: Option<DeviceType>,

    /// Abort on the first undecodable sample instead of skipping it
    #[arg(long)]
    strict: bool,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Model archive produced by `train`
    #[arg(long)]
    model: Option<PathBuf>,

    /// cpu | wgpu
    #[arg(long)]
    device: Option<DeviceType>,

    /// Images to classify
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

#[derive(Args, Debug)]
struct CollectArgs {
    /// Raw label text as typed by the user (e.g. `7`, `+`, `x`)
    #[arg(long)]
    label: String,

    /// Image to store
    #[arg(long)]
    image: PathBuf,

    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("symbol_recognizer_lib=info,symbol_recognizer=info")
            }),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_default(&config_path);

    match cli.command {
        Commands::Train(args) => run_train(config, args),
        Commands::Predict(args) => run_predict(&config, args),
        Commands::Collect(args) => run_collect(&config, args),
    }
}

fn run_train(mut config: AppConfig, args: TrainArgs) -> Result<()> {
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(seed) = args.seed {
        config.training.seed = seed;
    }
    if let Some(device) = args.device {
        config.device_type = device;
    }
    if args.strict {
        config.training.decode_policy = DecodePolicy::Abort;
    }

    let data_dir = args.data_dir.unwrap_or_else(|| PathBuf::from(&config.dataset_dir));
    let output = args.output.unwrap_or_else(|| PathBuf::from(&config.model_path));
    tracing::info!(
        device = %config.device_type,
        data_dir = %data_dir.display(),
        "training requested"
    );

    match config.device_type {
        DeviceType::Cpu => train_on::<Autodiff<NdArray>>(
            &config,
            &data_dir,
            &output,
            &burn_ndarray::NdArrayDevice::default(),
        ),
        DeviceType::Wgpu => gpu::train(&config, &data_dir, &output),
    }
}

fn train_on<B: AutodiffBackend>(
    config: &AppConfig,
    data_dir: &Path,
    output: &Path,
    device: &B::Device,
) -> Result<()> {
    let total = config.training.num_epochs;
    let report = train_from_directory::<B, _>(config, data_dir, output, device, |m: &EpochMetrics| {
        println!(
            "Epoch {:>3}/{} | lr={:.6} | train_loss={:.4} | train_acc={:.1}% | \
             val_loss={} | val_acc={}",
            m.epoch,
            total,
            m.learning_rate,
            m.train_loss,
            m.train_accuracy * 100.0,
            m.valid_loss.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".into()),
            m.valid_accuracy
                .map(|v| format!("{:.1}%", v * 100.0))
                .unwrap_or_else(|| "-".into()),
        );
    })
    .with_context(|| format!("training from {} failed", data_dir.display()))?;

    println!(
        "学習完了: {} クラス ({}), {} 件スキップ → {}",
        report.labels.len(),
        report.labels.labels().join(", "),
        report.skipped_samples,
        output.display()
    );
    Ok(())
}

fn run_predict(config: &AppConfig, args: PredictArgs) -> Result<()> {
    let model = args.model.unwrap_or_else(|| PathBuf::from(&config.model_path));

    match args.device.unwrap_or(config.device_type) {
        DeviceType::Cpu => predict_on::<NdArray>(
            &model,
            &args.images,
            &burn_ndarray::NdArrayDevice::default(),
        ),
        DeviceType::Wgpu => gpu::predict(&model, &args.images),
    }
}

#[cfg(feature = "wgpu")]
mod gpu {
    use std::path::{Path, PathBuf};

    use anyhow::Result;
    use burn::backend::{Autodiff, Wgpu};
    use burn_wgpu::WgpuDevice;

    use symbol_recognizer_lib::model::AppConfig;

    pub fn train(config: &AppConfig, data_dir: &Path, output: &Path) -> Result<()> {
        super::train_on::<Autodiff<Wgpu>>(config, data_dir, output, &WgpuDevice::default())
    }

    pub fn predict(model: &Path, images: &[PathBuf]) -> Result<()> {
        super::predict_on::<Wgpu>(model, images, &WgpuDevice::default())
    }
}

#[cfg(not(feature = "wgpu"))]
mod gpu {
    use std::path::{Path, PathBuf};

    use anyhow::{bail, Result};

    use symbol_recognizer_lib::model::AppConfig;

    const UNAVAILABLE: &str =
        "this build does not include the wgpu backend (enable the `wgpu` feature)";

    pub fn train(_config: &AppConfig, _data_dir: &Path, _output: &Path) -> Result<()> {
        bail!(UNAVAILABLE)
    }

    pub fn predict(_model: &Path, _images: &[PathBuf]) -> Result<()> {
        bail!(UNAVAILABLE)
    }
}

fn predict_on<B: Backend>(model: &Path, images: &[PathBuf], device: &B::Device) -> Result<()> {
    let engine = InferenceEngine::<B>::load(model, device)
        .with_context(|| format!("failed to load model {}", model.display()))?;

    let mut failures = 0;
    for path in images {
        let result = image::open(path)
            .map_err(anyhow::Error::from)
            .and_then(|img| engine.predict_detailed(&img).map_err(anyhow::Error::from));

        match result {
            Ok(prediction) => println!(
                "{}: {} ({:.3})",
                path.display(),
                prediction.label,
                prediction.confidence
            ),
            Err(e) => {
                failures += 1;
                eprintln!("{}: error: {e:#}", path.display());
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} image(s) could not be classified", images.len());
    }
    Ok(())
}

fn run_collect(config: &AppConfig, args: CollectArgs) -> Result<()> {
    let data_dir = args.data_dir.unwrap_or_else(|| PathBuf::from(&config.dataset_dir));
    let image = image::open(&args.image)
        .with_context(|| format!("failed to open {}", args.image.display()))?;

    let path = SampleStore::new(&data_dir)
        .save(&args.label, &image)
        .with_context(|| format!("failed to store sample for label {:?}", args.label))?;
    println!("{}", path.display());
    Ok(())
}
