//! DentView
//!
//! Classifies clinical dental photographs into the nine standard views and
//! keeps the classifier improving from user corrections.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dentview_classifiers::{
    ClassifierConfig, FeatureExtractor, StatisticalClassifier, ViewClassifier,
};
use dentview_core::{ClassificationResult, TrainingReport};
use dentview_training::{CycleOutcome, PhotoClassificationService};
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{info, warn};

mod config;

use config::AppConfig;

/// Names of the 17 feature values, in vector order
const FEATURE_NAMES: [&str; 17] = [
    "mean_r",
    "mean_g",
    "mean_b",
    "std_r",
    "std_g",
    "std_b",
    "gradient_x",
    "gradient_y",
    "gray_std",
    "edge_density",
    "aspect_ratio",
    "brightness_mean",
    "brightness_std",
    "top_brightness",
    "bottom_brightness",
    "left_brightness",
    "right_brightness",
];

#[derive(Parser, Debug)]
#[command(name = "dentview")]
#[command(about = "Dental photo view classification", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "dentview.yaml")]
    config: PathBuf,

    /// Directory holding model files
    #[arg(long, env = "DENTVIEW_MODELS_DIR")]
    models_dir: Option<PathBuf>,

    /// Root of the training sample folders
    #[arg(long, env = "DENTVIEW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Inference device (cpu, cuda, metal)
    #[arg(long)]
    device: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Classify one or more photographs
    Classify {
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the feature vector of a photograph
    Features { path: PathBuf },
    /// Train a classifier from the sample folders and save it
    Train {
        /// Which classifier to train
        #[arg(long, value_enum, default_value_t = Variant::Active)]
        variant: Variant,
    },
    /// Store a labeled photograph for training
    AddSample {
        path: PathBuf,

        #[arg(long)]
        category: String,

        /// The automatic classification was already right
        #[arg(long)]
        correct: bool,
    },
    /// Delete a stored sample by file name
    RemoveSample { name: PathBuf },
    /// Show stored sample counts
    Stats,
    /// Show model and retrainer status
    Status,
    /// Run the background retrainer until interrupted
    Watch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Variant {
    /// Whichever classifier the registry serves
    Active,
    Statistical,
    Deep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_json);

    let config = AppConfig::load(&cli.config, &cli)?;
    info!(
        models_dir = %config.classifiers.models_dir.display(),
        data_dir = %config.training.data_dir.display(),
        "Configuration loaded"
    );

    let service = PhotoClassificationService::from_config(
        config.classifiers.clone(),
        &config.training,
        config.retrainer.clone(),
    );

    match cli.command {
        Command::Classify { paths, json } => {
            let results = service.classify_bulk(&paths);
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for (path, result) in paths.iter().zip(&results) {
                    print_result(path, result);
                }
            }
        }
        Command::Features { path } => {
            let features = FeatureExtractor::new()
                .try_extract_path(&path)
                .with_context(|| format!("extracting features from {}", path.display()))?;
            for (name, value) in FEATURE_NAMES.iter().zip(features.as_slice()) {
                println!("{:<18} {:>10.4}", name, value);
            }
        }
        Command::Train { variant } => {
            let report = train(&service, &config.classifiers, variant)?;
            println!(
                "Trained on {} samples: train accuracy {:.3}, validation accuracy {:.3}",
                report.num_samples, report.train_accuracy, report.val_accuracy
            );
        }
        Command::AddSample {
            path,
            category,
            correct,
        } => {
            let stored = if correct {
                service.confirm_sample(&path, &category)?
            } else {
                service.add_corrected_sample(&path, &category)?
            };
            println!("Stored {}", stored.display());
        }
        Command::RemoveSample { name } => {
            if service.remove_sample(&name)? {
                println!("Removed {}", name.display());
            } else {
                println!("No sample named {}", name.display());
            }
        }
        Command::Stats => {
            let stats = service.training_stats()?;
            for (category, count) in &stats.per_category {
                println!("{:<28} {:>6}", category, count);
            }
            println!("{:<28} {:>6}", dentview_training::OTHER_BUCKET, stats.other);
            println!("{:<28} {:>6}", "total", stats.total);
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&service.get_model_status())?);
        }
        Command::Watch => {
            service.start_background_retraining();
            info!("Watching {} for new samples", config.training.data_dir.display());

            shutdown_signal().await;
            warn!("Shutdown signal received, stopping retrainer...");

            if !service.stop_background_retraining() {
                warn!("Retrainer still busy at exit");
            }
            if let Some(report) = service.retrainer().last_report() {
                info!(
                    train_accuracy = report.train_accuracy,
                    val_accuracy = report.val_accuracy,
                    "Last retrain"
                );
            }
        }
    }

    Ok(())
}

fn train(
    service: &PhotoClassificationService,
    config: &ClassifierConfig,
    variant: Variant,
) -> Result<TrainingReport> {
    let data_dir = service.store().root();
    let classifier: Box<dyn ViewClassifier> = match variant {
        Variant::Active => {
            // Shares the retrainer busy flag and last-report bookkeeping
            return match service.retrain_blocking() {
                CycleOutcome::Retrained(report) => Ok(report),
                CycleOutcome::Busy => bail!("a retrain is already running"),
                CycleOutcome::Failed(error) => bail!("training failed: {}", error),
                CycleOutcome::NotNeeded { total } => {
                    bail!("training skipped with {} samples", total)
                }
            };
        }
        Variant::Statistical => Box::new(StatisticalClassifier::load(config)),
        #[cfg(feature = "ml-models")]
        Variant::Deep => Box::new(load_or_init_deep(config)?),
        #[cfg(not(feature = "ml-models"))]
        Variant::Deep => bail!("built without the ml-models feature"),
    };

    let report = classifier.train(data_dir);
    if let Some(error) = &report.error {
        bail!("training {} failed: {}", classifier.name(), error);
    }
    classifier
        .save()
        .with_context(|| format!("saving {} model", classifier.name()))?;
    Ok(report)
}

#[cfg(feature = "ml-models")]
fn load_or_init_deep(config: &ClassifierConfig) -> Result<dentview_classifiers::DeepClassifier> {
    use dentview_classifiers::DeepClassifier;
    use dentview_core::Error;

    match DeepClassifier::load(config) {
        Ok(classifier) => Ok(classifier),
        Err(Error::WeightsMissing(path)) => {
            info!(
                "No deep weights at {}, fine-tuning from the pretrained backbone",
                path.display()
            );
            Ok(DeepClassifier::untrained(config)?)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_result(path: &Path, result: &ClassificationResult) {
    println!(
        "{}: {} ({:.1}%) [{}]",
        path.display(),
        result.category_display_name,
        result.confidence * 100.0,
        result.model_used
    );
    if let Some(rules) = &result.refinement {
        println!("  refined by: {}", rules.join(", "));
    }
    if let Some(error) = &result.error {
        println!("  fallback: {}", error);
    }
}

/// Listen for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("dentview=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("dentview=info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
