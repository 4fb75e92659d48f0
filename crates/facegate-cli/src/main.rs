use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use facegate_core::{Authenticator, FsPhotoStore, Gallery, OnnxFaceAnalyzer, PipelineConfig};
use facegate_imaging::capture::load_path;
use facegate_imaging::{
    CapturedImage, EnhanceOutcome, ImageEnhancer, LivenessDetector, QualityAssessor,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "facegate", about = "Facegate face authentication pipeline")]
struct Cli {
    /// Pipeline configuration (TOML). Defaults plus FACEGATE_* overrides when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate a capture against an enrollment manifest
    Authenticate {
        /// Captured image file
        #[arg(short, long, conflicts_with = "payload", required_unless_present = "payload")]
        image: Option<PathBuf>,
        /// File holding a base64 (optionally data-URI) payload
        #[arg(short, long)]
        payload: Option<PathBuf>,
        /// TOML manifest of [[enrollment]] entries
        #[arg(short, long)]
        gallery: PathBuf,
    },
    /// Report capture quality
    Quality { image: PathBuf },
    /// Run the liveness heuristics
    Liveness {
        image: PathBuf,
        /// Analyze the image as-is instead of enhancing it first
        #[arg(long)]
        raw: bool,
    },
    /// Enhance an image and write the result
    Enhance {
        image: PathBuf,
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(p) => PipelineConfig::load(p)?,
        None => PipelineConfig::from_env()?,
    };
    Ok(config)
}

fn load_image(path: &Path) -> Result<CapturedImage> {
    load_path(path).with_context(|| format!("loading {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Authenticate {
            image,
            payload,
            gallery,
        } => {
            let payload = match (image, payload) {
                (Some(path), _) => {
                    let bytes = std::fs::read(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    STANDARD.encode(bytes)
                }
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => anyhow::bail!("either --image or --payload is required"),
            };

            let manifest = std::fs::read_to_string(&gallery)
                .with_context(|| format!("reading {}", gallery.display()))?;
            let gallery = Gallery::from_toml(&manifest)?;

            let models = &config.models;
            let analyzer =
                OnnxFaceAnalyzer::load(&models.detector_path(), &models.recognizer_path())?
                    .with_detection_thresholds(models.detection_confidence, models.nms_threshold);
            let store = FsPhotoStore::new(&config.media_root);
            tracing::info!(
                candidates = gallery.len(),
                media_root = %config.media_root.display(),
                "authenticating"
            );

            let mut authenticator = Authenticator::new(config, analyzer, store);
            let response = authenticator.authenticate(&payload, &gallery);
            print_json(&response)?;
            Ok(if response.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Quality { image } => {
            let captured = load_image(&image)?;
            let report = QualityAssessor::new(config.quality).assess(&captured);
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Liveness { image, raw } => {
            let captured = load_image(&image)?;
            let subject = if raw {
                captured
            } else {
                match ImageEnhancer::new(config.enhancer).enhance(&captured) {
                    EnhanceOutcome::Enhanced { image, .. } => image,
                    EnhanceOutcome::Rejected { message, .. } => {
                        tracing::warn!(%message, "enhancement rejected image; analyzing original");
                        captured
                    }
                }
            };
            let report = LivenessDetector::new(config.liveness).analyze(&subject)?;
            print_json(&report)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Enhance { image, out } => {
            let captured = load_image(&image)?;
            match ImageEnhancer::new(config.enhancer).enhance(&captured) {
                EnhanceOutcome::Enhanced {
                    image: enhanced,
                    score,
                    blur,
                    brightness,
                } => {
                    enhanced
                        .rgb()
                        .save(&out)
                        .with_context(|| format!("writing {}", out.display()))?;
                    print_json(&serde_json::json!({
                        "enhanced": true,
                        "score": score,
                        "blur": blur,
                        "brightness": brightness,
                        "output": out,
                    }))?;
                    Ok(ExitCode::SUCCESS)
                }
                EnhanceOutcome::Rejected { reason, score, message } => {
                    print_json(&serde_json::json!({
                        "enhanced": false,
                        "reason": reason,
                        "score": score,
                        "message": message,
                    }))?;
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}
