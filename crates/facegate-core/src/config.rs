//! Pipeline configuration.
//!
//! Every heuristic threshold lives here and is handed to each stage at
//! construction. Values come from an optional TOML file, then
//! `FACEGATE_*` environment overrides, then defaults.

use crate::matcher::MatcherConfig;
use facegate_imaging::{EnhancerConfig, LivenessThresholds, QualityThresholds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_file: String,
    pub recognizer_file: String,
    pub detection_confidence: f32,
    pub nms_threshold: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            detector_file: "det_10g.onnx".to_string(),
            recognizer_file: "w600k_r50.onnx".to_string(),
            detection_confidence: crate::detector::DEFAULT_CONFIDENCE_THRESHOLD,
            nms_threshold: crate::detector::DEFAULT_NMS_THRESHOLD,
        }
    }
}

impl ModelConfig {
    /// Path to the SCRFD detection model.
    pub fn detector_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_file)
    }

    /// Path to the ArcFace recognition model.
    pub fn recognizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub quality: QualityThresholds,
    pub enhancer: EnhancerConfig,
    pub liveness: LivenessThresholds,
    pub matcher: MatcherConfig,
    pub models: ModelConfig,
    /// Root directory that enrollment photo references are resolved against.
    pub media_root: PathBuf,
    /// Soft wall-clock budget for one attempt, in milliseconds.
    pub time_budget_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality: QualityThresholds::default(),
            enhancer: EnhancerConfig::default(),
            liveness: LivenessThresholds::default(),
            matcher: MatcherConfig::default(),
            models: ModelConfig::default(),
            media_root: PathBuf::from("media"),
            time_budget_ms: 30_000,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml(src: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let src = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: PipelineConfig = toml::from_str(&src)?;
        config.apply_env();
        config.validate()?;
        tracing::info!(path = %path.display(), "loaded pipeline config");
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = PipelineConfig::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `FACEGATE_MODEL_DIR`, `FACEGATE_MEDIA_ROOT` and `FACEGATE_TIME_BUDGET_MS`.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("FACEGATE_MODEL_DIR") {
            self.models.model_dir = PathBuf::from(dir);
        }
        if let Ok(root) = std::env::var("FACEGATE_MEDIA_ROOT") {
            self.media_root = PathBuf::from(root);
        }
        self.time_budget_ms = env_u64("FACEGATE_TIME_BUDGET_MS", self.time_budget_ms);
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.matcher;
        if !(m.strict_tolerance <= m.standard_tolerance
            && m.standard_tolerance <= m.lenient_tolerance)
        {
            return Err(ConfigError::Invalid(format!(
                "matcher tolerances must be non-decreasing from strict to lenient, got {} / {} / {}",
                m.strict_tolerance, m.standard_tolerance, m.lenient_tolerance
            )));
        }
        if m.strict_quality < m.standard_quality {
            return Err(ConfigError::Invalid(format!(
                "strict_quality ({}) must not be below standard_quality ({})",
                m.strict_quality, m.standard_quality
            )));
        }
        if m.lenient_tolerance <= 0.0 {
            return Err(ConfigError::Invalid("matcher tolerances must be positive".into()));
        }
        if self.enhancer.gamma <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "gamma must be positive, got {}",
                self.enhancer.gamma
            )));
        }
        if self.enhancer.score_blur_divisor <= 0.0 {
            return Err(ConfigError::Invalid("score_blur_divisor must be positive".into()));
        }
        if self.enhancer.clahe_grid == 0 || self.enhancer.clahe_clip_limit <= 0.0 {
            return Err(ConfigError::Invalid("CLAHE grid and clip limit must be positive".into()));
        }
        if !(0.0..=100.0).contains(&self.quality.pass_score) {
            return Err(ConfigError::Invalid(format!(
                "quality pass_score must be within 0–100, got {}",
                self.quality.pass_score
            )));
        }
        if !(0.0..=100.0).contains(&self.liveness.live_score) {
            return Err(ConfigError::Invalid(format!(
                "liveness live_score must be within 0–100, got {}",
                self.liveness.live_score
            )));
        }
        if self.time_budget_ms == 0 {
            return Err(ConfigError::Invalid("time_budget_ms must be greater than zero".into()));
        }
        Ok(())
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
