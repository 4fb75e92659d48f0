//! Capture quality gate.
//!
//! Scores an image from 100 downwards on sharpness, brightness, contrast
//! and resolution, and explains every deduction with a suggestion the user
//! can act on before retaking the photo.

use crate::capture::{self, CapturedImage};
use serde::{Deserialize, Serialize};

/// Thresholds and deductions for the quality gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Laplacian variance below which the image is considered unfocused.
    pub blur_severe: f32,
    pub blur_severe_penalty: f32,
    /// Laplacian variance below which the image is slightly soft.
    pub blur_mild: f32,
    pub blur_mild_penalty: f32,
    pub dark_severe: f32,
    pub dark_severe_penalty: f32,
    pub dark_mild: f32,
    pub dark_mild_penalty: f32,
    pub bright_severe: f32,
    pub bright_severe_penalty: f32,
    pub bright_mild: f32,
    pub bright_mild_penalty: f32,
    /// Minimum grayscale standard deviation.
    pub min_contrast: f32,
    pub contrast_penalty: f32,
    pub min_width: u32,
    pub min_height: u32,
    pub resolution_penalty: f32,
    /// Minimum score for the image to pass.
    pub pass_score: f32,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            blur_severe: 30.0,
            blur_severe_penalty: 30.0,
            blur_mild: 60.0,
            blur_mild_penalty: 15.0,
            dark_severe: 40.0,
            dark_severe_penalty: 25.0,
            dark_mild: 60.0,
            dark_mild_penalty: 10.0,
            bright_severe: 220.0,
            bright_severe_penalty: 20.0,
            bright_mild: 200.0,
            bright_mild_penalty: 10.0,
            min_contrast: 25.0,
            contrast_penalty: 15.0,
            min_width: 320,
            min_height: 240,
            resolution_penalty: 20.0,
            pass_score: 40.0,
        }
    }
}

/// Raw measurements behind a [`QualityReport`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityMetrics {
    /// Laplacian variance.
    pub sharpness: f32,
    /// Mean grayscale intensity.
    pub brightness: f32,
    /// Grayscale standard deviation.
    pub contrast: f32,
    pub width: u32,
    pub height: u32,
}

/// Outcome of the quality gate.
#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub passed: bool,
    /// 0–100.
    pub score: f32,
    /// One suggestion per deduction, in evaluation order.
    pub reasons: Vec<String>,
    pub metrics: QualityMetrics,
}

pub struct QualityAssessor {
    thresholds: QualityThresholds,
}

impl QualityAssessor {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    /// Measure an image and score it. Never fails.
    pub fn assess(&self, image: &CapturedImage) -> QualityReport {
        let gray = image.gray();
        let metrics = QualityMetrics {
            sharpness: capture::laplacian_variance(&gray),
            brightness: capture::mean(&gray),
            contrast: capture::std_dev(&gray),
            width: image.width(),
            height: image.height(),
        };
        let report = self.score(metrics);
        tracing::debug!(
            score = report.score,
            passed = report.passed,
            sharpness = metrics.sharpness,
            brightness = metrics.brightness,
            contrast = metrics.contrast,
            "quality assessed"
        );
        report
    }

    /// Apply the deduction rules to precomputed metrics.
    pub fn score(&self, metrics: QualityMetrics) -> QualityReport {
        let t = &self.thresholds;
        let mut score = 100.0f32;
        let mut reasons = Vec::new();

        if metrics.sharpness < t.blur_severe {
            score -= t.blur_severe_penalty;
            reasons.push(
                "Imagem desfocada - mantenha a câmera estável e ajuste o foco".to_string(),
            );
        } else if metrics.sharpness < t.blur_mild {
            score -= t.blur_mild_penalty;
            reasons.push(
                "Imagem levemente desfocada - tente manter a câmera mais estável".to_string(),
            );
        }

        if metrics.brightness < t.dark_severe {
            score -= t.dark_severe_penalty;
            reasons.push("Imagem muito escura - procure um local mais iluminado".to_string());
        } else if metrics.brightness < t.dark_mild {
            score -= t.dark_mild_penalty;
            reasons.push("Imagem um pouco escura - melhore a iluminação".to_string());
        } else if metrics.brightness > t.bright_severe {
            score -= t.bright_severe_penalty;
            reasons.push("Imagem muito clara - evite luz direta no rosto".to_string());
        } else if metrics.brightness > t.bright_mild {
            score -= t.bright_mild_penalty;
            reasons.push("Imagem um pouco clara - reduza a iluminação".to_string());
        }

        if metrics.contrast < t.min_contrast {
            score -= t.contrast_penalty;
            reasons.push("Contraste baixo - evite fundos da mesma cor do rosto".to_string());
        }

        if metrics.height < t.min_height || metrics.width < t.min_width {
            score -= t.resolution_penalty;
            reasons.push("Resolução muito baixa - aproxime-se da câmera".to_string());
        }

        if reasons.is_empty() {
            reasons.push("Qualidade da imagem adequada".to_string());
        }

        let score = score.clamp(0.0, 100.0);
        QualityReport {
            passed: score >= t.pass_score,
            score,
            reasons,
            metrics,
        }
    }
}

impl Default for QualityAssessor {
    fn default() -> Self {
        Self::new(QualityThresholds::default())
    }
}
