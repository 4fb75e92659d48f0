//! Passive single-image liveness heuristics.
//!
//! Reprinted photos and screen replays tend to lose fine texture, flatten
//! brightness and colour variation, or add moiré/bezel edges. Each signal
//! is checked independently and deducts from a score of 100.
//!
//! # Threat Coverage
//!
//! - **Flags:** low-texture reprints, flat screen replays, edge-heavy moiré.
//! - **Does not flag:** high-quality prints under good light, 3D masks.

use crate::capture::CapturedImage;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessThresholds {
    pub min_texture: f32,
    pub texture_penalty: f32,
    pub min_brightness_std: f32,
    pub brightness_penalty: f32,
    /// Maximum fraction of Canny edge pixels.
    pub max_edge_density: f32,
    pub edge_penalty: f32,
    pub min_color_std: f32,
    pub color_penalty: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    pub live_score: f32,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            min_texture: 50.0,
            texture_penalty: 40.0,
            min_brightness_std: 30.0,
            brightness_penalty: 30.0,
            max_edge_density: 0.15,
            edge_penalty: 20.0,
            min_color_std: 20.0,
            color_penalty: 25.0,
            canny_low: 100.0,
            canny_high: 200.0,
            live_score: 50.0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("image too small for liveness analysis: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
}

/// Raw measurements behind a [`LivenessReport`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LivenessSignals {
    /// Laplacian variance.
    pub texture: f32,
    /// Grayscale standard deviation.
    pub brightness_std: f32,
    /// Fraction of Canny edge pixels (0–1).
    pub edge_density: f32,
    /// Mean of the per-channel standard deviations.
    pub color_std: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivenessReport {
    pub is_live: bool,
    /// 0–100.
    pub score: f32,
    /// Joined failure reasons, or a success message.
    pub reason: String,
    /// `None` when the report was produced without running the detector.
    pub signals: Option<LivenessSignals>,
}

impl LivenessReport {
    /// Pass-through report for when the detector itself failed.
    ///
    /// Detector faults must not lock out legitimate users; genuine spoofing
    /// signals still reject through [`LivenessDetector::score`].
    pub fn fail_open(err: &LivenessError) -> Self {
        Self {
            is_live: true,
            score: 100.0,
            reason: format!("Verificação de vivacidade indisponível: {err}"),
            signals: None,
        }
    }
}

pub struct LivenessDetector {
    thresholds: LivenessThresholds,
}

impl LivenessDetector {
    pub fn new(thresholds: LivenessThresholds) -> Self {
        Self { thresholds }
    }

    /// Measure an (enhanced) image and score it.
    pub fn analyze(&self, image: &CapturedImage) -> Result<LivenessReport, LivenessError> {
        let (width, height) = (image.width(), image.height());
        if width < 3 || height < 3 {
            return Err(LivenessError::TooSmall { width, height });
        }

        let gray = image.gray();
        let edges =
            imageproc::edges::canny(&gray, self.thresholds.canny_low, self.thresholds.canny_high);
        let edge_pixels = edges.as_raw().iter().filter(|&&v| v > 0).count();

        let signals = LivenessSignals {
            texture: crate::capture::laplacian_variance(&gray),
            brightness_std: crate::capture::std_dev(&gray),
            edge_density: edge_pixels as f32 / (width as f32 * height as f32),
            color_std: crate::capture::channel_std_dev(image.rgb()),
        };

        let report = self.score(signals);
        tracing::debug!(
            score = report.score,
            is_live = report.is_live,
            texture = signals.texture,
            brightness_std = signals.brightness_std,
            edge_density = signals.edge_density,
            color_std = signals.color_std,
            "liveness analyzed"
        );
        Ok(report)
    }

    /// Apply the deduction rules to precomputed signals. Every rule runs.
    pub fn score(&self, signals: LivenessSignals) -> LivenessReport {
        let t = &self.thresholds;
        let mut score = 100.0f32;
        let mut reasons: Vec<&str> = Vec::new();

        if signals.texture < t.min_texture {
            score -= t.texture_penalty;
            reasons.push("textura suspeita (possível foto de foto)");
        }
        if signals.brightness_std < t.min_brightness_std {
            score -= t.brightness_penalty;
            reasons.push("brilho muito uniforme (possível tela)");
        }
        if signals.edge_density > t.max_edge_density {
            score -= t.edge_penalty;
            reasons.push("muitas bordas detectadas");
        }
        if signals.color_std < t.min_color_std {
            score -= t.color_penalty;
            reasons.push("variação de cor suspeita");
        }

        let score = score.clamp(0.0, 100.0);
        let is_live = score >= t.live_score;
        let reason = if reasons.is_empty() {
            "Verificação de vivacidade aprovada".to_string()
        } else {
            reasons.join("; ")
        };

        LivenessReport {
            is_live,
            score,
            reason,
            signals: Some(signals),
        }
    }
}

impl Default for LivenessDetector {
    fn default() -> Self {
        Self::new(LivenessThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn signals(
        texture: f32,
        brightness_std: f32,
        edge_density: f32,
        color_std: f32,
    ) -> LivenessSignals {
        LivenessSignals {
            texture,
            brightness_std,
            edge_density,
            color_std,
        }
    }

    #[test]
    fn test_all_signals_healthy() {
        let report = LivenessDetector::default().score(signals(200.0, 50.0, 0.05, 40.0));
        assert!(report.is_live);
        assert_eq!(report.score, 100.0);
        assert_eq!(report.reason, "Verificação de vivacidade aprovada");
    }

    #[test]
    fn test_every_rule_runs() {
        let report = LivenessDetector::default().score(signals(10.0, 5.0, 0.5, 5.0));
        assert!(!report.is_live);
        assert_eq!(report.score, 0.0);
        assert_eq!(report.reason.split("; ").count(), 4);
    }

    #[test]
    fn test_texture_and_color_fail_together() {
        // 100 - 40 - 25 = 35
        let report = LivenessDetector::default().score(signals(10.0, 50.0, 0.05, 5.0));
        assert_eq!(report.score, 35.0);
        assert!(!report.is_live);
    }

    #[test]
    fn test_single_failure_still_live() {
        // 100 - 40 = 60
        let report = LivenessDetector::default().score(signals(10.0, 50.0, 0.05, 40.0));
        assert_eq!(report.score, 60.0);
        assert!(report.is_live);
        assert!(report.reason.contains("textura suspeita"));
    }

    #[test]
    fn test_score_forty_five_blocks() {
        let detector = LivenessDetector::new(LivenessThresholds {
            texture_penalty: 55.0,
            ..LivenessThresholds::default()
        });
        let report = detector.score(signals(10.0, 50.0, 0.05, 40.0));
        assert_eq!(report.score, 45.0);
        assert!(!report.is_live);
    }

    #[test]
    fn test_live_gate_matches_score() {
        let detector = LivenessDetector::default();
        for texture in [10.0, 100.0] {
            for bstd in [10.0, 40.0] {
                for edges in [0.01, 0.3] {
                    for cstd in [5.0, 30.0] {
                        let r = detector.score(signals(texture, bstd, edges, cstd));
                        assert!((0.0..=100.0).contains(&r.score));
                        assert_eq!(r.is_live, r.score >= 50.0, "score {}", r.score);
                    }
                }
            }
        }
    }

    #[test]
    fn test_flat_image_is_not_live() {
        let flat = CapturedImage::from_rgb(RgbImage::from_pixel(64, 64, Rgb([120, 110, 100])));
        let report = LivenessDetector::default().analyze(&flat).unwrap();
        assert!(!report.is_live);
        let s = report.signals.unwrap();
        assert_eq!(s.texture, 0.0);
        assert_eq!(s.edge_density, 0.0);
    }

    #[test]
    fn test_too_small_is_error() {
        let tiny = CapturedImage::from_rgb(RgbImage::from_pixel(2, 2, Rgb([1, 2, 3])));
        assert!(matches!(
            LivenessDetector::default().analyze(&tiny),
            Err(LivenessError::TooSmall { .. })
        ));
    }

    #[test]
    fn test_fail_open_report() {
        let err = LivenessError::TooSmall { width: 1, height: 1 };
        let report = LivenessReport::fail_open(&err);
        assert!(report.is_live);
        assert_eq!(report.score, 100.0);
        assert!(report.signals.is_none());
    }
}
