//! Image enhancement ahead of liveness and face encoding.
//!
//! The enhancer runs its own focus/exposure gate and refuses images it
//! cannot meaningfully correct. Accepted images go through a fixed
//! correction chain: per-channel CLAHE, median denoise, 3×3 sharpen and a
//! gamma lookup table.

use crate::capture::{self, CapturedImage, ImagingError};
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// 3×3 sharpening kernel, row-major. Coefficients sum to 1.
pub const SHARPEN_KERNEL: [f32; 9] = [
    -1.0, -1.0, -1.0, //
    -1.0, 9.0, -1.0, //
    -1.0, -1.0, -1.0,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    /// Laplacian variance below which the image is rejected as unfocused.
    pub min_blur: f32,
    /// Mean brightness below which the image is rejected as too dark.
    pub min_brightness: f32,
    /// Mean brightness above which the image is rejected as too bright.
    pub max_brightness: f32,
    pub clahe_clip_limit: f32,
    /// CLAHE tiles per axis.
    pub clahe_grid: u32,
    /// Median filter radius (1 = 3×3 window).
    pub denoise_radius: u32,
    pub gamma: f32,
    pub score_blur_divisor: f32,
    /// Bonus added to the derived score when brightness is comfortably mid-range.
    pub score_brightness_bonus: f32,
    pub bonus_brightness_low: f32,
    pub bonus_brightness_high: f32,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            min_blur: 30.0,
            min_brightness: 30.0,
            max_brightness: 240.0,
            clahe_clip_limit: 2.0,
            clahe_grid: 8,
            denoise_radius: 1,
            gamma: 1.2,
            score_blur_divisor: 5.0,
            score_brightness_bonus: 50.0,
            bonus_brightness_low: 60.0,
            bonus_brightness_high: 200.0,
        }
    }
}

/// Why the enhancer refused an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnhanceReason {
    Unfocused,
    TooDark,
    TooBright,
    Internal,
}

#[derive(Debug, Clone)]
pub enum EnhanceOutcome {
    Enhanced {
        image: CapturedImage,
        /// Derived 0–100 quality score.
        score: f32,
        blur: f32,
        brightness: f32,
    },
    Rejected {
        reason: EnhanceReason,
        /// Raw metric behind the rejection (blur score or brightness), 0 for internal errors.
        score: f32,
        message: String,
    },
}

pub struct ImageEnhancer {
    config: EnhancerConfig,
    gamma_lut: [u8; 256],
}

impl ImageEnhancer {
    pub fn new(config: EnhancerConfig) -> Self {
        let gamma_lut = gamma_lut(config.gamma);
        Self { config, gamma_lut }
    }

    pub fn config(&self) -> &EnhancerConfig {
        &self.config
    }

    /// Gate and correct an image.
    pub fn enhance(&self, image: &CapturedImage) -> EnhanceOutcome {
        let gray = image.gray();
        let blur = capture::laplacian_variance(&gray);
        let brightness = capture::mean(&gray);
        let c = &self.config;

        if blur < c.min_blur {
            tracing::debug!(blur, "enhance: rejected unfocused image");
            return EnhanceOutcome::Rejected {
                reason: EnhanceReason::Unfocused,
                score: blur,
                message: format!("Imagem desfocada (nitidez {blur:.1})"),
            };
        }
        if brightness < c.min_brightness {
            tracing::debug!(brightness, "enhance: rejected dark image");
            return EnhanceOutcome::Rejected {
                reason: EnhanceReason::TooDark,
                score: brightness,
                message: format!("Imagem muito escura (brilho {brightness:.1})"),
            };
        }
        if brightness > c.max_brightness {
            tracing::debug!(brightness, "enhance: rejected bright image");
            return EnhanceOutcome::Rejected {
                reason: EnhanceReason::TooBright,
                score: brightness,
                message: format!("Imagem muito clara (brilho {brightness:.1})"),
            };
        }

        match self.correct(image.rgb()) {
            Ok(rgb) => {
                let score = derived_score(c, blur, brightness);
                tracing::debug!(blur, brightness, score, "enhance: image corrected");
                EnhanceOutcome::Enhanced {
                    image: CapturedImage::from_rgb(rgb),
                    score,
                    blur,
                    brightness,
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "enhance: correction failed");
                EnhanceOutcome::Rejected {
                    reason: EnhanceReason::Internal,
                    score: 0.0,
                    message: format!("Erro ao processar imagem: {err}"),
                }
            }
        }
    }

    fn correct(&self, rgb: &RgbImage) -> Result<RgbImage, ImagingError> {
        let (w, h) = rgb.dimensions();
        if w < 3 || h < 3 {
            return Err(ImagingError::TooSmall { width: w, height: h });
        }

        let mut planes = capture::split_channels(rgb);
        for plane in planes.iter_mut() {
            capture::clahe_enhance(
                plane,
                w,
                h,
                self.config.clahe_grid,
                self.config.clahe_clip_limit,
            )?;
        }
        let equalized = capture::merge_channels(&planes, w, h)?;

        let r = self.config.denoise_radius;
        let denoised = imageproc::filter::median_filter(&equalized, r, r);

        let mut sharpened = sharpen(&denoised);

        for p in sharpened.pixels_mut() {
            for v in p.0.iter_mut() {
                *v = self.gamma_lut[*v as usize];
            }
        }

        Ok(sharpened)
    }
}

impl Default for ImageEnhancer {
    fn default() -> Self {
        Self::new(EnhancerConfig::default())
    }
}

fn derived_score(c: &EnhancerConfig, blur: f32, brightness: f32) -> f32 {
    let bonus = if brightness > c.bonus_brightness_low && brightness < c.bonus_brightness_high {
        c.score_brightness_bonus
    } else {
        0.0
    };
    (blur / c.score_blur_divisor + bonus).min(100.0)
}

/// Build the gamma lookup table: `255 * (v / 255) ^ (1 / gamma)`.
pub fn gamma_lut(gamma: f32) -> [u8; 256] {
    let inv = 1.0 / gamma;
    std::array::from_fn(|i| (255.0 * (i as f32 / 255.0).powf(inv)).round().clamp(0.0, 255.0) as u8)
}

/// Convolve with [`SHARPEN_KERNEL`]. Borders replicate edge pixels and
/// results saturate to `u8`.
fn sharpen(rgb: &RgbImage) -> RgbImage {
    imageproc::filter::filter3x3::<_, f32, u8>(rgb, &SHARPEN_KERNEL)
}
