//! Captured image type, payload decoding and pixel statistics: grayscale
//! conversion, Laplacian variance, CLAHE.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use image::{GrayImage, RgbImage};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("image payload is empty")]
    Empty,
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("unreadable image data: {0}")]
    Image(#[from] image::ImageError),
    #[error("image has zero width or height")]
    EmptyImage,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ImagingError {
    #[error("invalid plane length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("image too small: {width}x{height}")]
    TooSmall { width: u32, height: u32 },
}

/// An 8-bit RGB image taken from a single authentication attempt.
#[derive(Debug, Clone)]
pub struct CapturedImage {
    rgb: RgbImage,
}

impl CapturedImage {
    pub fn from_rgb(rgb: RgbImage) -> Self {
        Self { rgb }
    }

    pub fn rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    /// Luma plane using the ITU-R BT.601 weights (0.299, 0.587, 0.114).
    pub fn gray(&self) -> GrayImage {
        let (w, h) = self.rgb.dimensions();
        let data = self
            .rgb
            .pixels()
            .map(|p| {
                let [r, g, b] = p.0;
                (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32)
                    .round()
                    .clamp(0.0, 255.0) as u8
            })
            .collect();
        // Length is w * h by construction.
        GrayImage::from_raw(w, h, data).unwrap_or_else(|| GrayImage::new(w, h))
    }
}

/// Remove a `data:<mime>;base64,` prefix if present.
///
/// Payloads without a prefix are returned unchanged, so applying this twice
/// is the same as applying it once.
pub fn strip_data_uri(payload: &str) -> &str {
    if payload.starts_with("data:") {
        if let Some((_, body)) = payload.split_once(',') {
            return body;
        }
    }
    payload
}

/// Decode a base64 (optionally data-URI prefixed) image payload.
pub fn decode_payload(payload: &str) -> Result<CapturedImage, DecodeError> {
    let body = strip_data_uri(payload.trim()).trim();
    if body.is_empty() {
        return Err(DecodeError::Empty);
    }
    let bytes = STANDARD.decode(body)?;
    decode_bytes(&bytes)
}

/// Decode an encoded image (JPEG, PNG, ...) into RGB.
pub fn decode_bytes(bytes: &[u8]) -> Result<CapturedImage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    let rgb = image::load_from_memory(bytes)?.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(DecodeError::EmptyImage);
    }
    tracing::debug!(width = rgb.width(), height = rgb.height(), "decoded image");
    Ok(CapturedImage::from_rgb(rgb))
}

/// Load and decode an image file from disk.
pub fn load_path(path: &Path) -> Result<CapturedImage, DecodeError> {
    let bytes = std::fs::read(path)?;
    decode_bytes(&bytes)
}

/// Mean pixel intensity (0.0–255.0).
pub fn mean(gray: &GrayImage) -> f32 {
    let data = gray.as_raw();
    if data.is_empty() {
        return 0.0;
    }
    data.iter().map(|&b| b as f64).sum::<f64>() as f32 / data.len() as f32
}

/// Population standard deviation of pixel intensity.
pub fn std_dev(gray: &GrayImage) -> f32 {
    plane_std_dev(gray.as_raw().iter().copied())
}

/// Mean of the three per-channel standard deviations.
pub fn channel_std_dev(rgb: &RgbImage) -> f32 {
    let raw = rgb.as_raw();
    (0..3)
        .map(|c| plane_std_dev(raw.iter().skip(c).step_by(3).copied()))
        .sum::<f32>()
        / 3.0
}

fn plane_std_dev(values: impl Iterator<Item = u8> + Clone) -> f32 {
    let mut n = 0usize;
    let mut sum = 0.0f64;
    for v in values.clone() {
        sum += v as f64;
        n += 1;
    }
    if n == 0 {
        return 0.0;
    }
    let mean = sum / n as f64;
    let variance = values.map(|v| (v as f64 - mean).powi(2)).sum::<f64>() / n as f64;
    variance.sqrt() as f32
}

/// Reflect an out-of-range index back into `0..n` without repeating the edge
/// pixel (`-1 -> 1`, `n -> n - 2`).
fn reflect(i: i64, n: i64) -> usize {
    if n == 1 {
        return 0;
    }
    let r = if i < 0 {
        -i
    } else if i >= n {
        2 * n - 2 - i
    } else {
        i
    };
    r.clamp(0, n - 1) as usize
}

/// Variance of the 4-neighbour Laplacian response.
///
/// High values mean strong local detail; a defocused or smoothed image
/// scores low.
pub fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    if w == 0 || h == 0 {
        return 0.0;
    }
    let data = gray.as_raw();
    let at = |x: i64, y: i64| data[reflect(y, h) * w as usize + reflect(x, w)] as f64;

    let n = (w * h) as f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let lap = at(x, y - 1) + at(x, y + 1) + at(x - 1, y) + at(x + 1, y) - 4.0 * at(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0) as f32
}

/// Split an RGB image into three planes.
pub fn split_channels(rgb: &RgbImage) -> [Vec<u8>; 3] {
    let n = (rgb.width() * rgb.height()) as usize;
    let mut planes = [
        Vec::with_capacity(n),
        Vec::with_capacity(n),
        Vec::with_capacity(n),
    ];
    for p in rgb.pixels() {
        for (plane, &v) in planes.iter_mut().zip(p.0.iter()) {
            plane.push(v);
        }
    }
    planes
}

/// Interleave three planes back into an RGB image.
pub fn merge_channels(
    planes: &[Vec<u8>; 3],
    width: u32,
    height: u32,
) -> Result<RgbImage, ImagingError> {
    let expected = (width * height) as usize;
    for plane in planes {
        if plane.len() != expected {
            return Err(ImagingError::InvalidLength {
                expected,
                actual: plane.len(),
            });
        }
    }
    let mut data = Vec::with_capacity(expected * 3);
    for i in 0..expected {
        data.extend_from_slice(&[planes[0][i], planes[1][i], planes[2][i]]);
    }
    RgbImage::from_raw(width, height, data).ok_or(ImagingError::InvalidLength {
        expected: expected * 3,
        actual: 0,
    })
}

/// Apply Contrast-Limited Adaptive Histogram Equalization (CLAHE) in-place
/// on a single 8-bit plane.
///
/// `clip_limit` is a multiple of the mean histogram bin height (2.0 caps
/// each bin at twice the count a flat histogram would have). Tile mappings
/// are blended bilinearly between tile centres.
pub fn clahe_enhance(
    plane: &mut [u8],
    width: u32,
    height: u32,
    grid: u32,
    clip_limit: f32,
) -> Result<(), ImagingError> {
    let w = width as usize;
    let h = height as usize;
    if plane.len() != w * h {
        return Err(ImagingError::InvalidLength {
            expected: w * h,
            actual: plane.len(),
        });
    }
    if w == 0 || h == 0 {
        return Err(ImagingError::TooSmall { width, height });
    }

    let tx = (grid as usize).clamp(1, w);
    let ty = (grid as usize).clamp(1, h);
    let tile_w = w.div_ceil(tx);
    let tile_h = h.div_ceil(ty);

    // Per-tile lookup tables
    let mut luts: Vec<[f32; 256]> = Vec::with_capacity(tx * ty);

    for row in 0..ty {
        for col in 0..tx {
            let y0 = row * tile_h;
            let x0 = col * tile_w;
            let y1 = (y0 + tile_h).min(h);
            let x1 = (x0 + tile_w).min(w);

            let mut hist = [0u32; 256];
            let mut tile_pixels = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[plane[y * w + x] as usize] += 1;
                    tile_pixels += 1;
                }
            }

            if tile_pixels == 0 {
                luts.push(std::array::from_fn(|i| i as f32));
                continue;
            }

            // Clip histogram
            let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            // Cumulative distribution scaled to 0–255
            let scale = 255.0 / tile_pixels as f32;
            let mut lut = [0f32; 256];
            let mut acc = 0u32;
            for (i, &count) in hist.iter().enumerate() {
                acc += count;
                lut[i] = (acc as f32 * scale).clamp(0.0, 255.0);
            }
            luts.push(lut);
        }
    }

    for y in 0..h {
        for x in 0..w {
            let pixel = plane[y * w + x] as usize;

            let fy = ((y as f32 + 0.5) / tile_h as f32 - 0.5).clamp(0.0, (ty - 1) as f32);
            let fx = ((x as f32 + 0.5) / tile_w as f32 - 0.5).clamp(0.0, (tx - 1) as f32);

            let r0 = fy as usize;
            let c0 = fx as usize;
            let r1 = (r0 + 1).min(ty - 1);
            let c1 = (c0 + 1).min(tx - 1);

            let dy = fy - r0 as f32;
            let dx = fx - c0 as f32;

            let tl = luts[r0 * tx + c0][pixel];
            let tr = luts[r0 * tx + c1][pixel];
            let bl = luts[r1 * tx + c0][pixel];
            let br = luts[r1 * tx + c1][pixel];

            let top = tl * (1.0 - dx) + tr * dx;
            let bot = bl * (1.0 - dx) + br * dx;
            let val = top * (1.0 - dy) + bot * dy;

            plane[y * w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    Ok(())
}
