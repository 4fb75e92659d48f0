//! facegate-imaging — Pixel-level stages of the face authentication pipeline.
//!
//! Decodes captured payloads, gates them on capture quality, corrects them
//! for encoding, and scores passive liveness heuristics.

pub mod capture;
pub mod enhance;
pub mod liveness;
pub mod quality;

pub use capture::{decode_bytes, decode_payload, strip_data_uri, CapturedImage, DecodeError};
pub use enhance::{EnhanceOutcome, EnhanceReason, EnhancerConfig, ImageEnhancer};
pub use liveness::{LivenessDetector, LivenessError, LivenessReport, LivenessThresholds};
pub use quality::{QualityAssessor, QualityReport, QualityThresholds};
