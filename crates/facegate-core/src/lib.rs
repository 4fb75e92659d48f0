//! Face authentication core.
//!
//! Takes a captured image through quality gating, enhancement and
//! liveness checks (from `facegate-imaging`), then locates and encodes the
//! face and matches it against a gallery of enrolled identities.
//!
//! The vision backend sits behind [`FaceAnalyzer`]: [`OnnxFaceAnalyzer`]
//! runs SCRFD detection and ArcFace encoding via ONNX Runtime,
//! [`ScriptedFaceAnalyzer`] returns canned answers for tests.

pub mod alignment;
pub mod analyzer;
pub mod cache;
pub mod config;
pub mod detector;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxFaceAnalyzer, ScriptedFaceAnalyzer};
pub use cache::EnrollmentDescriptorCache;
pub use config::{ConfigError, ModelConfig, PipelineConfig};
pub use gallery::{
    EnrollmentRecord, FsPhotoStore, Gallery, GalleryError, MemoryPhotoStore, PhotoStore,
};
pub use matcher::{AdaptiveMatcher, BestCandidate, MatchDecision, MatcherConfig};
pub use pipeline::{AuthFailure, AuthResponse, AuthSuccess, Authenticator, Stage};
pub use types::{BoundingBox, FaceDescriptor, MatchResult};
