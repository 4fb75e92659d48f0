//! Face locator/encoder capability.
//!
//! The pipeline only needs two things from a vision backend: where the
//! faces are, and a descriptor for one of them. [`OnnxFaceAnalyzer`] is the
//! production backend; [`ScriptedFaceAnalyzer`] returns canned answers for
//! tests.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, FaceDescriptor};
use facegate_imaging::CapturedImage;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Locates faces and encodes one of them.
pub trait FaceAnalyzer {
    /// Return every face found, highest confidence first.
    fn locate(&mut self, image: &CapturedImage) -> Result<Vec<BoundingBox>, AnalyzerError>;

    /// Encode the face inside `face`.
    fn encode(
        &mut self,
        image: &CapturedImage,
        face: &BoundingBox,
    ) -> Result<FaceDescriptor, AnalyzerError>;
}

/// SCRFD detection + ArcFace encoding.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    pub fn load(detector_path: &Path, recognizer_path: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(detector_path)?;
        tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        tracing::info!(path = %recognizer_path.display(), "ArcFace recognizer loaded");
        Ok(Self { detector, recognizer })
    }

    pub fn with_detection_thresholds(mut self, confidence: f32, nms: f32) -> Self {
        self.detector = self.detector.with_thresholds(confidence, nms);
        self
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn locate(&mut self, image: &CapturedImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        Ok(self.detector.detect(image.rgb())?)
    }

    fn encode(
        &mut self,
        image: &CapturedImage,
        face: &BoundingBox,
    ) -> Result<FaceDescriptor, AnalyzerError> {
        Ok(self.recognizer.extract(image.rgb(), face)?)
    }
}

#[derive(Debug, Clone, Default)]
struct Script {
    faces: Vec<BoundingBox>,
    descriptor: Option<FaceDescriptor>,
}

/// Deterministic analyzer keyed on image dimensions.
///
/// Enhancement never changes image dimensions, so a script registered for
/// `(width, height)` answers for both the raw and the enhanced image.
/// Unknown sizes have no faces.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFaceAnalyzer {
    scripts: HashMap<(u32, u32), Script>,
    locate_calls: usize,
    encode_calls: usize,
}

impl ScriptedFaceAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// One face for images of this size, encoding to `values`.
    pub fn with_face(mut self, size: (u32, u32), values: Vec<f32>) -> Self {
        let width = size.0 as f32;
        let height = size.1 as f32;
        let script = self.scripts.entry(size).or_default();
        script.faces = vec![BoundingBox {
            x: width * 0.25,
            y: height * 0.25,
            width: width * 0.5,
            height: height * 0.5,
            confidence: 0.99,
            landmarks: None,
        }];
        script.descriptor = Some(FaceDescriptor::new(values));
        self
    }

    /// `count` faces for images of this size, no descriptor.
    pub fn with_faces(mut self, size: (u32, u32), count: usize) -> Self {
        let script = self.scripts.entry(size).or_default();
        script.faces = (0..count)
            .map(|i| BoundingBox {
                x: i as f32 * 10.0,
                y: 0.0,
                width: 8.0,
                height: 8.0,
                confidence: 0.9,
                landmarks: None,
            })
            .collect();
        self
    }

    /// One face for images of this size whose encoding fails.
    pub fn with_unencodable_face(self, size: (u32, u32)) -> Self {
        let mut this = self.with_faces(size, 1);
        if let Some(script) = this.scripts.get_mut(&size) {
            script.descriptor = None;
        }
        this
    }

    pub fn locate_calls(&self) -> usize {
        self.locate_calls
    }

    pub fn encode_calls(&self) -> usize {
        self.encode_calls
    }
}

impl FaceAnalyzer for ScriptedFaceAnalyzer {
    fn locate(&mut self, image: &CapturedImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
        self.locate_calls += 1;
        Ok(self
            .scripts
            .get(&(image.width(), image.height()))
            .map(|s| s.faces.clone())
            .unwrap_or_default())
    }

    fn encode(
        &mut self,
        image: &CapturedImage,
        _face: &BoundingBox,
    ) -> Result<FaceDescriptor, AnalyzerError> {
        self.encode_calls += 1;
        let size = (image.width(), image.height());
        self.scripts
            .get(&size)
            .and_then(|s| s.descriptor.clone())
            .ok_or_else(|| {
                AnalyzerError::Encoding(format!("no descriptor scripted for {}x{}", size.0, size.1))
            })
    }
}
