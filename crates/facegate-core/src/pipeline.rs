//! Authentication orchestrator.
//!
//! One attempt runs decode → quality → enhance → liveness → detect →
//! encode → match, stopping at the first terminal outcome. Every outcome,
//! including unexpected panics inside a stage, comes back to the caller as
//! an [`AuthResponse`]; nothing escapes as an error.
//!
//! Liveness is the one stage with asymmetric failure handling: a detector
//! fault passes the attempt through, a spoofing verdict rejects it.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::cache::EnrollmentDescriptorCache;
use crate::config::PipelineConfig;
use crate::gallery::{EnrollmentRecord, Gallery, GalleryError, PhotoStore};
use crate::matcher::{AdaptiveMatcher, BestCandidate, MatchDecision};
use crate::types::FaceDescriptor;
use facegate_imaging::{
    decode_bytes, decode_payload, CapturedImage, DecodeError, EnhanceOutcome, EnhanceReason,
    ImageEnhancer, LivenessDetector, LivenessError, LivenessReport, QualityAssessor,
};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Pipeline stage an attempt ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Quality,
    Enhance,
    Liveness,
    Detect,
    Encode,
    Match,
    Internal,
}

/// Terminal negative outcome of an attempt.
#[derive(Error, Debug)]
pub enum AuthFailure {
    #[error("invalid image payload: {0}")]
    InvalidPayload(#[from] DecodeError),
    #[error("image quality too low (score {score:.0})")]
    LowQuality { score: f32, suggestions: Vec<String> },
    #[error("enhancement rejected image: {message}")]
    EnhancementRejected {
        reason: EnhanceReason,
        message: String,
        quality_score: f32,
    },
    #[error("liveness check failed (score {score:.0}): {reason}")]
    LivenessFailed {
        score: f32,
        reason: String,
        quality_score: f32,
    },
    #[error("face detection failed: {0}")]
    DetectionFailed(#[source] AnalyzerError),
    #[error("no face detected")]
    NoFace,
    #[error("{0} faces detected")]
    MultipleFaces(usize),
    #[error("face encoding failed: {0}")]
    EncodingFailed(#[source] AnalyzerError),
    #[error("no enrolled identity within tolerance {tolerance:.2}")]
    NoMatch { tolerance: f32, quality_score: f32 },
    #[error("match confidence {confidence:.1}% below minimum {minimum:.0}%")]
    LowConfidence {
        identity_id: String,
        confidence: f32,
        minimum: f32,
        quality_score: f32,
    },
    #[error("time budget of {budget_ms} ms exhausted before {stage:?}")]
    TimedOut { stage: Stage, budget_ms: u128 },
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthFailure {
    pub fn stage(&self) -> Stage {
        match self {
            AuthFailure::InvalidPayload(_) => Stage::Decode,
            AuthFailure::LowQuality { .. } => Stage::Quality,
            AuthFailure::EnhancementRejected { .. } => Stage::Enhance,
            AuthFailure::LivenessFailed { .. } => Stage::Liveness,
            AuthFailure::DetectionFailed(_)
            | AuthFailure::NoFace
            | AuthFailure::MultipleFaces(_) => Stage::Detect,
            AuthFailure::EncodingFailed(_) => Stage::Encode,
            AuthFailure::NoMatch { .. } | AuthFailure::LowConfidence { .. } => Stage::Match,
            AuthFailure::TimedOut { stage, .. } => *stage,
            AuthFailure::Internal(_) => Stage::Internal,
        }
    }
}

/// Accepted attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthSuccess {
    pub identity_id: String,
    pub distance: f32,
    pub confidence: f32,
    /// Enhanced-image quality score the matcher thresholds were chosen from.
    pub quality_score: f32,
    pub liveness_score: f32,
}

/// Structured result handed back to the caller for one attempt.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub success: bool,
    pub message: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    /// One decimal place followed by `%`, e.g. `"70.0%"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_score: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

fn format_confidence(confidence: f32) -> String {
    format!("{confidence:.1}%")
}

impl AuthResponse {
    fn rejected(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            stage,
            identity_id: None,
            confidence: None,
            quality_score: None,
            liveness_score: None,
            suggestions: Vec::new(),
        }
    }

    fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions = suggestions.into_iter().map(Into::into).collect();
        self
    }

    fn with_quality(mut self, score: f32) -> Self {
        self.quality_score = Some(score);
        self
    }
}

impl From<AuthSuccess> for AuthResponse {
    fn from(s: AuthSuccess) -> Self {
        Self {
            success: true,
            message: "Autenticação realizada com sucesso".to_string(),
            stage: Stage::Match,
            identity_id: Some(s.identity_id),
            confidence: Some(format_confidence(s.confidence)),
            quality_score: Some(s.quality_score),
            liveness_score: Some(s.liveness_score),
            suggestions: Vec::new(),
        }
    }
}

impl From<AuthFailure> for AuthResponse {
    fn from(failure: AuthFailure) -> Self {
        let stage = failure.stage();
        match failure {
            AuthFailure::InvalidPayload(_) => {
                AuthResponse::rejected(stage, "Imagem inválida ou ausente")
                    .with_suggestions(["Capture a foto novamente"])
            }
            AuthFailure::LowQuality { score, suggestions } => {
                AuthResponse::rejected(stage, "Qualidade da imagem insuficiente")
                    .with_suggestions(suggestions)
                    .with_quality(score)
            }
            AuthFailure::EnhancementRejected {
                message,
                quality_score,
                ..
            } => AuthResponse::rejected(stage, "Não foi possível processar a imagem")
                .with_suggestions([
                    message,
                    "Tente novamente com melhor iluminação e foco".to_string(),
                ])
                .with_quality(quality_score),
            AuthFailure::LivenessFailed {
                score,
                reason,
                quality_score,
            } => {
                let message = format!("Possível tentativa de fraude detectada: {reason}");
                let mut response = AuthResponse::rejected(stage, message)
                    .with_suggestions(["Use seu rosto real diante da câmera, não uma foto ou tela"])
                    .with_quality(quality_score);
                response.liveness_score = Some(score);
                response
            }
            AuthFailure::DetectionFailed(_) => {
                AuthResponse::rejected(stage, "Não foi possível localizar o rosto")
                    .with_suggestions(["Tente novamente"])
            }
            AuthFailure::NoFace => {
                AuthResponse::rejected(stage, "Nenhum rosto detectado").with_suggestions([
                    "Posicione o rosto no centro da câmera",
                    "Verifique se há iluminação suficiente",
                    "Remova óculos escuros, boné ou máscara",
                ])
            }
            AuthFailure::MultipleFaces(n) => {
                AuthResponse::rejected(stage, format!("{n} rostos detectados")).with_suggestions([
                    "Certifique-se de que apenas uma pessoa aparece na imagem",
                ])
            }
            AuthFailure::EncodingFailed(_) => {
                AuthResponse::rejected(stage, "Não foi possível processar o rosto")
                    .with_suggestions(["Tente novamente"])
            }
            AuthFailure::NoMatch { quality_score, .. } => {
                AuthResponse::rejected(stage, "Rosto não reconhecido")
                    .with_suggestions([
                        "Verifique se você está cadastrado no sistema",
                        "Tente novamente olhando diretamente para a câmera",
                    ])
                    .with_quality(quality_score)
            }
            AuthFailure::LowConfidence {
                confidence,
                minimum,
                quality_score,
                ..
            } => {
                let mut response = AuthResponse::rejected(
                    stage,
                    format!("Confiança insuficiente no reconhecimento (mínimo {minimum:.0}%)"),
                )
                .with_suggestions(["Melhore a iluminação e tente novamente"])
                .with_quality(quality_score);
                response.confidence = Some(format_confidence(confidence));
                response
            }
            AuthFailure::TimedOut { .. } => {
                AuthResponse::rejected(stage, "Tempo limite de processamento excedido")
                    .with_suggestions(["Tente novamente"])
            }
            AuthFailure::Internal(_) => {
                AuthResponse::rejected(stage, "Erro interno ao processar a autenticação")
            }
        }
    }
}

/// Resolve a liveness result into a report the pipeline can act on.
///
/// Detector faults pass the attempt through.
pub fn liveness_verdict(result: Result<LivenessReport, LivenessError>) -> LivenessReport {
    match result {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(error = %err, "liveness detector failed; allowing attempt");
            LivenessReport::fail_open(&err)
        }
    }
}

struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    fn new(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    /// Fail if the budget is spent before entering `stage`.
    fn check(&self, stage: Stage) -> Result<(), AuthFailure> {
        let elapsed = self.start.elapsed();
        if elapsed >= self.budget {
            tracing::warn!(
                ?stage,
                elapsed_ms = elapsed.as_millis() as u64,
                "time budget exhausted"
            );
            return Err(AuthFailure::TimedOut {
                stage,
                budget_ms: self.budget.as_millis(),
            });
        }
        Ok(())
    }
}

/// Why a gallery candidate was skipped.
#[derive(Error, Debug)]
enum CandidateError {
    #[error("photo: {0}")]
    Photo(#[from] GalleryError),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("no face in enrollment photo")]
    NoFace,
    #[error("descriptor length {enrolled} does not match capture length {captured}")]
    DimensionMismatch { captured: usize, enrolled: usize },
    #[error("analyzer: {0}")]
    Analyzer(#[from] AnalyzerError),
}

/// Descriptor for one enrollment photo.
///
/// Enhancement is best effort: a rejected photo is encoded as-is. Photos
/// with several faces use the most confident one.
fn encode_enrollment<A: FaceAnalyzer>(
    enhancer: &ImageEnhancer,
    analyzer: &mut A,
    photo: &[u8],
) -> Result<FaceDescriptor, CandidateError> {
    let raw = decode_bytes(photo)?;
    let image = match enhancer.enhance(&raw) {
        EnhanceOutcome::Enhanced { image, .. } => image,
        EnhanceOutcome::Rejected { reason, .. } => {
            tracing::debug!(?reason, "enrollment photo not enhanced; using original");
            raw
        }
    };
    let faces = analyzer.locate(&image)?;
    let face = faces.first().ok_or(CandidateError::NoFace)?;
    Ok(analyzer.encode(&image, face)?)
}

/// Runs authentication attempts against a gallery.
pub struct Authenticator<A, S> {
    config: PipelineConfig,
    assessor: QualityAssessor,
    enhancer: ImageEnhancer,
    liveness: LivenessDetector,
    matcher: AdaptiveMatcher,
    analyzer: A,
    store: S,
    cache: Option<Arc<EnrollmentDescriptorCache>>,
}

impl<A: FaceAnalyzer, S: PhotoStore> Authenticator<A, S> {
    pub fn new(config: PipelineConfig, analyzer: A, store: S) -> Self {
        Self {
            assessor: QualityAssessor::new(config.quality.clone()),
            enhancer: ImageEnhancer::new(config.enhancer.clone()),
            liveness: LivenessDetector::new(config.liveness.clone()),
            matcher: AdaptiveMatcher::new(config.matcher.clone()),
            config,
            analyzer,
            store,
            cache: None,
        }
    }

    /// Reuse enrollment descriptors across attempts.
    pub fn with_cache(mut self, cache: Arc<EnrollmentDescriptorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    /// Run one attempt and render the outcome for the caller.
    ///
    /// Panics inside any stage are caught here and reported as an internal
    /// failure.
    pub fn authenticate(&mut self, payload: &str, gallery: &Gallery) -> AuthResponse {
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.try_authenticate(payload, gallery)));
        match outcome {
            Ok(Ok(success)) => success.into(),
            Ok(Err(failure)) => failure.into(),
            Err(_) => {
                tracing::error!("authentication pipeline panicked");
                AuthFailure::Internal("pipeline panicked".to_string()).into()
            }
        }
    }

    /// Run one attempt, returning the typed outcome.
    pub fn try_authenticate(
        &mut self,
        payload: &str,
        gallery: &Gallery,
    ) -> Result<AuthSuccess, AuthFailure> {
        let deadline = Deadline::new(self.config.time_budget());

        let captured = decode_payload(payload).map_err(|e| {
            tracing::info!(error = %e, "rejecting payload");
            AuthFailure::InvalidPayload(e)
        })?;
        deadline.check(Stage::Quality)?;

        let quality = self.assessor.assess(&captured);
        if !quality.passed {
            tracing::info!(score = quality.score, "rejected: low quality");
            return Err(AuthFailure::LowQuality {
                score: quality.score,
                suggestions: quality.reasons,
            });
        }
        deadline.check(Stage::Enhance)?;

        let (enhanced, quality_score) = match self.enhancer.enhance(&captured) {
            EnhanceOutcome::Enhanced { image, score, .. } => (image, score),
            EnhanceOutcome::Rejected { reason, message, .. } => {
                tracing::info!(?reason, "rejected: enhancement");
                return Err(AuthFailure::EnhancementRejected {
                    reason,
                    message,
                    quality_score: quality.score,
                });
            }
        };
        drop(captured);
        deadline.check(Stage::Liveness)?;

        let liveness = liveness_verdict(self.liveness.analyze(&enhanced));
        if !liveness.is_live {
            tracing::warn!(score = liveness.score, reason = %liveness.reason, "rejected: liveness");
            return Err(AuthFailure::LivenessFailed {
                score: liveness.score,
                reason: liveness.reason,
                quality_score,
            });
        }
        deadline.check(Stage::Detect)?;

        let descriptor = self.encode_capture(&enhanced)?;
        deadline.check(Stage::Match)?;

        let scan = self.scan_gallery(&descriptor, gallery, quality_score, &deadline)?;
        match self.matcher.decide(&scan, quality_score) {
            MatchDecision::Accepted(result) => {
                let identity_id = result.matched_identity_id.unwrap_or_default();
                tracing::info!(
                    identity = %identity_id,
                    distance = result.distance,
                    confidence = result.confidence_percent,
                    quality = quality_score,
                    "authentication accepted"
                );
                Ok(AuthSuccess {
                    identity_id,
                    distance: result.distance,
                    confidence: result.confidence_percent,
                    quality_score,
                    liveness_score: liveness.score,
                })
            }
            MatchDecision::LowConfidence { result, minimum } => {
                tracing::info!(
                    confidence = result.confidence_percent,
                    minimum,
                    "rejected: low match confidence"
                );
                Err(AuthFailure::LowConfidence {
                    identity_id: result.matched_identity_id.unwrap_or_default(),
                    confidence: result.confidence_percent,
                    minimum,
                    quality_score,
                })
            }
            MatchDecision::NoMatch { tolerance } => {
                tracing::info!(tolerance, candidates = scan.offered(), "rejected: no match");
                Err(AuthFailure::NoMatch {
                    tolerance,
                    quality_score,
                })
            }
        }
    }

    fn encode_capture(&mut self, image: &CapturedImage) -> Result<FaceDescriptor, AuthFailure> {
        let faces = self.analyzer.locate(image).map_err(|e| {
            tracing::warn!(error = %e, "face detection failed");
            AuthFailure::DetectionFailed(e)
        })?;
        match faces.len() {
            0 => {
                tracing::info!("rejected: no face");
                Err(AuthFailure::NoFace)
            }
            1 => {
                let descriptor = self.analyzer.encode(image, &faces[0]).map_err(|e| {
                    tracing::warn!(error = %e, "face encoding failed");
                    AuthFailure::EncodingFailed(e)
                })?;
                if descriptor.is_empty() {
                    tracing::warn!("face encoding produced an empty descriptor");
                    return Err(AuthFailure::EncodingFailed(AnalyzerError::Encoding(
                        "empty descriptor".to_string(),
                    )));
                }
                Ok(descriptor)
            }
            n => {
                tracing::info!(faces = n, "rejected: multiple faces");
                Err(AuthFailure::MultipleFaces(n))
            }
        }
    }

    /// Compare against every candidate. Bad candidates are logged and skipped.
    fn scan_gallery(
        &mut self,
        captured: &FaceDescriptor,
        gallery: &Gallery,
        quality_score: f32,
        deadline: &Deadline,
    ) -> Result<BestCandidate, AuthFailure> {
        let mut scan = BestCandidate::new(self.matcher.tolerance_for(quality_score));
        for record in gallery.iter() {
            deadline.check(Stage::Match)?;
            let compared = self.enrollment_descriptor(record).and_then(|enrolled| {
                captured
                    .euclidean_distance(&enrolled)
                    .ok_or(CandidateError::DimensionMismatch {
                        captured: captured.len(),
                        enrolled: enrolled.len(),
                    })
            });
            match compared {
                Ok(distance) => {
                    tracing::debug!(identity = %record.identity_id, distance, "candidate compared");
                    scan.offer(&record.identity_id, distance);
                }
                Err(err) => {
                    tracing::warn!(
                        identity = %record.identity_id,
                        error = %err,
                        "skipping enrollment"
                    );
                }
            }
        }
        Ok(scan)
    }

    fn enrollment_descriptor(
        &mut self,
        record: &EnrollmentRecord,
    ) -> Result<FaceDescriptor, CandidateError> {
        let photo = self.store.load(&record.photo)?;
        let enhancer = &self.enhancer;
        let analyzer = &mut self.analyzer;
        match &self.cache {
            Some(cache) => cache.get_or_try_insert_with(&record.identity_id, &photo, || {
                encode_enrollment(enhancer, analyzer, &photo)
            }),
            None => encode_enrollment(enhancer, analyzer, &photo),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::ScriptedFaceAnalyzer;
    use crate::detector::DetectorError;
    use crate::gallery::MemoryPhotoStore;
    use crate::types::BoundingBox;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    const CAPTURE: (u32, u32) = (320, 240);

    /// Deterministic noise, every channel in 40..220.
    fn textured(size: (u32, u32), seed: u32) -> RgbImage {
        let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        RgbImage::from_fn(size.0, size.1, |_, _| {
            let mut channel = || {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                40 + ((state >> 24) % 180) as u8
            };
            Rgb([channel(), channel(), channel()])
        })
    }

    fn png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    fn payload(img: &RgbImage) -> String {
        STANDARD.encode(png(img))
    }

    /// Defaults, with the edge-density rule relaxed for synthetic noise.
    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.liveness.max_edge_density = 1.0;
        config
    }

    /// No faces anywhere and no enrollment photos.
    fn unscripted(config: PipelineConfig) -> Authenticator<ScriptedFaceAnalyzer, MemoryPhotoStore> {
        Authenticator::new(config, ScriptedFaceAnalyzer::new(), MemoryPhotoStore::new())
    }

    fn gallery(ids: &[&str]) -> Gallery {
        Gallery::from_records(ids.iter().map(|id| EnrollmentRecord::new(*id, format!("{id}.png"))))
    }

    fn store(entries: &[(&str, (u32, u32))]) -> MemoryPhotoStore {
        let mut store = MemoryPhotoStore::new();
        for (i, (id, size)) in entries.iter().enumerate() {
            store.insert(format!("{id}.png"), png(&textured(*size, 100 + i as u32)));
        }
        store
    }

    #[test]
    fn test_accepts_close_match() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, vec![0.0, 0.0])
            .with_face((321, 240), vec![0.30, 0.0]);
        let mut auth = Authenticator::new(test_config(), analyzer, store(&[("ana", (321, 240))]));

        let response = auth.authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&["ana"]));
        assert!(response.success, "unexpected rejection: {response:?}");
        assert_eq!(response.identity_id.as_deref(), Some("ana"));
        assert_eq!(response.confidence.as_deref(), Some("70.0%"));
        assert_eq!(response.stage, Stage::Match);
        assert!(response.liveness_score.unwrap() >= 50.0);
        assert!(response.quality_score.unwrap() >= 80.0);
    }

    #[test]
    fn test_low_confidence_under_tolerance() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, vec![0.0, 0.0])
            .with_face((321, 240), vec![0.55, 0.0]);
        let mut auth = Authenticator::new(test_config(), analyzer, store(&[("ana", (321, 240))]));

        let result = auth.try_authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&["ana"]));
        match result {
            Err(AuthFailure::LowConfidence {
                identity_id,
                confidence,
                minimum,
                ..
            }) => {
                assert_eq!(identity_id, "ana");
                assert!((confidence - 45.0).abs() < 1e-3);
                assert_eq!(minimum, 50.0);
            }
            other => panic!("expected low confidence, got {other:?}"),
        }

        let response = auth.authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&["ana"]));
        assert!(!response.success);
        assert_eq!(response.confidence.as_deref(), Some("45.0%"));
        assert!(response.identity_id.is_none());
    }

    #[test]
    fn test_blurry_capture_stops_at_quality() {
        let flat = RgbImage::from_pixel(64, 64, Rgb([120, 120, 120]));
        let mut auth = unscripted(test_config());

        let response = auth.authenticate(&payload(&flat), &gallery(&[]));
        assert!(!response.success);
        assert_eq!(response.stage, Stage::Quality);
        assert!(response.quality_score.unwrap() <= 70.0);
        assert!(response.suggestions.iter().any(|s| s.contains("desfocada")));
        assert_eq!(auth.analyzer().locate_calls(), 0);
    }

    #[test]
    fn test_unfocused_capture_rejected_by_enhancer() {
        // Smooth gradient: sharp enough overall to pass quality at 70, too soft to enhance.
        let gradient = RgbImage::from_fn(320, 240, |x, _| {
            let v = (x * 255 / 319) as u8;
            Rgb([v, v, v])
        });
        let mut auth = unscripted(test_config());

        let result = auth.try_authenticate(&payload(&gradient), &gallery(&[]));
        assert!(matches!(
            result,
            Err(AuthFailure::EnhancementRejected {
                reason: EnhanceReason::Unfocused,
                ..
            })
        ));
    }

    #[test]
    fn test_spoof_stops_before_matching() {
        let mut config = test_config();
        config.liveness.min_color_std = 1000.0;
        config.liveness.color_penalty = 55.0;
        let analyzer = ScriptedFaceAnalyzer::new().with_face(CAPTURE, vec![0.0]);
        let mut auth = Authenticator::new(config, analyzer, MemoryPhotoStore::new());

        let response = auth.authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&[]));
        assert!(!response.success);
        assert_eq!(response.stage, Stage::Liveness);
        assert_eq!(response.liveness_score, Some(45.0));
        assert!(response.message.contains("fraude"));
        assert_eq!(auth.analyzer().locate_calls(), 0);
    }

    #[test]
    fn test_liveness_fault_fails_open() {
        let err = LivenessError::TooSmall { width: 1, height: 1 };
        let report = liveness_verdict(Err(err));
        assert!(report.is_live);
        assert!(report.signals.is_none());
    }

    #[test]
    fn test_no_face_and_multiple_faces() {
        let mut auth = unscripted(test_config());
        let response = auth.authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&[]));
        assert_eq!(response.stage, Stage::Detect);
        assert_eq!(response.suggestions.len(), 3);

        let analyzer = ScriptedFaceAnalyzer::new().with_faces(CAPTURE, 2);
        let mut auth = Authenticator::new(test_config(), analyzer, MemoryPhotoStore::new());
        let result = auth.try_authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&[]));
        assert!(matches!(result, Err(AuthFailure::MultipleFaces(2))));
    }

    #[test]
    fn test_encoding_failure() {
        let analyzer = ScriptedFaceAnalyzer::new().with_unencodable_face(CAPTURE);
        let mut auth = Authenticator::new(test_config(), analyzer, MemoryPhotoStore::new());
        let response = auth.authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&[]));
        assert_eq!(response.stage, Stage::Encode);
        assert_eq!(response.suggestions, vec!["Tente novamente".to_string()]);
    }

    #[test]
    fn test_bad_enrollments_are_skipped() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, vec![0.0, 0.0])
            .with_face((322, 240), vec![0.2, 0.0]);
        let mut store = store(&[("sem_rosto", (330, 240)), ("bruno", (322, 240))]);
        store.insert("corrompida.png", b"not an image".to_vec());
        let gallery = gallery(&["corrompida", "ausente", "sem_rosto", "bruno"]);
        let mut auth = Authenticator::new(test_config(), analyzer, store);

        let success = auth.try_authenticate(&payload(&textured(CAPTURE, 1)), &gallery).unwrap();
        assert_eq!(success.identity_id, "bruno");
        assert!((success.distance - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_descriptors_are_skipped() {
        let capture = vec![0.9; 512];
        let mut close = capture.clone();
        close[0] = 0.6;
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, capture)
            .with_face((321, 240), Vec::new())
            .with_face((322, 240), vec![0.9; 128])
            .with_face((323, 240), close);
        let store = store(&[("vazia", (321, 240)), ("curta", (322, 240)), ("ana", (323, 240))]);
        let mut auth = Authenticator::new(test_config(), analyzer, store);
        let attempt = payload(&textured(CAPTURE, 1));

        let response = auth.authenticate(&attempt, &gallery(&["vazia"]));
        assert!(!response.success, "empty enrollment accepted: {response:?}");
        assert_eq!(response.stage, Stage::Match);

        let result = auth.try_authenticate(&attempt, &gallery(&["vazia", "curta"]));
        assert!(matches!(result, Err(AuthFailure::NoMatch { .. })), "got {result:?}");

        let success = auth
            .try_authenticate(&attempt, &gallery(&["vazia", "curta", "ana"]))
            .unwrap();
        assert_eq!(success.identity_id, "ana");
        assert!((success.distance - 0.3).abs() < 1e-4);
    }

    #[test]
    fn test_empty_capture_descriptor_is_encoding_failure() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, Vec::new())
            .with_face((321, 240), Vec::new());
        let mut auth = Authenticator::new(test_config(), analyzer, store(&[("ana", (321, 240))]));

        let result = auth.try_authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&["ana"]));
        assert!(matches!(result, Err(AuthFailure::EncodingFailed(_))), "got {result:?}");
        // gallery never scanned
        assert_eq!(auth.analyzer().encode_calls(), 1);
    }

    struct BrokenDetector;

    impl FaceAnalyzer for BrokenDetector {
        fn locate(&mut self, _image: &CapturedImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
            Err(DetectorError::InferenceFailed("session lost".to_string()).into())
        }

        fn encode(
            &mut self,
            _image: &CapturedImage,
            _face: &BoundingBox,
        ) -> Result<FaceDescriptor, AnalyzerError> {
            unreachable!()
        }
    }

    #[test]
    fn test_detection_fault_asks_for_retry() {
        let mut auth = Authenticator::new(test_config(), BrokenDetector, MemoryPhotoStore::new());

        let result = auth.try_authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&[]));
        assert!(matches!(result, Err(AuthFailure::DetectionFailed(_))), "got {result:?}");

        let response = auth.authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&[]));
        assert!(!response.success);
        assert_eq!(response.stage, Stage::Detect);
        assert_eq!(response.suggestions, vec!["Tente novamente".to_string()]);
    }

    #[test]
    fn test_gallery_order_does_not_change_result() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, vec![0.0, 0.0])
            .with_face((321, 240), vec![0.5, 0.0])
            .with_face((322, 240), vec![0.2, 0.0])
            .with_face((323, 240), vec![0.4, 0.0])
            .with_face((324, 240), vec![0.9, 0.0]);
        let store = store(&[
            ("a", (321, 240)),
            ("b", (322, 240)),
            ("c", (323, 240)),
            ("d", (324, 240)),
        ]);
        let mut auth = Authenticator::new(test_config(), analyzer, store);
        let attempt = payload(&textured(CAPTURE, 1));

        let mut ids = vec!["a", "b", "c", "d"];
        let expected = auth.try_authenticate(&attempt, &gallery(&ids)).unwrap();
        assert_eq!(expected.identity_id, "b");
        for _ in 0..ids.len() {
            ids.rotate_left(1);
            assert_eq!(auth.try_authenticate(&attempt, &gallery(&ids)).unwrap(), expected);
        }
        ids.reverse();
        assert_eq!(auth.try_authenticate(&attempt, &gallery(&ids)).unwrap(), expected);
    }

    #[test]
    fn test_picks_closest_candidate() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, vec![0.0, 0.0])
            .with_face((321, 240), vec![0.4, 0.0])
            .with_face((322, 240), vec![0.1, 0.0])
            .with_face((323, 240), vec![0.9, 0.0]);
        let store = store(&[("a", (321, 240)), ("b", (322, 240)), ("c", (323, 240))]);
        let mut auth = Authenticator::new(test_config(), analyzer, store);

        let success = auth
            .try_authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&["a", "b", "c"]))
            .unwrap();
        assert_eq!(success.identity_id, "b");
        // every candidate encoded plus the capture
        assert_eq!(auth.analyzer().encode_calls(), 4);
    }

    #[test]
    fn test_empty_gallery_is_no_match() {
        let analyzer = ScriptedFaceAnalyzer::new().with_face(CAPTURE, vec![0.0]);
        let mut auth = Authenticator::new(test_config(), analyzer, MemoryPhotoStore::new());
        let response = auth.authenticate(&payload(&textured(CAPTURE, 1)), &Gallery::default());
        assert!(!response.success);
        assert_eq!(response.stage, Stage::Match);
        assert_eq!(response.message, "Rosto não reconhecido");
    }

    #[test]
    fn test_cache_skips_reencoding() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, vec![0.0, 0.0])
            .with_face((321, 240), vec![0.3, 0.0]);
        let cache = Arc::new(EnrollmentDescriptorCache::new());
        let mut auth = Authenticator::new(test_config(), analyzer, store(&[("ana", (321, 240))]))
            .with_cache(Arc::clone(&cache));
        let attempt = payload(&textured(CAPTURE, 1));

        assert!(auth.authenticate(&attempt, &gallery(&["ana"])).success);
        assert!(auth.authenticate(&attempt, &gallery(&["ana"])).success);
        assert_eq!(auth.analyzer().encode_calls(), 3);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_duplicate_enrollment_encoded_once() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, vec![0.0, 0.0])
            .with_face((321, 240), vec![0.3, 0.0])
            .with_face((322, 240), vec![0.1, 0.0]);
        let store = MemoryPhotoStore::new()
            .with_photo("a1.png", png(&textured((321, 240), 7)))
            .with_photo("a2.png", png(&textured((322, 240), 8)));
        let gallery = Gallery::from_records([
            EnrollmentRecord::new("ana", "a1.png"),
            EnrollmentRecord::new("ana", "a2.png"),
        ]);
        let cache = Arc::new(EnrollmentDescriptorCache::new());
        let mut auth =
            Authenticator::new(test_config(), analyzer, store).with_cache(Arc::clone(&cache));
        let attempt = payload(&textured(CAPTURE, 1));

        let first = auth.try_authenticate(&attempt, &gallery).unwrap();
        let second = auth.try_authenticate(&attempt, &gallery).unwrap();
        assert_eq!(first, second);
        assert!((first.distance - 0.3).abs() < 1e-6);
        assert_eq!(gallery.len(), 1);
        assert_eq!(auth.analyzer().encode_calls(), 3);
    }

    #[test]
    fn test_data_uri_prefix_is_optional() {
        let analyzer = ScriptedFaceAnalyzer::new()
            .with_face(CAPTURE, vec![0.0, 0.0])
            .with_face((321, 240), vec![0.3, 0.0]);
        let mut auth = Authenticator::new(test_config(), analyzer, store(&[("ana", (321, 240))]));
        let bare = payload(&textured(CAPTURE, 1));
        let prefixed = format!("data:image/png;base64,{bare}");

        let a = auth.try_authenticate(&bare, &gallery(&["ana"])).unwrap();
        let b = auth.try_authenticate(&prefixed, &gallery(&["ana"])).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_payload() {
        let mut auth = unscripted(test_config());
        for bad in ["", "data:image/png;base64,", "!!!", "aGVsbG8="] {
            let response = auth.authenticate(bad, &gallery(&[]));
            assert!(!response.success);
            assert_eq!(response.stage, Stage::Decode, "payload {bad:?}");
        }
    }

    #[test]
    fn test_time_budget() {
        let mut config = test_config();
        config.time_budget_ms = 0;
        let mut auth = unscripted(config);
        let result = auth.try_authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&[]));
        assert!(matches!(
            result,
            Err(AuthFailure::TimedOut {
                stage: Stage::Quality,
                ..
            })
        ));
    }

    struct PanickingAnalyzer;

    impl FaceAnalyzer for PanickingAnalyzer {
        fn locate(&mut self, _image: &CapturedImage) -> Result<Vec<BoundingBox>, AnalyzerError> {
            panic!("backend crashed");
        }

        fn encode(
            &mut self,
            _image: &CapturedImage,
            _face: &BoundingBox,
        ) -> Result<FaceDescriptor, AnalyzerError> {
            unreachable!()
        }
    }

    #[test]
    fn test_panic_becomes_internal_failure() {
        let mut auth =
            Authenticator::new(test_config(), PanickingAnalyzer, MemoryPhotoStore::new());
        let response = auth.authenticate(&payload(&textured(CAPTURE, 1)), &gallery(&[]));
        assert!(!response.success);
        assert_eq!(response.stage, Stage::Internal);
    }

    #[test]
    fn test_response_json_shape() {
        let success: AuthResponse = AuthSuccess {
            identity_id: "ana".into(),
            distance: 0.3,
            confidence: 70.0,
            quality_score: 100.0,
            liveness_score: 80.0,
        }
        .into();
        let json = serde_json::to_value(&success).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["identity_id"], "ana");
        assert_eq!(json["confidence"], "70.0%");
        assert_eq!(json["stage"], "match");
        assert!(json.get("suggestions").is_none());

        let failure: AuthResponse = AuthFailure::NoFace.into();
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["stage"], "detect");
        assert!(json.get("identity_id").is_none());
        assert_eq!(json["suggestions"].as_array().unwrap().len(), 3);
    }
}
