//! Gallery matching with quality-adaptive tolerance.
//!
//! Better captures get a stricter distance tolerance. The closest
//! candidate under tolerance is then converted to a confidence percentage
//! and must clear a (also quality-dependent) minimum confidence.

use crate::types::MatchResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Quality score at or above which `strict_tolerance` applies.
    pub strict_quality: f32,
    pub strict_tolerance: f32,
    /// Quality score at or above which `standard_tolerance` applies.
    pub standard_quality: f32,
    pub standard_tolerance: f32,
    /// Tolerance for everything below `standard_quality`.
    pub lenient_tolerance: f32,
    /// Quality score at or above which `min_confidence_high` applies.
    pub confident_quality: f32,
    pub min_confidence_high: f32,
    pub min_confidence_low: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            strict_quality: 80.0,
            strict_tolerance: 0.60,
            standard_quality: 60.0,
            standard_tolerance: 0.65,
            lenient_tolerance: 0.70,
            confident_quality: 70.0,
            min_confidence_high: 50.0,
            min_confidence_low: 45.0,
        }
    }
}

/// Final matcher verdict for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Accepted(MatchResult),
    /// Closest candidate was under tolerance but its confidence is below `minimum`.
    LowConfidence { result: MatchResult, minimum: f32 },
    NoMatch { tolerance: f32 },
}

/// Running minimum over a gallery scan.
///
/// A candidate replaces the current best only when its distance is
/// strictly below both the tolerance and the best so far, so equal
/// distances keep the first one offered. NaN and infinite distances are
/// counted but never selected.
#[derive(Debug, Clone)]
pub struct BestCandidate {
    tolerance: f32,
    best: Option<(String, f32)>,
    offered: usize,
}

impl BestCandidate {
    pub fn new(tolerance: f32) -> Self {
        Self {
            tolerance,
            best: None,
            offered: 0,
        }
    }

    pub fn offer(&mut self, identity_id: &str, distance: f32) {
        self.offered += 1;
        if !distance.is_finite() || distance >= self.tolerance {
            return;
        }
        let better = match &self.best {
            None => true,
            Some((_, best)) => distance < *best,
        };
        if better {
            self.best = Some((identity_id.to_string(), distance));
        }
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// Number of candidates compared so far.
    pub fn offered(&self) -> usize {
        self.offered
    }

    pub fn best(&self) -> Option<(&str, f32)> {
        self.best.as_ref().map(|(id, d)| (id.as_str(), *d))
    }
}

/// Euclidean-distance matcher with quality-adaptive thresholds.
///
/// The caller feeds every gallery distance into a [`BestCandidate`] built
/// from [`AdaptiveMatcher::tolerance_for`]; there is no early exit on a
/// good match.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveMatcher {
    config: MatcherConfig,
}

impl AdaptiveMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Distance tolerance for a capture of the given quality.
    pub fn tolerance_for(&self, quality: f32) -> f32 {
        let c = &self.config;
        if quality >= c.strict_quality {
            c.strict_tolerance
        } else if quality >= c.standard_quality {
            c.standard_tolerance
        } else {
            c.lenient_tolerance
        }
    }

    /// Minimum accepted confidence percentage for a capture of the given quality.
    pub fn min_confidence_for(&self, quality: f32) -> f32 {
        if quality >= self.config.confident_quality {
            self.config.min_confidence_high
        } else {
            self.config.min_confidence_low
        }
    }

    /// Turn a finished scan into a verdict.
    pub fn decide(&self, scan: &BestCandidate, quality: f32) -> MatchDecision {
        let tolerance = scan.tolerance();
        let Some((identity, distance)) = scan.best() else {
            return MatchDecision::NoMatch { tolerance };
        };

        let result = MatchResult {
            matched_identity_id: Some(identity.to_string()),
            distance,
            confidence_percent: confidence(distance),
            tolerance_used: tolerance,
        };
        let minimum = self.min_confidence_for(quality);
        if result.confidence_percent < minimum {
            MatchDecision::LowConfidence { result, minimum }
        } else {
            MatchDecision::Accepted(result)
        }
    }
}

/// Confidence percentage for a descriptor distance.
pub fn confidence(distance: f32) -> f32 {
    (1.0 - distance) * 100.0
}
