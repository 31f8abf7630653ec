//! Nearest-neighbour face matching over the enrollment gallery.
//!
//! The gallery is scanned in the order it is handed in (galleries return
//! insertion order). In the default [`MatchMode::FirstUnderThreshold`] mode
//! the scan stops at the first record closer than the strict threshold, so
//! that record wins even if a closer one is enrolled later.

use crate::types::{match_percent, Embedding, EnrollmentRecord, MatchResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_STRICT_THRESHOLD: f32 = 0.4;
pub const DEFAULT_MIN_MATCH_PERCENT: u8 = 60;
pub const DEFAULT_EMBEDDING_DIM: usize = 128;

/// Starting best distance. A record must beat it to become a candidate.
const SENTINEL_DISTANCE: f32 = 1.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("invalid probe embedding: expected {expected} finite components, got {actual}")]
    InvalidEmbedding { expected: usize, actual: usize },
    #[error("no enrolled face embeddings in the gallery")]
    NoEnrollments,
}

/// Gallery traversal strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    /// Stop at the first record under the strict threshold.
    #[default]
    FirstUnderThreshold,
    /// Compare every record and keep the closest (first enumerated on ties).
    Exhaustive,
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-under-threshold" => Ok(MatchMode::FirstUnderThreshold),
            "exhaustive" => Ok(MatchMode::Exhaustive),
            other => Err(format!("unknown match mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchPolicy {
    pub dimension: usize,
    /// A record strictly closer than this is accepted.
    pub strict_threshold: f32,
    /// Accepted matches must also score strictly above this percentage.
    pub min_match_percent: u8,
    pub mode: MatchMode,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_EMBEDDING_DIM,
            strict_threshold: DEFAULT_STRICT_THRESHOLD,
            min_match_percent: DEFAULT_MIN_MATCH_PERCENT,
            mode: MatchMode::FirstUnderThreshold,
        }
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrollments.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[EnrollmentRecord],
    ) -> Result<MatchResult, MatchError>;
}

/// Euclidean-distance matcher.
#[derive(Debug, Clone, Default)]
pub struct EuclideanMatcher {
    policy: MatchPolicy,
}

impl EuclideanMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[EnrollmentRecord],
    ) -> Result<MatchResult, MatchError> {
        let dimension = self.policy.dimension;
        if !probe.is_well_formed(dimension) {
            return Err(MatchError::InvalidEmbedding {
                expected: dimension,
                actual: probe.values.len(),
            });
        }

        let strict = self.policy.strict_threshold;
        let mut best_distance = SENTINEL_DISTANCE;
        let mut best_idx: Option<usize> = None;
        let mut compared = 0usize;
        let mut early_exit = false;

        for (i, record) in gallery.iter().enumerate() {
            // Credential-only and malformed records never take part in face matching.
            let Some(enrolled) = record
                .embedding
                .as_ref()
                .filter(|e| e.is_well_formed(dimension))
            else {
                continue;
            };
            compared += 1;

            let distance = probe.distance(enrolled);
            if distance < best_distance {
                best_distance = distance;
                best_idx = Some(i);
            }

            if self.policy.mode == MatchMode::FirstUnderThreshold && distance < strict {
                best_distance = distance;
                best_idx = Some(i);
                early_exit = true;
                break;
            }
        }

        if compared == 0 {
            return Err(MatchError::NoEnrollments);
        }

        let percent = match_percent(best_distance);
        let matched =
            best_idx.is_some() && best_distance < strict && percent > self.policy.min_match_percent;

        tracing::debug!(
            compared,
            early_exit,
            best_distance,
            match_percent = percent,
            matched,
            "face match computed"
        );

        Ok(MatchResult {
            matched,
            best_distance,
            candidate: best_idx.map(|idx| gallery[idx].clone()),
            match_percent: percent,
        })
    }
}
