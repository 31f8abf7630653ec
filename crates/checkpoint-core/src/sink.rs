//! Outcome reporting boundary consumed by the presentation layer.

use crate::types::{Channel, EnrollmentRecord};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Matched,
    Rejected,
}

/// Why a session reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    FaceMatched,
    FaceNotRecognised,
    NoFaceAtStrictPass,
    NoEnrollments,
    InvalidEmbedding,
    GalleryUnavailable,
    CredentialPreAuthorized,
    CredentialEnrolled,
    CredentialNotFound,
    CredentialMalformed,
    CredentialServiceError,
}

/// Terminal outcome of one verification session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub session_id: Uuid,
    pub channel: Channel,
    pub outcome: Outcome,
    /// Similarity of the closest candidate, reported on rejection too.
    pub match_percent: u8,
    pub record: Option<EnrollmentRecord>,
    pub reason: Reason,
    pub message: String,
}

/// Non-terminal status updates.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusNotice {
    Scanning { session_id: Uuid, channel: Channel },
    CaptureFault { error: String, retry_in: Duration },
    RetriesExhausted { attempts: u32 },
}

pub trait ResultSink: Send + Sync {
    /// Called exactly once per session, on terminal state entry.
    fn report(&self, report: &VerificationReport);

    fn notice(&self, _notice: &StatusNotice) {}
}

/// Sink that writes outcomes to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ResultSink for TracingSink {
    fn report(&self, report: &VerificationReport) {
        tracing::info!(
            session = %report.session_id,
            channel = %report.channel,
            outcome = ?report.outcome,
            match_percent = report.match_percent,
            record = ?report.record.as_ref().map(|r| r.id),
            reason = ?report.reason,
            "{}",
            report.message
        );
    }

    fn notice(&self, notice: &StatusNotice) {
        match notice {
            StatusNotice::Scanning { session_id, channel } => {
                tracing::info!(session = %session_id, %channel, "scanning");
            }
            StatusNotice::CaptureFault { error, retry_in } => {
                tracing::warn!(
                    error = %error,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "capture fault; retrying"
                );
            }
            StatusNotice::RetriesExhausted { attempts } => {
                tracing::error!(attempts, "capture retries exhausted; scanning stopped");
            }
        }
    }
}
