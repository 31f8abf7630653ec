//! Verification state machine.
//!
//! ```text
//! Idle -> AwaitingCapability -> Scanning -> CandidateLocked -> Deciding -> Matched | Rejected
//!                  ^                |                                            |
//!                  |                +-- (credential) Decoded -> Deciding --------+
//!                  |                                                             |
//!                  +---------------------- reset ---------------------------------+
//! any capture fault -> Error -> (backoff) -> AwaitingCapability
//! ```
//!
//! The machine is synchronous and takes the current instant as an argument;
//! [`crate::driver`] supplies the timers.

use crate::capture::{
    BiometricDetector, CaptureFault, Collaborators, CredentialReader, FrameSource,
};
use crate::credential::{CredentialValidator, CredentialVerdict, VerdictKind};
use crate::gallery::IdentityGallery;
use crate::matcher::{EuclideanMatcher, MatchError, Matcher};
use crate::sink::{Outcome, Reason, ResultSink, StatusNotice, VerificationReport};
use crate::types::{Channel, EnrollmentRecord};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_PRESENCE_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_DECODE_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(2000);
pub const DEFAULT_STRICT_MIN_CONFIDENCE: f32 = 0.7;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("cannot {action} while {state:?}")]
    InvalidTransition {
        state: VerificationState,
        action: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Idle,
    AwaitingCapability,
    Scanning,
    CandidateLocked,
    Decoded,
    Deciding,
    Matched,
    Rejected,
    Error,
}

impl VerificationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, VerificationState::Matched | VerificationState::Rejected)
    }
}

/// Timing and retry policy for a state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanPolicy {
    pub presence_interval: Duration,
    pub decode_interval: Duration,
    pub retry_backoff: Duration,
    /// `None` retries forever.
    pub max_capability_retries: Option<u32>,
    pub strict_min_confidence: f32,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            presence_interval: DEFAULT_PRESENCE_INTERVAL,
            decode_interval: DEFAULT_DECODE_INTERVAL,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_capability_retries: None,
            strict_min_confidence: DEFAULT_STRICT_MIN_CONFIDENCE,
        }
    }
}

/// What a single scan tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not scanning, or a decision is in flight.
    Suppressed,
    /// Nothing in frame.
    Empty,
    CandidateLocked,
    Decided(Outcome),
    Faulted,
}

/// Per-attempt session state. Replaced wholesale on reset or channel switch.
#[derive(Debug, Clone)]
pub struct VerificationSession {
    id: Uuid,
    channel: Channel,
    state: VerificationState,
    started_at: Instant,
    state_entered_at: Instant,
    /// Single-flight guard: set on candidate lock or decode, cleared on
    /// terminal entry, error or reset.
    in_flight: bool,
    consecutive_faults: u32,
    retry_at: Option<Instant>,
    report: Option<VerificationReport>,
}

impl VerificationSession {
    fn new(channel: Channel, now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            state: VerificationState::Idle,
            started_at: now,
            state_entered_at: now,
            in_flight: false,
            consecutive_faults: 0,
            retry_at: None,
            report: None,
        }
    }

    fn enter(&mut self, state: VerificationState, now: Instant) {
        tracing::debug!(
            session = %self.id,
            channel = %self.channel,
            from = ?self.state,
            to = ?state,
            "state transition"
        );
        self.state = state;
        self.state_entered_at = now;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn state_entered_at(&self) -> Instant {
        self.state_entered_at
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn report(&self) -> Option<&VerificationReport> {
        self.report.as_ref()
    }
}

/// Point-in-time view of a session, safe to hand across tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub channel: Channel,
    pub state: VerificationState,
    pub in_flight: bool,
    pub report: Option<VerificationReport>,
}

pub struct VerificationStateMachine {
    policy: ScanPolicy,
    source: Box<dyn FrameSource>,
    detector: Box<dyn BiometricDetector>,
    reader: Box<dyn CredentialReader>,
    gallery: Arc<dyn IdentityGallery>,
    sink: Arc<dyn ResultSink>,
    matcher: EuclideanMatcher,
    validator: CredentialValidator,
    session: VerificationSession,
    capture_open: bool,
}

impl VerificationStateMachine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Channel,
        policy: ScanPolicy,
        collaborators: Collaborators,
        gallery: Arc<dyn IdentityGallery>,
        sink: Arc<dyn ResultSink>,
        matcher: EuclideanMatcher,
        validator: CredentialValidator,
        now: Instant,
    ) -> Self {
        Self {
            policy,
            source: collaborators.source,
            detector: collaborators.detector,
            reader: collaborators.reader,
            gallery,
            sink,
            matcher,
            validator,
            session: VerificationSession::new(channel, now),
            capture_open: false,
        }
    }

    pub fn session(&self) -> &VerificationSession {
        &self.session
    }

    pub fn state(&self) -> VerificationState {
        self.session.state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session.id,
            channel: self.session.channel,
            state: self.session.state,
            in_flight: self.session.in_flight,
            report: self.session.report.clone(),
        }
    }

    /// Tick period while scanning; `None` means the tick timer must not run.
    pub fn tick_period(&self) -> Option<Duration> {
        if self.session.state != VerificationState::Scanning || self.session.in_flight {
            return None;
        }
        Some(match self.session.channel {
            Channel::Biometric => self.policy.presence_interval,
            Channel::Credential => self.policy.decode_interval,
        })
    }

    /// When the next capability retry is due, while in `Error`.
    pub fn retry_deadline(&self) -> Option<Instant> {
        if self.session.state == VerificationState::Error {
            self.session.retry_at
        } else {
            None
        }
    }

    /// Startup: `Idle -> AwaitingCapability`, then acquire capture.
    pub fn start(&mut self, now: Instant) -> Result<VerificationState, SessionError> {
        self.expect_state(VerificationState::Idle, "start")?;
        self.session.enter(VerificationState::AwaitingCapability, now);
        self.acquire(now);
        Ok(self.session.state)
    }

    /// Retry acquisition from `Error` once the backoff has elapsed.
    pub fn retry_capability(&mut self, now: Instant) -> Result<VerificationState, SessionError> {
        self.expect_state(VerificationState::Error, "retry capability")?;
        match self.session.retry_at {
            Some(due) if now >= due => {
                self.session.enter(VerificationState::AwaitingCapability, now);
                self.acquire(now);
            }
            _ => {}
        }
        Ok(self.session.state)
    }

    /// One scan tick: a frame through the presence detector (biometric) or
    /// the code reader (credential).
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.session.state != VerificationState::Scanning || self.session.in_flight {
            return TickOutcome::Suppressed;
        }

        let frame = match self.source.frame() {
            Ok(frame) => frame,
            Err(fault) => {
                self.fail(fault, now);
                return TickOutcome::Faulted;
            }
        };

        match self.session.channel {
            Channel::Biometric => match self.detector.detect_presence(&frame) {
                Ok(None) => TickOutcome::Empty,
                Ok(Some(landmarks)) => {
                    self.session.in_flight = true;
                    tracing::debug!(
                        session = %self.session.id,
                        confidence = landmarks.confidence,
                        frame = frame.sequence,
                        "face present; candidate locked"
                    );
                    self.session.enter(VerificationState::CandidateLocked, now);
                    TickOutcome::CandidateLocked
                }
                Err(fault) => {
                    self.fail(fault, now);
                    TickOutcome::Faulted
                }
            },
            Channel::Credential => match self.reader.decode(&frame) {
                Ok(None) => TickOutcome::Empty,
                Ok(Some(payload)) => TickOutcome::Decided(self.decide_credential(&payload, now)),
                Err(fault) => {
                    self.fail(fault, now);
                    TickOutcome::Faulted
                }
            },
        }
    }

    /// Strict detection pass and gallery match for a locked candidate.
    pub fn decide(&mut self, now: Instant) -> Result<TickOutcome, SessionError> {
        self.expect_state(VerificationState::CandidateLocked, "decide")?;

        let frame = match self.source.frame() {
            Ok(frame) => frame,
            Err(fault) => {
                self.fail(fault, now);
                return Ok(TickOutcome::Faulted);
            }
        };

        let detection = match self
            .detector
            .detect_and_extract(&frame, self.policy.strict_min_confidence)
        {
            Ok(detection) => detection,
            Err(fault) => {
                self.fail(fault, now);
                return Ok(TickOutcome::Faulted);
            }
        };

        let Some(detection) = detection else {
            let outcome = self.conclude(
                Outcome::Rejected,
                0,
                None,
                Reason::NoFaceAtStrictPass,
                "face not detected at strict confidence; try again".into(),
                now,
            );
            return Ok(TickOutcome::Decided(outcome));
        };

        self.session.enter(VerificationState::Deciding, now);

        let records = match self.gallery.scan_all() {
            Ok(records) => records,
            Err(err) => {
                tracing::warn!(session = %self.session.id, error = %err, "gallery scan failed");
                let outcome = self.conclude(
                    Outcome::Rejected,
                    0,
                    None,
                    Reason::GalleryUnavailable,
                    "gallery read error".into(),
                    now,
                );
                return Ok(TickOutcome::Decided(outcome));
            }
        };

        let outcome = match self.matcher.compare(&detection.embedding, &records) {
            Ok(result) if result.matched => {
                let record = result.candidate;
                let message = match &record {
                    Some(r) => format!(
                        "face verified: {} ({}, {}, {}), {}% match",
                        r.name, r.position, r.rank, r.unit_type, result.match_percent
                    ),
                    None => format!("face verified, {}% match", result.match_percent),
                };
                self.conclude(
                    Outcome::Matched,
                    result.match_percent,
                    record,
                    Reason::FaceMatched,
                    message,
                    now,
                )
            }
            Ok(result) => self.conclude(
                Outcome::Rejected,
                result.match_percent,
                None,
                Reason::FaceNotRecognised,
                format!(
                    "face not recognised; closest match {}%",
                    result.match_percent
                ),
                now,
            ),
            Err(MatchError::NoEnrollments) => self.conclude(
                Outcome::Rejected,
                0,
                None,
                Reason::NoEnrollments,
                "no enrolled faces; enroll before verifying".into(),
                now,
            ),
            Err(err @ MatchError::InvalidEmbedding { .. }) => self.conclude(
                Outcome::Rejected,
                0,
                None,
                Reason::InvalidEmbedding,
                err.to_string(),
                now,
            ),
        };
        Ok(TickOutcome::Decided(outcome))
    }

    /// External decode event on the credential channel.
    pub fn on_decoded(&mut self, payload: &str, now: Instant) -> Result<Outcome, SessionError> {
        if self.session.channel != Channel::Credential {
            return Err(SessionError::InvalidTransition {
                state: self.session.state,
                action: "accept a decoded credential on the biometric channel",
            });
        }
        self.expect_state(VerificationState::Scanning, "accept a decoded credential")?;
        if self.session.in_flight {
            return Err(SessionError::InvalidTransition {
                state: self.session.state,
                action: "accept a second decoded credential",
            });
        }
        Ok(self.decide_credential(payload, now))
    }

    /// User reset from a terminal state, or from `Error` once capability
    /// retries are exhausted: release capture, fresh session, re-acquire.
    pub fn reset(&mut self, now: Instant) -> Result<VerificationState, SessionError> {
        let exhausted =
            self.session.state == VerificationState::Error && self.session.retry_at.is_none();
        if !self.session.state.is_terminal() && !exhausted {
            return Err(SessionError::InvalidTransition {
                state: self.session.state,
                action: "reset",
            });
        }
        self.restart(self.session.channel, now);
        Ok(self.session.state)
    }

    /// Abandon the current session and start scanning on `channel`.
    pub fn switch_channel(&mut self, channel: Channel, now: Instant) -> VerificationState {
        if self.session.state == VerificationState::Idle {
            self.session = VerificationSession::new(channel, now);
        } else {
            self.restart(channel, now);
        }
        self.session.state
    }

    /// Release capture resources. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        self.release_capture();
    }

    fn restart(&mut self, channel: Channel, now: Instant) {
        self.release_capture();
        tracing::info!(previous = %self.session.id, %channel, "starting new session");
        self.session = VerificationSession::new(channel, now);
        self.session.enter(VerificationState::AwaitingCapability, now);
        self.acquire(now);
    }

    fn decide_credential(&mut self, payload: &str, now: Instant) -> Outcome {
        self.session.in_flight = true;
        self.session.enter(VerificationState::Decoded, now);
        // A decode stops scanning immediately.
        self.release_capture();
        self.session.enter(VerificationState::Deciding, now);

        let verdict = match self.validator.validate(payload, self.gallery.as_ref()) {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::debug!(
                    session = %self.session.id,
                    error = %err,
                    "credential validation failed"
                );
                CredentialVerdict::from_error(&err)
            }
        };

        let reason = match verdict.kind {
            VerdictKind::PreAuthorized => Reason::CredentialPreAuthorized,
            VerdictKind::Enrolled => Reason::CredentialEnrolled,
            VerdictKind::NotFound => Reason::CredentialNotFound,
            VerdictKind::Malformed => Reason::CredentialMalformed,
            VerdictKind::ServiceError => Reason::CredentialServiceError,
        };
        let (outcome, percent) = if verdict.is_valid() {
            (Outcome::Matched, 100)
        } else {
            (Outcome::Rejected, 0)
        };
        self.conclude(outcome, percent, verdict.matched_record, reason, verdict.message, now)
    }

    fn conclude(
        &mut self,
        outcome: Outcome,
        match_percent: u8,
        record: Option<EnrollmentRecord>,
        reason: Reason,
        message: String,
        now: Instant,
    ) -> Outcome {
        let report = VerificationReport {
            session_id: self.session.id,
            channel: self.session.channel,
            outcome,
            match_percent,
            record,
            reason,
            message,
        };
        let state = match outcome {
            Outcome::Matched => VerificationState::Matched,
            Outcome::Rejected => VerificationState::Rejected,
        };
        self.session.enter(state, now);
        self.session.in_flight = false;
        tracing::info!(
            session = %self.session.id,
            channel = %self.session.channel,
            ?outcome,
            match_percent,
            ?reason,
            "verification concluded"
        );
        self.sink.report(&report);
        self.session.report = Some(report);
        outcome
    }

    fn acquire(&mut self, now: Instant) {
        // Stop-then-restart: never open on top of a live stream.
        self.release_capture();

        let acquired = self.detector.ready().and_then(|()| self.source.open());
        match acquired {
            Ok(()) => {
                self.capture_open = true;
                self.session.consecutive_faults = 0;
                self.session.retry_at = None;
                self.session.enter(VerificationState::Scanning, now);
                self.sink.notice(&StatusNotice::Scanning {
                    session_id: self.session.id,
                    channel: self.session.channel,
                });
            }
            Err(fault) => self.fail(fault, now),
        }
    }

    fn fail(&mut self, fault: CaptureFault, now: Instant) {
        self.release_capture();
        self.session.in_flight = false;
        self.session.consecutive_faults += 1;
        self.session.enter(VerificationState::Error, now);

        let retries_used = self.session.consecutive_faults - 1;
        if self
            .policy
            .max_capability_retries
            .is_some_and(|max| retries_used >= max)
        {
            self.session.retry_at = None;
            tracing::error!(
                session = %self.session.id,
                error = %fault,
                attempts = self.session.consecutive_faults,
                "capture fault; retries exhausted"
            );
            self.sink.notice(&StatusNotice::RetriesExhausted {
                attempts: self.session.consecutive_faults,
            });
            return;
        }

        self.session.retry_at = Some(now + self.policy.retry_backoff);
        tracing::warn!(
            session = %self.session.id,
            error = %fault,
            retry_in_ms = self.policy.retry_backoff.as_millis() as u64,
            "capture fault"
        );
        self.sink.notice(&StatusNotice::CaptureFault {
            error: fault.to_string(),
            retry_in: self.policy.retry_backoff,
        });
    }

    fn release_capture(&mut self) {
        if self.capture_open {
            self.source.close();
            self.capture_open = false;
            tracing::debug!(session = %self.session.id, "capture released");
        }
    }

    fn expect_state(
        &self,
        expected: VerificationState,
        action: &'static str,
    ) -> Result<(), SessionError> {
        if self.session.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition {
                state: self.session.state,
                action,
            })
        }
    }
}

impl Drop for VerificationStateMachine {
    fn drop(&mut self) {
        self.release_capture();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialRange;
    use crate::gallery::MemoryGallery;
    use crate::matcher::MatchPolicy;
    use crate::testing::{
        enrollment, offset, CaptureProbe, FakeDetector, FakeReader, FakeSource, RecordingSink,
        UnavailableGallery, DIM,
    };
    use crate::types::Embedding;

    struct Harness {
        machine: VerificationStateMachine,
        probe: CaptureProbe,
        sink: Arc<RecordingSink>,
        gallery: Arc<MemoryGallery>,
        now: Instant,
    }

    fn harness(channel: Channel) -> Harness {
        harness_with(channel, ScanPolicy::default(), None)
    }

    fn harness_with(
        channel: Channel,
        policy: ScanPolicy,
        gallery_override: Option<Arc<dyn IdentityGallery>>,
    ) -> Harness {
        let probe = CaptureProbe::default();
        let sink = Arc::new(RecordingSink::default());
        let gallery = Arc::new(MemoryGallery::new(DIM));
        let now = Instant::now();
        let machine = VerificationStateMachine::new(
            channel,
            policy,
            Collaborators {
                source: Box::new(FakeSource::new(probe.clone())),
                detector: Box::new(FakeDetector::new(probe.clone())),
                reader: Box::new(FakeReader::new(probe.clone())),
            },
            gallery_override.unwrap_or_else(|| gallery.clone() as Arc<dyn IdentityGallery>),
            sink.clone(),
            EuclideanMatcher::new(MatchPolicy {
                dimension: DIM,
                ..MatchPolicy::default()
            }),
            CredentialValidator::new(CredentialRange::contiguous(130_000, 130_249)),
            now,
        );
        Harness {
            machine,
            probe,
            sink,
            gallery,
            now,
        }
    }

    fn live() -> Embedding {
        Embedding::new(vec![0.25; DIM])
    }

    #[test]
    fn test_start_reaches_scanning() {
        let mut h = harness(Channel::Biometric);
        assert_eq!(h.machine.state(), VerificationState::Idle);
        assert_eq!(h.machine.start(h.now).unwrap(), VerificationState::Scanning);
        assert_eq!(h.probe.opens(), 1);
        assert_eq!(h.machine.tick_period(), Some(DEFAULT_PRESENCE_INTERVAL));
        assert!(h.machine.start(h.now).is_err());
    }

    #[test]
    fn test_empty_ticks_are_idempotent() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        for _ in 0..1000 {
            assert_eq!(h.machine.tick(h.now), TickOutcome::Empty);
        }
        assert_eq!(h.machine.state(), VerificationState::Scanning);
        assert_eq!(h.probe.presence_calls(), 1000);
        assert!(h.sink.reports().is_empty());
    }

    #[test]
    fn test_presence_locks_once_and_suppresses_ticks() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        h.probe.set_presence(true);

        assert_eq!(h.machine.tick(h.now), TickOutcome::CandidateLocked);
        assert_eq!(h.machine.state(), VerificationState::CandidateLocked);
        assert!(h.machine.session().in_flight());
        assert_eq!(h.machine.tick_period(), None);

        for _ in 0..10 {
            assert_eq!(h.machine.tick(h.now), TickOutcome::Suppressed);
        }
        assert_eq!(h.probe.presence_calls(), 1);
        assert_eq!(h.machine.state(), VerificationState::CandidateLocked);
    }

    #[test]
    fn test_identical_embedding_matches_at_100() {
        let mut h = harness(Channel::Biometric);
        h.gallery.insert(enrollment(500, Some(live()))).unwrap();
        h.machine.start(h.now).unwrap();
        h.probe.set_presence(true);
        h.probe.set_extraction(Some(live()));

        h.machine.tick(h.now);
        let decided = h.machine.decide(h.now).unwrap();
        assert_eq!(decided, TickOutcome::Decided(Outcome::Matched));
        assert_eq!(h.machine.state(), VerificationState::Matched);
        assert!(!h.machine.session().in_flight());

        let reports = h.sink.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].match_percent, 100);
        assert_eq!(reports[0].reason, Reason::FaceMatched);
        assert_eq!(reports[0].record.as_ref().unwrap().credential_code, 500);
        assert_eq!(h.probe.strict_confidence(), Some(DEFAULT_STRICT_MIN_CONFIDENCE));
    }

    #[test]
    fn test_distance_half_is_rejected_at_50() {
        let mut h = harness(Channel::Biometric);
        h.gallery.insert(enrollment(500, Some(live()))).unwrap();
        h.machine.start(h.now).unwrap();
        h.probe.set_presence(true);
        h.probe.set_extraction(Some(offset(&live(), 0.5)));

        h.machine.tick(h.now);
        h.machine.decide(h.now).unwrap();
        assert_eq!(h.machine.state(), VerificationState::Rejected);
        let report = h.sink.reports().pop().unwrap();
        assert_eq!(report.outcome, Outcome::Rejected);
        assert_eq!(report.match_percent, 50);
        assert_eq!(report.reason, Reason::FaceNotRecognised);
        assert!(report.record.is_none());
    }

    #[test]
    fn test_terminal_state_suppresses_ticks_until_reset() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        h.probe.set_presence(true);
        h.machine.tick(h.now);
        h.machine.decide(h.now).unwrap();
        // No extraction configured: strict pass finds nothing.
        assert_eq!(h.machine.state(), VerificationState::Rejected);
        assert_eq!(h.sink.reports()[0].reason, Reason::NoFaceAtStrictPass);

        assert_eq!(h.machine.tick(h.now), TickOutcome::Suppressed);
        assert_eq!(h.probe.presence_calls(), 1);

        let first_session = h.machine.session().id();
        assert_eq!(h.machine.reset(h.now).unwrap(), VerificationState::Scanning);
        assert_ne!(h.machine.session().id(), first_session);
        assert!(h.machine.session().report().is_none());
        assert_eq!(h.probe.opens(), 2);
        assert_eq!(h.probe.closes(), 1);
        assert_eq!(h.machine.tick(h.now), TickOutcome::CandidateLocked);
    }

    #[test]
    fn test_reset_outside_terminal_is_rejected() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        let err = h.machine.reset(h.now).unwrap_err();
        assert_eq!(
            err,
            SessionError::InvalidTransition {
                state: VerificationState::Scanning,
                action: "reset"
            }
        );
    }

    #[test]
    fn test_decide_requires_candidate() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        assert!(h.machine.decide(h.now).is_err());
    }

    #[test]
    fn test_empty_gallery_reports_no_enrollments() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        h.probe.set_presence(true);
        h.probe.set_extraction(Some(live()));
        h.machine.tick(h.now);
        h.machine.decide(h.now).unwrap();
        assert_eq!(h.sink.reports()[0].reason, Reason::NoEnrollments);
    }

    #[test]
    fn test_gallery_failure_rejects() {
        let mut h = harness_with(
            Channel::Biometric,
            ScanPolicy::default(),
            Some(Arc::new(UnavailableGallery)),
        );
        h.machine.start(h.now).unwrap();
        h.probe.set_presence(true);
        h.probe.set_extraction(Some(live()));
        h.machine.tick(h.now);
        h.machine.decide(h.now).unwrap();
        assert_eq!(h.machine.state(), VerificationState::Rejected);
        assert_eq!(h.sink.reports()[0].reason, Reason::GalleryUnavailable);
    }

    #[test]
    fn test_capture_fault_enters_error_and_retries_after_backoff() {
        let mut h = harness(Channel::Biometric);
        h.probe.fail_next_opens(1);
        assert_eq!(h.machine.start(h.now).unwrap(), VerificationState::Error);
        let deadline = h.machine.retry_deadline().unwrap();
        assert_eq!(deadline, h.now + DEFAULT_RETRY_BACKOFF);
        assert_eq!(h.machine.tick(h.now), TickOutcome::Suppressed);

        // Too early: stays in Error.
        let early = h.now + Duration::from_millis(500);
        assert_eq!(h.machine.retry_capability(early).unwrap(), VerificationState::Error);

        assert_eq!(
            h.machine.retry_capability(deadline).unwrap(),
            VerificationState::Scanning
        );
        assert!(h
            .sink
            .notices()
            .iter()
            .any(|n| matches!(n, StatusNotice::CaptureFault { .. })));
    }

    #[test]
    fn test_frame_fault_while_scanning_releases_capture() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        h.probe.fail_next_frames(1);
        assert_eq!(h.machine.tick(h.now), TickOutcome::Faulted);
        assert_eq!(h.machine.state(), VerificationState::Error);
        assert_eq!(h.probe.closes(), 1);
        assert!(!h.probe.is_open());
    }

    #[test]
    fn test_bounded_retries_exhaust() {
        let policy = ScanPolicy {
            max_capability_retries: Some(1),
            ..ScanPolicy::default()
        };
        let mut h = harness_with(Channel::Biometric, policy, None);
        h.probe.fail_next_opens(5);
        h.machine.start(h.now).unwrap();
        let deadline = h.machine.retry_deadline().unwrap();
        h.machine.retry_capability(deadline).unwrap();
        assert_eq!(h.machine.state(), VerificationState::Error);
        assert_eq!(h.machine.retry_deadline(), None);
        assert!(h
            .sink
            .notices()
            .contains(&StatusNotice::RetriesExhausted { attempts: 2 }));
    }

    #[test]
    fn test_reset_rearms_after_retries_exhausted() {
        let policy = ScanPolicy {
            max_capability_retries: Some(0),
            ..ScanPolicy::default()
        };
        let mut h = harness_with(Channel::Biometric, policy, None);
        h.probe.fail_next_opens(1);
        assert_eq!(h.machine.start(h.now).unwrap(), VerificationState::Error);
        assert_eq!(h.machine.retry_deadline(), None);
        assert_eq!(h.machine.retry_capability(h.now).unwrap(), VerificationState::Error);

        let previous = h.machine.session().id();
        assert_eq!(h.machine.reset(h.now).unwrap(), VerificationState::Scanning);
        assert_ne!(h.machine.session().id(), previous);
        assert!(h.probe.is_open());
    }

    #[test]
    fn test_reset_waits_for_pending_retry() {
        let mut h = harness(Channel::Biometric);
        h.probe.fail_next_opens(1);
        h.machine.start(h.now).unwrap();
        assert!(h.machine.retry_deadline().is_some());
        assert_eq!(
            h.machine.reset(h.now).unwrap_err(),
            SessionError::InvalidTransition {
                state: VerificationState::Error,
                action: "reset"
            }
        );
    }

    #[test]
    fn test_frame_fault_during_decide_enters_error() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        h.probe.set_presence(true);
        assert_eq!(h.machine.tick(h.now), TickOutcome::CandidateLocked);

        h.probe.fail_next_frames(1);
        assert_eq!(h.machine.decide(h.now).unwrap(), TickOutcome::Faulted);
        assert_eq!(h.machine.state(), VerificationState::Error);
        assert!(!h.machine.session().in_flight());
        assert!(!h.probe.is_open());
        assert_eq!(h.probe.strict_confidence(), None);
        assert!(h.sink.reports().is_empty());
        assert_eq!(h.machine.retry_deadline(), Some(h.now + DEFAULT_RETRY_BACKOFF));
    }

    #[test]
    fn test_never_opens_on_top_of_open_source() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        h.machine.switch_channel(Channel::Credential, h.now);
        h.machine.switch_channel(Channel::Biometric, h.now);
        // FakeSource panics on double open; reaching here is the assertion.
        assert_eq!(h.probe.opens(), 3);
        assert_eq!(h.probe.closes(), 2);
        drop(h.machine);
        assert_eq!(h.probe.closes(), 3);
    }

    #[test]
    fn test_credential_pre_authorized_matches_and_stops_capture() {
        let mut h = harness(Channel::Credential);
        h.machine.start(h.now).unwrap();
        assert_eq!(h.machine.tick_period(), Some(DEFAULT_DECODE_INTERVAL));
        assert_eq!(h.machine.tick(h.now), TickOutcome::Empty);

        h.probe.set_decoded(Some("130100"));
        assert_eq!(h.machine.tick(h.now), TickOutcome::Decided(Outcome::Matched));
        assert_eq!(h.machine.state(), VerificationState::Matched);
        assert!(!h.probe.is_open());

        let report = h.sink.reports().pop().unwrap();
        assert_eq!(report.reason, Reason::CredentialPreAuthorized);
        assert!(report.record.is_none());
        assert_eq!(report.match_percent, 100);
    }

    #[test]
    fn test_credential_event_enrolled_and_unknown() {
        let mut h = harness(Channel::Credential);
        h.gallery.insert(enrollment(129_999, None)).unwrap();
        h.machine.start(h.now).unwrap();
        assert_eq!(h.machine.on_decoded("129999", h.now).unwrap(), Outcome::Matched);
        assert_eq!(
            h.sink.reports()[0].record.as_ref().unwrap().credential_code,
            129_999
        );
        assert!(h.machine.on_decoded("1", h.now).is_err());

        h.machine.reset(h.now).unwrap();
        assert_eq!(h.machine.on_decoded("129998", h.now).unwrap(), Outcome::Rejected);
        assert_eq!(h.sink.reports()[1].reason, Reason::CredentialNotFound);

        h.machine.reset(h.now).unwrap();
        assert_eq!(h.machine.on_decoded("abc", h.now).unwrap(), Outcome::Rejected);
        assert_eq!(h.sink.reports()[2].reason, Reason::CredentialMalformed);
    }

    #[test]
    fn test_decoded_rejected_on_biometric_channel() {
        let mut h = harness(Channel::Biometric);
        h.machine.start(h.now).unwrap();
        assert!(h.machine.on_decoded("130100", h.now).is_err());
        assert_eq!(h.machine.state(), VerificationState::Scanning);
    }

    #[test]
    fn test_credential_storage_failure_is_service_error() {
        let mut h = harness_with(
            Channel::Credential,
            ScanPolicy::default(),
            Some(Arc::new(UnavailableGallery)),
        );
        h.machine.start(h.now).unwrap();
        h.machine.on_decoded("42", h.now).unwrap();
        assert_eq!(h.sink.reports()[0].reason, Reason::CredentialServiceError);
    }
}
