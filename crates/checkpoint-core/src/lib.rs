//! checkpoint-core — identity verification engine.
//!
//! Matches live face embeddings against an enrollment gallery, validates
//! printed credential codes, and sequences capture → detection → decision
//! → reset through a single-flight state machine.

pub mod capture;
pub mod config;
pub mod credential;
pub mod driver;
pub mod gallery;
pub mod matcher;
pub mod session;
pub mod sink;
pub mod types;

#[cfg(test)]
mod testing;

pub use capture::{
    BiometricDetector, CaptureFault, Collaborators, CredentialReader, Detection, Frame,
    FrameSource, Landmarks, NoCredentialReader,
};
pub use config::{CheckpointConfig, ConfigError};
pub use credential::{
    CredentialError, CredentialRange, CredentialValidator, CredentialVerdict, VerdictKind,
};
pub use driver::{
    run_scanner, scanner_channel, spawn_scanner, ScanCommand, ScannerError, ScannerHandle,
};
pub use gallery::{GalleryError, IdentityGallery, MemoryGallery};
pub use matcher::{EuclideanMatcher, MatchError, MatchMode, MatchPolicy, Matcher};
pub use session::{
    ScanPolicy, SessionError, SessionSnapshot, TickOutcome, VerificationSession,
    VerificationState, VerificationStateMachine,
};
pub use sink::{Outcome, Reason, ResultSink, StatusNotice, TracingSink, VerificationReport};
pub use types::{Channel, Embedding, EnrollmentRecord, MatchResult, NewEnrollment};
