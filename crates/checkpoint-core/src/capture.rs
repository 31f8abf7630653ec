//! Capture-side collaborators: frame source, face detector, code reader.
//!
//! The state machine owns one of each for the lifetime of a session and is
//! the only caller. Any error they return is a [`CaptureFault`], which puts
//! the machine into its retrying `Error` state.

use crate::types::Embedding;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureFault {
    #[error("frame source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("frame capture failed: {0}")]
    FrameFailed(String),
    #[error("detector not ready: {0}")]
    DetectorUnavailable(String),
    #[error("detection failed: {0}")]
    DetectorFailed(String),
}

/// A captured camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

/// Facial landmark geometry from a detection pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Landmarks {
    pub points: Vec<(f32, f32)>,
    pub confidence: f32,
}

/// Result of the strict detection pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub landmarks: Landmarks,
    pub embedding: Embedding,
}

/// Camera or other frame provider.
///
/// `open` is never called on an already open source: the state machine
/// always closes before re-opening.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<(), CaptureFault>;
    fn frame(&mut self) -> Result<Frame, CaptureFault>;
    /// Stop all underlying streams. Must be safe to call on a closed source.
    fn close(&mut self);
}

/// Black-box face detector and embedding extractor.
pub trait BiometricDetector: Send {
    /// Load models or otherwise confirm readiness. Called on each capability
    /// acquisition; implementations should cache.
    fn ready(&mut self) -> Result<(), CaptureFault> {
        Ok(())
    }

    /// Cheap, low-confidence presence check run on every scan tick.
    fn detect_presence(&mut self, frame: &Frame) -> Result<Option<Landmarks>, CaptureFault>;

    /// Expensive single-face detection plus embedding extraction, run once
    /// per locked candidate.
    fn detect_and_extract(
        &mut self,
        frame: &Frame,
        min_confidence: f32,
    ) -> Result<Option<Detection>, CaptureFault>;
}

/// Printed-code decoder for the credential channel.
pub trait CredentialReader: Send {
    fn decode(&mut self, frame: &Frame) -> Result<Option<String>, CaptureFault>;
}

/// Reader for deployments that only receive decode events externally.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentialReader;

impl CredentialReader for NoCredentialReader {
    fn decode(&mut self, _frame: &Frame) -> Result<Option<String>, CaptureFault> {
        Ok(None)
    }
}

/// The capture collaborators handed to a state machine.
pub struct Collaborators {
    pub source: Box<dyn FrameSource>,
    pub detector: Box<dyn BiometricDetector>,
    pub reader: Box<dyn CredentialReader>,
}
