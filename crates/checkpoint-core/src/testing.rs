//! Fakes shared by the unit tests.

use crate::capture::{
    BiometricDetector, CaptureFault, CredentialReader, Detection, Frame, FrameSource, Landmarks,
};
use crate::gallery::{GalleryError, IdentityGallery};
use crate::sink::{ResultSink, StatusNotice, VerificationReport};
use crate::types::{Embedding, EnrollmentRecord, NewEnrollment};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const DIM: usize = 4;

pub fn enrollment(code: i64, embedding: Option<Embedding>) -> NewEnrollment {
    NewEnrollment {
        name: format!("subject-{code}"),
        position: "guard".into(),
        rank: "sergeant".into(),
        unit_type: "north".into(),
        embedding,
        credential_code: code,
        image_ref: None,
    }
}

pub fn record(code: i64, embedding: Option<Embedding>) -> EnrollmentRecord {
    EnrollmentRecord::from_enrollment(enrollment(code, embedding), Uuid::new_v4(), Utc::now())
}

/// Copy of `base` moved by `by` along the first axis, so the Euclidean
/// distance between the two is `by`.
pub fn offset(base: &Embedding, by: f32) -> Embedding {
    let mut values = base.values.clone();
    values[0] += by;
    Embedding::new(values)
}

#[derive(Default)]
struct ProbeState {
    open: bool,
    opens: usize,
    closes: usize,
    fail_opens: usize,
    fail_frames: usize,
    sequence: u32,
    presence: bool,
    presence_calls: usize,
    extraction: Option<Embedding>,
    strict_confidence: Option<f32>,
    decoded: Option<String>,
}

/// Shared control and observation handle for the fake collaborators.
#[derive(Clone, Default)]
pub struct CaptureProbe(Arc<Mutex<ProbeState>>);

impl CaptureProbe {
    fn with<T>(&self, f: impl FnOnce(&mut ProbeState) -> T) -> T {
        f(&mut self.0.lock().unwrap())
    }

    pub fn set_presence(&self, present: bool) {
        self.with(|s| s.presence = present);
    }

    pub fn set_extraction(&self, embedding: Option<Embedding>) {
        self.with(|s| s.extraction = embedding);
    }

    pub fn set_decoded(&self, payload: Option<&str>) {
        self.with(|s| s.decoded = payload.map(str::to_string));
    }

    pub fn fail_next_opens(&self, n: usize) {
        self.with(|s| s.fail_opens = n);
    }

    pub fn fail_next_frames(&self, n: usize) {
        self.with(|s| s.fail_frames = n);
    }

    pub fn opens(&self) -> usize {
        self.with(|s| s.opens)
    }

    pub fn closes(&self) -> usize {
        self.with(|s| s.closes)
    }

    pub fn is_open(&self) -> bool {
        self.with(|s| s.open)
    }

    pub fn presence_calls(&self) -> usize {
        self.with(|s| s.presence_calls)
    }

    pub fn strict_confidence(&self) -> Option<f32> {
        self.with(|s| s.strict_confidence)
    }
}

pub struct FakeSource(CaptureProbe);

impl FakeSource {
    pub fn new(probe: CaptureProbe) -> Self {
        Self(probe)
    }
}

impl FrameSource for FakeSource {
    fn open(&mut self) -> Result<(), CaptureFault> {
        self.0.with(|s| {
            assert!(!s.open, "frame source opened twice without close");
            if s.fail_opens > 0 {
                s.fail_opens -= 1;
                return Err(CaptureFault::SourceUnavailable("camera busy".into()));
            }
            s.open = true;
            s.opens += 1;
            Ok(())
        })
    }

    fn frame(&mut self) -> Result<Frame, CaptureFault> {
        self.0.with(|s| {
            if !s.open {
                return Err(CaptureFault::FrameFailed("source closed".into()));
            }
            if s.fail_frames > 0 {
                s.fail_frames -= 1;
                return Err(CaptureFault::FrameFailed("dequeue failed".into()));
            }
            s.sequence += 1;
            Ok(Frame {
                data: vec![128; 4],
                width: 2,
                height: 2,
                timestamp: std::time::Instant::now(),
                sequence: s.sequence,
            })
        })
    }

    fn close(&mut self) {
        self.0.with(|s| {
            if s.open {
                s.open = false;
                s.closes += 1;
            }
        });
    }
}

pub struct FakeDetector(CaptureProbe);

impl FakeDetector {
    pub fn new(probe: CaptureProbe) -> Self {
        Self(probe)
    }
}

impl BiometricDetector for FakeDetector {
    fn detect_presence(&mut self, _frame: &Frame) -> Result<Option<Landmarks>, CaptureFault> {
        Ok(self.0.with(|s| {
            s.presence_calls += 1;
            s.presence.then(|| Landmarks {
                points: vec![(0.5, 0.5)],
                confidence: 0.6,
            })
        }))
    }

    fn detect_and_extract(
        &mut self,
        _frame: &Frame,
        min_confidence: f32,
    ) -> Result<Option<Detection>, CaptureFault> {
        Ok(self.0.with(|s| {
            s.strict_confidence = Some(min_confidence);
            s.extraction.clone().map(|embedding| Detection {
                landmarks: Landmarks {
                    points: vec![(0.5, 0.5)],
                    confidence: 0.9,
                },
                embedding,
            })
        }))
    }
}

pub struct FakeReader(CaptureProbe);

impl FakeReader {
    pub fn new(probe: CaptureProbe) -> Self {
        Self(probe)
    }
}

impl CredentialReader for FakeReader {
    fn decode(&mut self, _frame: &Frame) -> Result<Option<String>, CaptureFault> {
        Ok(self.0.with(|s| s.decoded.clone()))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<VerificationReport>>,
    notices: Mutex<Vec<StatusNotice>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<VerificationReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<StatusNotice> {
        self.notices.lock().unwrap().clone()
    }
}

impl ResultSink for RecordingSink {
    fn report(&self, report: &VerificationReport) {
        self.reports.lock().unwrap().push(report.clone());
    }

    fn notice(&self, notice: &StatusNotice) {
        self.notices.lock().unwrap().push(notice.clone());
    }
}

/// Gallery whose backing store is down.
pub struct UnavailableGallery;

impl IdentityGallery for UnavailableGallery {
    fn scan_all(&self) -> Result<Vec<EnrollmentRecord>, GalleryError> {
        Err(GalleryError::Unavailable("disk gone".into()))
    }

    fn find_by_credential_code(
        &self,
        _code: i64,
    ) -> Result<Option<EnrollmentRecord>, GalleryError> {
        Err(GalleryError::Unavailable("disk gone".into()))
    }

    fn insert(&self, _enrollment: NewEnrollment) -> Result<Uuid, GalleryError> {
        Err(GalleryError::Unavailable("disk gone".into()))
    }

    fn remove(&self, _id: Uuid) -> Result<(), GalleryError> {
        Err(GalleryError::Unavailable("disk gone".into()))
    }

    fn len(&self) -> Result<usize, GalleryError> {
        Err(GalleryError::Unavailable("disk gone".into()))
    }
}
