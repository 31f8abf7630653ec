//! Enrollment gallery interface and an in-memory implementation.
//!
//! Every gallery returns records from [`IdentityGallery::scan_all`] in
//! insertion order; the matcher's first-under-threshold rule depends on it.

use crate::types::{EnrollmentRecord, NewEnrollment};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GalleryError {
    #[error("credential code {0} is already enrolled")]
    DuplicateCredentialCode(i64),
    #[error("invalid embedding: expected {expected} finite components, got {actual}")]
    InvalidEmbedding { expected: usize, actual: usize },
    #[error("enrollment not found: {0}")]
    NotFound(Uuid),
    #[error("gallery unavailable: {0}")]
    Unavailable(String),
}

/// Durable collection of enrollment records.
///
/// The verification core only calls the read operations. Implementations
/// must give a consistent snapshot for the duration of a single `scan_all`.
pub trait IdentityGallery: Send + Sync {
    /// All records, in insertion order.
    fn scan_all(&self) -> Result<Vec<EnrollmentRecord>, GalleryError>;

    /// Exact lookup on the unique credential code.
    fn find_by_credential_code(
        &self,
        code: i64,
    ) -> Result<Option<EnrollmentRecord>, GalleryError>;

    /// Store a new record. Fails with `DuplicateCredentialCode` without
    /// modifying the gallery when the code is taken.
    fn insert(&self, enrollment: NewEnrollment) -> Result<Uuid, GalleryError>;

    fn remove(&self, id: Uuid) -> Result<(), GalleryError>;

    fn len(&self) -> Result<usize, GalleryError>;

    fn is_empty(&self) -> Result<bool, GalleryError> {
        Ok(self.len()? == 0)
    }
}

/// Reject embeddings that could never take part in matching.
pub fn validate_enrollment(
    enrollment: &NewEnrollment,
    dimension: usize,
) -> Result<(), GalleryError> {
    match &enrollment.embedding {
        Some(e) if !e.is_well_formed(dimension) => Err(GalleryError::InvalidEmbedding {
            expected: dimension,
            actual: e.values.len(),
        }),
        _ => Ok(()),
    }
}

/// Insertion-ordered gallery held in memory, with a credential code index.
pub struct MemoryGallery {
    dimension: usize,
    entries: RwLock<Entries>,
}

#[derive(Default)]
struct Entries {
    records: Vec<EnrollmentRecord>,
    /// credential code -> position in `records`
    by_code: HashMap<i64, usize>,
}

impl Entries {
    fn remove_at(&mut self, idx: usize) {
        let removed = self.records.remove(idx);
        self.by_code.remove(&removed.credential_code);
        for pos in self.by_code.values_mut() {
            if *pos > idx {
                *pos -= 1;
            }
        }
    }
}

impl MemoryGallery {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: RwLock::new(Entries::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Entries>, GalleryError> {
        self.entries.read().map_err(|_| Self::poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Entries>, GalleryError> {
        self.entries.write().map_err(|_| Self::poisoned())
    }

    fn poisoned() -> GalleryError {
        GalleryError::Unavailable("gallery lock poisoned".into())
    }
}

impl IdentityGallery for MemoryGallery {
    fn scan_all(&self) -> Result<Vec<EnrollmentRecord>, GalleryError> {
        Ok(self.read()?.records.clone())
    }

    fn find_by_credential_code(
        &self,
        code: i64,
    ) -> Result<Option<EnrollmentRecord>, GalleryError> {
        let entries = self.read()?;
        Ok(entries
            .by_code
            .get(&code)
            .and_then(|&idx| entries.records.get(idx))
            .cloned())
    }

    fn insert(&self, enrollment: NewEnrollment) -> Result<Uuid, GalleryError> {
        validate_enrollment(&enrollment, self.dimension)?;

        let mut entries = self.write()?;
        let code = enrollment.credential_code;
        if entries.by_code.contains_key(&code) {
            return Err(GalleryError::DuplicateCredentialCode(code));
        }

        let id = Uuid::new_v4();
        tracing::debug!(%id, credential_code = code, "enrollment stored");
        let idx = entries.records.len();
        entries
            .records
            .push(EnrollmentRecord::from_enrollment(enrollment, id, Utc::now()));
        entries.by_code.insert(code, idx);
        Ok(id)
    }

    fn remove(&self, id: Uuid) -> Result<(), GalleryError> {
        let mut entries = self.write()?;
        let idx = entries
            .records
            .iter()
            .position(|r| r.id == id)
            .ok_or(GalleryError::NotFound(id))?;
        entries.remove_at(idx);
        Ok(())
    }

    fn len(&self) -> Result<usize, GalleryError> {
        Ok(self.read()?.records.len())
    }
}
