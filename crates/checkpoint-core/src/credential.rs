//! Two-tier credential validation: a sorted static allow-list of code
//! intervals searched in O(log n), then an exact lookup of enrolled codes.

use crate::gallery::{GalleryError, IdentityGallery};
use crate::types::EnrollmentRecord;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("credential is not a number: {0:?}")]
    MalformedCredential(String),
    #[error("credential storage unavailable: {0}")]
    StorageUnavailable(#[from] GalleryError),
}

/// Pre-authorized credential codes, held as sorted, disjoint, non-adjacent
/// inclusive intervals so arbitrarily wide ranges cost one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialRange {
    intervals: Vec<(i64, i64)>,
}

/// Outcome of a binary search over a [`CredentialRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeLookup {
    Found { interval: usize },
    /// `nearest` is the closest pre-authorized code (lower one on ties),
    /// for operator feedback only.
    Missing { nearest: Option<i64> },
}

impl CredentialRange {
    /// Individual codes, in any order, duplicates allowed.
    pub fn new(codes: Vec<i64>) -> Self {
        Self::from_intervals(codes.into_iter().map(|c| (c, c)))
    }

    /// Every code in `start..=end`.
    pub fn contiguous(start: i64, end: i64) -> Self {
        Self::from_intervals([(start, end)])
    }

    /// Merge inclusive `(start, end)` intervals. Inverted intervals are empty
    /// and dropped.
    pub fn from_intervals(intervals: impl IntoIterator<Item = (i64, i64)>) -> Self {
        let mut sorted: Vec<(i64, i64)> = intervals.into_iter().filter(|(s, e)| s <= e).collect();
        sorted.sort_unstable();

        let mut merged: Vec<(i64, i64)> = Vec::with_capacity(sorted.len());
        for (start, end) in sorted {
            match merged.last_mut() {
                Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        Self { intervals: merged }
    }

    /// Number of codes covered; `None` when it does not fit in a `u64`
    /// (only the whole `i64` domain).
    pub fn len(&self) -> Option<u64> {
        self.intervals.iter().try_fold(0u64, |total, &(start, end)| {
            end.abs_diff(start)
                .checked_add(1)
                .and_then(|width| total.checked_add(width))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> &[(i64, i64)] {
        &self.intervals
    }

    pub fn lookup(&self, code: i64) -> RangeLookup {
        let after = self.intervals.partition_point(|&(start, _)| start <= code);
        let previous = after.checked_sub(1).map(|i| (i, self.intervals[i]));

        if let Some((interval, (_, end))) = previous {
            if code <= end {
                return RangeLookup::Found { interval };
            }
        }

        let below = previous.map(|(_, (_, end))| end);
        let above = self.intervals.get(after).map(|&(start, _)| start);
        let nearest = match (below, above) {
            (Some(b), Some(a)) => {
                if code.abs_diff(b) <= a.abs_diff(code) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (b, a) => b.or(a),
        };
        RangeLookup::Missing { nearest }
    }

    pub fn contains(&self, code: i64) -> bool {
        matches!(self.lookup(code), RangeLookup::Found { .. })
    }
}

/// How a credential was (or was not) authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    PreAuthorized,
    Enrolled,
    NotFound,
    Malformed,
    ServiceError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CredentialVerdict {
    pub kind: VerdictKind,
    pub code: Option<i64>,
    pub message: String,
    /// Set for [`VerdictKind::Enrolled`].
    pub matched_record: Option<EnrollmentRecord>,
    /// Closest pre-authorized code when the credential was not found.
    pub nearest_hint: Option<i64>,
}

impl CredentialVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self.kind, VerdictKind::PreAuthorized | VerdictKind::Enrolled)
    }

    /// Render a validation failure as an invalid verdict. Storage failures
    /// get a distinct service message so operators can tell them apart from
    /// a bad code.
    pub fn from_error(err: &CredentialError) -> Self {
        let (kind, message) = match err {
            CredentialError::MalformedCredential(_) => {
                (VerdictKind::Malformed, "credential is not a number".to_string())
            }
            CredentialError::StorageUnavailable(_) => (
                VerdictKind::ServiceError,
                "credential service error: gallery unavailable".to_string(),
            ),
        };
        Self {
            kind,
            code: None,
            message,
            matched_record: None,
            nearest_hint: None,
        }
    }
}

pub fn parse_credential(raw: &str) -> Result<i64, CredentialError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| CredentialError::MalformedCredential(raw.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct CredentialValidator {
    range: CredentialRange,
}

impl CredentialValidator {
    pub fn new(range: CredentialRange) -> Self {
        Self { range }
    }

    pub fn range(&self) -> &CredentialRange {
        &self.range
    }

    /// Validate a decoded credential. Read-only.
    pub fn validate(
        &self,
        raw: &str,
        gallery: &dyn IdentityGallery,
    ) -> Result<CredentialVerdict, CredentialError> {
        let code = parse_credential(raw)?;

        let nearest = match self.range.lookup(code) {
            RangeLookup::Found { interval } => {
                tracing::debug!(code, interval, "credential pre-authorized");
                return Ok(CredentialVerdict {
                    kind: VerdictKind::PreAuthorized,
                    code: Some(code),
                    message: format!("credential {code} pre-authorized"),
                    matched_record: None,
                    nearest_hint: None,
                });
            }
            RangeLookup::Missing { nearest } => nearest,
        };

        match gallery.find_by_credential_code(code)? {
            Some(record) => {
                tracing::debug!(code, id = %record.id, "credential matched enrollment");
                Ok(CredentialVerdict {
                    kind: VerdictKind::Enrolled,
                    code: Some(code),
                    message: format!("credential {code} verified for {}", record.name),
                    matched_record: Some(record),
                    nearest_hint: None,
                })
            }
            None => {
                let message = match nearest {
                    Some(n) => format!("credential {code} not recognised (nearest code: {n})"),
                    None => format!("credential {code} not recognised"),
                };
                Ok(CredentialVerdict {
                    kind: VerdictKind::NotFound,
                    code: Some(code),
                    message,
                    matched_record: None,
                    nearest_hint: nearest,
                })
            }
        }
    }
}
