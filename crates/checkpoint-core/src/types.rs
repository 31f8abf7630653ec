use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Face embedding vector (128-dimensional for the default detector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// True when the vector has exactly `dimension` finite components.
    pub fn is_well_formed(&self, dimension: usize) -> bool {
        self.values.len() == dimension && self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean (L2) distance. Lower = more similar.
    pub fn distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Verification channel a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Live face capture matched against enrolled embeddings.
    Biometric,
    /// Printed code decoded from the camera and checked against the allow-list.
    Credential,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Biometric => f.write_str("biometric"),
            Channel::Credential => f.write_str("credential"),
        }
    }
}

/// Payload for creating an enrollment. The gallery assigns `id` and `enrolled_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEnrollment {
    pub name: String,
    pub position: String,
    pub rank: String,
    pub unit_type: String,
    /// `None` enrolls a credential-only subject.
    pub embedding: Option<Embedding>,
    pub credential_code: i64,
    pub image_ref: Option<String>,
}

/// A stored enrollment with gallery-assigned identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub id: Uuid,
    pub name: String,
    pub position: String,
    pub rank: String,
    pub unit_type: String,
    pub embedding: Option<Embedding>,
    pub credential_code: i64,
    pub image_ref: Option<String>,
    pub enrolled_at: DateTime<Utc>,
}

impl EnrollmentRecord {
    pub fn from_enrollment(
        enrollment: NewEnrollment,
        id: Uuid,
        enrolled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: enrollment.name,
            position: enrollment.position,
            rank: enrollment.rank,
            unit_type: enrollment.unit_type,
            embedding: enrollment.embedding,
            credential_code: enrollment.credential_code,
            image_ref: enrollment.image_ref,
            enrolled_at,
        }
    }
}

/// Result of matching a probe embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance of the best candidate, or the 1.0 sentinel when
    /// nothing came closer.
    pub best_distance: f32,
    /// Closest record seen (the accepted one when `matched`).
    pub candidate: Option<EnrollmentRecord>,
    pub match_percent: u8,
}

impl MatchResult {
    /// The matched record, only when the match was accepted.
    pub fn matched_record(&self) -> Option<&EnrollmentRecord> {
        if self.matched {
            self.candidate.as_ref()
        } else {
            None
        }
    }
}

/// Convert a distance into the operator-facing similarity percentage.
///
/// `round((1 - distance) * 100)` evaluated in f64 and clamped to [0, 100],
/// so `match_percent(0.4) == 60` despite 0.4 not being representable in f32.
pub fn match_percent(distance: f32) -> u8 {
    let pct = ((1.0 - f64::from(distance)) * 100.0).round();
    if pct.is_nan() {
        return 0;
    }
    pct.clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_identical() {
        let a = Embedding::new(vec![0.1, 0.2, 0.3]);
        assert_eq!(a.distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_distance_unit_axis() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 0.0]);
        assert!((a.distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_three_four_five() {
        let a = Embedding::new(vec![3.0, 0.0]);
        let b = Embedding::new(vec![0.0, 4.0]);
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_well_formed_rejects_wrong_length_and_nan() {
        assert!(Embedding::new(vec![0.0; 4]).is_well_formed(4));
        assert!(!Embedding::new(vec![0.0; 3]).is_well_formed(4));
        assert!(!Embedding::new(vec![0.0, f32::NAN, 0.0, 0.0]).is_well_formed(4));
        assert!(!Embedding::new(vec![f32::INFINITY, 0.0, 0.0, 0.0]).is_well_formed(4));
    }

    #[test]
    fn test_match_percent_boundaries() {
        assert_eq!(match_percent(0.0), 100);
        assert_eq!(match_percent(0.4), 60);
        assert_eq!(match_percent(0.5), 50);
        assert_eq!(match_percent(1.0), 0);
    }

    #[test]
    fn test_match_percent_clamps() {
        assert_eq!(match_percent(1.7), 0);
        assert_eq!(match_percent(-0.2), 100);
        assert_eq!(match_percent(f32::NAN), 0);
    }

    #[test]
    fn test_embedding_serializes_as_plain_array() {
        let e = Embedding::new(vec![0.5, -0.25]);
        assert_eq!(serde_json::to_string(&e).unwrap(), "[0.5,-0.25]");
        let back: Embedding = serde_json::from_str("[0.5,-0.25]").unwrap();
        assert_eq!(back, e);
    }
}
