use crate::credential::CredentialRange;
use crate::matcher::{
    MatchMode, MatchPolicy, DEFAULT_EMBEDDING_DIM, DEFAULT_MIN_MATCH_PERCENT,
    DEFAULT_STRICT_THRESHOLD,
};
use crate::session::{
    ScanPolicy, DEFAULT_DECODE_INTERVAL, DEFAULT_PRESENCE_INTERVAL, DEFAULT_RETRY_BACKOFF,
    DEFAULT_STRICT_MIN_CONFIDENCE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Engine configuration: a TOML file, then `CHECKPOINT_*` environment
/// overrides, then validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Path to the SQLite gallery.
    pub db_path: PathBuf,
    /// Embedding dimensionality produced by the detector.
    pub embedding_dim: usize,
    pub matching: MatchingConfig,
    pub scan: ScanConfig,
    pub credentials: CredentialConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    pub strict_threshold: f32,
    pub min_match_percent: u8,
    pub mode: MatchMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    pub presence_interval_ms: u64,
    pub decode_interval_ms: u64,
    pub retry_backoff_ms: u64,
    /// Unset retries capture acquisition forever.
    pub max_capability_retries: Option<u32>,
    pub strict_min_confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialConfig {
    /// Inclusive ranges of pre-authorized codes.
    pub ranges: Vec<CodeRange>,
    /// Individually pre-authorized codes.
    pub codes: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeRange {
    pub start: i64,
    pub end: i64,
}

impl FromStr for CodeRange {
    type Err = String;

    /// `"130000-130249"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| format!("expected START-END, got {s:?}"))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<i64>()
                .map_err(|e| format!("bad range bound {v:?}: {e}"))
        };
        Ok(Self {
            start: parse(start)?,
            end: parse(end)?,
        })
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("gallery.db"),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            matching: MatchingConfig::default(),
            scan: ScanConfig::default(),
            credentials: CredentialConfig::default(),
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            strict_threshold: DEFAULT_STRICT_THRESHOLD,
            min_match_percent: DEFAULT_MIN_MATCH_PERCENT,
            mode: MatchMode::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            presence_interval_ms: DEFAULT_PRESENCE_INTERVAL.as_millis() as u64,
            decode_interval_ms: DEFAULT_DECODE_INTERVAL.as_millis() as u64,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            max_capability_retries: None,
            strict_min_confidence: DEFAULT_STRICT_MIN_CONFIDENCE,
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            ranges: vec![CodeRange {
                start: 130_000,
                end: 130_249,
            }],
            codes: Vec::new(),
        }
    }
}

impl CheckpointConfig {
    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `CHECKPOINT_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("CHECKPOINT_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        override_from(&lookup, "CHECKPOINT_EMBEDDING_DIM", &mut self.embedding_dim);
        override_from(&lookup, "CHECKPOINT_STRICT_THRESHOLD", &mut self.matching.strict_threshold);
        override_from(
            &lookup,
            "CHECKPOINT_MIN_MATCH_PERCENT",
            &mut self.matching.min_match_percent,
        );
        override_from(&lookup, "CHECKPOINT_MATCH_MODE", &mut self.matching.mode);
        override_from(
            &lookup,
            "CHECKPOINT_PRESENCE_INTERVAL_MS",
            &mut self.scan.presence_interval_ms,
        );
        override_from(&lookup, "CHECKPOINT_DECODE_INTERVAL_MS", &mut self.scan.decode_interval_ms);
        override_from(&lookup, "CHECKPOINT_RETRY_BACKOFF_MS", &mut self.scan.retry_backoff_ms);
        override_from(
            &lookup,
            "CHECKPOINT_STRICT_MIN_CONFIDENCE",
            &mut self.scan.strict_min_confidence,
        );

        let mut max_retries = 0u32;
        if override_from(&lookup, "CHECKPOINT_MAX_CAPABILITY_RETRIES", &mut max_retries) {
            self.scan.max_capability_retries = Some(max_retries);
        }

        let mut range = CodeRange { start: 0, end: 0 };
        if override_from(&lookup, "CHECKPOINT_CREDENTIAL_RANGE", &mut range) {
            self.credentials.ranges = vec![range];
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dim == 0 {
            return Err(ConfigError::Invalid("embedding_dim must be positive".into()));
        }
        let t = self.matching.strict_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "matching.strict_threshold must be in (0, 1], got {t}"
            )));
        }
        if self.matching.min_match_percent > 100 {
            return Err(ConfigError::Invalid(
                "matching.min_match_percent must be at most 100".into(),
            ));
        }
        if self.scan.presence_interval_ms == 0 || self.scan.decode_interval_ms == 0 {
            return Err(ConfigError::Invalid("scan intervals must be positive".into()));
        }
        let c = self.scan.strict_min_confidence;
        if !(0.0..=1.0).contains(&c) {
            return Err(ConfigError::Invalid(format!(
                "scan.strict_min_confidence must be in [0, 1], got {c}"
            )));
        }
        if let Some(r) = self.credentials.ranges.iter().find(|r| r.start > r.end) {
            return Err(ConfigError::Invalid(format!(
                "credential range {}-{} is inverted",
                r.start, r.end
            )));
        }
        Ok(())
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            dimension: self.embedding_dim,
            strict_threshold: self.matching.strict_threshold,
            min_match_percent: self.matching.min_match_percent,
            mode: self.matching.mode,
        }
    }

    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            presence_interval: Duration::from_millis(self.scan.presence_interval_ms),
            decode_interval: Duration::from_millis(self.scan.decode_interval_ms),
            retry_backoff: Duration::from_millis(self.scan.retry_backoff_ms),
            max_capability_retries: self.scan.max_capability_retries,
            strict_min_confidence: self.scan.strict_min_confidence,
        }
    }

    pub fn credential_range(&self) -> CredentialRange {
        let ranges = self.credentials.ranges.iter().map(|r| (r.start, r.end));
        let codes = self.credentials.codes.iter().map(|&c| (c, c));
        CredentialRange::from_intervals(ranges.chain(codes))
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("checkpoint")
}

/// Parse `key` into `slot`. Returns whether an override was applied.
fn override_from<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> bool {
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.trim().parse() {
        Ok(value) => {
            *slot = value;
            true
        }
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            false
        }
    }
}
