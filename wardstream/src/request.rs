//! Analysis request model, validation, and fingerprinting.
//!
//! An [`AnalysisRequest`] names a ward (or other subject), a depth tier, and
//! a strategic context. Its fingerprint keys the cache and the dedup table:
//! two requests with the same subject, depth, and context are the same
//! analysis.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for analysis requests.
pub type RequestId = String;

/// Subjects longer than this are rejected before orchestration.
pub const MAX_SUBJECT_LEN: usize = 256;

/// Upper bound on caller-requested retries per backend.
pub const MAX_RETRIES_CAP: u32 = 10;

/// Depth tier of an analysis. Each tier maps to its own deadline and token
/// budget (see `DepthBudgets` in the config module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisDepth {
    Quick,
    Standard,
    Deep,
}

impl AnalysisDepth {
    /// All depth tiers, shallowest first.
    pub fn all() -> &'static [AnalysisDepth] {
        &[
            AnalysisDepth::Quick,
            AnalysisDepth::Standard,
            AnalysisDepth::Deep,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisDepth::Quick => "quick",
            AnalysisDepth::Standard => "standard",
            AnalysisDepth::Deep => "deep",
        }
    }
}

impl fmt::Display for AnalysisDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strategic framing for the analysis. A tone hint for synthesis; it does
/// not change orchestration mechanics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisContext {
    Defensive,
    Neutral,
    Offensive,
}

impl AnalysisContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisContext::Defensive => "defensive",
            AnalysisContext::Neutral => "neutral",
            AnalysisContext::Offensive => "offensive",
        }
    }
}

impl fmt::Display for AnalysisContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-request knobs recognized alongside the core parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Override for retries per backend; `None` uses the configured default.
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Override for the fixed inter-attempt delay.
    #[serde(default)]
    pub retry_base_delay: Option<Duration>,
    /// Scheduling priority under the concurrency ceiling. Higher runs first;
    /// never affects correctness.
    #[serde(default)]
    pub priority: u8,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry_base_delay: None,
            priority: 0,
        }
    }
}

/// Deterministic cache/dedup key derived from subject, depth, and context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validation failures reject a request before any side effect.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("subject must not be empty")]
    EmptySubject,

    #[error("subject exceeds {max} characters (got {len})")]
    SubjectTooLong { len: usize, max: usize },

    #[error("max_retries {requested} exceeds the cap of {cap}")]
    TooManyRetries { requested: u32, cap: u32 },
}

/// One analysis request as received from a dashboard client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub id: RequestId,
    /// Ward or other subject identifier.
    pub subject: String,
    pub depth: AnalysisDepth,
    pub context: AnalysisContext,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub options: RequestOptions,
}

impl AnalysisRequest {
    /// Create a request with a fresh id and the default options.
    pub fn new(
        subject: impl Into<String>,
        depth: AnalysisDepth,
        context: AnalysisContext,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject: subject.into(),
            depth,
            context,
            submitted_at: Utc::now(),
            options: RequestOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.options.priority = priority;
        self
    }

    /// Reject malformed parameters. Runs before orchestration; a failed
    /// validation has no side effects.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let subject = self.subject.trim();
        if subject.is_empty() {
            return Err(ValidationError::EmptySubject);
        }
        if subject.len() > MAX_SUBJECT_LEN {
            return Err(ValidationError::SubjectTooLong {
                len: subject.len(),
                max: MAX_SUBJECT_LEN,
            });
        }
        if let Some(requested) = self.options.max_retries {
            if requested > MAX_RETRIES_CAP {
                return Err(ValidationError::TooManyRetries {
                    requested,
                    cap: MAX_RETRIES_CAP,
                });
            }
        }
        Ok(())
    }

    /// Hash of (subject, depth, context). Identical requests collapse to one
    /// orchestration regardless of who submitted them or when.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.subject.trim().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.depth.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.context.as_str().as_bytes());
        Fingerprint(hasher.finalize().to_hex().to_string())
    }
}
