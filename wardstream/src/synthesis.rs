//! Merging backend outcomes into one report.
//!
//! The synthesizer never sees backends, only their outcomes. It grades the
//! result full, partial, or degraded, aggregates confidence with an
//! agreement lift, and falls back to a cached report when every backend
//! failed.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{BackendReply, Citation};
use crate::orchestrator::{CallOutcome, ModelCall};
use crate::request::{AnalysisContext, AnalysisRequest};

/// Knobs for result grading and confidence aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisPolicy {
    /// Hard ceiling on confidence when any backend is missing from the
    /// result.
    pub partial_ceiling: f32,
    /// How strongly cross-backend citation agreement can lift confidence
    /// toward 1.0.
    pub agreement_lift: f32,
}

impl Default for SynthesisPolicy {
    fn default() -> Self {
        Self {
            partial_ceiling: 0.7,
            agreement_lift: 0.3,
        }
    }
}

impl SynthesisPolicy {
    pub fn with_partial_ceiling(mut self, partial_ceiling: f32) -> Self {
        self.partial_ceiling = partial_ceiling.clamp(0.0, 1.0);
        self
    }

    pub fn with_agreement_lift(mut self, agreement_lift: f32) -> Self {
        self.agreement_lift = agreement_lift.clamp(0.0, 1.0);
        self
    }
}

/// How much of the intended fan-out made it into the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// Every backend contributed.
    Full,
    /// At least one backend contributed, at least one did not.
    Partial,
    /// No live output; a stale cached report was served instead.
    Degraded,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Full => "full",
            Completeness::Partial => "partial",
            Completeness::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for Completeness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One section of the synthesized report, attributed to its provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportSection {
    pub provider: String,
    pub content: String,
    pub citations: Vec<Citation>,
}

/// The synthesized report delivered with `analysis:complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub sections: Vec<ReportSection>,
    /// Aggregate confidence in `[0.0, 1.0]`.
    pub confidence: f32,
    /// Union of section citations, deduplicated by source, first seen first.
    pub citations: Vec<Citation>,
    pub completeness: Completeness,
    /// True when this is a cached report served after a total backend
    /// failure.
    pub stale: bool,
    pub context: AnalysisContext,
    pub generated_at: DateTime<Utc>,
}

/// Every backend failed and no cached report was available.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no usable backend output: {details}")]
pub struct SynthesisFailure {
    pub details: String,
}

/// Merges per-backend outcomes into an [`AnalysisResult`].
#[derive(Debug, Clone, Default)]
pub struct ResponseSynthesizer {
    policy: SynthesisPolicy,
}

impl ResponseSynthesizer {
    pub fn new(policy: SynthesisPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &SynthesisPolicy {
        &self.policy
    }

    /// Build the report for one request from its call outcomes.
    ///
    /// `fallback` is the most recent cached report for the same fingerprint,
    /// consulted only when every backend failed. With no successes and no
    /// fallback this is the one place a request becomes an error.
    pub fn synthesize(
        &self,
        request: &AnalysisRequest,
        calls: &[ModelCall],
        fallback: Option<AnalysisResult>,
    ) -> Result<AnalysisResult, SynthesisFailure> {
        let successes: Vec<(&str, &BackendReply)> = calls
            .iter()
            .filter_map(|call| call.outcome.reply().map(|reply| (call.provider.as_str(), reply)))
            .collect();

        if successes.is_empty() {
            if let Some(mut previous) = fallback {
                warn!(
                    request_id = %request.id,
                    subject = %request.subject,
                    "serving stale cached report after total backend failure"
                );
                previous.stale = true;
                previous.completeness = Completeness::Degraded;
                return Ok(previous);
            }
            return Err(SynthesisFailure {
                details: summarize_failures(calls),
            });
        }

        let completeness = if successes.len() == calls.len() {
            Completeness::Full
        } else {
            Completeness::Partial
        };

        let mut confidence = self.aggregate_confidence(&successes);
        if completeness == Completeness::Partial {
            confidence = confidence.min(self.policy.partial_ceiling);
        }

        let sections = successes
            .iter()
            .map(|(provider, reply)| ReportSection {
                provider: provider.to_string(),
                content: reply.text.clone(),
                citations: reply.citations.clone(),
            })
            .collect();

        debug!(
            request_id = %request.id,
            completeness = %completeness,
            confidence = confidence,
            contributors = successes.len(),
            of = calls.len(),
            "synthesized analysis result"
        );

        Ok(AnalysisResult {
            sections,
            confidence: confidence.clamp(0.0, 1.0),
            citations: merge_citations(&successes),
            completeness,
            stale: false,
            context: request.context,
            generated_at: Utc::now(),
        })
    }

    /// Aggregate confidence across contributing backends.
    ///
    /// Starts from the mean, lifts it toward 1.0 in proportion to citation
    /// agreement, and floors it at the best single capped score so adding a
    /// contributor can never lower the result below what its strongest
    /// member alone would have earned.
    fn aggregate_confidence(&self, successes: &[(&str, &BackendReply)]) -> f32 {
        let mean = successes
            .iter()
            .map(|(_, reply)| reply.confidence)
            .sum::<f32>()
            / successes.len() as f32;

        if successes.len() < 2 {
            return mean.clamp(0.0, 1.0);
        }

        let agreement = citation_agreement(successes);
        let lifted = mean + self.policy.agreement_lift * agreement * (1.0 - mean);
        let floor = successes
            .iter()
            .map(|(_, reply)| reply.confidence.min(self.policy.partial_ceiling))
            .fold(0.0_f32, f32::max);

        lifted.max(floor).clamp(0.0, 1.0)
    }
}

/// Average pairwise Jaccard overlap of citation source sets.
///
/// Pairs where neither side cites anything carry no evidence and are
/// skipped; if no pair carries evidence the agreement is a neutral 0.5.
fn citation_agreement(successes: &[(&str, &BackendReply)]) -> f32 {
    let sets: Vec<HashSet<&str>> = successes
        .iter()
        .map(|(_, reply)| reply.citations.iter().map(|c| c.source.as_str()).collect())
        .collect();

    let mut total = 0.0_f32;
    let mut pairs = 0_u32;
    for i in 0..sets.len() {
        for j in (i + 1)..sets.len() {
            if sets[i].is_empty() && sets[j].is_empty() {
                continue;
            }
            let intersection = sets[i].intersection(&sets[j]).count();
            let union = sets[i].union(&sets[j]).count();
            total += intersection as f32 / union as f32;
            pairs += 1;
        }
    }

    if pairs == 0 {
        0.5
    } else {
        total / pairs as f32
    }
}

/// Union of citations across contributors, deduplicated by source,
/// preserving first-seen order.
fn merge_citations(successes: &[(&str, &BackendReply)]) -> Vec<Citation> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut merged = Vec::new();
    for (_, reply) in successes {
        for citation in &reply.citations {
            if seen.insert(citation.source.as_str()) {
                merged.push(citation.clone());
            }
        }
    }
    merged
}

fn summarize_failures(calls: &[ModelCall]) -> String {
    if calls.is_empty() {
        return "no backends configured".to_string();
    }
    calls
        .iter()
        .map(|call| match &call.outcome {
            CallOutcome::Timeout => format!("{}: timeout", call.provider),
            CallOutcome::CircuitOpen => format!("{}: circuit open", call.provider),
            CallOutcome::Error { message } => format!("{}: {}", call.provider, message),
            CallOutcome::Success { .. } => format!("{}: ok", call.provider),
        })
        .collect::<Vec<_>>()
        .join("; ")
}
