//! The fixed six-stage progress ladder.
//!
//! Subscribers render a stepper from these events, so the contract is
//! strict: stages arrive in order, each exactly once, no gaps. The emitter
//! enforces that regardless of how callers interleave.

use std::sync::{Mutex, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::{ChannelId, StreamEvent};
use crate::request::RequestId;
use crate::stream::StreamConnectionManager;

/// Stages every analysis walks through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    Initializing,
    GatheringIntelligence,
    ProcessingData,
    AnalyzingPatterns,
    GeneratingInsights,
    FinalizingReport,
}

impl AnalysisStage {
    /// Number of stages in the ladder.
    pub const TOTAL: u8 = 6;

    pub fn all() -> [AnalysisStage; 6] {
        [
            AnalysisStage::Initializing,
            AnalysisStage::GatheringIntelligence,
            AnalysisStage::ProcessingData,
            AnalysisStage::AnalyzingPatterns,
            AnalysisStage::GeneratingInsights,
            AnalysisStage::FinalizingReport,
        ]
    }

    /// One-based position in the ladder.
    pub fn index(&self) -> u8 {
        match self {
            AnalysisStage::Initializing => 1,
            AnalysisStage::GatheringIntelligence => 2,
            AnalysisStage::ProcessingData => 3,
            AnalysisStage::AnalyzingPatterns => 4,
            AnalysisStage::GeneratingInsights => 5,
            AnalysisStage::FinalizingReport => 6,
        }
    }

    pub fn from_index(index: u8) -> Option<AnalysisStage> {
        match index {
            1 => Some(AnalysisStage::Initializing),
            2 => Some(AnalysisStage::GatheringIntelligence),
            3 => Some(AnalysisStage::ProcessingData),
            4 => Some(AnalysisStage::AnalyzingPatterns),
            5 => Some(AnalysisStage::GeneratingInsights),
            6 => Some(AnalysisStage::FinalizingReport),
            _ => None,
        }
    }

    /// Human-readable label shown in the dashboard stepper.
    pub fn label(&self) -> &'static str {
        match self {
            AnalysisStage::Initializing => "Initializing Analysis",
            AnalysisStage::GatheringIntelligence => "Gathering Intelligence",
            AnalysisStage::ProcessingData => "Processing Data",
            AnalysisStage::AnalyzingPatterns => "Analyzing Patterns",
            AnalysisStage::GeneratingInsights => "Generating Insights",
            AnalysisStage::FinalizingReport => "Finalizing Report",
        }
    }
}

impl std::fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Publishes `analysis:progress` events for one request.
///
/// `advance_to` may be called from any task in any order; emission stays
/// strictly 1 through 6 with repeats and regressions ignored.
pub struct ProgressEmitter {
    manager: StreamConnectionManager,
    channel: ChannelId,
    request_id: RequestId,
    /// Highest stage index already emitted; 0 before the first.
    emitted: Mutex<u8>,
}

impl ProgressEmitter {
    pub fn new(
        manager: StreamConnectionManager,
        channel: impl Into<ChannelId>,
        request_id: impl Into<RequestId>,
    ) -> Self {
        Self {
            manager,
            channel: channel.into(),
            request_id: request_id.into(),
            emitted: Mutex::new(0),
        }
    }

    /// Emit every unemitted stage up to and including `stage`.
    pub fn advance_to(&self, stage: AnalysisStage) {
        self.advance_with(stage, None);
    }

    /// Like [`ProgressEmitter::advance_to`], attaching `message` to the
    /// target stage. Skipped-over stages are emitted without a message.
    pub fn advance_with(&self, stage: AnalysisStage, message: Option<String>) {
        let mut emitted = self.emitted.lock().unwrap_or_else(PoisonError::into_inner);
        if *emitted >= stage.index() {
            return;
        }

        for step in AnalysisStage::all() {
            let index = step.index();
            if index <= *emitted || index > stage.index() {
                continue;
            }
            let note = if index == stage.index() {
                message.clone()
            } else {
                None
            };
            let result = self.manager.publish(
                &self.channel,
                StreamEvent::AnalysisProgress {
                    request_id: self.request_id.clone(),
                    stage: index,
                    total: AnalysisStage::TOTAL,
                    label: step.label().to_string(),
                    message: note,
                    timestamp: Utc::now(),
                },
            );
            if let Err(err) = result {
                // The channel disappeared under us; nothing to update.
                debug!(channel = %self.channel, error = %err, "progress event dropped");
            }
            *emitted = index;
        }
    }

    /// Highest stage emitted so far.
    pub fn current(&self) -> Option<AnalysisStage> {
        let emitted = self.emitted.lock().unwrap_or_else(PoisonError::into_inner);
        AnalysisStage::from_index(*emitted)
    }
}
