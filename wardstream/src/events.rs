//! Wire event types for analysis channels.
//!
//! Every event delivered to a subscriber or pushed over the transport is one
//! of these variants. The serialized form is internally tagged with the wire
//! name (`analysis:start`, `connection:status`, ...) so dashboard clients can
//! switch on `type` without touching the payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::Citation;
use crate::request::{AnalysisDepth, RequestId};
use crate::synthesis::AnalysisResult;

/// Identifier of a named event stream.
pub type ChannelId = String;

/// Connection state of a channel as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Transport is up; events flow.
    Open,
    /// Transport dropped; reconnection in progress. Local delivery continues.
    Degraded,
    /// Channel torn down; no further events.
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// All events delivered on an analysis channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// An analysis request was accepted for this channel.
    #[serde(rename = "analysis:start")]
    AnalysisStart {
        request_id: RequestId,
        subject: String,
        depth: AnalysisDepth,
        timestamp: DateTime<Utc>,
    },

    /// One stage of the fixed six-stage ladder completed.
    #[serde(rename = "analysis:progress")]
    AnalysisProgress {
        request_id: RequestId,
        stage: u8,
        total: u8,
        label: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// One merged content section of the final report.
    #[serde(rename = "analysis:section")]
    AnalysisSection {
        request_id: RequestId,
        provider: String,
        content: String,
        citations: Vec<Citation>,
        timestamp: DateTime<Utc>,
    },

    /// The synthesized report for a request.
    #[serde(rename = "analysis:complete")]
    AnalysisComplete {
        request_id: RequestId,
        result: AnalysisResult,
        timestamp: DateTime<Utc>,
    },

    /// A request failed, or the stream itself needs client action
    /// (e.g. `stream_reset` after an unresumable reconnect).
    #[serde(rename = "analysis:error")]
    AnalysisError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        code: String,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// The channel's connection state changed.
    #[serde(rename = "connection:status")]
    ConnectionStatus {
        state: ConnectionState,
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    /// Get the wire-level event type tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::AnalysisStart { .. } => "analysis:start",
            StreamEvent::AnalysisProgress { .. } => "analysis:progress",
            StreamEvent::AnalysisSection { .. } => "analysis:section",
            StreamEvent::AnalysisComplete { .. } => "analysis:complete",
            StreamEvent::AnalysisError { .. } => "analysis:error",
            StreamEvent::ConnectionStatus { .. } => "connection:status",
        }
    }

    /// Get the timestamp of this event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StreamEvent::AnalysisStart { timestamp, .. } => *timestamp,
            StreamEvent::AnalysisProgress { timestamp, .. } => *timestamp,
            StreamEvent::AnalysisSection { timestamp, .. } => *timestamp,
            StreamEvent::AnalysisComplete { timestamp, .. } => *timestamp,
            StreamEvent::AnalysisError { timestamp, .. } => *timestamp,
            StreamEvent::ConnectionStatus { timestamp, .. } => *timestamp,
        }
    }

    /// Get the request id if this event is request-scoped.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            StreamEvent::AnalysisStart { request_id, .. } => Some(request_id),
            StreamEvent::AnalysisProgress { request_id, .. } => Some(request_id),
            StreamEvent::AnalysisSection { request_id, .. } => Some(request_id),
            StreamEvent::AnalysisComplete { request_id, .. } => Some(request_id),
            StreamEvent::AnalysisError { request_id, .. } => request_id.as_deref(),
            StreamEvent::ConnectionStatus { .. } => None,
        }
    }

    /// The stage index, for progress events.
    pub fn stage(&self) -> Option<u8> {
        match self {
            StreamEvent::AnalysisProgress { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// An event stamped with its channel sequence number.
///
/// Sequence numbers are assigned at publish time, strictly increasing per
/// channel, and survive reconnects so the transport can resume from the last
/// delivered position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: StreamEvent,
}
