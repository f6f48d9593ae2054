//! Resilient real-time analysis streaming for campaign dashboards.
//!
//! This library provides:
//! - Multi-backend analysis fan-out with per-backend circuit breakers and
//!   depth-tiered deadlines
//! - Response synthesis with citation-aware confidence aggregation and
//!   explicit partial/degraded results
//! - Sequenced multi-subscriber channels with transport reconnection,
//!   resume-after-reconnect, and bounded subscriber queues
//! - Request fingerprinting with TTL caching, in-flight dedup, and a
//!   priority admission queue under a concurrency ceiling
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use wardstream::{
//!     AnalysisBackend, AnalysisContext, AnalysisDepth, AnalysisRequest, Coordinator,
//!     HttpAnalysisBackend, NullTransport, StreamingConfig,
//! };
//!
//! # async fn run() -> Result<(), wardstream::AnalysisError> {
//! let backends: Vec<Arc<dyn AnalysisBackend>> = vec![Arc::new(HttpAnalysisBackend::new(
//!     "strategist",
//!     "http://127.0.0.1:8080/v1/analyze",
//!     "strategist-7b",
//! ))];
//! let coordinator = Coordinator::new(
//!     backends,
//!     Arc::new(NullTransport),
//!     StreamingConfig::default(),
//! );
//!
//! let mut events = coordinator.manager().subscribe("ward-12");
//! tokio::spawn(async move {
//!     while let Some(delivery) = events.recv().await {
//!         println!("{:?}", delivery);
//!     }
//! });
//!
//! let request = AnalysisRequest::new("ward-12", AnalysisDepth::Standard, AnalysisContext::Neutral);
//! let ticket = coordinator.submit("ward-12", request).await?;
//! let report = ticket.wait().await?;
//! println!("confidence {:.2} ({})", report.confidence, report.completeness);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod backend;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod orchestrator;
pub mod progress;
pub mod reconnect;
pub mod request;
pub mod stream;
pub mod synthesis;

// Re-export key coordinator types
pub use coordinator::{AnalysisError, AnalysisTicket, Coordinator, CoordinatorStatus};

// Re-export key request types
pub use request::{
    AnalysisContext, AnalysisDepth, AnalysisRequest, Fingerprint, RequestId, RequestOptions,
    ValidationError,
};

// Re-export key event types
pub use events::{ChannelId, ConnectionState, SequencedEvent, StreamEvent};

// Re-export key streaming types
pub use stream::{
    ChannelStatus, Delivery, NullTransport, StreamConnectionManager, StreamError, Subscription,
    Transport, TransportError, TransportLink, TransportWriter, STREAM_RESET_CODE,
};

// Re-export key backend types
pub use backend::{
    AnalysisBackend, BackendError, BackendPrompt, BackendReply, Citation, HttpAnalysisBackend,
};

// Re-export key resilience types
pub use breaker::{
    BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitOpenError, CircuitState, ExecuteError,
};
pub use reconnect::{NetworkQuality, ReconnectPolicy, ReconnectionStrategy};

// Re-export key orchestration types
pub use orchestrator::{BackendStatus, CallOutcome, ModelCall, ModelOrchestrator};

// Re-export key synthesis types
pub use synthesis::{
    AnalysisResult, Completeness, ReportSection, ResponseSynthesizer, SynthesisFailure,
    SynthesisPolicy,
};

// Re-export key progress types
pub use progress::{AnalysisStage, ProgressEmitter};

// Re-export key cache types
pub use cache::{AnalysisCache, CacheEntry, CacheStore, MemoryCacheStore};

// Re-export key config types
pub use config::{
    CacheTtls, ChannelConfig, DepthBudget, DepthBudgets, OrchestratorConfig, StreamingConfig,
};
