//! Request lifecycle from submission to published report.
//!
//! The coordinator validates each request, collapses identical in-flight
//! work onto one orchestration, admits jobs under the concurrency ceiling in
//! priority order, and publishes every lifecycle event to the request's
//! channel. It is a cheap `Clone` handle over shared state, so one instance
//! can be threaded through an entire deployment without globals.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::AnalysisBackend;
use crate::cache::{
    AnalysisCache, CacheStore, Flight, FlightOutcome, MemoryCacheStore, SingleFlight,
};
use crate::config::StreamingConfig;
use crate::events::{ChannelId, StreamEvent};
use crate::orchestrator::{BackendStatus, ModelOrchestrator};
use crate::progress::{AnalysisStage, ProgressEmitter};
use crate::request::{AnalysisRequest, Fingerprint, RequestId, ValidationError};
use crate::stream::{StreamConnectionManager, Transport};
use crate::synthesis::{AnalysisResult, ResponseSynthesizer, SynthesisFailure};

/// Terminal failure of one analysis request.
///
/// Carries `String` detail throughout so a shared failure can be cloned to
/// every deduplicated waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Synthesis(#[from] SynthesisFailure),

    /// Every interested caller dropped its ticket before the work finished.
    #[error("analysis cancelled before completion")]
    Cancelled,

    #[error("coordinator is shutting down")]
    Shutdown,
}

impl AnalysisError {
    /// Wire code carried by `analysis:error`.
    pub fn code(&self) -> &'static str {
        match self {
            AnalysisError::Validation(_) => "validation_error",
            AnalysisError::Synthesis(_) => "synthesis_failure",
            AnalysisError::Cancelled => "cancelled",
            AnalysisError::Shutdown => "shutdown",
        }
    }
}

/// Operational counters for status surfaces.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CoordinatorStatus {
    /// Analyses currently running under the concurrency ceiling.
    pub active: usize,
    /// Analyses queued behind the ceiling.
    pub pending: usize,
}

/// One queued analysis, ordered by priority then submission order.
struct PendingJob {
    priority: u8,
    seq: u64,
    request: AnalysisRequest,
    fingerprint: Fingerprint,
    generation: u64,
    channel: ChannelId,
    cancel: CancellationToken,
}

impl PartialEq for PendingJob {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PendingJob {}

impl PartialOrd for PendingJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then earlier submission first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    manager: StreamConnectionManager,
    orchestrator: ModelOrchestrator,
    synthesizer: ResponseSynthesizer,
    cache: AnalysisCache,
    dedup: SingleFlight<AnalysisError>,
    queue: Mutex<BinaryHeap<PendingJob>>,
    permits: Arc<Semaphore>,
    submissions: AtomicU64,
    active: AtomicUsize,
    shutdown: CancellationToken,
}

/// Front door for analysis requests.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Build a coordinator with the in-process cache store.
    pub fn new(
        backends: Vec<Arc<dyn AnalysisBackend>>,
        transport: Arc<dyn Transport>,
        config: StreamingConfig,
    ) -> Self {
        Self::with_store(backends, transport, Arc::new(MemoryCacheStore::new()), config)
    }

    /// Build a coordinator over an injected cache store.
    pub fn with_store(
        backends: Vec<Arc<dyn AnalysisBackend>>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn CacheStore>,
        config: StreamingConfig,
    ) -> Self {
        let StreamingConfig {
            orchestrator,
            channel,
            cache,
            synthesis,
            max_concurrent,
        } = config;
        Self {
            inner: Arc::new(Inner {
                manager: StreamConnectionManager::new(transport, channel),
                orchestrator: ModelOrchestrator::new(backends, orchestrator),
                synthesizer: ResponseSynthesizer::new(synthesis),
                cache: AnalysisCache::new(store, cache),
                dedup: SingleFlight::new(),
                queue: Mutex::new(BinaryHeap::new()),
                permits: Arc::new(Semaphore::new(max_concurrent)),
                submissions: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// The stream manager this coordinator publishes through. Subscribe here
    /// to observe a channel's events.
    pub fn manager(&self) -> &StreamConnectionManager {
        &self.inner.manager
    }

    /// Breaker health per backend.
    pub fn backend_status(&self) -> Vec<BackendStatus> {
        self.inner.orchestrator.status()
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            active: self.inner.active.load(Ordering::SeqCst),
            pending: self.inner.lock_queue().len(),
        }
    }

    /// Validate and schedule one analysis on `channel`.
    ///
    /// A fresh cached report resolves the ticket immediately. Otherwise the
    /// request either starts a new orchestration or joins an identical one
    /// already in flight; every accepted submission gets its own
    /// `analysis:start` and terminal event on the channel. Validation
    /// failures reject the request before any side effect.
    pub async fn submit(
        &self,
        channel: impl Into<ChannelId>,
        request: AnalysisRequest,
    ) -> Result<AnalysisTicket, AnalysisError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(AnalysisError::Shutdown);
        }
        request.validate()?;

        let channel: ChannelId = channel.into();
        let fingerprint = request.fingerprint();
        inner.manager.pin(&channel);
        inner.publish(
            &channel,
            StreamEvent::AnalysisStart {
                request_id: request.id.clone(),
                subject: request.subject.clone(),
                depth: request.depth,
                timestamp: Utc::now(),
            },
        );

        if let Some(result) = inner.cache.lookup(&fingerprint).await {
            info!(
                request_id = %request.id,
                fingerprint = %fingerprint,
                "serving cached report"
            );
            inner.publish_report(&channel, &request.id, &result);
            inner.manager.unpin(&channel);
            return Ok(AnalysisTicket {
                request_id: request.id,
                fingerprint,
                state: TicketState::Resolved(result),
            });
        }

        match inner.dedup.begin(&fingerprint) {
            Flight::Leader {
                outcome,
                generation,
                cancel,
            } => {
                let request_id = request.id.clone();
                let job = PendingJob {
                    priority: request.options.priority,
                    seq: inner.submissions.fetch_add(1, Ordering::Relaxed),
                    request,
                    fingerprint: fingerprint.clone(),
                    generation,
                    channel,
                    cancel,
                };
                inner.lock_queue().push(job);
                debug!(request_id = %request_id, fingerprint = %fingerprint, "analysis queued");
                Inner::pump(inner);
                Ok(AnalysisTicket {
                    request_id,
                    fingerprint: fingerprint.clone(),
                    state: TicketState::Waiting {
                        outcome,
                        seat: Seat {
                            inner: inner.clone(),
                            fingerprint,
                            generation,
                        },
                    },
                })
            }
            Flight::Follower {
                outcome,
                generation,
            } => {
                info!(
                    request_id = %request.id,
                    fingerprint = %fingerprint,
                    "joined in-flight analysis"
                );
                tokio::spawn(deliver_follower(
                    inner.clone(),
                    channel,
                    request.id.clone(),
                    outcome.clone(),
                ));
                Ok(AnalysisTicket {
                    request_id: request.id,
                    fingerprint: fingerprint.clone(),
                    state: TicketState::Waiting {
                        outcome,
                        seat: Seat {
                            inner: inner.clone(),
                            fingerprint,
                            generation,
                        },
                    },
                })
            }
        }
    }

    /// Refuse new work, fail queued analyses, cancel running ones, and tear
    /// down every channel. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        info!("coordinator shutting down");
        inner.shutdown.cancel();
        inner.permits.close();

        let drained: Vec<PendingJob> = {
            let mut queue = inner.lock_queue();
            let mut drained = Vec::with_capacity(queue.len());
            while let Some(job) = queue.pop() {
                drained.push(job);
            }
            drained
        };
        for job in drained {
            inner
                .dedup
                .complete(&job.fingerprint, job.generation, Err(AnalysisError::Shutdown));
            inner.manager.unpin(&job.channel);
        }

        // Running jobs stop at their next cancellation check and resolve
        // their own flights.
        inner.dedup.cancel_all();
        inner.manager.shutdown();
    }
}

/// Handle to one submitted analysis.
///
/// `wait` resolves to the shared outcome. Dropping an unresolved ticket
/// releases this caller's interest; when the last interested caller leaves,
/// the underlying computation is cancelled.
pub struct AnalysisTicket {
    request_id: RequestId,
    fingerprint: Fingerprint,
    state: TicketState,
}

impl std::fmt::Debug for AnalysisTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisTicket")
            .field("request_id", &self.request_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

enum TicketState {
    Resolved(AnalysisResult),
    Waiting {
        outcome: FlightOutcome<AnalysisError>,
        seat: Seat,
    },
}

impl AnalysisTicket {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Resolve to the analysis outcome, consuming the ticket.
    pub async fn wait(self) -> Result<AnalysisResult, AnalysisError> {
        match self.state {
            TicketState::Resolved(result) => Ok(result),
            TicketState::Waiting { mut outcome, seat } => {
                let resolution = match outcome.wait_for(|value| value.is_some()).await {
                    Ok(value) => value.clone(),
                    // Announcement slot dropped without a value: the flight
                    // was abandoned.
                    Err(_) => None,
                };
                drop(seat);
                match resolution {
                    Some(outcome) => outcome,
                    None => Err(AnalysisError::Cancelled),
                }
            }
        }
    }
}

/// One counted seat on an in-flight computation, released on drop.
struct Seat {
    inner: Arc<Inner>,
    fingerprint: Fingerprint,
    generation: u64,
}

impl Drop for Seat {
    fn drop(&mut self) {
        self.inner.dedup.leave(&self.fingerprint, self.generation);
    }
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, BinaryHeap<PendingJob>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish, dropping the event if the channel is already gone.
    fn publish(&self, channel: &str, event: StreamEvent) {
        if let Err(err) = self.manager.publish(channel, event) {
            debug!(channel = %channel, error = %err, "event dropped");
        }
    }

    fn publish_report(&self, channel: &str, request_id: &str, result: &AnalysisResult) {
        for section in &result.sections {
            self.publish(
                channel,
                StreamEvent::AnalysisSection {
                    request_id: request_id.to_string(),
                    provider: section.provider.clone(),
                    content: section.content.clone(),
                    citations: section.citations.clone(),
                    timestamp: Utc::now(),
                },
            );
        }
        self.publish(
            channel,
            StreamEvent::AnalysisComplete {
                request_id: request_id.to_string(),
                result: result.clone(),
                timestamp: Utc::now(),
            },
        );
    }

    fn publish_error(&self, channel: &str, request_id: RequestId, error: &AnalysisError) {
        self.publish(
            channel,
            StreamEvent::AnalysisError {
                request_id: Some(request_id),
                code: error.code().to_string(),
                message: error.to_string(),
                timestamp: Utc::now(),
            },
        );
    }

    /// Start queued jobs while permits and work are both available.
    fn pump(inner: &Arc<Inner>) {
        loop {
            let permit = match inner.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                // Ceiling reached, or the semaphore was closed on shutdown.
                Err(_) => return,
            };
            let job = inner.lock_queue().pop();
            match job {
                Some(job) => {
                    inner.active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(run_job(inner.clone(), job, permit));
                }
                None => {
                    // Release the spare permit before the emptiness re-check
                    // so a racing submit can always admit its own job.
                    drop(permit);
                    if inner.lock_queue().is_empty() {
                        return;
                    }
                }
            }
        }
    }
}

async fn run_job(inner: Arc<Inner>, job: PendingJob, permit: OwnedSemaphorePermit) {
    execute_job(&inner, job).await;
    drop(permit);
    inner.active.fetch_sub(1, Ordering::SeqCst);
    Inner::pump(&inner);
}

/// Drive one admitted analysis to its terminal event.
async fn execute_job(inner: &Arc<Inner>, job: PendingJob) {
    let PendingJob {
        request,
        fingerprint,
        generation,
        channel,
        cancel,
        ..
    } = job;

    if cancel.is_cancelled() {
        debug!(request_id = %request.id, "analysis abandoned before admission");
        inner
            .dedup
            .complete(&fingerprint, generation, Err(AnalysisError::Cancelled));
        inner.manager.unpin(&channel);
        return;
    }

    info!(
        request_id = %request.id,
        subject = %request.subject,
        depth = %request.depth,
        priority = request.options.priority,
        "analysis admitted"
    );
    let progress = ProgressEmitter::new(inner.manager.clone(), channel.clone(), request.id.clone());
    progress.advance_to(AnalysisStage::Initializing);

    let calls = inner.orchestrator.dispatch(&request, &progress, &cancel).await;

    if cancel.is_cancelled() {
        debug!(request_id = %request.id, "analysis abandoned mid-flight");
        inner
            .dedup
            .complete(&fingerprint, generation, Err(AnalysisError::Cancelled));
        inner.manager.unpin(&channel);
        return;
    }

    progress.advance_to(AnalysisStage::GeneratingInsights);

    let fallback = if calls.iter().any(|call| call.outcome.is_success()) {
        None
    } else {
        inner.cache.fallback(&fingerprint).await
    };

    match inner.synthesizer.synthesize(&request, &calls, fallback) {
        Ok(result) => {
            inner.cache.store(&fingerprint, request.depth, &result).await;
            progress.advance_to(AnalysisStage::FinalizingReport);
            inner.publish_report(&channel, &request.id, &result);
            info!(
                request_id = %request.id,
                completeness = %result.completeness,
                confidence = result.confidence,
                stale = result.stale,
                "analysis complete"
            );
            inner
                .dedup
                .complete(&fingerprint, generation, Ok(result));
        }
        Err(failure) => {
            let error = AnalysisError::Synthesis(failure);
            warn!(request_id = %request.id, error = %error, "analysis failed");
            inner.publish_error(&channel, request.id.clone(), &error);
            inner
                .dedup
                .complete(&fingerprint, generation, Err(error));
        }
    }
    inner.manager.unpin(&channel);
}

/// Mirror the shared outcome onto a joined submission's own request id.
async fn deliver_follower(
    inner: Arc<Inner>,
    channel: ChannelId,
    request_id: RequestId,
    mut outcome: FlightOutcome<AnalysisError>,
) {
    let resolution = match outcome.wait_for(|value| value.is_some()).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    match resolution {
        Some(Ok(result)) => inner.publish_report(&channel, &request_id, &result),
        Some(Err(error)) => {
            // Abandonment is client-initiated; only real failures go out.
            if !matches!(error, AnalysisError::Cancelled) {
                inner.publish_error(&channel, request_id.clone(), &error);
            }
        }
        None => {}
    }
    inner.manager.unpin(&channel);
}
