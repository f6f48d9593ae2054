//! Parallel fan-out of one request to every analysis backend.
//!
//! Each backend sits behind its own circuit breaker and deadline; one slow
//! or failing provider cannot hold back the rest. The orchestrator never
//! fails as a whole: it always returns one outcome per backend and leaves
//! grading to the synthesizer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{AnalysisBackend, BackendError, BackendPrompt, BackendReply};
use crate::breaker::{BreakerSnapshot, CircuitBreaker, ExecuteError};
use crate::config::OrchestratorConfig;
use crate::progress::{AnalysisStage, ProgressEmitter};
use crate::request::AnalysisRequest;

/// How one backend's participation ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallOutcome {
    Success { reply: BackendReply },
    /// The call exceeded its depth-tier deadline and was cancelled.
    Timeout,
    /// The breaker was open; no call reached the backend.
    CircuitOpen,
    Error { message: String },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CallOutcome::Success { .. })
    }

    pub fn reply(&self) -> Option<&BackendReply> {
        match self {
            CallOutcome::Success { reply } => Some(reply),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CallOutcome::Success { .. } => "success",
            CallOutcome::Timeout => "timeout",
            CallOutcome::CircuitOpen => "circuit_open",
            CallOutcome::Error { .. } => "error",
        }
    }
}

/// Record of one backend's work on a request.
#[derive(Debug, Clone, Serialize)]
pub struct ModelCall {
    pub provider: String,
    pub deadline_ms: u64,
    /// Retry attempts made after the first call.
    pub retries: u32,
    pub outcome: CallOutcome,
    pub elapsed_ms: u64,
}

/// Provider health as exposed on status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub provider: String,
    pub breaker: BreakerSnapshot,
}

struct BackendSlot {
    backend: Arc<dyn AnalysisBackend>,
    breaker: CircuitBreaker,
}

/// Fans requests out to the configured backends.
pub struct ModelOrchestrator {
    slots: Vec<BackendSlot>,
    config: OrchestratorConfig,
}

impl ModelOrchestrator {
    pub fn new(backends: Vec<Arc<dyn AnalysisBackend>>, config: OrchestratorConfig) -> Self {
        let slots = backends
            .into_iter()
            .map(|backend| {
                let breaker = CircuitBreaker::new(backend.id().to_string(), config.breaker);
                BackendSlot { backend, breaker }
            })
            .collect();
        Self { slots, config }
    }

    pub fn backend_count(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Breaker snapshot per provider, in declaration order.
    pub fn status(&self) -> Vec<BackendStatus> {
        self.slots
            .iter()
            .map(|slot| BackendStatus {
                provider: slot.backend.id().to_string(),
                breaker: slot.breaker.snapshot(),
            })
            .collect()
    }

    /// Run one request against every backend in parallel.
    ///
    /// Waits for all calls to finish or deadline out, reporting the
    /// dispatch, first-outcome, and all-outcomes milestones through
    /// `progress`. Cancellation aborts in-flight calls; their outcome is
    /// recorded as an error without touching the breakers.
    pub async fn dispatch(
        &self,
        request: &AnalysisRequest,
        progress: &ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Vec<ModelCall> {
        let budget = self.config.budgets.budget(request.depth);
        let prompt = build_prompt(request, budget.max_tokens);
        let max_retries = request
            .options
            .max_retries
            .unwrap_or(self.config.max_retries);
        let retry_delay = request
            .options
            .retry_base_delay
            .unwrap_or(self.config.retry_base_delay);

        progress.advance_to(AnalysisStage::GatheringIntelligence);
        info!(
            request_id = %request.id,
            depth = %request.depth,
            backends = self.slots.len(),
            deadline = ?budget.deadline,
            "dispatching analysis fan-out"
        );

        let first_outcome = AtomicBool::new(false);
        let calls = join_all(self.slots.iter().map(|slot| {
            let prompt = &prompt;
            let first_outcome = &first_outcome;
            async move {
                let call = call_backend(
                    slot,
                    prompt,
                    budget.deadline,
                    max_retries,
                    retry_delay,
                    cancel,
                )
                .await;
                if !first_outcome.swap(true, Ordering::SeqCst) {
                    progress.advance_to(AnalysisStage::ProcessingData);
                }
                call
            }
        }))
        .await;

        progress.advance_to(AnalysisStage::AnalyzingPatterns);

        let successes = calls.iter().filter(|call| call.outcome.is_success()).count();
        info!(
            request_id = %request.id,
            successes,
            of = calls.len(),
            "fan-out complete"
        );
        calls
    }
}

/// Drive one backend to a final outcome, retrying failed attempts.
///
/// Every attempt gets the full per-call deadline. Retries stop early when
/// the breaker opens or the request is cancelled.
async fn call_backend(
    slot: &BackendSlot,
    prompt: &BackendPrompt,
    deadline: Duration,
    max_retries: u32,
    retry_delay: Duration,
    cancel: &CancellationToken,
) -> ModelCall {
    let provider = slot.backend.id().to_string();
    let started = Instant::now();
    let mut attempt = 0u32;

    let outcome = loop {
        if cancel.is_cancelled() {
            break CallOutcome::Error {
                message: "cancelled".to_string(),
            };
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = slot.breaker.execute(|| async {
                match tokio::time::timeout(deadline, slot.backend.invoke(prompt, deadline)).await {
                    Ok(inner) => inner,
                    Err(_) => Err(BackendError::Timeout(deadline)),
                }
            }) => Some(result),
        };

        match result {
            None => {
                break CallOutcome::Error {
                    message: "cancelled".to_string(),
                }
            }
            Some(Ok(reply)) => break CallOutcome::Success { reply },
            Some(Err(ExecuteError::Open(open))) => {
                debug!(
                    provider = %provider,
                    retry_in = ?open.retry_in,
                    "circuit open; call skipped"
                );
                break CallOutcome::CircuitOpen;
            }
            Some(Err(ExecuteError::Inner(err))) => {
                if attempt >= max_retries {
                    break match err {
                        BackendError::Timeout(_) => CallOutcome::Timeout,
                        BackendError::Service(message) => CallOutcome::Error { message },
                    };
                }
                attempt += 1;
                warn!(
                    provider = %provider,
                    attempt,
                    error = %err,
                    "backend attempt failed; retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(retry_delay) => {}
                    _ = cancel.cancelled() => break CallOutcome::Error {
                        message: "cancelled".to_string(),
                    },
                }
            }
        }
    };

    let call = ModelCall {
        provider,
        deadline_ms: deadline.as_millis() as u64,
        retries: attempt,
        outcome,
        elapsed_ms: started.elapsed().as_millis() as u64,
    };
    debug!(
        provider = %call.provider,
        outcome = call.outcome.label(),
        retries = call.retries,
        elapsed_ms = call.elapsed_ms,
        "backend call finished"
    );
    call
}

fn build_prompt(request: &AnalysisRequest, max_tokens: u32) -> BackendPrompt {
    let text = format!(
        "Analyze {} for the campaign dashboard.\n\
         Depth: {}. Posture: {}.\n\
         Report key findings with citations and end with a [confidence: 0.NN] marker.",
        request.subject, request.depth, request.context
    );
    BackendPrompt { text, max_tokens }
}
