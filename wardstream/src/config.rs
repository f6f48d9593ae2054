//! Runtime configuration with environment overrides.
//!
//! Every knob has a compiled-in default and an optional `WARDSTREAM_*`
//! environment override, read once when the config is constructed. Tests
//! build configs through the `with_*` methods instead of the environment.

use std::time::Duration;

use crate::breaker::BreakerSettings;
use crate::reconnect::ReconnectPolicy;
use crate::request::AnalysisDepth;
use crate::synthesis::SynthesisPolicy;

fn secs_from_env(var: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

fn millis_from_env(var: &str, default_ms: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default_ms)
}

fn u32_from_env(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn usize_from_env(var: &str, default: usize) -> usize {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// Deadline and token budget for one analysis depth.
#[derive(Debug, Clone, Copy)]
pub struct DepthBudget {
    pub deadline: Duration,
    pub max_tokens: u32,
}

/// Per-depth deadline/token pairs for backend calls.
#[derive(Debug, Clone)]
pub struct DepthBudgets {
    pub quick: DepthBudget,
    pub standard: DepthBudget,
    pub deep: DepthBudget,
}

impl Default for DepthBudgets {
    fn default() -> Self {
        Self {
            quick: DepthBudget {
                deadline: secs_from_env("WARDSTREAM_QUICK_DEADLINE_SECS", 5),
                max_tokens: u32_from_env("WARDSTREAM_QUICK_MAX_TOKENS", 1_024),
            },
            standard: DepthBudget {
                deadline: secs_from_env("WARDSTREAM_STANDARD_DEADLINE_SECS", 15),
                max_tokens: u32_from_env("WARDSTREAM_STANDARD_MAX_TOKENS", 2_048),
            },
            deep: DepthBudget {
                deadline: secs_from_env("WARDSTREAM_DEEP_DEADLINE_SECS", 30),
                max_tokens: u32_from_env("WARDSTREAM_DEEP_MAX_TOKENS", 4_096),
            },
        }
    }
}

impl DepthBudgets {
    /// Budget for the given depth.
    pub fn budget(&self, depth: AnalysisDepth) -> DepthBudget {
        match depth {
            AnalysisDepth::Quick => self.quick,
            AnalysisDepth::Standard => self.standard,
            AnalysisDepth::Deep => self.deep,
        }
    }

    pub fn with_deadline(mut self, depth: AnalysisDepth, deadline: Duration) -> Self {
        match depth {
            AnalysisDepth::Quick => self.quick.deadline = deadline,
            AnalysisDepth::Standard => self.standard.deadline = deadline,
            AnalysisDepth::Deep => self.deep.deadline = deadline,
        }
        self
    }
}

/// Time-to-live per analysis depth for cached results.
///
/// Deeper analyses cost more to recompute and age slower, so they keep
/// longer TTLs.
#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub quick: Duration,
    pub standard: Duration,
    pub deep: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            quick: secs_from_env("WARDSTREAM_CACHE_QUICK_TTL_SECS", 60),
            standard: secs_from_env("WARDSTREAM_CACHE_STANDARD_TTL_SECS", 300),
            deep: secs_from_env("WARDSTREAM_CACHE_DEEP_TTL_SECS", 900),
        }
    }
}

impl CacheTtls {
    /// TTL for the given depth.
    pub fn ttl(&self, depth: AnalysisDepth) -> Duration {
        match depth {
            AnalysisDepth::Quick => self.quick,
            AnalysisDepth::Standard => self.standard,
            AnalysisDepth::Deep => self.deep,
        }
    }

    pub fn with_ttl(mut self, depth: AnalysisDepth, ttl: Duration) -> Self {
        match depth {
            AnalysisDepth::Quick => self.quick = ttl,
            AnalysisDepth::Standard => self.standard = ttl,
            AnalysisDepth::Deep => self.deep = ttl,
        }
        self
    }
}

/// Settings for the backend fan-out.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub budgets: DepthBudgets,
    /// Breaker applied per backend.
    pub breaker: BreakerSettings,
    /// Default retry attempts after the first call, unless the request
    /// overrides it.
    pub max_retries: u32,
    /// Fixed delay between attempts to the same backend.
    pub retry_base_delay: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        // Zero is a valid retry count, so no >0 filter here.
        let max_retries = std::env::var("WARDSTREAM_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(2);
        Self {
            budgets: DepthBudgets::default(),
            breaker: BreakerSettings::new(
                u32_from_env("WARDSTREAM_BREAKER_THRESHOLD", 5),
                secs_from_env("WARDSTREAM_BREAKER_TIMEOUT_SECS", 30),
            ),
            max_retries,
            retry_base_delay: Duration::from_millis(millis_from_env(
                "WARDSTREAM_RETRY_DELAY_MS",
                500,
            )),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_budgets(mut self, budgets: DepthBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }
}

/// Settings for channel delivery and transport recovery.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Bounded event queue per subscriber; the oldest event is dropped on
    /// overflow.
    pub subscriber_buffer: usize,
    /// How many recent events a channel retains for resume after reconnect.
    pub retain_events: usize,
    /// Breaker guarding reconnection attempts.
    pub breaker: BreakerSettings,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: usize_from_env("WARDSTREAM_SUBSCRIBER_BUFFER", 64),
            retain_events: usize_from_env("WARDSTREAM_RETAIN_EVENTS", 256),
            breaker: BreakerSettings::new(
                u32_from_env("WARDSTREAM_RECONNECT_BREAKER_THRESHOLD", 5),
                secs_from_env("WARDSTREAM_RECONNECT_BREAKER_TIMEOUT_SECS", 30),
            ),
            reconnect: ReconnectPolicy::new(
                millis_from_env("WARDSTREAM_RECONNECT_INITIAL_MS", 500),
                2.0,
                millis_from_env("WARDSTREAM_RECONNECT_MAX_MS", 30_000),
            ),
        }
    }
}

impl ChannelConfig {
    pub fn with_subscriber_buffer(mut self, subscriber_buffer: usize) -> Self {
        self.subscriber_buffer = subscriber_buffer;
        self
    }

    pub fn with_retain_events(mut self, retain_events: usize) -> Self {
        self.retain_events = retain_events;
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerSettings) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Top-level configuration for the streaming layer.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub orchestrator: OrchestratorConfig,
    pub channel: ChannelConfig,
    pub cache: CacheTtls,
    pub synthesis: SynthesisPolicy,
    /// Analyses allowed to run at once; the rest queue by priority.
    pub max_concurrent: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamingConfig {
    pub fn new() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            channel: ChannelConfig::default(),
            cache: CacheTtls::default(),
            synthesis: SynthesisPolicy::default(),
            max_concurrent: usize_from_env("WARDSTREAM_MAX_CONCURRENT", 4),
        }
    }

    pub fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_cache(mut self, cache: CacheTtls) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_synthesis(mut self, synthesis: SynthesisPolicy) -> Self {
        self.synthesis = synthesis;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }
}
