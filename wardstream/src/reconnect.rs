//! Reconnection backoff with network-quality adaptation.
//!
//! Delays grow exponentially per consecutive attempt and are capped, with a
//! bounded random jitter so a fleet of clients does not reconnect in
//! lockstep. A sliding window of recent connection outcomes classifies the
//! network as good, moderate, or poor and scales the growth rate and cap
//! accordingly.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff parameters for reconnection attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Growth factor applied per consecutive attempt.
    pub multiplier: f64,
    /// Upper bound on the computed delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Upper bound on the random jitter added to every delay, in milliseconds.
    pub max_jitter_ms: u64,
    /// How many recent connection outcomes feed the quality classifier.
    pub quality_window: usize,
    /// Success rate at or above which the network counts as good.
    pub good_rate: f32,
    /// Success rate below which the network counts as poor.
    pub poor_rate: f32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_jitter_ms: 1_000,
            quality_window: 8,
            good_rate: 0.75,
            poor_rate: 0.35,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(initial_delay_ms: u64, multiplier: f64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            multiplier,
            max_delay_ms,
            ..Default::default()
        }
    }

    pub fn with_max_jitter_ms(mut self, max_jitter_ms: u64) -> Self {
        self.max_jitter_ms = max_jitter_ms;
        self
    }

    pub fn with_quality_window(mut self, quality_window: usize) -> Self {
        self.quality_window = quality_window;
        self
    }
}

/// Observed network quality over the recent outcome window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Good,
    Moderate,
    Poor,
}

impl NetworkQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::Good => "good",
            NetworkQuality::Moderate => "moderate",
            NetworkQuality::Poor => "poor",
        }
    }

    /// Scale applied to the growth factor for this quality.
    fn growth_scale(&self) -> f64 {
        match self {
            NetworkQuality::Good => 0.75,
            NetworkQuality::Moderate => 1.0,
            NetworkQuality::Poor => 1.5,
        }
    }

    /// Scale applied to the delay cap for this quality.
    fn cap_scale(&self) -> f64 {
        match self {
            NetworkQuality::Good => 0.5,
            NetworkQuality::Moderate => 1.0,
            NetworkQuality::Poor => 2.0,
        }
    }
}

impl std::fmt::Display for NetworkQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stateful backoff sequence for one connection.
///
/// Owned exclusively by the channel's reconnect loop; not shared.
#[derive(Debug)]
pub struct ReconnectionStrategy {
    policy: ReconnectPolicy,
    attempt: u32,
    outcomes: VecDeque<bool>,
}

impl ReconnectionStrategy {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            outcomes: VecDeque::new(),
        }
    }

    /// Compute the delay before the next attempt and advance the counter.
    ///
    /// The base sequence is non-decreasing while quality stays constant; the
    /// jitter on top is uniform in `[0, max_jitter_ms]`.
    pub fn next_delay(&mut self) -> Duration {
        let quality = self.quality();
        let multiplier = (self.policy.multiplier * quality.growth_scale()).max(1.0);
        let cap = (self.policy.max_delay_ms as f64 * quality.cap_scale())
            .max(self.policy.initial_delay_ms as f64);

        let base = self.policy.initial_delay_ms as f64 * multiplier.powi(self.attempt as i32);
        let capped = base.min(cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = if self.policy.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.policy.max_jitter_ms)
        };

        Duration::from_millis(capped as u64 + jitter_ms)
    }

    /// Zero the attempt counter after a successful reconnection.
    ///
    /// The outcome window is kept: quality reflects history, not the current
    /// attempt run.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Record one connection attempt outcome into the quality window.
    pub fn record_outcome(&mut self, success: bool) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > self.policy.quality_window {
            self.outcomes.pop_front();
        }
    }

    /// Classify the network from the recent outcome window.
    ///
    /// An empty window is moderate: no evidence either way.
    pub fn quality(&self) -> NetworkQuality {
        if self.outcomes.is_empty() {
            return NetworkQuality::Moderate;
        }
        let successes = self.outcomes.iter().filter(|s| **s).count();
        let rate = successes as f32 / self.outcomes.len() as f32;
        if rate >= self.policy.good_rate {
            NetworkQuality::Good
        } else if rate < self.policy.poor_rate {
            NetworkQuality::Poor
        } else {
            NetworkQuality::Moderate
        }
    }

    /// Number of attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> ReconnectPolicy {
        ReconnectPolicy::new(100, 2.0, 1_000).with_max_jitter_ms(0)
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut strategy = ReconnectionStrategy::new(no_jitter_policy());

        let mut previous = Duration::ZERO;
        for _ in 0..8 {
            let delay = strategy.next_delay();
            assert!(delay >= previous, "sequence must be non-decreasing");
            previous = delay;
        }
        // 100 * 2^7 is far past the cap.
        assert_eq!(previous, Duration::from_millis(1_000));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut strategy = ReconnectionStrategy::new(no_jitter_policy());
        strategy.next_delay();
        strategy.next_delay();
        assert_eq!(strategy.attempt(), 2);

        strategy.reset();
        assert_eq!(strategy.attempt(), 0);
        assert_eq!(strategy.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let policy = ReconnectPolicy::new(100, 2.0, 1_000).with_max_jitter_ms(50);
        let mut strategy = ReconnectionStrategy::new(policy);

        for _ in 0..20 {
            strategy.reset();
            let delay = strategy.next_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_quality_classification() {
        let mut strategy = ReconnectionStrategy::new(no_jitter_policy());
        assert_eq!(strategy.quality(), NetworkQuality::Moderate);

        for _ in 0..8 {
            strategy.record_outcome(true);
        }
        assert_eq!(strategy.quality(), NetworkQuality::Good);

        for _ in 0..8 {
            strategy.record_outcome(false);
        }
        assert_eq!(strategy.quality(), NetworkQuality::Poor);

        strategy.record_outcome(true);
        strategy.record_outcome(true);
        strategy.record_outcome(true);
        strategy.record_outcome(true);
        assert_eq!(strategy.quality(), NetworkQuality::Moderate);
    }

    #[test]
    fn test_outcome_window_is_bounded() {
        let policy = no_jitter_policy().with_quality_window(4);
        let mut strategy = ReconnectionStrategy::new(policy);

        for _ in 0..50 {
            strategy.record_outcome(false);
        }
        for _ in 0..4 {
            strategy.record_outcome(true);
        }
        // Only the last four outcomes count.
        assert_eq!(strategy.quality(), NetworkQuality::Good);
    }

    #[test]
    fn test_poor_network_backs_off_harder_than_good() {
        let mut poor = ReconnectionStrategy::new(no_jitter_policy());
        let mut good = ReconnectionStrategy::new(no_jitter_policy());
        for _ in 0..8 {
            poor.record_outcome(false);
            good.record_outcome(true);
        }

        let mut last_poor = Duration::ZERO;
        let mut last_good = Duration::ZERO;
        for _ in 0..10 {
            last_poor = poor.next_delay();
            last_good = good.next_delay();
        }
        assert!(last_poor > last_good);
        // Poor widens the cap, good tightens it.
        assert_eq!(last_poor, Duration::from_millis(2_000));
        assert_eq!(last_good, Duration::from_millis(500));
    }
}
