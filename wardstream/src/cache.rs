//! Report memoization and collapse of identical in-flight requests.
//!
//! Completed reports are cached per fingerprint with a depth-tiered TTL.
//! Expired entries stay in the store until overwritten so a total backend
//! failure can still serve the previous report, marked stale. [`SingleFlight`]
//! covers work that has not finished yet: concurrent submissions with the
//! same fingerprint share one orchestration and one outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CacheTtls;
use crate::request::{AnalysisDepth, Fingerprint};
use crate::synthesis::AnalysisResult;

/// One cached report with its freshness horizon.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub result: AnalysisResult,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Storage seam for cached reports. Per-key operations are atomic.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Option<CacheEntry>;
    async fn set(&self, key: Fingerprint, entry: CacheEntry);
    async fn remove(&self, key: &Fingerprint);
}

/// In-process store backing the default deployment.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<Fingerprint, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &Fingerprint) -> Option<CacheEntry> {
        self.lock().get(key).cloned()
    }

    async fn set(&self, key: Fingerprint, entry: CacheEntry) {
        self.lock().insert(key, entry);
    }

    async fn remove(&self, key: &Fingerprint) {
        self.lock().remove(key);
    }
}

/// TTL cache over synthesized reports, keyed by request fingerprint.
pub struct AnalysisCache {
    store: Arc<dyn CacheStore>,
    ttls: CacheTtls,
}

impl AnalysisCache {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self { store, ttls }
    }

    pub fn in_memory(ttls: CacheTtls) -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()), ttls)
    }

    /// Return a fresh report, if any. Expired entries are left in place so
    /// [`AnalysisCache::fallback`] can still serve them.
    pub async fn lookup(&self, key: &Fingerprint) -> Option<AnalysisResult> {
        let entry = self.store.get(key).await?;
        if !entry.is_fresh() {
            return None;
        }
        debug!(fingerprint = %key, "cache hit");
        Some(entry.result)
    }

    /// Most recent report regardless of expiry. Serving it is the caller's
    /// call; the result should be marked stale on the way out.
    pub async fn fallback(&self, key: &Fingerprint) -> Option<AnalysisResult> {
        let entry = self.store.get(key).await?;
        debug!(
            fingerprint = %key,
            fresh = entry.is_fresh(),
            "serving cached fallback"
        );
        Some(entry.result)
    }

    /// Record a completed report under its depth tier's TTL. Stale reports
    /// are fallbacks being re-served and are never written back.
    pub async fn store(&self, key: &Fingerprint, depth: AnalysisDepth, result: &AnalysisResult) {
        if result.stale {
            return;
        }
        let ttl = self.ttls.ttl(depth);
        let entry = CacheEntry {
            result: result.clone(),
            expires_at: Utc::now() + ttl,
        };
        debug!(fingerprint = %key, depth = %depth, ttl = ?ttl, "report cached");
        self.store.set(key.clone(), entry).await;
    }

    pub async fn invalidate(&self, key: &Fingerprint) {
        self.store.remove(key).await;
    }
}

/// Announcement slot for one flight: `None` until the computation resolves.
pub(crate) type FlightOutcome<E> = watch::Receiver<Option<Result<AnalysisResult, E>>>;

/// A caller's seat on an in-flight computation.
pub(crate) enum Flight<E> {
    /// First caller for this fingerprint. Runs the work and watches `cancel`
    /// for abandonment.
    Leader {
        outcome: FlightOutcome<E>,
        generation: u64,
        cancel: CancellationToken,
    },
    /// Attached to a computation another caller is already running.
    Follower {
        outcome: FlightOutcome<E>,
        generation: u64,
    },
}

struct InflightEntry<E> {
    waiters: usize,
    /// Distinguishes successive flights under the same fingerprint, so a
    /// late `leave` or `complete` from a finished flight cannot touch its
    /// successor.
    generation: u64,
    cancel: CancellationToken,
    announce: watch::Sender<Option<Result<AnalysisResult, E>>>,
}

/// In-flight computations per fingerprint. Identical concurrent requests
/// collapse onto one seat table; the single outcome is announced to every
/// waiter at once.
pub(crate) struct SingleFlight<E> {
    inflight: Mutex<HashMap<Fingerprint, InflightEntry<E>>>,
    generations: AtomicU64,
}

impl<E: Clone> SingleFlight<E> {
    pub(crate) fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Fingerprint, InflightEntry<E>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the computation for `key`, creating it if absent. Receivers are
    /// subscribed under the table lock, so a concurrent `complete` cannot
    /// slip its announcement past a joining waiter.
    pub(crate) fn begin(&self, key: &Fingerprint) -> Flight<E> {
        let mut inflight = self.lock();
        if let Some(entry) = inflight.get_mut(key) {
            entry.waiters += 1;
            return Flight::Follower {
                outcome: entry.announce.subscribe(),
                generation: entry.generation,
            };
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (announce, outcome) = watch::channel(None);
        let cancel = CancellationToken::new();
        inflight.insert(
            key.clone(),
            InflightEntry {
                waiters: 1,
                generation,
                cancel: cancel.clone(),
                announce,
            },
        );
        Flight::Leader {
            outcome,
            generation,
            cancel,
        }
    }

    /// Resolve the flight `generation`: every waiter still seated receives
    /// `outcome`, and the next `begin` for `key` starts a fresh flight. A
    /// resolution from an abandoned flight whose fingerprint has already been
    /// reclaimed by a newer one is dropped.
    pub(crate) fn complete(
        &self,
        key: &Fingerprint,
        generation: u64,
        outcome: Result<AnalysisResult, E>,
    ) {
        let mut inflight = self.lock();
        let entry = match inflight.get(key) {
            Some(entry) if entry.generation == generation => inflight.remove(key),
            _ => None,
        };
        drop(inflight);
        if let Some(entry) = entry {
            // All waiters may have left already; announcing to nobody is fine.
            entry.announce.send_replace(Some(outcome));
        }
    }

    /// Drop one caller's interest in the flight `generation`. When the last
    /// waiter leaves an unresolved flight, its computation is cancelled.
    pub(crate) fn leave(&self, key: &Fingerprint, generation: u64) {
        let mut inflight = self.lock();
        let abandoned = match inflight.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.waiters = entry.waiters.saturating_sub(1);
                entry.waiters == 0
            }
            _ => false,
        };
        if abandoned {
            if let Some(entry) = inflight.remove(key) {
                debug!(fingerprint = %key, "all waiters left; cancelling computation");
                entry.cancel.cancel();
            }
        }
    }

    /// Fire every in-flight computation's cancellation token. Entries stay
    /// seated; each computation resolves itself on the way out.
    pub(crate) fn cancel_all(&self) {
        for entry in self.lock().values() {
            entry.cancel.cancel();
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.lock().len()
    }
}
