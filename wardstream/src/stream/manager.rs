//! Channel registry, subscriber fan-out, and transport recovery.
//!
//! One logical connection per channel, shared by every subscriber of that
//! channel. Events are sequence-numbered at publish time, fanned out to
//! per-subscriber bounded queues, and mirrored over the transport. A
//! per-channel loop owns the link and rides out drops with breaker-gated,
//! backoff-paced reconnects; local delivery never stops while the link is
//! down.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, ExecuteError};
use crate::config::ChannelConfig;
use crate::events::{ChannelId, ConnectionState, SequencedEvent, StreamEvent};
use crate::reconnect::ReconnectionStrategy;
use crate::stream::transport::{Transport, TransportLink};

/// Error code telling a remote client its stream cannot be resumed.
pub const STREAM_RESET_CODE: &str = "stream_reset";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("stream manager is shut down")]
    ShutDown,
}

/// What a subscriber pulls off its queue.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(SequencedEvent),
    /// The subscriber fell behind and the oldest `missed` events were
    /// dropped. Delivered once per overflow episode, not per event.
    Lagged { missed: u64 },
}

/// Point-in-time view of one channel, for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub channel: String,
    pub state: ConnectionState,
    pub subscribers: usize,
    pub pins: usize,
    pub last_seq: u64,
}

struct ChannelEntry {
    state: ConnectionState,
    next_seq: u64,
    next_subscriber: u64,
    /// Keyed by subscriber id; ids are assigned monotonically, so iteration
    /// follows subscription order and removal never searches.
    subscribers: BTreeMap<u64, broadcast::Sender<SequencedEvent>>,
    /// Recent events kept for transport resume after a reconnect.
    retained: VecDeque<SequencedEvent>,
    /// In-flight analyses holding the channel open without a subscriber.
    pins: usize,
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    channels: Mutex<HashMap<ChannelId, ChannelEntry>>,
    shutdown: CancellationToken,
}

/// Handle to the shared channel registry. Clones are cheap and equivalent.
#[derive(Clone)]
pub struct StreamConnectionManager {
    inner: Arc<Inner>,
}

impl StreamConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Attach a subscriber to `channel`, creating the channel and its
    /// connection loop on first use.
    pub fn subscribe(&self, channel: impl Into<ChannelId>) -> Subscription {
        let channel = channel.into();
        if self.inner.shutdown.is_cancelled() {
            warn!(channel = %channel, "subscribe after shutdown; returning closed subscription");
            let (sender, receiver) = broadcast::channel(1);
            drop(sender);
            return Subscription {
                channel,
                id: 0,
                receiver,
                inner: Weak::new(),
                active: false,
            };
        }

        let (id, receiver) = {
            let mut map = self.inner.lock_channels();
            let entry = Inner::ensure_channel(&self.inner, &mut map, &channel);
            let id = entry.next_subscriber;
            entry.next_subscriber += 1;
            let (sender, receiver) =
                broadcast::channel(self.inner.config.subscriber_buffer.max(1));
            entry.subscribers.insert(id, sender);
            (id, receiver)
        };

        debug!(channel = %channel, subscriber = id, "subscriber attached");
        Subscription {
            channel,
            id,
            receiver,
            inner: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// Publish an event to every subscriber of `channel` and to the
    /// transport. Returns the assigned sequence number.
    pub fn publish(&self, channel: &str, event: StreamEvent) -> Result<u64, StreamError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(StreamError::ShutDown);
        }
        let mut map = self.inner.lock_channels();
        match map.get_mut(channel) {
            Some(entry) => Ok(self.inner.publish_to(entry, event)),
            None => Err(StreamError::UnknownChannel(channel.to_string())),
        }
    }

    /// Connection state of a channel, or `None` if it does not exist.
    pub fn channel_state(&self, channel: &str) -> Option<ConnectionState> {
        self.inner
            .lock_channels()
            .get(channel)
            .map(|entry| entry.state)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .lock_channels()
            .get(channel)
            .map(|entry| entry.subscribers.len())
            .unwrap_or(0)
    }

    /// Snapshot of every live channel, sorted by name.
    pub fn status(&self) -> Vec<ChannelStatus> {
        let map = self.inner.lock_channels();
        let mut statuses: Vec<ChannelStatus> = map
            .iter()
            .map(|(channel, entry)| ChannelStatus {
                channel: channel.clone(),
                state: entry.state,
                subscribers: entry.subscribers.len(),
                pins: entry.pins,
                last_seq: entry.next_seq,
            })
            .collect();
        statuses.sort_by(|a, b| a.channel.cmp(&b.channel));
        statuses
    }

    /// Keep `channel` alive for an in-flight analysis, creating it if
    /// needed. Paired with [`StreamConnectionManager::unpin`].
    pub(crate) fn pin(&self, channel: &str) {
        let channel: ChannelId = channel.to_string();
        let mut map = self.inner.lock_channels();
        let entry = Inner::ensure_channel(&self.inner, &mut map, &channel);
        entry.pins += 1;
    }

    /// Release one pin; the channel is torn down once no subscriber and no
    /// pin reference it.
    pub(crate) fn unpin(&self, channel: &str) {
        let mut map = self.inner.lock_channels();
        let teardown = match map.get_mut(channel) {
            Some(entry) => {
                entry.pins = entry.pins.saturating_sub(1);
                entry.pins == 0 && entry.subscribers.is_empty()
            }
            None => false,
        };
        if teardown {
            Inner::teardown_locked(&mut map, channel);
        }
    }

    /// Tear down a channel now: remaining subscribers get a final
    /// `connection:status{closed}` event and then end of stream.
    pub fn close(&self, channel: &str) {
        let mut map = self.inner.lock_channels();
        Inner::teardown_locked(&mut map, channel);
    }

    /// Tear down every channel and refuse further publishes.
    pub fn shutdown(&self) {
        info!("stream manager shutting down");
        self.inner.shutdown.cancel();
        let mut map = self.inner.lock_channels();
        let names: Vec<ChannelId> = map.keys().cloned().collect();
        for name in names {
            Inner::teardown_locked(&mut map, &name);
        }
    }
}

impl Inner {
    fn lock_channels(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelEntry>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up or create a channel entry, spawning its connection loop on
    /// creation. The registry lock must already be held.
    fn ensure_channel<'a>(
        inner: &Arc<Inner>,
        map: &'a mut HashMap<ChannelId, ChannelEntry>,
        channel: &ChannelId,
    ) -> &'a mut ChannelEntry {
        map.entry(channel.clone()).or_insert_with(|| {
            let cancel = inner.shutdown.child_token();
            info!(channel = %channel, "channel created");
            tokio::spawn(run_channel(
                inner.clone(),
                channel.clone(),
                cancel.clone(),
            ));
            ChannelEntry {
                state: ConnectionState::Connecting,
                next_seq: 0,
                next_subscriber: 0,
                subscribers: BTreeMap::new(),
                retained: VecDeque::new(),
                pins: 0,
                cancel,
                wake: Arc::new(Notify::new()),
            }
        })
    }

    /// Assign the next sequence number, retain the event for resume, fan it
    /// out, and wake the transport writer.
    fn publish_to(&self, entry: &mut ChannelEntry, event: StreamEvent) -> u64 {
        entry.next_seq += 1;
        let sequenced = SequencedEvent {
            seq: entry.next_seq,
            event,
        };

        entry.retained.push_back(sequenced.clone());
        while entry.retained.len() > self.config.retain_events.max(1) {
            entry.retained.pop_front();
        }

        // A send error means that subscriber dropped its receiver; it will
        // be removed when its handle unsubscribes.
        for sender in entry.subscribers.values() {
            let _ = sender.send(sequenced.clone());
        }

        entry.wake.notify_one();
        sequenced.seq
    }

    /// Record a state change and announce it on the channel itself.
    fn set_state(&self, channel: &str, state: ConnectionState) {
        let mut map = self.lock_channels();
        if let Some(entry) = map.get_mut(channel) {
            if entry.state != state {
                entry.state = state;
                self.publish_to(
                    entry,
                    StreamEvent::ConnectionStatus {
                        state,
                        timestamp: Utc::now(),
                    },
                );
            }
        }
    }

    /// Detach one subscriber. Idempotent: a second removal of the same id
    /// finds nothing and does nothing.
    fn unsubscribe(&self, channel: &str, id: u64) {
        let mut map = self.lock_channels();
        let teardown = match map.get_mut(channel) {
            Some(entry) => {
                if entry.subscribers.remove(&id).is_some() {
                    debug!(channel = %channel, subscriber = id, "subscriber detached");
                }
                entry.subscribers.is_empty() && entry.pins == 0
            }
            None => false,
        };
        if teardown {
            Inner::teardown_locked(&mut map, channel);
        }
    }

    fn teardown_locked(map: &mut HashMap<ChannelId, ChannelEntry>, channel: &str) {
        if let Some(mut entry) = map.remove(channel) {
            entry.state = ConnectionState::Closed;
            let closing = SequencedEvent {
                seq: entry.next_seq + 1,
                event: StreamEvent::ConnectionStatus {
                    state: ConnectionState::Closed,
                    timestamp: Utc::now(),
                },
            };
            for sender in entry.subscribers.values() {
                let _ = sender.send(closing.clone());
            }
            entry.cancel.cancel();
            info!(channel = %channel, "channel torn down");
        }
    }

    fn wake_handle(&self, channel: &str) -> Option<Arc<Notify>> {
        self.lock_channels()
            .get(channel)
            .map(|entry| entry.wake.clone())
    }
}

/// A subscriber's handle: pulls deliveries and detaches on drop.
pub struct Subscription {
    channel: ChannelId,
    id: u64,
    receiver: broadcast::Receiver<SequencedEvent>,
    inner: Weak<Inner>,
    active: bool,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next delivery, or `None` once the channel is gone and the queue is
    /// drained. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Delivery> {
        match self.receiver.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                Some(Delivery::Lagged { missed })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Detach from the channel. Calling this twice is a no-op.
    pub fn unsubscribe(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.unsubscribe(&self.channel, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

enum LinkEnd {
    Dropped,
    Cancelled,
}

/// Per-channel connection loop: connect behind the breaker, mirror events,
/// reconnect on drops with adaptive backoff.
async fn run_channel(inner: Arc<Inner>, channel: ChannelId, cancel: CancellationToken) {
    let mut strategy = ReconnectionStrategy::new(inner.config.reconnect.clone());
    let breaker = CircuitBreaker::new(format!("reconnect:{}", channel), inner.config.breaker);
    let mut last_sent: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match breaker.execute(|| inner.transport.connect(&channel)).await {
            Ok(link) => {
                strategy.record_outcome(true);
                strategy.reset();
                inner.set_state(&channel, ConnectionState::Open);
                info!(channel = %channel, quality = %strategy.quality(), "transport connected");

                match drive_link(&inner, &channel, link, &mut last_sent, &cancel).await {
                    LinkEnd::Cancelled => break,
                    LinkEnd::Dropped => {
                        strategy.record_outcome(false);
                        inner.set_state(&channel, ConnectionState::Degraded);
                        warn!(channel = %channel, "transport dropped; local delivery continues");
                    }
                }
            }
            // Skipped entirely: no connect call reaches the transport while
            // the breaker is open.
            Err(ExecuteError::Open(open)) => {
                inner.set_state(&channel, ConnectionState::Degraded);
                debug!(
                    channel = %channel,
                    retry_in = ?open.retry_in,
                    "reconnect breaker open; skipping attempt"
                );
            }
            Err(ExecuteError::Inner(err)) => {
                strategy.record_outcome(false);
                inner.set_state(&channel, ConnectionState::Degraded);
                warn!(
                    channel = %channel,
                    error = %err,
                    quality = %strategy.quality(),
                    "reconnect attempt failed"
                );
            }
        }

        let delay = strategy.next_delay();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => break,
        }
    }

    debug!(channel = %channel, "connection loop exited");
}

/// Feed retained events through one live link until it drops.
///
/// `last_sent` tracks the transport's resume position across links. If the
/// retained window no longer reaches that position, the remote gets one
/// `stream_reset` error and delivery restarts from the oldest retained
/// event.
async fn drive_link(
    inner: &Arc<Inner>,
    channel: &str,
    link: TransportLink,
    last_sent: &mut u64,
    cancel: &CancellationToken,
) -> LinkEnd {
    let TransportLink { mut writer, closed } = link;
    let wake = match inner.wake_handle(channel) {
        Some(wake) => wake,
        None => return LinkEnd::Cancelled,
    };

    loop {
        let outbound = {
            let map = inner.lock_channels();
            let entry = match map.get(channel) {
                Some(entry) => entry,
                None => return LinkEnd::Cancelled,
            };
            match entry.retained.iter().find(|e| e.seq > *last_sent) {
                None => None,
                Some(next) if next.seq > *last_sent + 1 => {
                    // The window moved past the resume position.
                    Some(SequencedEvent {
                        seq: next.seq - 1,
                        event: StreamEvent::AnalysisError {
                            request_id: None,
                            code: STREAM_RESET_CODE.to_string(),
                            message: "retained window expired during reconnect; restart stream"
                                .to_string(),
                            timestamp: Utc::now(),
                        },
                    })
                }
                Some(next) => Some(next.clone()),
            }
        };

        match outbound {
            Some(event) => {
                let seq = event.seq;
                tokio::select! {
                    _ = cancel.cancelled() => return LinkEnd::Cancelled,
                    _ = closed.cancelled() => return LinkEnd::Dropped,
                    result = writer.send(&event) => match result {
                        Ok(()) => *last_sent = seq,
                        Err(err) => {
                            debug!(channel = %channel, error = %err, "link send failed");
                            return LinkEnd::Dropped;
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return LinkEnd::Cancelled,
                    _ = closed.cancelled() => return LinkEnd::Dropped,
                    _ = wake.notified() => {}
                }
            }
        }
    }
}
