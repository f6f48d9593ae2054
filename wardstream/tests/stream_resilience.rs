//! Transport loss and recovery: reconnect pacing, breaker gating, resume
//! versus stream reset, and teardown as seen from both sides of a channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use wardstream::{
    BreakerSettings, ChannelConfig, ConnectionState, Delivery, ReconnectPolicy, SequencedEvent,
    StreamConnectionManager, StreamEvent, Subscription, Transport, TransportError, TransportLink,
    TransportWriter, STREAM_RESET_CODE,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport fake: every accepted link records what it is sent, and the
/// test can fail upcoming connects or drop a live link on cue.
struct FlakyTransport {
    connects: AtomicUsize,
    fail_next: AtomicUsize,
    links: Mutex<Vec<LinkHandle>>,
}

#[derive(Clone)]
struct LinkHandle {
    log: Arc<Mutex<Vec<SequencedEvent>>>,
    closed: CancellationToken,
}

struct RecordingWriter {
    log: Arc<Mutex<Vec<SequencedEvent>>>,
    closed: CancellationToken,
}

#[async_trait]
impl TransportWriter for RecordingWriter {
    async fn send(&mut self, event: &SequencedEvent) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Send("link closed".to_string()));
        }
        self.log.lock().unwrap().push(event.clone());
        Ok(())
    }
}

impl FlakyTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connects: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    fn failing_first(n: usize) -> Arc<Self> {
        let transport = Self::new();
        transport.fail_next.store(n, Ordering::SeqCst);
        transport
    }

    fn always_failing() -> Arc<Self> {
        Self::failing_first(usize::MAX)
    }

    fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    /// Everything sent over link `index`, in send order.
    fn sent(&self, index: usize) -> Vec<SequencedEvent> {
        self.links.lock().unwrap()[index].log.lock().unwrap().clone()
    }

    /// Simulate the remote side dropping link `index`.
    fn drop_link(&self, index: usize) {
        self.links.lock().unwrap()[index].closed.cancel();
    }

    async fn wait_for_connects(&self, count: usize) {
        for _ in 0..500 {
            if self.connects() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("transport never reached {} connect attempts", count);
    }

    async fn wait_for_sent(&self, index: usize, count: usize) {
        for _ in 0..500 {
            let len = self
                .links
                .lock()
                .unwrap()
                .get(index)
                .map(|link| link.log.lock().unwrap().len())
                .unwrap_or(0);
            if len >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("link {} never received {} events", index, count);
    }
}

#[async_trait]
impl Transport for FlakyTransport {
    async fn connect(&self, channel: &str) -> Result<TransportLink, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connect(format!(
                "injected failure for {}",
                channel
            )));
        }
        let log = Arc::new(Mutex::new(Vec::new()));
        let closed = CancellationToken::new();
        self.links.lock().unwrap().push(LinkHandle {
            log: log.clone(),
            closed: closed.clone(),
        });
        Ok(TransportLink::new(
            Box::new(RecordingWriter {
                log,
                closed: closed.clone(),
            }),
            closed,
        ))
    }
}

/// Backoff tuned so reconnects land within milliseconds of virtual time.
fn fast_channel_config() -> ChannelConfig {
    ChannelConfig::default()
        .with_reconnect(ReconnectPolicy::new(10, 2.0, 50).with_max_jitter_ms(0))
}

fn note(text: &str) -> StreamEvent {
    StreamEvent::AnalysisError {
        request_id: None,
        code: "test_note".to_string(),
        message: text.to_string(),
        timestamp: Utc::now(),
    }
}

/// Pull every delivery already queued for this subscriber.
async fn drain_available(subscription: &mut Subscription) -> Vec<SequencedEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_millis(50), subscription.recv()).await {
            Ok(Some(Delivery::Event(event))) => events.push(event),
            Ok(Some(Delivery::Lagged { .. })) => continue,
            Ok(None) | Err(_) => return events,
        }
    }
}

fn seqs(events: &[SequencedEvent]) -> Vec<u64> {
    events.iter().map(|event| event.seq).collect()
}

fn statuses(events: &[SequencedEvent]) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match &event.event {
            StreamEvent::ConnectionStatus { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_drop_reconnects_and_resumes_from_last_sent() {
    init_tracing();
    let transport = FlakyTransport::new();
    let manager = StreamConnectionManager::new(transport.clone(), fast_channel_config());

    let mut subscription = manager.subscribe("ward-7");
    transport.wait_for_sent(0, 1).await;

    manager.publish("ward-7", note("a")).unwrap();
    manager.publish("ward-7", note("b")).unwrap();
    transport.wait_for_sent(0, 3).await;
    assert_eq!(seqs(&transport.sent(0)), vec![1, 2, 3]);

    transport.drop_link(0);
    transport.wait_for_connects(2).await;
    transport.wait_for_sent(1, 2).await;
    manager.publish("ward-7", note("c")).unwrap();
    transport.wait_for_sent(1, 3).await;

    // The second link picks up exactly where the first stopped: the
    // degraded/open statuses published during the outage, then new traffic.
    // Nothing the first link acknowledged is sent again.
    let resumed = transport.sent(1);
    assert_eq!(seqs(&resumed), vec![4, 5, 6]);
    assert_eq!(
        statuses(&resumed),
        vec![ConnectionState::Degraded, ConnectionState::Open]
    );
    assert!(!resumed
        .iter()
        .any(|event| matches!(&event.event, StreamEvent::AnalysisError { code, .. } if code == STREAM_RESET_CODE)));

    assert_eq!(transport.connects(), 2);
    assert_eq!(
        manager.channel_state("ward-7"),
        Some(ConnectionState::Open)
    );

    // Local subscribers rode through the outage without interruption.
    let local = drain_available(&mut subscription).await;
    assert_eq!(
        statuses(&local),
        vec![
            ConnectionState::Open,
            ConnectionState::Degraded,
            ConnectionState::Open
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_failures_degrade_channel_until_link_lands() {
    init_tracing();
    let transport = FlakyTransport::failing_first(2);
    let manager = StreamConnectionManager::new(transport.clone(), fast_channel_config());

    let mut subscription = manager.subscribe("ward-8");
    transport.wait_for_sent(0, 2).await;

    assert_eq!(transport.connects(), 3);
    assert_eq!(transport.link_count(), 1);
    assert_eq!(
        manager.channel_state("ward-8"),
        Some(ConnectionState::Open)
    );

    // The link that finally lands starts from the top of the retained
    // window, so the remote sees the full status history.
    assert_eq!(seqs(&transport.sent(0)), vec![1, 2]);
    assert_eq!(
        statuses(&transport.sent(0)),
        vec![ConnectionState::Degraded, ConnectionState::Open]
    );

    let local = drain_available(&mut subscription).await;
    assert_eq!(
        statuses(&local),
        vec![ConnectionState::Degraded, ConnectionState::Open]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_breaker_caps_connect_attempts() {
    init_tracing();
    let transport = FlakyTransport::always_failing();
    let config = fast_channel_config()
        .with_breaker(BreakerSettings::new(2, Duration::from_secs(3600)));
    let manager = StreamConnectionManager::new(transport.clone(), config);

    let mut subscription = manager.subscribe("ward-9");
    transport.wait_for_connects(2).await;

    // The loop keeps waking, but while the breaker is open no attempt
    // reaches the transport.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.connects(), 2);
    assert_eq!(transport.link_count(), 0);
    assert_eq!(
        manager.channel_state("ward-9"),
        Some(ConnectionState::Degraded)
    );

    // State changed once; repeated failures do not re-announce it.
    let local = drain_available(&mut subscription).await;
    assert_eq!(statuses(&local), vec![ConnectionState::Degraded]);
}

#[tokio::test(start_paused = true)]
async fn test_gap_past_retained_window_resets_remote_stream() {
    init_tracing();
    let transport = FlakyTransport::new();
    let config = fast_channel_config().with_retain_events(2);
    let manager = StreamConnectionManager::new(transport.clone(), config);

    let mut subscription = manager.subscribe("ward-10");
    transport.wait_for_sent(0, 1).await;
    manager.publish("ward-10", note("a")).unwrap();
    transport.wait_for_sent(0, 2).await;

    // Burst past the retained window while the link is down.
    transport.drop_link(0);
    manager.publish("ward-10", note("b")).unwrap();
    manager.publish("ward-10", note("c")).unwrap();
    manager.publish("ward-10", note("d")).unwrap();

    transport.wait_for_connects(2).await;
    transport.wait_for_sent(1, 3).await;

    // The resume position fell out of the window, so the remote gets one
    // stream_reset marker and then the retained tail, sequence intact.
    let resumed = transport.sent(1);
    assert!(matches!(
        &resumed[0].event,
        StreamEvent::AnalysisError { code, request_id: None, .. } if code == STREAM_RESET_CODE
    ));
    let mut wire: Vec<u64> = seqs(&transport.sent(0));
    wire.extend(seqs(&resumed));
    assert!(wire.windows(2).all(|pair| pair[0] < pair[1]));

    // Local subscribers never lost anything and never see the reset.
    let local = drain_available(&mut subscription).await;
    let messages: Vec<&str> = local
        .iter()
        .filter_map(|event| match &event.event {
            StreamEvent::AnalysisError { code, message, .. } if code == "test_note" => {
                Some(message.as_str())
            }
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec!["a", "b", "c", "d"]);
    assert!(!local
        .iter()
        .any(|event| matches!(&event.event, StreamEvent::AnalysisError { code, .. } if code == STREAM_RESET_CODE)));
}

#[tokio::test(start_paused = true)]
async fn test_close_ends_local_stream_and_freezes_wire() {
    init_tracing();
    let transport = FlakyTransport::new();
    let manager = StreamConnectionManager::new(transport.clone(), fast_channel_config());

    let mut subscription = manager.subscribe("ward-11");
    transport.wait_for_sent(0, 1).await;
    manager.publish("ward-11", note("hello")).unwrap();
    transport.wait_for_sent(0, 2).await;

    manager.close("ward-11");

    // Local side: queued events, the final closed status, then end of
    // stream. The drained list ends because recv returned None.
    let local = drain_available(&mut subscription).await;
    assert_eq!(
        statuses(&local).last(),
        Some(&ConnectionState::Closed)
    );

    // Remote side: the link is abandoned rather than reset; nothing else
    // goes out after teardown.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.sent(0).len(), 2);
    assert!(manager.channel_state("ward-11").is_none());
    assert!(manager.status().is_empty());
}
