//! Transport seam between a channel and its remote delivery path.
//!
//! The manager only ever sees these traits. Production wires in a gateway
//! client (websocket, SSE push, message bus); tests wire in scripted fakes
//! that drop links on cue.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::events::SequencedEvent;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Writer half of a live link. Owned by one channel loop at a time.
#[async_trait]
pub trait TransportWriter: Send {
    async fn send(&mut self, event: &SequencedEvent) -> Result<(), TransportError>;
}

/// One live link to the remote side of a channel.
pub struct TransportLink {
    pub writer: Box<dyn TransportWriter>,
    /// Fired by the transport when the link drops out from under us.
    pub closed: CancellationToken,
}

impl TransportLink {
    pub fn new(writer: Box<dyn TransportWriter>, closed: CancellationToken) -> Self {
        Self { writer, closed }
    }
}

/// Connection factory for one remote delivery path.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link for `channel`. Called once per connection attempt.
    async fn connect(&self, channel: &str) -> Result<TransportLink, TransportError>;
}

/// Transport for fully in-process deployments.
///
/// Accepts every connection and discards outbound events; local subscribers
/// still receive everything through their own queues.
#[derive(Debug, Default)]
pub struct NullTransport;

struct NullWriter;

#[async_trait]
impl TransportWriter for NullWriter {
    async fn send(&mut self, _event: &SequencedEvent) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl Transport for NullTransport {
    async fn connect(&self, _channel: &str) -> Result<TransportLink, TransportError> {
        Ok(TransportLink::new(
            Box::new(NullWriter),
            CancellationToken::new(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ConnectionState, StreamEvent};
    use chrono::Utc;

    #[tokio::test]
    async fn test_null_transport_accepts_everything() {
        let transport = NullTransport;
        let mut link = transport.connect("ward-1").await.unwrap();
        assert!(!link.closed.is_cancelled());

        let event = SequencedEvent {
            seq: 1,
            event: StreamEvent::ConnectionStatus {
                state: ConnectionState::Open,
                timestamp: Utc::now(),
            },
        };
        link.writer.send(&event).await.unwrap();
    }
}
