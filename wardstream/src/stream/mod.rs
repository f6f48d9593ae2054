//! Resilient event delivery: channel registry plus transport recovery.

mod manager;
mod transport;

pub use manager::{
    ChannelStatus, Delivery, StreamConnectionManager, StreamError, Subscription,
    STREAM_RESET_CODE,
};
pub use transport::{NullTransport, Transport, TransportError, TransportLink, TransportWriter};
