//! Transport abstraction: anything that can carry RPC calls to a remote.
//!
//! Concrete implementations:
//! - [`NullTransport`]: accepts everything, never answers
//! - `adapters::loopback::LoopbackTransport`: in-process service on its own I/O thread
//!
//! Every method is called on the host thread and must not block. Results
//! come back later through the [`CompletionSink`](super::router::CompletionSink)
//! the transport was constructed with: connection outcomes as channel
//! signals, call results as completion events.

use core::time::Duration;

use super::events::{ChannelId, CorrelationId, Payload, TransportError};
use crate::schema::MethodKind;

/// Request metadata key/value pairs (sent as call headers).
pub type Metadata = Vec<(String, String)>;

/// A call handed to the transport for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCall {
    pub id: CorrelationId,
    pub channel: ChannelId,
    /// Full method path, `/package.Service/Method`.
    pub method: String,
    pub kind: MethodKind,
    pub payload: Payload,
    pub metadata: Metadata,
    /// Time left until the bridge fails the call, if it has a deadline.
    pub timeout: Option<Duration>,
}

/// Call-level transport boundary.
pub trait Transport {
    /// Begin connecting `channel` to `address`. The outcome arrives as a
    /// `Connected` / `ConnectFailed` signal. An `Err` here counts as an
    /// immediate failed attempt.
    fn connect(&mut self, channel: ChannelId, address: &str) -> Result<(), TransportError>;

    /// Drop the connection for `channel`. No further events are expected.
    fn disconnect(&mut self, channel: ChannelId);

    /// Send a call on a ready channel.
    fn start_call(&mut self, call: OutboundCall) -> Result<(), TransportError>;

    /// Send one more request message on a bidirectional stream.
    fn write(&mut self, id: CorrelationId, payload: Payload) -> Result<(), TransportError>;

    /// Half-close the request side of a bidirectional stream.
    fn finish_writes(&mut self, id: CorrelationId) -> Result<(), TransportError>;

    /// Ask for the call to be cancelled. Acknowledged with a `Cancelled` event.
    fn cancel(&mut self, id: CorrelationId);

    /// Stop reading inbound messages for `channel` until resumed.
    fn pause_reads(&mut self, _channel: ChannelId) {}

    fn resume_reads(&mut self, _channel: ChannelId) {}
}

/// A transport that accepts everything and never produces an event.
/// Useful as a default when no remote is wired up.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn connect(&mut self, _channel: ChannelId, _address: &str) -> Result<(), TransportError> {
        Ok(())
    }

    fn disconnect(&mut self, _channel: ChannelId) {}

    fn start_call(&mut self, _call: OutboundCall) -> Result<(), TransportError> {
        Ok(())
    }

    fn write(&mut self, _id: CorrelationId, _payload: Payload) -> Result<(), TransportError> {
        Ok(())
    }

    fn finish_writes(&mut self, _id: CorrelationId) -> Result<(), TransportError> {
        Ok(())
    }

    fn cancel(&mut self, _id: CorrelationId) {}
}
