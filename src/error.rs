//! Unified error types for the bridge runtime.
//!
//! A single `BridgeError` enum that every component converts into, so the
//! host sees one taxonomy whether an error was raised synchronously at
//! submission or delivered later as a terminal call event.

use core::fmt;

use crate::rpc::events::{CancelReason, ChannelId, CorrelationId, StatusCode};

// ---------------------------------------------------------------------------
// Top-level bridge error
// ---------------------------------------------------------------------------

/// Every fallible operation in the bridge funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// A host value is incompatible with the schema field it maps to.
    SchemaMismatch {
        message: String,
        field: String,
        detail: String,
    },
    /// Wire bytes are truncated, corrupt, or violate the schema's wire types.
    MalformedMessage(String),
    /// A message or method name is not present in the descriptor registry.
    UnknownDescriptor(String),
    /// A descriptor was registered twice with different contents.
    DescriptorConflict(String),
    /// The channel exhausted its reconnect budget.
    Unavailable(ChannelId),
    /// The call's deadline elapsed before a terminal event arrived.
    DeadlineExceeded,
    /// The call was cancelled.
    Cancelled(CancelReason),
    /// The transport reported a failure.
    Transport(TransportError),
    /// No channel with this handle exists.
    InvalidChannel(ChannelId),
    /// The channel is shut down and accepts no new calls.
    ChannelShutdown(ChannelId),
    /// No live call with this correlation id exists.
    UnknownCall(CorrelationId),
    /// The operation is not valid for the call or channel in its current state.
    InvalidState(String),
    /// Configuration is invalid.
    Config(String),
}

impl BridgeError {
    pub(crate) fn mismatch(message: &str, field: &str, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.to_owned(),
            field: field.to_owned(),
            detail: detail.into(),
        }
    }

    pub(crate) fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedMessage(detail.into())
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SchemaMismatch {
                message,
                field,
                detail,
            } => write!(f, "schema mismatch: {message}.{field}: {detail}"),
            Self::MalformedMessage(detail) => write!(f, "malformed message: {detail}"),
            Self::UnknownDescriptor(name) => write!(f, "unknown descriptor: {name}"),
            Self::DescriptorConflict(name) => {
                write!(f, "conflicting descriptor registration: {name}")
            }
            Self::Unavailable(ch) => write!(f, "channel {ch} unavailable (retries exhausted)"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::Cancelled(reason) => write!(f, "cancelled: {reason}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::InvalidChannel(ch) => write!(f, "invalid channel handle {ch}"),
            Self::ChannelShutdown(ch) => write!(f, "channel {ch} is shut down"),
            Self::UnknownCall(id) => write!(f, "unknown call {id}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for BridgeError {}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

/// A failure reported by the transport, with its RPC status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub code: StatusCode,
    pub detail: String,
}

impl TransportError {
    pub fn new(code: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.detail)
        }
    }
}

impl From<TransportError> for BridgeError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<prost::DecodeError> for BridgeError {
    fn from(e: prost::DecodeError) -> Self {
        Self::MalformedMessage(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, BridgeError>;
