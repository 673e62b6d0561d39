//! Identifiers and event types that cross the transport/host boundary.
//!
//! Everything here is plain data: produced on transport threads, moved
//! through the completion queue, consumed once on the host thread.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

pub use crate::error::TransportError;

// ── Identifiers ─────────────────────────────────────────────────

static NEXT_CORRELATION: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique, monotonic call identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Allocate the next id. Never returns the same value twice in a process.
    pub fn next() -> Self {
        Self(NEXT_CORRELATION.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// True if `next()` has already handed out this id.
    pub fn was_issued(self) -> bool {
        self.0 != 0 && self.0 < NEXT_CORRELATION.load(Ordering::Relaxed)
    }

    /// Rebuild an id received back from a transport.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque channel handle issued by the channel manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u32);

/// Name used by the host-facing API.
pub type ChannelHandle = ChannelId;

impl ChannelId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Payloads & status ───────────────────────────────────────────

/// Encoded message bytes as they travel to or from the transport.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub bytes: Vec<u8>,
    /// True when `bytes` is a DEFLATE stream of the encoded message.
    pub compressed: bool,
}

impl Payload {
    pub fn plain(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            compressed: false,
        }
    }
}

/// RPC status codes, numbered as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Map a raw wire code; anything out of range is `Unknown`.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserRequested,
    ChannelClosed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserRequested => f.write_str("user requested"),
            Self::ChannelClosed => f.write_str("channel closed"),
        }
    }
}

// ── Events ──────────────────────────────────────────────────────

/// What happened to a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Unary response (terminal).
    Success(Payload),
    /// One message on a streaming call.
    StreamItem(Payload),
    /// Server finished the stream (terminal).
    StreamEnd,
    /// Transport failure (terminal).
    Error(TransportError),
    /// Cancellation acknowledged (terminal).
    Cancelled(CancelReason),
}

impl EventKind {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::StreamItem(_))
    }
}

/// A single call event tagged with its routing keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub channel: ChannelId,
    pub id: CorrelationId,
    pub kind: EventKind,
}

/// Connectivity change reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Connected,
    ConnectFailed(String),
    Disconnected(String),
}

/// Queue item: either a call event or a channel signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouterEvent {
    Call(CompletionEvent),
    Channel {
        channel: ChannelId,
        signal: ChannelSignal,
    },
}

/// Router flow-control notification for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Pause(ChannelId),
    Resume(ChannelId),
}
