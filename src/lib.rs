//! ProtoBridge runtime library.
//!
//! Lets a single-threaded real-time host (a game engine frame loop) issue
//! RPCs over a binary transport and receive results through its own
//! reflection-based object model, without ever blocking the frame.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  Host thread                                                   │
//! │   Bridge ── submit ──▶ Dispatcher ── encode ──▶ Marshaller     │
//! │     │                     │                                    │
//! │   tick()                  ▼                                    │
//! │     │               ChannelManager ──▶ Transport (trait)       │
//! │     ▼                                      │                   │
//! │  CompletionRouter ◀── CompletionSink ◀─────┘ transport threads │
//! └────────────────────────────────────────────────────────────────┘
//! ```

#![deny(unused_must_use)]

pub mod adapters;
pub mod bridge;
pub mod config;
pub mod error;
pub mod reflect;
pub mod rpc;
pub mod schema;

pub use bridge::{Bridge, TickReport};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use reflect::{HostObject, HostValue, Reflected};
pub use rpc::channel::{ChannelOptions, ChannelState, Compression, RetryPolicy};
pub use rpc::dispatcher::{CallEvent, CallHandler, CallOptions, CallState};
pub use rpc::events::{CancelReason, ChannelHandle, CorrelationId, StatusCode};
pub use rpc::interceptor::Interceptor;
