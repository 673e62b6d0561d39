//! Transport-agnostic RPC subsystem.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      RPC Stack                             │
//! │                                                            │
//! │  ┌────────────┐   ┌────────────┐   ┌────────────────────┐  │
//! │  │ Dispatcher │──▶│  Marshal   │──▶│ Compress (deflate) │  │
//! │  │ (calls)    │   │ (schema)   │   └─────────┬──────────┘  │
//! │  └────────────┘   └────────────┘             ▼             │
//! │        ▲                              ┌────────────┐       │
//! │        │          ┌────────────┐      │ Transport  │       │
//! │        └──────────│   Router   │◀─────│ (trait)    │       │
//! │          drain    │  (queue)   │ sink └────────────┘       │
//! │                   └────────────┘                           │
//! └────────────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod compress;
pub mod dispatcher;
pub mod events;
pub mod interceptor;
pub mod marshal;
pub mod router;
pub mod transport;
