//! Adapters: concrete implementations of the bridge's boundary traits.
//!
//! | Adapter    | Implements  | Connects to                          |
//! |------------|-------------|--------------------------------------|
//! | `loopback` | Transport   | In-process service on an I/O thread  |
//! | `log_sink` | CallHandler | `log` facade                         |
//! | `time`     | Clock       | `std::time::Instant` / manual time   |

pub mod log_sink;
pub mod loopback;
pub mod time;
