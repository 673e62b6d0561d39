//! Log-based call handler.
//!
//! Implements [`CallHandler`] by writing every call event to the `log`
//! facade. Payloads are rendered through the JSON inspection view at debug
//! level; terminal outcomes are logged at info/warn.

use log::{debug, info, log_enabled, warn, Level};

use crate::config::BridgeConfig;
use crate::reflect::HostObject;
use crate::reflect::json::{Int64Strategy, to_json};
use crate::rpc::dispatcher::{CallEvent, CallHandler};
use crate::rpc::events::CorrelationId;

/// JSON nesting rendered before giving up.
const RENDER_DEPTH: u32 = 32;

/// Handler that logs every [`CallEvent`] under a label.
pub struct LogHandler {
    label: String,
    strategy: Int64Strategy,
}

impl LogHandler {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_owned(),
            strategy: Int64Strategy::AlwaysString,
        }
    }

    /// Handler rendering 64-bit integers as the bridge configuration says.
    pub fn from_config(label: &str, config: &BridgeConfig) -> Self {
        Self::new(label).with_int64_strategy(config.int64_strategy)
    }

    #[must_use]
    pub fn with_int64_strategy(mut self, strategy: Int64Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    fn render(&self, obj: &HostObject) -> String {
        to_json(obj, self.strategy, RENDER_DEPTH)
            .map_or_else(|e| format!("<unrenderable: {e}>"), |v| v.to_string())
    }
}

impl CallHandler for LogHandler {
    fn on_event(&mut self, id: CorrelationId, event: CallEvent) {
        match event {
            CallEvent::Response(obj) => {
                info!("CALL[{}] {} | response", id, self.label);
                if log_enabled!(Level::Debug) {
                    debug!("CALL[{}] {} | {}", id, self.label, self.render(&obj));
                }
            }
            CallEvent::StreamItem(obj) => {
                if log_enabled!(Level::Debug) {
                    debug!("CALL[{}] {} | item {}", id, self.label, self.render(&obj));
                }
            }
            CallEvent::StreamEnd => {
                info!("CALL[{}] {} | stream end", id, self.label);
            }
            CallEvent::Failed(e) => {
                warn!("CALL[{}] {} | failed: {}", id, self.label, e);
            }
            CallEvent::Cancelled(reason) => {
                info!("CALL[{}] {} | cancelled ({})", id, self.label, reason);
            }
        }
    }
}
