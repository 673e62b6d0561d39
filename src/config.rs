//! Bridge configuration parameters
//!
//! All tunable parameters for the bridge runtime. Loaded from JSON by the
//! host (project settings) or restored from a compact postcard snapshot.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::reflect::json::Int64Strategy;
use crate::rpc::channel::{ChannelOptions, Compression, RetryPolicy};
use crate::rpc::marshal::MarshalLimits;

/// Core bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    // --- Channels ---
    /// Default payload compression for new channels
    pub compression: Compression,
    /// Connect attempts before a channel becomes unavailable
    pub max_retry_attempts: u32,
    /// First reconnect delay (milliseconds)
    pub backoff_base_ms: u32,
    /// Upper bound on reconnect delay (milliseconds)
    pub backoff_cap_ms: u32,
    /// Random spread applied to each delay (0.0-1.0)
    pub backoff_jitter: f32,
    /// Defer connecting until the first call on the channel
    pub lazy_connect: bool,

    // --- Completion queue ---
    /// Queue depth above which streaming channels are paused
    pub queue_high_watermark: usize,
    /// Queue depth at or below which paused channels resume
    pub queue_low_watermark: usize,
    /// Max events processed per tick (None = drain everything)
    pub drain_budget: Option<usize>,

    // --- Calls ---
    /// Deadline applied to unary calls without an explicit one (milliseconds)
    pub default_deadline_ms: Option<u32>,
    /// Wait for a transport cancel acknowledgement before synthesizing one (milliseconds)
    pub cancel_grace_ms: u32,

    // --- Marshalling ---
    /// Maximum nested message depth
    pub max_message_depth: u32,
    /// Maximum size of a single length-delimited field (bytes)
    pub max_field_bytes: usize,
    /// How 64-bit integers are rendered in the JSON inspection view
    pub int64_strategy: Int64Strategy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            // Channels
            compression: Compression::None,
            max_retry_attempts: 5,
            backoff_base_ms: 100,
            backoff_cap_ms: 5_000,
            backoff_jitter: 0.2,
            lazy_connect: false,

            // Completion queue
            queue_high_watermark: 1024,
            queue_low_watermark: 256,
            drain_budget: None,

            // Calls
            default_deadline_ms: Some(10_000),
            cancel_grace_ms: 250,

            // Marshalling
            max_message_depth: 64,
            max_field_bytes: 64 * 1024 * 1024, // 64 MiB
            int64_strategy: Int64Strategy::ErrorOnPrecisionLoss,
        }
    }
}

impl BridgeConfig {
    /// Parse a JSON settings document; absent keys keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(text).map_err(|e| BridgeError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Compact binary snapshot.
    pub fn to_postcard(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub fn from_postcard(bytes: &[u8]) -> Result<Self> {
        let cfg: Self =
            postcard::from_bytes(bytes).map_err(|e| BridgeError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject combinations the runtime cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_retry_attempts == 0 {
            return Err(BridgeError::Config("max_retry_attempts must be >= 1".into()));
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(BridgeError::Config(
                "backoff requires 0 < base <= cap".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(BridgeError::Config(
                "backoff_jitter must be within 0.0..=1.0".into(),
            ));
        }
        if self.queue_high_watermark == 0 || self.queue_low_watermark >= self.queue_high_watermark
        {
            return Err(BridgeError::Config(
                "queue watermarks require 0 <= low < high".into(),
            ));
        }
        if self.drain_budget == Some(0) {
            return Err(BridgeError::Config("drain_budget must be >= 1".into()));
        }
        if self.max_message_depth == 0 {
            return Err(BridgeError::Config("max_message_depth must be >= 1".into()));
        }
        if self.max_field_bytes == 0 {
            return Err(BridgeError::Config("max_field_bytes must be >= 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retry_attempts,
            base_ms: self.backoff_base_ms,
            cap_ms: self.backoff_cap_ms,
            jitter: self.backoff_jitter,
        }
    }

    /// Channel options derived from the defaults here.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            compression: self.compression,
            retry: self.retry_policy(),
            lazy_connect: self.lazy_connect,
        }
    }

    pub fn marshal_limits(&self) -> MarshalLimits {
        MarshalLimits {
            max_depth: self.max_message_depth,
            max_field_bytes: self.max_field_bytes,
        }
    }
}
