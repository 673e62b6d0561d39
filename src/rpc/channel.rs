//! Channel manager: lifecycle of logical connections to remote endpoints.
//!
//! ## Reconnection policy
//!
//! On a failed connect or a disconnect the channel enters
//! `TransientFailure` and retries after an exponential backoff
//! (`base`, `2·base`, `4·base` … capped at `cap`, each spread by
//! `±jitter`). After `max_attempts` consecutive failures it becomes
//! `Unavailable` and stays there until reopened.
//!
//! Calls submitted before the channel is `Ready` wait in a per-channel FIFO
//! and go out in submission order once it connects.

use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::events::{ChannelId, ChannelSignal, CorrelationId};
use super::transport::Transport;
use crate::error::{BridgeError, Result};

// ───────────────────────────────────────────────────────────────
// Options
// ───────────────────────────────────────────────────────────────

/// Payload compression policy of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Deflate,
}

/// Reconnect budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_ms: u32,
    pub cap_ms: u32,
    /// Fractional spread, 0.0-1.0.
    pub jitter: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 100,
            cap_ms: 5_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with `spread` in
    /// -1.0..=1.0 selecting where inside the jitter band it lands.
    pub fn delay_for(&self, attempt: u32, spread: f32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let raw = u64::from(self.base_ms).saturating_mul(1u64 << exp);
        let capped = raw.min(u64::from(self.cap_ms)) as f64;
        let factor = 1.0 + f64::from(self.jitter) * f64::from(spread.clamp(-1.0, 1.0));
        Duration::from_micros((capped * factor * 1000.0).round().max(0.0) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelOptions {
    pub compression: Compression,
    pub retry: RetryPolicy,
    /// Connect on first call instead of at open.
    pub lazy_connect: bool,
}

// ───────────────────────────────────────────────────────────────
// Channel state
// ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    /// Retry budget exhausted. Terminal until reopened.
    Unavailable,
    Shutdown,
}

impl ChannelState {
    /// New calls are refused in these states.
    pub const fn rejects_calls(self) -> bool {
        matches!(self, Self::Unavailable | Self::Shutdown)
    }
}

/// Uniform value in -1.0..=1.0 from host entropy.
fn jitter_spread() -> f32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let v = RandomState::new().build_hasher().finish();
    ((v >> 40) as f32 / (1u64 << 24) as f32).mul_add(2.0, -1.0)
}

#[derive(Debug)]
struct ChannelEntry {
    address: String,
    options: ChannelOptions,
    state: ChannelState,
    /// Consecutive failed connects since the last `Ready`.
    attempt: u32,
    retry_at: Option<Duration>,
    reads_paused: bool,
    /// Every non-terminal call bound to this channel.
    calls: BTreeSet<CorrelationId>,
    /// Subset of `calls` not yet handed to the transport, in order.
    waiting: VecDeque<CorrelationId>,
}

/// What the bridge must do after a channel transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// Channel became ready; send these waiting calls in order.
    Ready { flush: Vec<CorrelationId> },
    /// A retry is scheduled.
    Retrying { delay: Duration },
    /// Budget exhausted; fail these calls with `Unavailable`.
    Exhausted { fail: Vec<CorrelationId> },
    Ignored,
}

/// How a call was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    SendNow,
    Queued,
}

// ───────────────────────────────────────────────────────────────
// Manager
// ───────────────────────────────────────────────────────────────

/// Live channels only. Ids are never reused, so an issued id with no
/// entry belongs to a channel that was shut down and released.
#[derive(Debug, Default)]
pub struct ChannelManager {
    channels: BTreeMap<ChannelId, ChannelEntry>,
    next_id: u32,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel and, unless lazy, start connecting.
    pub fn open(
        &mut self,
        address: &str,
        options: ChannelOptions,
        transport: &mut impl Transport,
        now: Duration,
    ) -> Result<(ChannelId, ChannelOutcome)> {
        if address.is_empty() {
            return Err(BridgeError::Config("empty channel address".into()));
        }
        if options.retry.max_attempts == 0 {
            return Err(BridgeError::Config("retry max_attempts must be >= 1".into()));
        }
        self.next_id += 1;
        let id = ChannelId::new(self.next_id);
        self.channels.insert(
            id,
            ChannelEntry {
                address: address.to_owned(),
                options,
                state: ChannelState::Idle,
                attempt: 0,
                retry_at: None,
                reads_paused: false,
                calls: BTreeSet::new(),
                waiting: VecDeque::new(),
            },
        );
        info!("CH[{}]: opened -> {} (lazy={})", id, address, options.lazy_connect);

        let outcome = if options.lazy_connect {
            ChannelOutcome::Ignored
        } else {
            self.start_connect(id, transport, now)
        };
        Ok((id, outcome))
    }

    pub fn health(&self, id: ChannelId) -> Result<ChannelState> {
        match self.channels.get(&id) {
            Some(e) => Ok(e.state),
            None if self.is_retired(id) => Ok(ChannelState::Shutdown),
            None => Err(BridgeError::InvalidChannel(id)),
        }
    }

    pub fn options(&self, id: ChannelId) -> Result<ChannelOptions> {
        Ok(self.entry(id)?.options)
    }

    pub fn reads_paused(&self, id: ChannelId) -> bool {
        self.channels.get(&id).is_some_and(|e| e.reads_paused)
    }

    pub fn set_reads_paused(&mut self, id: ChannelId, paused: bool) {
        if let Some(e) = self.channels.get_mut(&id) {
            e.reads_paused = paused;
        }
    }

    /// Bind a new call to `id`.
    pub fn admit(
        &mut self,
        id: ChannelId,
        call: CorrelationId,
        transport: &mut impl Transport,
        now: Duration,
    ) -> Result<(Admission, ChannelOutcome)> {
        let entry = self.entry_mut(id)?;
        match entry.state {
            ChannelState::Shutdown => return Err(BridgeError::ChannelShutdown(id)),
            ChannelState::Unavailable => return Err(BridgeError::Unavailable(id)),
            _ => {}
        }
        entry.calls.insert(call);
        if entry.state == ChannelState::Ready {
            return Ok((Admission::SendNow, ChannelOutcome::Ignored));
        }
        entry.waiting.push_back(call);
        debug!("CH[{}]: call {} waiting ({:?})", id, call, entry.state);
        let outcome = if entry.state == ChannelState::Idle {
            self.start_connect(id, transport, now)
        } else {
            ChannelOutcome::Ignored
        };
        Ok((Admission::Queued, outcome))
    }

    /// Unbind a call that reached a terminal state.
    pub fn detach(&mut self, id: ChannelId, call: CorrelationId) {
        if let Some(e) = self.channels.get_mut(&id) {
            e.calls.remove(&call);
            e.waiting.retain(|c| *c != call);
        }
    }

    /// Apply a connectivity signal from the transport.
    pub fn on_signal(
        &mut self,
        id: ChannelId,
        signal: &ChannelSignal,
        now: Duration,
    ) -> ChannelOutcome {
        let retired = self.is_retired(id);
        let Some(entry) = self.channels.get_mut(&id) else {
            if retired {
                debug!("CH[{}]: {:?} after release ignored", id, signal);
            } else {
                warn!("CH[{}]: signal {:?} for unknown channel dropped", id, signal);
            }
            return ChannelOutcome::Ignored;
        };
        if matches!(
            entry.state,
            ChannelState::Shutdown | ChannelState::Unavailable
        ) {
            debug!("CH[{}]: {:?} ignored in {:?}", id, signal, entry.state);
            return ChannelOutcome::Ignored;
        }

        match signal {
            ChannelSignal::Connected => {
                if entry.state == ChannelState::Ready {
                    return ChannelOutcome::Ignored;
                }
                entry.state = ChannelState::Ready;
                entry.attempt = 0;
                entry.retry_at = None;
                let flush: Vec<CorrelationId> = entry.waiting.drain(..).collect();
                info!("CH[{}]: ready, flushing {} waiting calls", id, flush.len());
                ChannelOutcome::Ready { flush }
            }
            ChannelSignal::ConnectFailed(detail) | ChannelSignal::Disconnected(detail) => {
                if entry.state == ChannelState::TransientFailure {
                    // Already backing off.
                    return ChannelOutcome::Ignored;
                }
                warn!("CH[{}]: {}", id, detail);
                Self::handle_failure(id, entry, now)
            }
        }
    }

    /// Start due reconnect attempts.
    pub fn poll_retries(
        &mut self,
        transport: &mut impl Transport,
        now: Duration,
    ) -> Vec<(ChannelId, ChannelOutcome)> {
        let due: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, e)| {
                e.state == ChannelState::TransientFailure && e.retry_at.is_some_and(|t| t <= now)
            })
            .map(|(id, _)| *id)
            .collect();

        due.into_iter()
            .map(|id| (id, self.start_connect(id, transport, now)))
            .filter(|(_, o)| *o != ChannelOutcome::Ignored)
            .collect()
    }

    /// Shut the channel down. Returns the calls that must be cancelled.
    pub fn close(&mut self, id: ChannelId) -> Result<Vec<CorrelationId>> {
        if self.is_retired(id) {
            return Ok(Vec::new());
        }
        let entry = self.entry_mut(id)?;
        if entry.state == ChannelState::Shutdown {
            return Ok(Vec::new());
        }
        entry.state = ChannelState::Shutdown;
        entry.retry_at = None;
        entry.waiting.clear();
        let calls: Vec<CorrelationId> = entry.calls.iter().copied().collect();
        info!("CH[{}]: shutdown, {} calls to cancel", id, calls.len());
        Ok(calls)
    }

    /// Release transport connections of shut-down channels with no calls
    /// left, and forget them.
    pub fn release_idle(&mut self, transport: &mut impl Transport) {
        self.channels.retain(|id, e| {
            if e.state != ChannelState::Shutdown || !e.calls.is_empty() {
                return true;
            }
            transport.disconnect(*id);
            info!("CH[{}]: connection released", id);
            false
        });
    }

    /// Reset the retry budget and reconnect immediately.
    pub fn reopen(
        &mut self,
        id: ChannelId,
        transport: &mut impl Transport,
        now: Duration,
    ) -> Result<ChannelOutcome> {
        let entry = self.entry_mut(id)?;
        match entry.state {
            ChannelState::Shutdown => Err(BridgeError::ChannelShutdown(id)),
            ChannelState::Ready | ChannelState::Connecting => Ok(ChannelOutcome::Ignored),
            ChannelState::Idle | ChannelState::TransientFailure | ChannelState::Unavailable => {
                entry.attempt = 0;
                entry.retry_at = None;
                info!("CH[{}]: reopen", id);
                Ok(self.start_connect(id, transport, now))
            }
        }
    }

    // ── Internals ────────────────────────────────────────────

    fn start_connect(
        &mut self,
        id: ChannelId,
        transport: &mut impl Transport,
        now: Duration,
    ) -> ChannelOutcome {
        let Some(entry) = self.channels.get_mut(&id) else {
            return ChannelOutcome::Ignored;
        };
        entry.state = ChannelState::Connecting;
        entry.retry_at = None;
        entry.attempt += 1;
        debug!("CH[{}]: connect attempt {}", id, entry.attempt);
        match transport.connect(id, &entry.address) {
            Ok(()) => ChannelOutcome::Ignored,
            Err(e) => {
                warn!("CH[{}]: connect refused: {}", id, e);
                Self::handle_failure(id, entry, now)
            }
        }
    }

    fn handle_failure(id: ChannelId, entry: &mut ChannelEntry, now: Duration) -> ChannelOutcome {
        if entry.state == ChannelState::Ready {
            // Dropped from ready: a fresh budget starts with this failure.
            entry.attempt = 1;
        }
        if entry.attempt >= entry.options.retry.max_attempts {
            entry.state = ChannelState::Unavailable;
            entry.retry_at = None;
            entry.waiting.clear();
            let fail: Vec<CorrelationId> = entry.calls.iter().copied().collect();
            warn!(
                "CH[{}]: unavailable after {} attempts, failing {} calls",
                id,
                entry.attempt,
                fail.len()
            );
            return ChannelOutcome::Exhausted { fail };
        }
        let delay = entry.options.retry.delay_for(entry.attempt, jitter_spread());
        entry.state = ChannelState::TransientFailure;
        entry.retry_at = Some(now + delay);
        info!(
            "CH[{}]: transient failure (attempt {}), retry in {:?}",
            id, entry.attempt, delay
        );
        ChannelOutcome::Retrying { delay }
    }

    /// Issued by this manager and already released.
    fn is_retired(&self, id: ChannelId) -> bool {
        (1..=self.next_id).contains(&id.get()) && !self.channels.contains_key(&id)
    }

    fn missing(&self, id: ChannelId) -> BridgeError {
        if self.is_retired(id) {
            BridgeError::ChannelShutdown(id)
        } else {
            BridgeError::InvalidChannel(id)
        }
    }

    fn entry(&self, id: ChannelId) -> Result<&ChannelEntry> {
        self.channels.get(&id).ok_or_else(|| self.missing(id))
    }

    fn entry_mut(&mut self, id: ChannelId) -> Result<&mut ChannelEntry> {
        if !self.channels.contains_key(&id) {
            return Err(self.missing(id));
        }
        self.channels
            .get_mut(&id)
            .ok_or(BridgeError::InvalidChannel(id))
    }
}

// ── Tests ────────────────────────────────────────────────────
