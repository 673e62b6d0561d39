//! Completion router: transport threads → host thread.
//!
//! ```text
//! ┌──────────────┐  deliver()   ┌──────────────────┐  drain()  ┌─────────────┐
//! │  Transport   │─────────────▶│ CompletionQueue  │──────────▶│ Host thread │
//! │  threads     │  signal()    │ (blocking mutex) │  1x/tick  │ (dispatch)  │
//! └──────────────┘              └──────────────────┘           └─────────────┘
//! ```
//!
//! One FIFO for all calls and channel signals keeps per-call order and
//! cross-call submission order. The critical section only moves events in
//! or out; handlers run after the lock is released.

use core::cell::RefCell;
use core::marker::PhantomData;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, warn};

use super::events::{
    ChannelId, ChannelSignal, CompletionEvent, EventKind, FlowSignal, RouterEvent,
};

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<RouterEvent>,
    /// Channels currently held paused by backpressure.
    paused: Vec<ChannelId>,
    /// Paused since the last drain; Pause not yet reported.
    newly_paused: Vec<ChannelId>,
}

/// Shared multi-producer queue. Consumers go through [`CompletionRouter`].
pub struct CompletionQueue {
    state: Mutex<CriticalSectionRawMutex, RefCell<QueueState>>,
    high_watermark: usize,
    low_watermark: usize,
}

impl CompletionQueue {
    fn new(high_watermark: usize, low_watermark: usize) -> Self {
        Self {
            state: Mutex::new(RefCell::new(QueueState::default())),
            high_watermark,
            low_watermark,
        }
    }

    fn push(&self, event: RouterEvent) {
        self.state.lock(|cell| {
            let mut st = cell.borrow_mut();
            let pause = match &event {
                RouterEvent::Call(CompletionEvent {
                    channel,
                    kind: EventKind::StreamItem(_),
                    ..
                }) => Some(*channel),
                _ => None,
            };
            st.events.push_back(event);
            if let Some(ch) = pause {
                if st.events.len() > self.high_watermark && !st.paused.contains(&ch) {
                    warn!(
                        "ROUTER: queue depth {} above high watermark, pausing CH[{}]",
                        st.events.len(),
                        ch
                    );
                    st.paused.push(ch);
                    st.newly_paused.push(ch);
                }
            }
        });
    }

    /// Move up to `budget` events out, with the flow changes they imply.
    fn take_batch(&self, budget: Option<usize>) -> Batch {
        self.state.lock(|cell| {
            let mut st = cell.borrow_mut();
            let n = budget.map_or(st.events.len(), |b| b.min(st.events.len()));
            let events: Vec<RouterEvent> = st.events.drain(..n).collect();
            let pauses: Vec<ChannelId> = st.newly_paused.drain(..).collect();
            let resumes = if st.events.len() <= self.low_watermark {
                st.paused.drain(..).collect()
            } else {
                Vec::new()
            };
            Batch {
                events,
                pauses,
                resumes,
                remaining: st.events.len(),
            }
        })
    }

    fn len(&self) -> usize {
        self.state.lock(|cell| cell.borrow().events.len())
    }

    fn is_paused(&self, channel: ChannelId) -> bool {
        self.state.lock(|cell| cell.borrow().paused.contains(&channel))
    }
}

struct Batch {
    events: Vec<RouterEvent>,
    pauses: Vec<ChannelId>,
    resumes: Vec<ChannelId>,
    remaining: usize,
}

/// Producer handle given to transports. Cheap to clone, `Send + Sync`.
#[derive(Clone)]
pub struct CompletionSink {
    queue: Arc<CompletionQueue>,
}

impl CompletionSink {
    /// Enqueue a call event. Never blocks beyond the queue's critical section.
    pub fn deliver(&self, event: CompletionEvent) {
        self.queue.push(RouterEvent::Call(event));
    }

    /// Enqueue a connectivity change for `channel`.
    pub fn signal_channel(&self, channel: ChannelId, signal: ChannelSignal) {
        self.queue.push(RouterEvent::Channel { channel, signal });
    }

    /// True while backpressure holds `channel` paused. Producers may poll
    /// this to stop reading from the network early.
    pub fn reads_paused(&self, channel: ChannelId) -> bool {
        self.queue.is_paused(channel)
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Host-side consumer of drained events.
pub trait DrainTarget {
    fn on_call_event(&mut self, event: CompletionEvent);
    fn on_channel_signal(&mut self, channel: ChannelId, signal: ChannelSignal);
    fn on_flow(&mut self, signal: FlowSignal);
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub call_events: usize,
    pub channel_signals: usize,
    pub flow_signals: usize,
    /// Events left queued because of the drain budget.
    pub remaining: usize,
}

/// Consumer side of the completion queue. Pinned to the host thread.
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<protobridge::rpc::router::CompletionRouter>();
/// ```
pub struct CompletionRouter {
    queue: Arc<CompletionQueue>,
    drain_budget: Option<usize>,
    _host_thread: PhantomData<Rc<()>>,
}

impl CompletionRouter {
    pub fn new(high_watermark: usize, low_watermark: usize, drain_budget: Option<usize>) -> Self {
        Self {
            queue: Arc::new(CompletionQueue::new(high_watermark, low_watermark)),
            drain_budget,
            _host_thread: PhantomData,
        }
    }

    pub fn sink(&self) -> CompletionSink {
        CompletionSink {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Pop queued events FIFO and hand each to `target`.
    ///
    /// Pause notifications go out before the batch and Resume after it.
    pub fn drain(&self, target: &mut impl DrainTarget) -> DrainStats {
        let batch = self.queue.take_batch(self.drain_budget);
        let mut stats = DrainStats {
            remaining: batch.remaining,
            ..DrainStats::default()
        };

        for ch in batch.pauses {
            target.on_flow(FlowSignal::Pause(ch));
            stats.flow_signals += 1;
        }
        for event in batch.events {
            match event {
                RouterEvent::Call(ev) => {
                    target.on_call_event(ev);
                    stats.call_events += 1;
                }
                RouterEvent::Channel { channel, signal } => {
                    target.on_channel_signal(channel, signal);
                    stats.channel_signals += 1;
                }
            }
        }
        for ch in batch.resumes {
            target.on_flow(FlowSignal::Resume(ch));
            stats.flow_signals += 1;
        }

        if stats.remaining > 0 {
            debug!("ROUTER: {} events deferred to next tick", stats.remaining);
        }
        stats
    }
}

// ── Tests ────────────────────────────────────────────────────
