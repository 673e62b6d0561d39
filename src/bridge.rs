//! Bridge facade: the single host-facing entry point.
//!
//! Owns the channel manager, call dispatcher, completion router and the
//! transport. Everything here runs on the host thread; the facade is
//! `!Send` so it cannot be moved off it.
//!
//! ```text
//!  host frame N                                         host frame N+1
//!  ─────┬──────────────────────────────────────────────────────┬──────
//!       │ tick():                                              │ tick()
//!       │  1. drain completion queue → handlers                │
//!       │  2. deadlines, cancellation grace                    │
//!       │  3. channel retries, deferred failures, releases     │
//! ```

use core::time::Duration;
use std::sync::Arc;

use log::{debug, info};

use crate::adapters::time::{Clock, MonotonicClock};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::reflect::Reflected;
use crate::rpc::channel::{ChannelManager, ChannelOptions, ChannelState};
use crate::rpc::dispatcher::{CallHandler, CallOptions, CallState, DispatchCtx, Dispatcher};
use crate::rpc::events::{
    ChannelHandle, ChannelId, ChannelSignal, CompletionEvent, CorrelationId, FlowSignal,
};
use crate::rpc::interceptor::Interceptor;
use crate::rpc::marshal::Marshaller;
use crate::rpc::router::{CompletionRouter, CompletionSink, DrainStats, DrainTarget};
use crate::rpc::transport::Transport;
use crate::schema::DescriptorRegistry;

/// Summary of one `tick()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub drained: DrainStats,
    /// Deadlines and cancellation grace periods that fired.
    pub timers_fired: usize,
    /// Calls failed for reasons decided outside the drain (unavailable
    /// channels, sends that failed after connect).
    pub deferred_failures: usize,
    pub in_flight: usize,
}

pub struct Bridge<T: Transport> {
    config: BridgeConfig,
    channels: ChannelManager,
    dispatcher: Dispatcher,
    router: CompletionRouter,
    transport: T,
    clock: Box<dyn Clock>,
    ticks: u64,
}

impl<T: Transport> Bridge<T> {
    /// Build a bridge. `make_transport` receives the sink the transport
    /// must report through.
    pub fn new(
        config: BridgeConfig,
        registry: Arc<DescriptorRegistry>,
        make_transport: impl FnOnce(CompletionSink) -> T,
    ) -> Result<Self> {
        Self::with_clock(config, registry, make_transport, Box::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: BridgeConfig,
        registry: Arc<DescriptorRegistry>,
        make_transport: impl FnOnce(CompletionSink) -> T,
        clock: Box<dyn Clock>,
    ) -> Result<Self> {
        Self::build(config, registry, |sink| Ok(make_transport(sink)), clock)
    }

    /// Like [`Bridge::new`] for transports whose construction can fail
    /// (spawning an I/O thread, binding a socket).
    pub fn try_new<E: From<BridgeError>>(
        config: BridgeConfig,
        registry: Arc<DescriptorRegistry>,
        make_transport: impl FnOnce(CompletionSink) -> core::result::Result<T, E>,
    ) -> core::result::Result<Self, E> {
        Self::build(config, registry, make_transport, Box::new(MonotonicClock::new()))
    }

    fn build<E: From<BridgeError>>(
        config: BridgeConfig,
        registry: Arc<DescriptorRegistry>,
        make_transport: impl FnOnce(CompletionSink) -> core::result::Result<T, E>,
        clock: Box<dyn Clock>,
    ) -> core::result::Result<Self, E> {
        config.validate()?;
        let router = CompletionRouter::new(
            config.queue_high_watermark,
            config.queue_low_watermark,
            config.drain_budget,
        );
        let transport = make_transport(router.sink())?;
        let marshaller = Marshaller::new(registry, config.marshal_limits());
        let dispatcher = Dispatcher::new(
            marshaller,
            config.default_deadline_ms.map(|ms| Duration::from_millis(u64::from(ms))),
            Duration::from_millis(u64::from(config.cancel_grace_ms)),
        );
        info!(
            "BRIDGE: up (compression={:?}, retries={}, watermarks={}/{})",
            config.compression,
            config.max_retry_attempts,
            config.queue_high_watermark,
            config.queue_low_watermark
        );
        Ok(Self {
            config,
            channels: ChannelManager::new(),
            dispatcher,
            router,
            transport,
            clock,
            ticks: 0,
        })
    }

    // ── Channels ─────────────────────────────────────────────

    /// Open a channel with the configured default options.
    pub fn open_channel(&mut self, address: &str) -> Result<ChannelHandle> {
        let options = self.config.channel_options();
        self.open_channel_with(address, options)
    }

    pub fn open_channel_with(
        &mut self,
        address: &str,
        options: ChannelOptions,
    ) -> Result<ChannelHandle> {
        let now = self.clock.now();
        let (id, outcome) = self
            .channels
            .open(address, options, &mut self.transport, now)?;
        let mut cx = DispatchCtx {
            channels: &mut self.channels,
            transport: &mut self.transport,
            now,
        };
        self.dispatcher.on_channel_outcome(&mut cx, id, outcome);
        Ok(id)
    }

    /// Shut a channel down. Its in-flight calls receive
    /// `Cancelled(ChannelClosed)` on the next tick.
    pub fn close_channel(&mut self, channel: ChannelHandle) -> Result<()> {
        let now = self.clock.now();
        let doomed = self.channels.close(channel)?;
        let sink = self.router.sink();
        self.dispatcher
            .cancel_for_close(&mut self.transport, &sink, &doomed, now);
        self.channels.release_idle(&mut self.transport);
        Ok(())
    }

    /// Reset an unavailable channel's retry budget and reconnect.
    pub fn reopen_channel(&mut self, channel: ChannelHandle) -> Result<()> {
        let now = self.clock.now();
        let outcome = self.channels.reopen(channel, &mut self.transport, now)?;
        let mut cx = DispatchCtx {
            channels: &mut self.channels,
            transport: &mut self.transport,
            now,
        };
        self.dispatcher.on_channel_outcome(&mut cx, channel, outcome);
        Ok(())
    }

    pub fn channel_health(&self, channel: ChannelHandle) -> Result<ChannelState> {
        self.channels.health(channel)
    }

    /// True while backpressure holds the channel's reads paused.
    pub fn reads_paused(&self, channel: ChannelHandle) -> bool {
        self.channels.reads_paused(channel)
    }

    // ── Calls ────────────────────────────────────────────────

    /// Register an interceptor. Interceptors run in registration order on
    /// every later submission and on every terminal event.
    pub fn add_interceptor(&mut self, interceptor: impl Interceptor + 'static) {
        self.dispatcher.add_interceptor(Box::new(interceptor));
    }

    /// Submit a unary call. Errors here are synchronous; everything after
    /// submission reaches `handler` from a later `tick()`.
    pub fn submit_call(
        &mut self,
        channel: ChannelHandle,
        method: &str,
        request: &dyn Reflected,
        options: CallOptions,
        handler: impl CallHandler + 'static,
    ) -> Result<CorrelationId> {
        let mut cx = DispatchCtx {
            channels: &mut self.channels,
            transport: &mut self.transport,
            now: self.clock.now(),
        };
        self.dispatcher
            .call(&mut cx, channel, method, request, options, Box::new(handler))
    }

    /// Submit a server-streaming or bidirectional call.
    pub fn submit_stream(
        &mut self,
        channel: ChannelHandle,
        method: &str,
        request: &dyn Reflected,
        options: CallOptions,
        handler: impl CallHandler + 'static,
    ) -> Result<CorrelationId> {
        let mut cx = DispatchCtx {
            channels: &mut self.channels,
            transport: &mut self.transport,
            now: self.clock.now(),
        };
        self.dispatcher
            .start_stream(&mut cx, channel, method, request, options, Box::new(handler))
    }

    /// Send another request message on a bidirectional stream.
    pub fn write_stream(&mut self, id: CorrelationId, request: &dyn Reflected) -> Result<()> {
        let mut cx = DispatchCtx {
            channels: &mut self.channels,
            transport: &mut self.transport,
            now: self.clock.now(),
        };
        self.dispatcher.write(&mut cx, id, request)
    }

    /// Close the request side of a bidirectional stream.
    pub fn finish_stream(&mut self, id: CorrelationId) -> Result<()> {
        let mut cx = DispatchCtx {
            channels: &mut self.channels,
            transport: &mut self.transport,
            now: self.clock.now(),
        };
        self.dispatcher.finish_writes(&mut cx, id)
    }

    pub fn cancel(&mut self, id: CorrelationId) -> Result<()> {
        let mut cx = DispatchCtx {
            channels: &mut self.channels,
            transport: &mut self.transport,
            now: self.clock.now(),
        };
        self.dispatcher.cancel(&mut cx, id)
    }

    // ── Per-frame pump ───────────────────────────────────────

    /// Run one host frame's worth of bridge work. Call once per frame.
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        self.ticks += 1;

        let drained = {
            let mut host = HostSide {
                dispatcher: &mut self.dispatcher,
                channels: &mut self.channels,
                transport: &mut self.transport,
                now,
            };
            self.router.drain(&mut host)
        };

        let mut cx = DispatchCtx {
            channels: &mut self.channels,
            transport: &mut self.transport,
            now,
        };
        let timers_fired = self.dispatcher.expire(&mut cx);

        for (channel, outcome) in cx.channels.poll_retries(cx.transport, now) {
            self.dispatcher.on_channel_outcome(&mut cx, channel, outcome);
        }
        let deferred_failures = self.dispatcher.flush_deferred(&mut self.channels);
        self.channels.release_idle(&mut self.transport);

        let report = TickReport {
            tick: self.ticks,
            drained,
            timers_fired,
            deferred_failures,
            in_flight: self.dispatcher.in_flight(),
        };
        if drained.call_events + drained.channel_signals + timers_fired + deferred_failures > 0 {
            debug!("BRIDGE: {:?}", report);
        }
        report
    }

    // ── Queries & accessors ──────────────────────────────────

    pub fn call_state(&self, id: CorrelationId) -> Option<CallState> {
        self.dispatcher.state(id)
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    /// Events waiting for the next tick.
    pub fn queued_events(&self) -> usize {
        self.router.pending()
    }

    pub fn marshaller(&self) -> &Marshaller {
        self.dispatcher.marshaller()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Another producer handle for the completion queue.
    pub fn completion_sink(&self) -> CompletionSink {
        self.router.sink()
    }
}

/// Host-thread view handed to the router during a drain.
struct HostSide<'a, T: Transport> {
    dispatcher: &'a mut Dispatcher,
    channels: &'a mut ChannelManager,
    transport: &'a mut T,
    now: Duration,
}

impl<T: Transport> DrainTarget for HostSide<'_, T> {
    fn on_call_event(&mut self, event: CompletionEvent) {
        let mut cx = DispatchCtx {
            channels: &mut *self.channels,
            transport: &mut *self.transport,
            now: self.now,
        };
        self.dispatcher.on_event(&mut cx, event);
    }

    fn on_channel_signal(&mut self, channel: ChannelId, signal: ChannelSignal) {
        let outcome = self.channels.on_signal(channel, &signal, self.now);
        let mut cx = DispatchCtx {
            channels: &mut *self.channels,
            transport: &mut *self.transport,
            now: self.now,
        };
        self.dispatcher.on_channel_outcome(&mut cx, channel, outcome);
    }

    fn on_flow(&mut self, signal: FlowSignal) {
        match signal {
            FlowSignal::Pause(ch) => {
                self.transport.pause_reads(ch);
                self.channels.set_reads_paused(ch, true);
            }
            FlowSignal::Resume(ch) => {
                self.transport.resume_reads(ch);
                self.channels.set_reads_paused(ch, false);
            }
        }
    }
}
