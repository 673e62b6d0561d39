//! In-process loopback transport.
//!
//! Serves calls from a user-supplied service function on a dedicated I/O
//! thread, the way a real network transport would: the host thread only
//! enqueues commands, and every result comes back through the
//! [`CompletionSink`] on a later tick.
//!
//! ```text
//!  host thread                       loopback-io thread
//!  ┌──────────────┐   Command   ┌───────────────────────────────────┐
//!  │ Transport    │────────────▶│ edge_executor::LocalExecutor      │
//!  │ impl         │  (embassy   │  ┌──────────────┐ ┌────────────┐  │
//!  └──────────────┘   channel)  │  │ command loop │ │ pump 1ms ⏱ │  │
//!                               │  └──────────────┘ └─────┬──────┘  │
//!                               └─────────────────────────┼─────────┘
//!                                  CompletionSink ◀───────┘
//! ```

use core::cell::RefCell;
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use log::{debug, info, warn};

use crate::rpc::compress;
use crate::rpc::events::{
    CancelReason, ChannelId, ChannelSignal, CompletionEvent, CorrelationId, EventKind, Payload,
    StatusCode, TransportError,
};
use crate::rpc::router::CompletionSink;
use crate::rpc::transport::{OutboundCall, Transport};
use crate::schema::MethodKind;

/// Command queue depth (host → I/O thread).
const CMD_DEPTH: usize = 64;

/// Largest request the loopback will inflate.
const MAX_INFLATE: usize = 16 * 1024 * 1024;

/// What the service answers for one request message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReply {
    /// A single encoded response.
    Unary(Vec<u8>),
    /// Encoded stream items, in order.
    Stream(Vec<Vec<u8>>),
    Fail(StatusCode, String),
    /// Never answer (the call runs until cancelled or timed out).
    NoReply,
}

/// `(method path, encoded request) -> reply`. Runs on the I/O thread.
pub type ServiceFn = Arc<dyn Fn(&str, &[u8]) -> ServiceReply + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackOptions {
    pub connect_latency: Duration,
    pub reply_latency: Duration,
    /// Spacing between consecutive stream items.
    pub item_interval: Duration,
    /// Answer every connect with `ConnectFailed`.
    pub refuse_connects: bool,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            connect_latency: Duration::from_millis(5),
            reply_latency: Duration::from_millis(2),
            item_interval: Duration::from_millis(1),
            refuse_connects: false,
        }
    }
}

enum Command {
    Connect(ChannelId),
    Disconnect(ChannelId),
    Start(OutboundCall),
    Write(CorrelationId, Payload),
    FinishWrites(CorrelationId),
    Cancel(CorrelationId),
    Pause(ChannelId),
    Resume(ChannelId),
    /// Simulated network loss.
    Drop(ChannelId),
}

type CommandChannel = Channel<CriticalSectionRawMutex, Command, CMD_DEPTH>;
type StopSignal = Signal<CriticalSectionRawMutex, ()>;

// ── I/O thread state ─────────────────────────────────────────

enum Output {
    Signal(ChannelSignal),
    Event(CorrelationId, EventKind),
}

struct Scheduled {
    due: Instant,
    seq: u64,
    channel: ChannelId,
    output: Output,
}

struct LiveCall {
    channel: ChannelId,
    method: String,
    kind: MethodKind,
    /// Due time of this call's latest scheduled output.
    last_due: Instant,
}

struct Simulation {
    sink: CompletionSink,
    service: ServiceFn,
    options: LoopbackOptions,
    connected: BTreeSet<ChannelId>,
    paused: BTreeSet<ChannelId>,
    calls: BTreeMap<CorrelationId, LiveCall>,
    /// Ordered by `(due, seq)`.
    scheduled: Vec<Scheduled>,
    seq: u64,
}

impl Simulation {
    fn schedule(&mut self, due: Instant, channel: ChannelId, output: Output) {
        self.seq += 1;
        let item = Scheduled {
            due,
            seq: self.seq,
            channel,
            output,
        };
        let at = self
            .scheduled
            .partition_point(|s| (s.due, s.seq) <= (item.due, item.seq));
        self.scheduled.insert(at, item);
    }

    fn schedule_call(&mut self, id: CorrelationId, after: Duration, kind: EventKind) {
        let Some(call) = self.calls.get_mut(&id) else {
            return;
        };
        let due = (Instant::now() + after).max(call.last_due);
        call.last_due = due;
        let channel = call.channel;
        if kind.is_terminal() {
            self.calls.remove(&id);
        }
        self.schedule(due, channel, Output::Event(id, kind));
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(channel) => {
                let signal = if self.options.refuse_connects {
                    ChannelSignal::ConnectFailed("connection refused".into())
                } else {
                    self.connected.insert(channel);
                    ChannelSignal::Connected
                };
                let due = Instant::now() + self.options.connect_latency;
                self.schedule(due, channel, Output::Signal(signal));
            }
            Command::Disconnect(channel) => {
                self.connected.remove(&channel);
                self.paused.remove(&channel);
                self.scheduled.retain(|s| s.channel != channel);
                self.calls.retain(|_, c| c.channel != channel);
                debug!("LOOPBACK: CH[{}] disconnected", channel);
            }
            Command::Drop(channel) => {
                self.connected.remove(&channel);
                self.scheduled.retain(|s| s.channel != channel);
                let doomed: Vec<CorrelationId> = self
                    .calls
                    .iter()
                    .filter(|(_, c)| c.channel == channel)
                    .map(|(id, _)| *id)
                    .collect();
                for id in doomed {
                    self.schedule_call(
                        id,
                        Duration::ZERO,
                        EventKind::Error(TransportError::new(
                            StatusCode::Unavailable,
                            "connection lost",
                        )),
                    );
                }
                self.schedule(
                    Instant::now(),
                    channel,
                    Output::Signal(ChannelSignal::Disconnected("connection lost".into())),
                );
                warn!("LOOPBACK: CH[{}] connection dropped", channel);
            }
            Command::Start(call) => self.start(call),
            Command::Write(id, payload) => {
                if let Some(method) = self.calls.get(&id).map(|c| c.method.clone()) {
                    self.serve(id, &method, payload);
                }
            }
            Command::FinishWrites(id) => {
                let latency = self.options.reply_latency;
                self.schedule_call(id, latency, EventKind::StreamEnd);
            }
            Command::Cancel(id) => {
                if self.calls.contains_key(&id) {
                    self.scheduled
                        .retain(|s| !matches!(s.output, Output::Event(e, _) if e == id));
                    self.schedule_call(
                        id,
                        Duration::ZERO,
                        EventKind::Cancelled(CancelReason::UserRequested),
                    );
                }
            }
            Command::Pause(channel) => {
                self.paused.insert(channel);
            }
            Command::Resume(channel) => {
                self.paused.remove(&channel);
            }
        }
    }

    fn start(&mut self, call: OutboundCall) {
        let OutboundCall {
            id,
            channel,
            method,
            kind,
            payload,
            ..
        } = call;
        self.calls.insert(
            id,
            LiveCall {
                channel,
                method: method.clone(),
                kind,
                last_due: Instant::now(),
            },
        );
        if !self.connected.contains(&channel) {
            self.schedule_call(
                id,
                Duration::ZERO,
                EventKind::Error(TransportError::new(StatusCode::Unavailable, "not connected")),
            );
            return;
        }
        self.serve(id, &method, payload);
    }

    /// Run the service for one request message and schedule its outputs.
    fn serve(&mut self, id: CorrelationId, method: &str, payload: Payload) {
        let Some(kind) = self.calls.get(&id).map(|c| c.kind) else {
            return;
        };
        let request = match compress::unpack(payload, MAX_INFLATE) {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = TransportError::new(StatusCode::InvalidArgument, e.to_string());
                self.schedule_call(id, Duration::ZERO, EventKind::Error(err));
                return;
            }
        };

        let latency = self.options.reply_latency;
        let interval = self.options.item_interval;
        match ((self.service)(method, &request), kind) {
            (ServiceReply::NoReply, _) => {}
            (ServiceReply::Fail(code, detail), _) => {
                let event = EventKind::Error(TransportError::new(code, detail));
                self.schedule_call(id, latency, event);
            }
            (ServiceReply::Unary(bytes), MethodKind::Unary) => {
                self.schedule_call(id, latency, EventKind::Success(Payload::plain(bytes)));
            }
            (ServiceReply::Unary(bytes), _) => {
                self.schedule_call(id, latency, EventKind::StreamItem(Payload::plain(bytes)));
                if kind == MethodKind::ServerStreaming {
                    self.schedule_call(id, latency, EventKind::StreamEnd);
                }
            }
            (ServiceReply::Stream(items), MethodKind::Unary) => {
                let err = TransportError::new(
                    StatusCode::Internal,
                    format!("service streamed {} items to a unary call", items.len()),
                );
                self.schedule_call(id, latency, EventKind::Error(err));
            }
            (ServiceReply::Stream(items), _) => {
                let mut after = latency;
                for bytes in items {
                    self.schedule_call(id, after, EventKind::StreamItem(Payload::plain(bytes)));
                    after += interval;
                }
                if kind == MethodKind::ServerStreaming {
                    self.schedule_call(id, after, EventKind::StreamEnd);
                }
            }
        }
    }

    /// Deliver everything due, holding back paused channels.
    fn pump(&mut self) {
        let now = Instant::now();
        let mut held = Vec::new();
        let mut idx = 0;
        while idx < self.scheduled.len() && self.scheduled[idx].due <= now {
            let channel = self.scheduled[idx].channel;
            let blocked = matches!(self.scheduled[idx].output, Output::Event(..))
                && (self.paused.contains(&channel) || self.sink.reads_paused(channel));
            if blocked {
                idx += 1;
                continue;
            }
            let item = self.scheduled.remove(idx);
            held.push(item);
        }
        for item in held {
            match item.output {
                Output::Signal(signal) => self.sink.signal_channel(item.channel, signal),
                Output::Event(id, kind) => self.sink.deliver(CompletionEvent {
                    channel: item.channel,
                    id,
                    kind,
                }),
            }
        }
    }
}

// ── Async tasks ──────────────────────────────────────────────

type SharedSim = Rc<RefCell<Simulation>>;

/// Command task: wakes as soon as the host enqueues a command.
async fn command_loop(commands: Arc<CommandChannel>, sim: SharedSim) {
    loop {
        let cmd = commands.receive().await;
        sim.borrow_mut().handle(cmd);
    }
}

/// Pump task: releases due outputs every 1ms via the reactor timer.
async fn pump_loop(sim: SharedSim) {
    loop {
        sim.borrow_mut().pump();
        async_io_mini::Timer::after(Duration::from_millis(1)).await;
    }
}

fn run_io_loop(sim: Simulation, commands: Arc<CommandChannel>, stop: Arc<StopSignal>) {
    let executor: edge_executor::LocalExecutor<'_, 8> = edge_executor::LocalExecutor::new();
    let sim: SharedSim = Rc::new(RefCell::new(sim));

    executor.spawn(command_loop(commands, sim.clone())).detach();
    executor.spawn(pump_loop(sim)).detach();

    info!("LOOPBACK: I/O task started");
    futures_lite::future::block_on(executor.run(stop.wait()));
    info!("LOOPBACK: I/O task stopped");
}

// ── Host-side handle ─────────────────────────────────────────

pub struct LoopbackTransport {
    commands: Arc<CommandChannel>,
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl LoopbackTransport {
    /// Start the I/O thread serving `service`.
    pub fn spawn(
        sink: CompletionSink,
        service: ServiceFn,
        options: LoopbackOptions,
    ) -> std::io::Result<Self> {
        let commands: Arc<CommandChannel> = Arc::new(Channel::new());
        let stop: Arc<StopSignal> = Arc::new(Signal::new());
        let sim = Simulation {
            sink,
            service,
            options,
            connected: BTreeSet::new(),
            paused: BTreeSet::new(),
            calls: BTreeMap::new(),
            scheduled: Vec::new(),
            seq: 0,
        };

        let thread = {
            let commands = commands.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("loopback-io".into())
                .spawn(move || run_io_loop(sim, commands, stop))?
        };
        Ok(Self {
            commands,
            stop,
            thread: Some(thread),
        })
    }

    /// Simulate the network dropping `channel`'s connection.
    pub fn drop_connection(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.send(Command::Drop(channel))
    }

    fn send(&self, cmd: Command) -> Result<(), TransportError> {
        self.commands.try_send(cmd).map_err(|_| {
            TransportError::new(StatusCode::ResourceExhausted, "loopback command queue full")
        })
    }
}

impl Transport for LoopbackTransport {
    fn connect(&mut self, channel: ChannelId, address: &str) -> Result<(), TransportError> {
        debug!("LOOPBACK: connect CH[{}] -> {}", channel, address);
        self.send(Command::Connect(channel))
    }

    fn disconnect(&mut self, channel: ChannelId) {
        if self.send(Command::Disconnect(channel)).is_err() {
            warn!("LOOPBACK: disconnect CH[{}] dropped, queue full", channel);
        }
    }

    fn start_call(&mut self, call: OutboundCall) -> Result<(), TransportError> {
        self.send(Command::Start(call))
    }

    fn write(&mut self, id: CorrelationId, payload: Payload) -> Result<(), TransportError> {
        self.send(Command::Write(id, payload))
    }

    fn finish_writes(&mut self, id: CorrelationId) -> Result<(), TransportError> {
        self.send(Command::FinishWrites(id))
    }

    fn cancel(&mut self, id: CorrelationId) {
        if self.send(Command::Cancel(id)).is_err() {
            warn!("LOOPBACK: cancel {} dropped, queue full", id);
        }
    }

    fn pause_reads(&mut self, channel: ChannelId) {
        if self.send(Command::Pause(channel)).is_err() {
            warn!("LOOPBACK: pause CH[{}] dropped, queue full", channel);
        }
    }

    fn resume_reads(&mut self, channel: ChannelId) {
        if self.send(Command::Resume(channel)).is_err() {
            warn!("LOOPBACK: resume CH[{}] dropped, queue full", channel);
        }
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.stop.signal(());
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("LOOPBACK: I/O thread panicked");
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
