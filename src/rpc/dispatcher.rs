//! Call dispatcher: owns every non-terminal call.
//!
//! Creates calls, encodes and sends requests, turns drained completion
//! events into host [`CallEvent`]s, and runs the bridge-owned timers
//! (deadlines, cancellation grace). All of it happens on the host thread.
//!
//! ```text
//!             send                first item
//!  Pending ─────────▶ Sent ─────────────────▶ StreamingIn
//!     │                │  Success/StreamEnd       │
//!     │                ├─────────────────────▶ Completed ◀──┘
//!     │                │  Error / deadline
//!     └────────────────┴─────────────────────▶ Failed
//!          cancel / channel close ───────────▶ Cancelled
//! ```

use core::time::Duration;
use std::collections::BTreeMap;

use heapless::HistoryBuffer;
use log::{debug, info, warn};

use super::channel::{Admission, ChannelManager, ChannelOutcome};
use super::compress;
use super::events::{
    CancelReason, ChannelId, CompletionEvent, CorrelationId, EventKind, Payload, StatusCode,
};
use super::interceptor::{Interceptor, InterceptorChain};
use super::router::CompletionSink;
use super::transport::{Metadata, OutboundCall, Transport};
use crate::error::{BridgeError, Result};
use crate::reflect::{HostObject, Reflected};
use crate::rpc::marshal::Marshaller;
use crate::schema::{MethodDescriptor, MethodKind};

/// Terminal call states remembered for `state()` queries.
pub const HISTORY_CAP: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    /// Waiting for the channel to become ready.
    Pending,
    /// Handed to the transport.
    Sent,
    /// At least one stream item delivered.
    StreamingIn,
    Completed,
    Cancelled,
    Failed,
}

impl CallState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Per-call submission options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Relative deadline. Unary calls fall back to the configured default.
    pub deadline: Option<Duration>,
    pub metadata: Metadata,
}

impl CallOptions {
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.push((key.to_owned(), value.to_owned()));
        self
    }
}

/// What the host handler sees.
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Unary response (terminal).
    Response(HostObject),
    /// One streamed message.
    StreamItem(HostObject),
    /// Stream finished normally (terminal).
    StreamEnd,
    /// Terminal failure.
    Failed(BridgeError),
    /// Terminal cancellation.
    Cancelled(CancelReason),
}

impl CallEvent {
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::StreamItem(_))
    }
}

/// Host callback for one call's events. Invoked only from `tick()`.
pub trait CallHandler {
    fn on_event(&mut self, id: CorrelationId, event: CallEvent);
}

impl<F: FnMut(CorrelationId, CallEvent)> CallHandler for F {
    fn on_event(&mut self, id: CorrelationId, event: CallEvent) {
        self(id, event);
    }
}

/// Borrowed collaborators for one dispatcher operation.
pub struct DispatchCtx<'a, T: Transport> {
    pub channels: &'a mut ChannelManager,
    pub transport: &'a mut T,
    pub now: Duration,
}

struct PendingCancel {
    reason: CancelReason,
    /// When the bridge stops waiting for the transport's acknowledgement.
    give_up_at: Duration,
}

struct CallRecord {
    channel: ChannelId,
    method: MethodDescriptor,
    state: CallState,
    deadline_at: Option<Duration>,
    cancel: Option<PendingCancel>,
    /// Request held back while `Pending`.
    outbound: Option<OutboundCall>,
    /// Bidi writes made while `Pending`.
    queued_writes: Vec<Payload>,
    writes_closed: bool,
    handler: Box<dyn CallHandler>,
}

pub struct Dispatcher {
    marshaller: Marshaller,
    calls: BTreeMap<CorrelationId, CallRecord>,
    history: HistoryBuffer<(CorrelationId, CallState), HISTORY_CAP>,
    /// Failures decided outside a drain, delivered on the next tick.
    deferred: Vec<(CorrelationId, BridgeError)>,
    default_deadline: Option<Duration>,
    cancel_grace: Duration,
    interceptors: InterceptorChain,
}

impl Dispatcher {
    pub fn new(
        marshaller: Marshaller,
        default_deadline: Option<Duration>,
        cancel_grace: Duration,
    ) -> Self {
        Self {
            marshaller,
            calls: BTreeMap::new(),
            history: HistoryBuffer::new(),
            deferred: Vec::new(),
            default_deadline,
            cancel_grace,
            interceptors: InterceptorChain::new(),
        }
    }

    pub fn marshaller(&self) -> &Marshaller {
        &self.marshaller
    }

    /// Run `interceptor` on every call submitted from now on.
    pub fn add_interceptor(&mut self, interceptor: Box<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    // ── Submission ───────────────────────────────────────────

    /// Submit a unary call.
    pub fn call<T: Transport>(
        &mut self,
        cx: &mut DispatchCtx<'_, T>,
        channel: ChannelId,
        method: &str,
        request: &dyn Reflected,
        options: CallOptions,
        handler: Box<dyn CallHandler>,
    ) -> Result<CorrelationId> {
        let desc = self.marshaller.registry().method(method)?.clone();
        if desc.kind.is_streaming() {
            return Err(BridgeError::UnknownDescriptor(format!(
                "{method} is a streaming method, not unary"
            )));
        }
        self.submit(cx, channel, desc, request, options, handler)
    }

    /// Submit a server-streaming or bidirectional call.
    pub fn start_stream<T: Transport>(
        &mut self,
        cx: &mut DispatchCtx<'_, T>,
        channel: ChannelId,
        method: &str,
        request: &dyn Reflected,
        options: CallOptions,
        handler: Box<dyn CallHandler>,
    ) -> Result<CorrelationId> {
        let desc = self.marshaller.registry().method(method)?.clone();
        if !desc.kind.is_streaming() {
            return Err(BridgeError::UnknownDescriptor(format!(
                "{method} is unary, not a streaming method"
            )));
        }
        self.submit(cx, channel, desc, request, options, handler)
    }

    fn submit<T: Transport>(
        &mut self,
        cx: &mut DispatchCtx<'_, T>,
        channel: ChannelId,
        method: MethodDescriptor,
        request: &dyn Reflected,
        options: CallOptions,
        handler: Box<dyn CallHandler>,
    ) -> Result<CorrelationId> {
        let compression = cx.channels.options(channel)?.compression;
        let encoded = self.marshaller.encode(request, &method.input)?;
        let payload = compress::pack(encoded, compression);

        // A deadline past the end of the clock's range means "none".
        let deadline = options
            .deadline
            .or(match method.kind {
                MethodKind::Unary => self.default_deadline,
                _ => None,
            })
            .filter(|d| cx.now.checked_add(*d).is_some());
        let mut metadata = options.metadata;
        self.interceptors.intercept_request(&method, &mut metadata);
        let id = CorrelationId::next();
        let outbound = OutboundCall {
            id,
            channel,
            method: method.path.clone(),
            kind: method.kind,
            payload,
            metadata,
            timeout: deadline,
        };

        let (admission, outcome) = cx.channels.admit(channel, id, cx.transport, cx.now)?;
        debug!(
            "CALL[{}]: {} on CH[{}] ({:?})",
            id, method.path, channel, admission
        );
        self.calls.insert(
            id,
            CallRecord {
                channel,
                method,
                state: CallState::Pending,
                deadline_at: deadline.and_then(|d| cx.now.checked_add(d)),
                cancel: None,
                outbound: Some(outbound),
                queued_writes: Vec::new(),
                writes_closed: false,
                handler,
            },
        );

        if admission == Admission::SendNow {
            if let Err(e) = self.send(id, cx.transport, cx.now) {
                self.calls.remove(&id);
                cx.channels.detach(channel, id);
                return Err(e);
            }
        }
        self.on_channel_outcome(cx, channel, outcome);
        Ok(id)
    }

    /// Hand a `Pending` call to the transport.
    fn send(
        &mut self,
        id: CorrelationId,
        transport: &mut impl Transport,
        now: Duration,
    ) -> Result<()> {
        let Some(rec) = self.calls.get_mut(&id) else {
            return Err(BridgeError::UnknownCall(id));
        };
        let Some(mut outbound) = rec.outbound.take() else {
            return Ok(());
        };
        if let Some(at) = rec.deadline_at {
            outbound.timeout = Some(at.saturating_sub(now));
        }
        transport.start_call(outbound)?;
        rec.state = CallState::Sent;
        for payload in rec.queued_writes.drain(..) {
            transport.write(id, payload)?;
        }
        if rec.writes_closed {
            transport.finish_writes(id)?;
        }
        Ok(())
    }

    // ── Bidirectional writes ─────────────────────────────────

    /// Send one more request message on a bidi stream.
    pub fn write<T: Transport>(
        &mut self,
        cx: &mut DispatchCtx<'_, T>,
        id: CorrelationId,
        request: &dyn Reflected,
    ) -> Result<()> {
        let rec = self.writable(id)?;
        let input = rec.method.input.clone();
        let channel = rec.channel;
        let encoded = self.marshaller.encode(request, &input)?;
        let payload = compress::pack(encoded, cx.channels.options(channel)?.compression);

        let rec = self.writable(id)?;
        if rec.state == CallState::Pending {
            rec.queued_writes.push(payload);
            return Ok(());
        }
        cx.transport.write(id, payload)?;
        Ok(())
    }

    /// Half-close the request side of a bidi stream.
    pub fn finish_writes<T: Transport>(
        &mut self,
        cx: &mut DispatchCtx<'_, T>,
        id: CorrelationId,
    ) -> Result<()> {
        let rec = self.writable(id)?;
        rec.writes_closed = true;
        if rec.state != CallState::Pending {
            cx.transport.finish_writes(id)?;
        }
        Ok(())
    }

    fn writable(&mut self, id: CorrelationId) -> Result<&mut CallRecord> {
        let rec = self.calls.get_mut(&id).ok_or(BridgeError::UnknownCall(id))?;
        if rec.method.kind != MethodKind::BidiStreaming {
            return Err(BridgeError::InvalidState(format!(
                "{} is not a bidirectional stream",
                rec.method.path
            )));
        }
        if rec.writes_closed || rec.cancel.is_some() {
            return Err(BridgeError::InvalidState(format!(
                "call {id} no longer accepts writes"
            )));
        }
        Ok(rec)
    }

    // ── Cancellation ─────────────────────────────────────────

    /// Request cancellation. A terminal `Cancelled` is guaranteed on a
    /// later tick. Cancelling a finished call is a no-op, even after it has
    /// left the history; only ids never issued are `UnknownCall`.
    pub fn cancel<T: Transport>(
        &mut self,
        cx: &mut DispatchCtx<'_, T>,
        id: CorrelationId,
    ) -> Result<()> {
        let Some(rec) = self.calls.get_mut(&id) else {
            if id.was_issued() {
                debug!("CALL[{}]: cancel after finish ignored", id);
                return Ok(());
            }
            return Err(BridgeError::UnknownCall(id));
        };
        if rec.cancel.is_some() {
            return Ok(());
        }

        let give_up_at = if rec.state == CallState::Pending {
            // Never reached the transport; nothing to acknowledge.
            cx.channels.detach(rec.channel, id);
            cx.now
        } else {
            cx.transport.cancel(id);
            cx.now.saturating_add(self.cancel_grace)
        };
        rec.cancel = Some(PendingCancel {
            reason: CancelReason::UserRequested,
            give_up_at,
        });
        info!("CALL[{}]: cancel requested", id);
        Ok(())
    }

    /// Cancel calls of a closed channel. The `Cancelled` events go through
    /// the completion queue so they are delivered on the next drain.
    pub fn cancel_for_close(
        &mut self,
        transport: &mut impl Transport,
        sink: &CompletionSink,
        ids: &[CorrelationId],
        now: Duration,
    ) {
        for id in ids {
            let Some(rec) = self.calls.get_mut(id) else {
                continue;
            };
            if rec.state != CallState::Pending {
                transport.cancel(*id);
            }
            rec.cancel = Some(PendingCancel {
                reason: CancelReason::ChannelClosed,
                give_up_at: now.saturating_add(self.cancel_grace),
            });
            sink.deliver(CompletionEvent {
                channel: rec.channel,
                id: *id,
                kind: EventKind::Cancelled(CancelReason::ChannelClosed),
            });
        }
    }

    // ── Channel outcomes ─────────────────────────────────────

    /// Act on a channel transition: flush waiting calls or fail them.
    pub fn on_channel_outcome<T: Transport>(
        &mut self,
        cx: &mut DispatchCtx<'_, T>,
        channel: ChannelId,
        outcome: ChannelOutcome,
    ) {
        match outcome {
            ChannelOutcome::Ready { flush } => {
                for id in flush {
                    let cancelled = self.calls.get(&id).is_none_or(|r| r.cancel.is_some());
                    if cancelled {
                        continue;
                    }
                    if let Err(e) = self.send(id, cx.transport, cx.now) {
                        warn!("CALL[{}]: send after connect failed: {}", id, e);
                        self.deferred.push((id, e));
                    }
                }
            }
            ChannelOutcome::Exhausted { fail } => {
                for id in fail {
                    self.deferred.push((id, BridgeError::Unavailable(channel)));
                }
            }
            ChannelOutcome::Retrying { .. } | ChannelOutcome::Ignored => {}
        }
    }

    /// Deliver failures decided since the last tick.
    pub fn flush_deferred(&mut self, channels: &mut ChannelManager) -> usize {
        let mut delivered = 0;
        for (id, err) in core::mem::take(&mut self.deferred) {
            if self.calls.contains_key(&id) {
                self.finish(channels, id, CallState::Failed, CallEvent::Failed(err));
                delivered += 1;
            }
        }
        delivered
    }

    // ── Completion handling ──────────────────────────────────

    /// Route one drained event to its call.
    pub fn on_event<T: Transport>(&mut self, cx: &mut DispatchCtx<'_, T>, event: CompletionEvent) {
        let CompletionEvent { channel, id, kind } = event;
        let Some(rec) = self.calls.get_mut(&id) else {
            debug!("CALL[{}]: late {:?} dropped", id, kind_name(&kind));
            return;
        };
        if rec.channel != channel {
            warn!(
                "CALL[{}]: event from CH[{}] but call is on CH[{}], dropped",
                id, channel, rec.channel
            );
            return;
        }

        if let Some(pending) = &rec.cancel {
            if kind.is_terminal() {
                let reason = pending.reason;
                self.finish(cx.channels, id, CallState::Cancelled, CallEvent::Cancelled(reason));
            }
            return;
        }

        match kind {
            EventKind::Success(payload) => {
                let output = rec.method.output.clone();
                let (state, event) = match self.decode(payload, &output) {
                    Ok(obj) => (CallState::Completed, CallEvent::Response(obj)),
                    Err(e) => (CallState::Failed, CallEvent::Failed(e)),
                };
                self.finish(cx.channels, id, state, event);
            }
            EventKind::StreamItem(payload) => {
                if !rec.method.kind.is_streaming() {
                    warn!("CALL[{}]: stream item on unary call dropped", id);
                    return;
                }
                let output = rec.method.output.clone();
                match self.decode(payload, &output) {
                    Ok(obj) => {
                        if let Some(rec) = self.calls.get_mut(&id) {
                            rec.state = CallState::StreamingIn;
                            rec.handler.on_event(id, CallEvent::StreamItem(obj));
                        }
                    }
                    Err(e) => {
                        warn!("CALL[{}]: undecodable stream item: {}", id, e);
                        cx.transport.cancel(id);
                        self.finish(cx.channels, id, CallState::Failed, CallEvent::Failed(e));
                    }
                }
            }
            EventKind::StreamEnd => {
                if rec.method.kind.is_streaming() {
                    self.finish(cx.channels, id, CallState::Completed, CallEvent::StreamEnd);
                } else {
                    let err = BridgeError::Transport(super::events::TransportError::new(
                        StatusCode::Internal,
                        "unary call ended without a response",
                    ));
                    self.finish(cx.channels, id, CallState::Failed, CallEvent::Failed(err));
                }
            }
            EventKind::Error(e) => {
                let err = if e.code == StatusCode::DeadlineExceeded {
                    BridgeError::DeadlineExceeded
                } else {
                    BridgeError::Transport(e)
                };
                self.finish(cx.channels, id, CallState::Failed, CallEvent::Failed(err));
            }
            EventKind::Cancelled(reason) => {
                self.finish(cx.channels, id, CallState::Cancelled, CallEvent::Cancelled(reason));
            }
        }
    }

    fn decode(&self, payload: Payload, message: &str) -> Result<HostObject> {
        let bytes = compress::unpack(payload, self.marshaller.limits().max_field_bytes)?;
        self.marshaller.decode(&bytes, message)
    }

    // ── Timers ───────────────────────────────────────────────

    /// Fire elapsed deadlines and cancellation grace periods.
    pub fn expire<T: Transport>(&mut self, cx: &mut DispatchCtx<'_, T>) -> usize {
        let now = cx.now;
        let mut cancelled = Vec::new();
        let mut expired = Vec::new();
        for (id, rec) in &self.calls {
            if let Some(pending) = &rec.cancel {
                if pending.give_up_at <= now {
                    cancelled.push((*id, pending.reason));
                }
            } else if rec.deadline_at.is_some_and(|at| at <= now) {
                expired.push((*id, rec.state));
            }
        }

        let fired = cancelled.len() + expired.len();
        for (id, reason) in cancelled {
            debug!("CALL[{}]: no cancel acknowledgement, synthesizing", id);
            self.finish(cx.channels, id, CallState::Cancelled, CallEvent::Cancelled(reason));
        }
        for (id, state) in expired {
            warn!("CALL[{}]: deadline exceeded", id);
            if state != CallState::Pending {
                cx.transport.cancel(id);
            }
            let event = CallEvent::Failed(BridgeError::DeadlineExceeded);
            self.finish(cx.channels, id, CallState::Failed, event);
        }
        fired
    }

    fn finish(
        &mut self,
        channels: &mut ChannelManager,
        id: CorrelationId,
        state: CallState,
        event: CallEvent,
    ) {
        let Some(mut rec) = self.calls.remove(&id) else {
            return;
        };
        channels.detach(rec.channel, id);
        self.history.write((id, state));
        debug!("CALL[{}]: -> {:?}", id, state);
        self.interceptors.intercept_response(id, &rec.method, &event);
        rec.handler.on_event(id, event);
    }

    // ── Queries ──────────────────────────────────────────────

    /// Current state, or the terminal state if the call finished recently.
    pub fn state(&self, id: CorrelationId) -> Option<CallState> {
        if let Some(rec) = self.calls.get(&id) {
            return Some(rec.state);
        }
        self.history
            .as_slice()
            .iter()
            .find(|(h, _)| *h == id)
            .map(|(_, s)| *s)
    }

    pub fn in_flight(&self) -> usize {
        self.calls.len()
    }

    pub fn channel_of(&self, id: CorrelationId) -> Option<ChannelId> {
        self.calls.get(&id).map(|r| r.channel)
    }
}

fn kind_name(kind: &EventKind) -> &'static str {
    match kind {
        EventKind::Success(_) => "Success",
        EventKind::StreamItem(_) => "StreamItem",
        EventKind::StreamEnd => "StreamEnd",
        EventKind::Error(_) => "Error",
        EventKind::Cancelled(_) => "Cancelled",
    }
}

// ── Tests ────────────────────────────────────────────────────
