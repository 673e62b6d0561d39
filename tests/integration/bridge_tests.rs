//! End-to-end call flows through the bridge facade.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;
use std::time::Duration;

use protobridge::reflect::HostValue;
use protobridge::rpc::compress;
use protobridge::rpc::events::{ChannelSignal, StatusCode};
use protobridge::rpc::transport::Metadata;
use protobridge::schema::MethodDescriptor;
use protobridge::{
    BridgeConfig, BridgeError, CallEvent, CallOptions, CallState, CancelReason, ChannelOptions,
    Compression, CorrelationId, HostObject, Interceptor,
};

use crate::mock_transport::{
    CHAT, GET, Recorder, WATCH, bridge_with, encode, event_log, ignore, item, ready_bridge,
};

// ── Unary ─────────────────────────────────────────────────────

#[test]
fn unary_call_delivers_decoded_response_on_tick() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();

    let request = HostObject::new("demo.Item").with("id", 7);
    let id = bridge
        .submit_call(ch, GET, &request, CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    let sent = &bridge.transport().started[0];
    assert_eq!(sent.id, id);
    assert_eq!(sent.method, GET);
    assert_eq!(sent.payload.bytes, vec![0x08, 0x07]);
    assert!(!sent.payload.compressed);

    let reply = encode(&bridge, &item(7, "ok"));
    bridge.transport().reply(id, reply);
    assert!(log.borrow().is_empty(), "nothing reaches handlers outside tick()");

    let report = bridge.tick();
    assert_eq!(report.drained.call_events, 1);
    assert_eq!(report.in_flight, 0);

    let events = log.borrow();
    assert_eq!(events.len(), 1);
    let (got_id, CallEvent::Response(obj)) = &events[0] else {
        panic!("expected a response, got {:?}", events[0]);
    };
    assert_eq!(*got_id, id);
    assert_eq!(obj.get("id"), Some(&HostValue::I32(7)));
    assert_eq!(obj.get("value"), Some(&HostValue::Str("ok".into())));
    assert_eq!(bridge.call_state(id), Some(CallState::Completed));
}

#[test]
fn metadata_and_deadline_reach_the_transport() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let opts = CallOptions::default()
        .with_deadline(Duration::from_millis(500))
        .with_metadata("authorization", "Bearer t");
    bridge
        .submit_call(ch, GET, &item(1, ""), opts, ignore)
        .unwrap();

    let sent = &bridge.transport().started[0];
    assert_eq!(sent.timeout, Some(Duration::from_millis(500)));
    assert_eq!(
        sent.metadata,
        vec![("authorization".to_owned(), "Bearer t".to_owned())]
    );
}

#[test]
fn unary_calls_get_the_configured_default_deadline() {
    let config = BridgeConfig {
        default_deadline_ms: Some(2_000),
        ..BridgeConfig::default()
    };
    let (mut bridge, _clock, ch) = ready_bridge(config);
    bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();
    bridge
        .submit_stream(ch, WATCH, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();

    let started = &bridge.transport().started;
    assert_eq!(started[0].timeout, Some(Duration::from_secs(2)));
    assert_eq!(started[1].timeout, None, "streams have no default deadline");
}

#[test]
fn transport_error_fails_the_call() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    bridge.transport().fail(id, StatusCode::NotFound, "no such item");
    bridge.tick();

    let events = log.borrow();
    assert_eq!(events.len(), 1);
    match &events[0].1 {
        CallEvent::Failed(BridgeError::Transport(e)) => {
            assert_eq!(e.code, StatusCode::NotFound);
            assert_eq!(e.detail, "no such item");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(bridge.call_state(id), Some(CallState::Failed));
}

#[test]
fn remote_deadline_status_maps_to_deadline_exceeded() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    bridge
        .transport()
        .fail(id, StatusCode::DeadlineExceeded, "too slow");
    bridge.tick();
    assert_eq!(
        log.borrow()[0].1,
        CallEvent::Failed(BridgeError::DeadlineExceeded)
    );
}

#[test]
fn undecodable_response_fails_with_malformed_message() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    // Field 2 claims 10 bytes, only 1 follows.
    bridge.transport().reply(id, vec![0x12, 0x0a, b'x']);
    bridge.tick();
    assert!(matches!(
        log.borrow()[0].1,
        CallEvent::Failed(BridgeError::MalformedMessage(_))
    ));
}

#[test]
fn unary_stream_end_without_response_is_internal_failure() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    bridge.transport().end(id);
    bridge.tick();
    assert!(matches!(
        &log.borrow()[0].1,
        CallEvent::Failed(BridgeError::Transport(e)) if e.code == StatusCode::Internal
    ));
}

// ── Submission errors ─────────────────────────────────────────

#[test]
fn schema_mismatch_is_reported_synchronously() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let bad = HostObject::new("demo.Item").with("id", "seven");

    let err = bridge
        .submit_call(ch, GET, &bad, CallOptions::default(), Recorder(log.clone()))
        .unwrap_err();
    match err {
        BridgeError::SchemaMismatch { message, field, .. } => {
            assert_eq!(message, "demo.Item");
            assert_eq!(field, "id");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(bridge.transport().started.is_empty());
    assert_eq!(bridge.in_flight(), 0);

    bridge.tick();
    assert!(log.borrow().is_empty(), "failed submissions never reach the handler");
}

#[test]
fn method_kind_mismatch_is_unknown_descriptor() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let req = item(1, "");

    let err = bridge
        .submit_call(ch, WATCH, &req, CallOptions::default(), ignore)
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnknownDescriptor(_)));

    let err = bridge
        .submit_stream(ch, GET, &req, CallOptions::default(), ignore)
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnknownDescriptor(_)));

    let err = bridge
        .submit_call(ch, "/demo.Echo/Nope", &req, CallOptions::default(), ignore)
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnknownDescriptor(_)));
    assert!(bridge.transport().started.is_empty());
}

#[test]
fn unknown_channel_is_rejected() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let other = protobridge::rpc::events::ChannelId::new(ch.get() + 100);
    let err = bridge
        .submit_call(other, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap_err();
    assert_eq!(err, BridgeError::InvalidChannel(other));
}

#[test]
fn immediate_send_failure_is_synchronous() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    bridge.transport_mut().fail_start = true;
    let err = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap_err();
    assert!(matches!(err, BridgeError::Transport(_)));
    assert_eq!(bridge.in_flight(), 0);
}

// ── Identity & ordering ───────────────────────────────────────

#[test]
fn ten_thousand_calls_get_distinct_ids() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let req = item(1, "");
    let mut ids = HashSet::new();
    for _ in 0..10_000 {
        let id = bridge
            .submit_call(ch, GET, &req, CallOptions::default(), ignore)
            .unwrap();
        assert!(ids.insert(id), "duplicate correlation id {id}");
    }
    assert_eq!(ids.len(), 10_000);
    assert_eq!(bridge.in_flight(), 10_000);
}

#[test]
fn stream_items_arrive_in_order_across_ticks() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_stream(ch, WATCH, &item(0, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    for n in 1..=3 {
        let bytes = encode(&bridge, &item(n, "a"));
        bridge.transport().item(id, bytes);
    }
    bridge.tick();
    assert_eq!(bridge.call_state(id), Some(CallState::StreamingIn));

    for n in 4..=5 {
        let bytes = encode(&bridge, &item(n, "b"));
        bridge.transport().item(id, bytes);
    }
    bridge.transport().end(id);
    bridge.tick();

    let events = log.borrow();
    let seen: Vec<i32> = events
        .iter()
        .filter_map(|(_, e)| match e {
            CallEvent::StreamItem(obj) => match obj.get("id") {
                Some(HostValue::I32(n)) => Some(*n),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(events.last().map(|(_, e)| e), Some(&CallEvent::StreamEnd));
    assert_eq!(bridge.call_state(id), Some(CallState::Completed));
}

#[test]
fn events_are_delivered_in_arrival_order_across_calls() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let a = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    let b = bridge
        .submit_call(ch, GET, &item(2, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    let reply = encode(&bridge, &item(0, "ok"));
    bridge.transport().reply(b, reply.clone());
    bridge.transport().reply(a, reply);
    bridge.tick();

    let order: Vec<_> = log.borrow().iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![b, a]);
}

#[test]
fn events_after_terminal_are_dropped() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_stream(ch, WATCH, &item(0, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    bridge.transport().end(id);
    let late = encode(&bridge, &item(9, "late"));
    bridge.transport().item(id, late);
    bridge.tick();
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(log.borrow()[0].1, CallEvent::StreamEnd);
}

// ── Deadlines ─────────────────────────────────────────────────

#[test]
fn deadline_fires_on_first_tick_at_or_after_expiry() {
    let (mut bridge, clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_call(
            ch,
            GET,
            &item(1, ""),
            CallOptions::default().with_deadline(Duration::from_millis(50)),
            Recorder(log.clone()),
        )
        .unwrap();

    clock.advance(Duration::from_millis(49));
    let report = bridge.tick();
    assert_eq!(report.timers_fired, 0);
    assert!(log.borrow().is_empty());
    assert_eq!(bridge.call_state(id), Some(CallState::Sent));

    clock.advance(Duration::from_millis(1));
    let report = bridge.tick();
    assert_eq!(report.timers_fired, 1);
    assert_eq!(
        log.borrow().as_slice(),
        &[(id, CallEvent::Failed(BridgeError::DeadlineExceeded))]
    );
    assert!(bridge.transport().cancels.contains(&id));

    // A response racing the deadline is discarded.
    let reply = encode(&bridge, &item(1, "late"));
    bridge.transport().reply(id, reply);
    bridge.tick();
    assert_eq!(log.borrow().len(), 1);
}

#[test]
fn deadline_counts_time_spent_waiting_for_the_channel() {
    let (mut bridge, clock) = bridge_with(BridgeConfig::default());
    bridge.transport_mut().auto_connect = false;
    let ch = bridge.open_channel("mock://slow").unwrap();
    let id = bridge
        .submit_call(
            ch,
            GET,
            &item(1, ""),
            CallOptions::default().with_deadline(Duration::from_millis(100)),
            ignore,
        )
        .unwrap();

    clock.advance(Duration::from_millis(30));
    bridge.transport().signal(ch, ChannelSignal::Connected);
    bridge.tick();
    let sent = &bridge.transport().started[0];
    assert_eq!(sent.id, id);
    assert_eq!(sent.timeout, Some(Duration::from_millis(70)));
}

#[test]
fn deadline_beyond_the_clock_range_means_no_deadline() {
    let (mut bridge, clock, ch) = ready_bridge(BridgeConfig::default());
    clock.advance(Duration::from_millis(5));
    let log = event_log();
    let id = bridge
        .submit_call(
            ch,
            GET,
            &item(1, ""),
            CallOptions::default().with_deadline(Duration::MAX),
            Recorder(log.clone()),
        )
        .unwrap();
    assert_eq!(bridge.transport().started[0].timeout, None);

    clock.advance(Duration::from_secs(3600));
    let report = bridge.tick();
    assert_eq!(report.timers_fired, 0);
    assert_eq!(bridge.call_state(id), Some(CallState::Sent));

    let reply = encode(&bridge, &item(1, "ok"));
    bridge.transport().reply(id, reply);
    bridge.tick();
    assert!(matches!(log.borrow()[0].1, CallEvent::Response(_)));
}

// ── Cancellation ──────────────────────────────────────────────

#[test]
fn cancel_acknowledged_by_transport() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    bridge.cancel(id).unwrap();
    assert_eq!(bridge.transport().cancels, vec![id]);
    bridge.transport().ack_cancel(id);
    bridge.tick();

    assert_eq!(
        log.borrow().as_slice(),
        &[(id, CallEvent::Cancelled(CancelReason::UserRequested))]
    );
    assert_eq!(bridge.call_state(id), Some(CallState::Cancelled));
}

#[test]
fn cancel_wins_over_a_racing_response() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    let reply = encode(&bridge, &item(1, "ok"));
    bridge.transport().reply(id, reply);
    bridge.cancel(id).unwrap();
    bridge.tick();
    assert_eq!(
        log.borrow().as_slice(),
        &[(id, CallEvent::Cancelled(CancelReason::UserRequested))]
    );
}

#[test]
fn cancel_without_acknowledgement_is_synthesized_after_grace() {
    let config = BridgeConfig {
        cancel_grace_ms: 250,
        ..BridgeConfig::default()
    };
    let (mut bridge, clock, ch) = ready_bridge(config);
    let log = event_log();
    let id = bridge
        .submit_stream(ch, WATCH, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    bridge.cancel(id).unwrap();
    // Items still in flight after the cancel request are swallowed.
    let bytes = encode(&bridge, &item(2, "x"));
    bridge.transport().item(id, bytes);
    bridge.tick();
    assert!(log.borrow().is_empty());

    clock.advance(Duration::from_millis(249));
    bridge.tick();
    assert!(log.borrow().is_empty());

    clock.advance(Duration::from_millis(1));
    let report = bridge.tick();
    assert_eq!(report.timers_fired, 1);
    assert_eq!(
        log.borrow().as_slice(),
        &[(id, CallEvent::Cancelled(CancelReason::UserRequested))]
    );
}

#[test]
fn cancel_of_pending_call_completes_next_tick_without_transport() {
    let (mut bridge, _clock) = bridge_with(BridgeConfig::default());
    bridge.transport_mut().auto_connect = false;
    let ch = bridge.open_channel("mock://slow").unwrap();
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    assert_eq!(bridge.call_state(id), Some(CallState::Pending));

    bridge.cancel(id).unwrap();
    assert!(bridge.transport().cancels.is_empty());
    bridge.tick();
    assert_eq!(
        log.borrow().as_slice(),
        &[(id, CallEvent::Cancelled(CancelReason::UserRequested))]
    );

    // Connecting later must not resurrect it.
    bridge.transport().signal(ch, ChannelSignal::Connected);
    bridge.tick();
    assert!(bridge.transport().started.is_empty());
}

#[test]
fn cancel_is_idempotent_and_rejects_unknown_ids() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();
    bridge.cancel(id).unwrap();
    bridge.cancel(id).unwrap();
    assert_eq!(bridge.transport().cancels.len(), 1);

    bridge.transport().ack_cancel(id);
    bridge.tick();
    bridge.cancel(id).unwrap();

    let bogus = CorrelationId::from_raw(u64::MAX);
    assert_eq!(bridge.cancel(bogus), Err(BridgeError::UnknownCall(bogus)));
}

#[test]
fn cancel_of_a_call_older_than_the_history_is_a_no_op() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let reply = encode(&bridge, &item(1, "ok"));
    let first = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();
    bridge.transport().reply(first, reply.clone());
    bridge.tick();

    for _ in 0..protobridge::rpc::dispatcher::HISTORY_CAP {
        let id = bridge
            .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
            .unwrap();
        bridge.transport().reply(id, reply.clone());
    }
    bridge.tick();
    assert_eq!(bridge.call_state(first), None);

    assert_eq!(bridge.cancel(first), Ok(()));
    assert!(bridge.transport().cancels.is_empty());
    assert_eq!(bridge.tick().drained.call_events, 0);
}

// ── Bidirectional streams ─────────────────────────────────────

#[test]
fn bidi_writes_and_half_close() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_stream(ch, CHAT, &item(1, "hello"), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    bridge.write_stream(id, &item(2, "again")).unwrap();
    bridge.write_stream(id, &item(3, "bye")).unwrap();
    bridge.finish_stream(id).unwrap();

    let expected = encode(&bridge, &item(2, "again"));
    let t = bridge.transport();
    assert_eq!(t.writes.len(), 2);
    assert_eq!(t.writes[0].0, id);
    assert_eq!(t.writes[0].1.bytes, expected);
    assert_eq!(t.finished, vec![id]);

    let err = bridge.write_stream(id, &item(4, "")).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidState(_)));

    let reply = encode(&bridge, &item(9, "pong"));
    bridge.transport().item(id, reply);
    bridge.transport().end(id);
    bridge.tick();
    assert_eq!(log.borrow().len(), 2);
}

#[test]
fn bidi_writes_before_ready_are_flushed_after_the_request() {
    let (mut bridge, _clock) = bridge_with(BridgeConfig::default());
    let ch = bridge.open_channel("mock://chat").unwrap();
    let id = bridge
        .submit_stream(ch, CHAT, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();
    bridge.write_stream(id, &item(2, "")).unwrap();
    bridge.finish_stream(id).unwrap();
    assert!(bridge.transport().started.is_empty());
    assert!(bridge.transport().writes.is_empty());

    bridge.tick();
    let t = bridge.transport();
    assert_eq!(t.started_ids(), vec![id]);
    assert_eq!(t.writes.len(), 1);
    assert_eq!(t.finished, vec![id]);
}

#[test]
fn writes_on_non_bidi_calls_are_rejected() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let id = bridge
        .submit_stream(ch, WATCH, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();
    assert!(matches!(
        bridge.write_stream(id, &item(2, "")),
        Err(BridgeError::InvalidState(_))
    ));
    assert!(matches!(
        bridge.finish_stream(id),
        Err(BridgeError::InvalidState(_))
    ));
}

// ── Compression ───────────────────────────────────────────────

#[test]
fn deflate_channel_compresses_large_requests_and_inflates_replies() {
    let (mut bridge, _clock) = bridge_with(BridgeConfig::default());
    let opts = ChannelOptions {
        compression: Compression::Deflate,
        ..ChannelOptions::default()
    };
    let ch = bridge.open_channel_with("mock://zip", opts).unwrap();
    bridge.tick();

    let big = "x".repeat(4096);
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, &big), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    let sent = &bridge.transport().started[0];
    assert!(sent.payload.compressed);
    assert!(sent.payload.bytes.len() < 4096);

    let reply = compress::pack(encode(&bridge, &item(1, &big)), Compression::Deflate);
    assert!(reply.compressed);
    bridge
        .transport()
        .emit(id, protobridge::rpc::events::EventKind::Success(reply));
    bridge.tick();

    let events = log.borrow();
    let CallEvent::Response(obj) = &events[0].1 else {
        panic!("expected response, got {:?}", events[0]);
    };
    assert_eq!(obj.get("value").and_then(HostValue::as_str), Some(big.as_str()));
}

#[test]
fn small_requests_stay_plain_on_deflate_channels() {
    let (mut bridge, _clock) = bridge_with(BridgeConfig {
        compression: Compression::Deflate,
        ..BridgeConfig::default()
    });
    let ch = bridge.open_channel("mock://zip").unwrap();
    bridge.tick();
    bridge
        .submit_call(ch, GET, &item(1, "tiny"), CallOptions::default(), ignore)
        .unwrap();
    assert!(!bridge.transport().started[0].payload.compressed);
}

// ── History ───────────────────────────────────────────────────

#[test]
fn call_state_tracks_live_and_recent_calls() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let first = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();
    assert_eq!(bridge.call_state(first), Some(CallState::Sent));

    let reply = encode(&bridge, &item(1, "ok"));
    bridge.transport().reply(first, reply.clone());
    bridge.tick();
    assert_eq!(bridge.call_state(first), Some(CallState::Completed));

    // Push `first` out of the bounded history.
    for _ in 0..protobridge::rpc::dispatcher::HISTORY_CAP {
        let id = bridge
            .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
            .unwrap();
        bridge.transport().reply(id, reply.clone());
    }
    bridge.tick();
    assert_eq!(bridge.call_state(first), None);
    assert_eq!(bridge.call_state(CorrelationId::from_raw(u64::MAX)), None);
}

// ── Interceptors ──────────────────────────────────────────────

type Trace = Rc<RefCell<Vec<String>>>;

/// Stamps a header and writes every terminal event it sees to `trace`.
struct Stamp {
    key: &'static str,
    trace: Trace,
}

impl Interceptor for Stamp {
    fn intercept_request(&mut self, method: &MethodDescriptor, metadata: &mut Metadata) {
        metadata.push((self.key.to_owned(), method.path.clone()));
    }

    fn intercept_response(
        &mut self,
        id: CorrelationId,
        _method: &MethodDescriptor,
        event: &CallEvent,
    ) {
        let kind = match event {
            CallEvent::Response(_) => "response",
            CallEvent::StreamEnd => "end",
            CallEvent::Failed(_) => "failed",
            CallEvent::Cancelled(_) => "cancelled",
            CallEvent::StreamItem(_) => "item",
        };
        self.trace.borrow_mut().push(format!("{} {id} {kind}", self.key));
    }
}

#[test]
fn interceptors_rewrite_metadata_and_see_terminal_events_first() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let trace = Trace::default();
    bridge.add_interceptor(Stamp {
        key: "x-first",
        trace: trace.clone(),
    });
    bridge.add_interceptor(Stamp {
        key: "x-second",
        trace: trace.clone(),
    });

    let handler_trace = trace.clone();
    let id = bridge
        .submit_call(
            ch,
            GET,
            &item(1, ""),
            CallOptions::default().with_metadata("x-app", "demo"),
            move |id: CorrelationId, _: CallEvent| {
                handler_trace.borrow_mut().push(format!("handler {id}"));
            },
        )
        .unwrap();

    let sent = &bridge.transport().started[0];
    assert_eq!(
        sent.metadata,
        vec![
            ("x-app".to_owned(), "demo".to_owned()),
            ("x-first".to_owned(), GET.to_owned()),
            ("x-second".to_owned(), GET.to_owned()),
        ]
    );

    let reply = encode(&bridge, &item(1, "ok"));
    bridge.transport().reply(id, reply);
    bridge.tick();
    assert_eq!(
        *trace.borrow(),
        vec![
            format!("x-first {id} response"),
            format!("x-second {id} response"),
            format!("handler {id}"),
        ]
    );
}

#[test]
fn interceptors_skip_stream_items_and_see_bridge_made_outcomes() {
    let (mut bridge, clock, ch) = ready_bridge(BridgeConfig::default());
    let trace = Trace::default();
    bridge.add_interceptor(Stamp {
        key: "x-trace",
        trace: trace.clone(),
    });

    let stream = bridge
        .submit_stream(ch, WATCH, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();
    let bytes = encode(&bridge, &item(2, "x"));
    bridge.transport().item(stream, bytes);
    bridge.transport().end(stream);

    let timed = bridge
        .submit_call(
            ch,
            GET,
            &item(1, ""),
            CallOptions::default().with_deadline(Duration::from_millis(10)),
            ignore,
        )
        .unwrap();
    clock.advance(Duration::from_millis(10));
    bridge.tick();

    assert_eq!(
        *trace.borrow(),
        vec![format!("x-trace {stream} end"), format!("x-trace {timed} failed")]
    );
}
