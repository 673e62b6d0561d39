//! Channel lifecycle, reconnection and backpressure through the facade.

use std::time::Duration;

use protobridge::adapters::time::ManualClock;
use protobridge::rpc::events::{ChannelSignal, StatusCode};
use protobridge::{
    Bridge, BridgeConfig, BridgeError, CallEvent, CallOptions, CancelReason, ChannelState,
};

use crate::mock_transport::{
    GET, MockTransport, Recorder, WATCH, bridge_with, encode, event_log, ignore, item,
    ready_bridge, registry,
};

fn no_jitter(attempts: u32) -> BridgeConfig {
    BridgeConfig {
        max_retry_attempts: attempts,
        backoff_base_ms: 100,
        backoff_cap_ms: 5_000,
        backoff_jitter: 0.0,
        ..BridgeConfig::default()
    }
}

// ── Connect & lazy connect ────────────────────────────────────

#[test]
fn eager_channel_connects_at_open() {
    let (mut bridge, _clock) = bridge_with(BridgeConfig::default());
    let ch = bridge.open_channel("mock://eager").unwrap();
    assert_eq!(bridge.transport().connects, vec![(ch, "mock://eager".to_owned())]);
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Connecting));

    let report = bridge.tick();
    assert_eq!(report.drained.channel_signals, 1);
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Ready));
}

#[test]
fn lazy_channel_connects_on_first_call_and_flushes_in_order() {
    let config = BridgeConfig {
        lazy_connect: true,
        ..BridgeConfig::default()
    };
    let (mut bridge, _clock) = bridge_with(config);
    let ch = bridge.open_channel("mock://lazy").unwrap();
    assert!(bridge.transport().connects.is_empty());
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Idle));

    let ids: Vec<_> = (0..3)
        .map(|n| {
            bridge
                .submit_call(ch, GET, &item(n, ""), CallOptions::default(), ignore)
                .unwrap()
        })
        .collect();
    assert_eq!(bridge.transport().connects.len(), 1);
    assert!(bridge.transport().started.is_empty());

    bridge.tick();
    assert_eq!(bridge.transport().started_ids(), ids);
}

#[test]
fn empty_address_is_a_config_error() {
    let (mut bridge, _clock) = bridge_with(BridgeConfig::default());
    assert!(matches!(
        bridge.open_channel(""),
        Err(BridgeError::Config(_))
    ));
}

#[test]
fn invalid_config_is_rejected_at_construction() {
    let config = BridgeConfig {
        queue_low_watermark: 10,
        queue_high_watermark: 10,
        ..BridgeConfig::default()
    };
    let result = Bridge::with_clock(
        config,
        registry(),
        MockTransport::new,
        Box::new(ManualClock::new()),
    );
    assert!(matches!(result, Err(BridgeError::Config(_))));
}

// ── Reconnection ──────────────────────────────────────────────

#[test]
fn retries_back_off_then_fail_waiting_calls_as_unavailable() {
    let clock = ManualClock::new();
    let mut bridge = Bridge::with_clock(
        no_jitter(3),
        registry(),
        MockTransport::refusing,
        Box::new(clock.clone()),
    )
    .unwrap();
    let ch = bridge.open_channel("mock://down").unwrap();
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::TransientFailure));

    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    bridge.tick();
    assert_eq!(bridge.transport().connects.len(), 1);

    // Attempt 2 after 100ms.
    clock.advance(Duration::from_millis(99));
    bridge.tick();
    assert_eq!(bridge.transport().connects.len(), 1);
    clock.advance(Duration::from_millis(1));
    bridge.tick();
    assert_eq!(bridge.transport().connects.len(), 2);
    assert!(log.borrow().is_empty());

    // Attempt 3 after a further 200ms exhausts the budget.
    clock.advance(Duration::from_millis(200));
    let report = bridge.tick();
    assert_eq!(bridge.transport().connects.len(), 3);
    assert_eq!(report.deferred_failures, 1);
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Unavailable));
    assert_eq!(
        log.borrow().as_slice(),
        &[(id, CallEvent::Failed(BridgeError::Unavailable(ch)))]
    );

    // No more attempts on their own.
    clock.advance(Duration::from_secs(60));
    bridge.tick();
    assert_eq!(bridge.transport().connects.len(), 3);

    let err = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap_err();
    assert_eq!(err, BridgeError::Unavailable(ch));
}

#[test]
fn reopen_resets_the_budget() {
    let (mut bridge, clock) = bridge_with(no_jitter(1));
    bridge.transport_mut().refuse_connect = true;
    let ch = bridge.open_channel("mock://flaky").unwrap();
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Unavailable));

    bridge.transport_mut().refuse_connect = false;
    bridge.reopen_channel(ch).unwrap();
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Connecting));
    clock.advance(Duration::from_millis(1));
    bridge.tick();
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Ready));
    assert_eq!(bridge.transport().connects.len(), 2);
}

#[test]
fn connect_failed_signal_counts_as_an_attempt() {
    let (mut bridge, clock) = bridge_with(no_jitter(5));
    bridge.transport_mut().auto_connect = false;
    let ch = bridge.open_channel("mock://x").unwrap();

    bridge
        .transport()
        .signal(ch, ChannelSignal::ConnectFailed("timeout".into()));
    bridge.tick();
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::TransientFailure));

    clock.advance(Duration::from_millis(100));
    bridge.tick();
    assert_eq!(bridge.transport().connects.len(), 2);
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Connecting));

    bridge.transport().signal(ch, ChannelSignal::Connected);
    bridge.tick();
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Ready));
}

#[test]
fn disconnect_from_ready_reconnects_and_holds_new_calls() {
    let (mut bridge, clock, ch) = ready_bridge(no_jitter(5));
    bridge.transport_mut().auto_connect = false;

    bridge
        .transport()
        .signal(ch, ChannelSignal::Disconnected("reset by peer".into()));
    bridge.tick();
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::TransientFailure));

    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap();
    assert_eq!(bridge.call_state(id), Some(protobridge::CallState::Pending));

    clock.advance(Duration::from_millis(100));
    bridge.tick();
    bridge.transport().signal(ch, ChannelSignal::Connected);
    bridge.tick();
    assert_eq!(bridge.transport().started_ids(), vec![id]);
}

// ── Close ─────────────────────────────────────────────────────

#[test]
fn close_cancels_every_in_flight_call_in_one_drain() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let ids: Vec<_> = (0..3)
        .map(|n| {
            bridge
                .submit_call(ch, GET, &item(n, ""), CallOptions::default(), Recorder(log.clone()))
                .unwrap()
        })
        .collect();

    bridge.close_channel(ch).unwrap();
    assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Shutdown));
    assert!(log.borrow().is_empty());
    assert!(bridge.transport().disconnects.is_empty(), "calls still bound");

    let report = bridge.tick();
    assert_eq!(report.drained.call_events, 3);
    let events = log.borrow();
    assert_eq!(events.len(), 3);
    for ((got, event), want) in events.iter().zip(&ids) {
        assert_eq!(got, want);
        assert_eq!(*event, CallEvent::Cancelled(CancelReason::ChannelClosed));
    }
    assert_eq!(bridge.transport().cancels, ids);
    assert_eq!(bridge.transport().disconnects, vec![ch]);
}

#[test]
fn closed_channel_rejects_calls_and_ignores_late_events() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    let log = event_log();
    let id = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    bridge.close_channel(ch).unwrap();

    let reply = encode(&bridge, &item(1, "too late"));
    bridge.transport().reply(id, reply);
    bridge.tick();
    bridge.tick();
    assert_eq!(log.borrow().len(), 1);

    let err = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
        .unwrap_err();
    assert_eq!(err, BridgeError::ChannelShutdown(ch));
    assert_eq!(bridge.reopen_channel(ch), Err(BridgeError::ChannelShutdown(ch)));
    // Closing twice is harmless.
    bridge.close_channel(ch).unwrap();
}

#[test]
fn close_with_no_calls_releases_immediately() {
    let (mut bridge, _clock, ch) = ready_bridge(BridgeConfig::default());
    bridge.close_channel(ch).unwrap();
    assert_eq!(bridge.transport().disconnects, vec![ch]);
}

#[test]
fn released_channels_still_report_shutdown() {
    let (mut bridge, _clock) = bridge_with(BridgeConfig::default());
    let mut closed = Vec::new();
    for n in 0..20 {
        let ch = bridge.open_channel(&format!("mock://{n}")).unwrap();
        bridge.tick();
        bridge.close_channel(ch).unwrap();
        closed.push(ch);
    }
    assert_eq!(bridge.transport().disconnects, closed);

    for ch in closed {
        assert_eq!(bridge.channel_health(ch), Ok(ChannelState::Shutdown));
        let err = bridge
            .submit_call(ch, GET, &item(1, ""), CallOptions::default(), ignore)
            .unwrap_err();
        assert_eq!(err, BridgeError::ChannelShutdown(ch));
        bridge.close_channel(ch).unwrap();
    }
    assert_eq!(bridge.transport().disconnects.len(), 20);
}

#[test]
fn calls_on_other_channels_survive_a_close() {
    let (mut bridge, _clock, a) = ready_bridge(BridgeConfig::default());
    let b = bridge.open_channel("mock://b").unwrap();
    bridge.tick();
    let log = event_log();
    let on_b = bridge
        .submit_call(b, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    bridge.close_channel(a).unwrap();

    let reply = encode(&bridge, &item(1, "ok"));
    bridge.transport().reply(on_b, reply);
    bridge.tick();
    assert!(matches!(log.borrow()[0].1, CallEvent::Response(_)));
}

// ── Backpressure ──────────────────────────────────────────────

#[test]
fn stream_backpressure_pauses_and_resumes_reads() {
    let config = BridgeConfig {
        queue_high_watermark: 4,
        queue_low_watermark: 1,
        drain_budget: Some(2),
        ..BridgeConfig::default()
    };
    let (mut bridge, _clock, ch) = ready_bridge(config);
    let log = event_log();
    let id = bridge
        .submit_stream(ch, WATCH, &item(0, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();

    for n in 1..=6 {
        let bytes = encode(&bridge, &item(n, ""));
        bridge.transport().item(id, bytes);
    }
    let sink = bridge.completion_sink();
    assert!(sink.reads_paused(ch), "queue above high watermark");

    let report = bridge.tick();
    assert_eq!(report.drained.call_events, 2);
    assert_eq!(report.drained.remaining, 4);
    assert_eq!(bridge.transport().paused, vec![ch]);
    assert!(bridge.reads_paused(ch));
    assert!(bridge.transport().resumed.is_empty());

    bridge.tick();
    assert!(bridge.reads_paused(ch), "2 left is still above the low watermark");

    let report = bridge.tick();
    assert_eq!(report.drained.remaining, 0);
    assert_eq!(bridge.transport().resumed, vec![ch]);
    assert!(!bridge.reads_paused(ch));
    assert!(!sink.reads_paused(ch));

    assert_eq!(log.borrow().len(), 6, "nothing is dropped under backpressure");
    assert_eq!(bridge.queued_events(), 0);
}

#[test]
fn drain_budget_defers_the_rest_to_later_ticks() {
    let config = BridgeConfig {
        drain_budget: Some(1),
        ..BridgeConfig::default()
    };
    let (mut bridge, _clock, ch) = ready_bridge(config);
    let log = event_log();
    let a = bridge
        .submit_call(ch, GET, &item(1, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    let b = bridge
        .submit_call(ch, GET, &item(2, ""), CallOptions::default(), Recorder(log.clone()))
        .unwrap();
    bridge.transport().fail(a, StatusCode::Aborted, "x");
    bridge.transport().fail(b, StatusCode::Aborted, "y");

    assert_eq!(bridge.tick().drained.remaining, 1);
    assert_eq!(log.borrow().len(), 1);
    assert_eq!(bridge.tick().drained.remaining, 0);
    let order: Vec<_> = log.borrow().iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![a, b]);
}
