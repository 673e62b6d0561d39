//! ProtoBridge demo host.
//!
//! Simulates a 60 Hz engine frame loop talking to an in-process echo
//! service through the loopback transport.
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │  frame loop (this thread)│        │  loopback-io thread      │
//! │  submit_* ──▶ Bridge ────┼───────▶│  demo.Echo service       │
//! │  tick()   ◀── handlers ◀─┼────────┤  (CompletionSink)        │
//! └──────────────────────────┘        └──────────────────────────┘
//! ```
//!
//! Usage: `protobridge-demo [config.json]`
#![deny(unused_must_use)]

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use protobridge::adapters::log_sink::LogHandler;
use protobridge::adapters::loopback::{LoopbackOptions, LoopbackTransport, ServiceFn, ServiceReply};
use protobridge::rpc::marshal::Marshaller;
use protobridge::rpc::transport::Metadata;
use protobridge::schema::{
    DescriptorRegistry, FieldDescriptor, FieldType, MessageDescriptor, MethodDescriptor,
    MethodKind, RegistryBuilder,
};
use protobridge::{
    Bridge, BridgeConfig, CallEvent, CallOptions, CorrelationId, HostObject, HostValue,
    Interceptor, StatusCode,
};

const FRAME: Duration = Duration::from_micros(16_667);
const FRAMES: u32 = 120;

fn build_registry() -> Result<Arc<DescriptorRegistry>> {
    let mut b = RegistryBuilder::new();
    b.message(MessageDescriptor::new(
        "demo.Item",
        vec![
            FieldDescriptor::new("id", 1, FieldType::Int32),
            FieldDescriptor::new("value", 2, FieldType::String),
        ],
    ))?;
    b.method(MethodDescriptor::new(
        "/demo.Echo/Get",
        MethodKind::Unary,
        "demo.Item",
        "demo.Item",
    ))?;
    b.method(MethodDescriptor::new(
        "/demo.Echo/Watch",
        MethodKind::ServerStreaming,
        "demo.Item",
        "demo.Item",
    ))?;
    b.method(MethodDescriptor::new(
        "/demo.Echo/Chat",
        MethodKind::BidiStreaming,
        "demo.Item",
        "demo.Item",
    ))?;
    Ok(b.build()?)
}

/// The remote side: answers `{id}` with `{id, value: "ok"}`.
fn echo_service(marshaller: Marshaller) -> ServiceFn {
    Arc::new(move |method: &str, request: &[u8]| {
        let req = match marshaller.decode(request, "demo.Item") {
            Ok(obj) => obj,
            Err(e) => {
                return ServiceReply::Fail(StatusCode::InvalidArgument, e.to_string());
            }
        };
        let id = req.get("id").cloned().unwrap_or(HostValue::I32(0));
        let reply = |value: &str| {
            let obj = HostObject::new("demo.Item").with("id", id.clone()).with("value", value);
            marshaller.encode(&obj, "demo.Item")
        };
        let result = match method {
            "/demo.Echo/Watch" => (1..=3)
                .map(|n| reply(&format!("tick {n}")))
                .collect::<protobridge::Result<Vec<_>>>()
                .map(ServiceReply::Stream),
            _ => reply("ok").map(ServiceReply::Unary),
        };
        result.unwrap_or_else(|e| ServiceReply::Fail(StatusCode::Internal, e.to_string()))
    })
}

/// Tags every request with the client name and logs failed calls.
struct ClientTag;

impl Interceptor for ClientTag {
    fn intercept_request(&mut self, _method: &MethodDescriptor, metadata: &mut Metadata) {
        metadata.push(("x-client".into(), "protobridge-demo".into()));
    }

    fn intercept_response(
        &mut self,
        id: CorrelationId,
        method: &MethodDescriptor,
        event: &CallEvent,
    ) {
        if let CallEvent::Failed(e) = event {
            warn!("CALL[{}] {} failed: {}", id, method.path, e);
        }
    }
}

fn load_config() -> Result<BridgeConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
            let cfg = BridgeConfig::from_json(&text)?;
            info!("Config loaded from {}", path);
            Ok(cfg)
        }
        None => {
            info!("No config file given, using defaults");
            Ok(BridgeConfig::default())
        }
    }
}

fn main() -> Result<()> {
    // Default to INFO; RUST_LOG overrides.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    info!("ProtoBridge demo v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    let registry = build_registry()?;
    let service = echo_service(Marshaller::new(registry.clone(), config.marshal_limits()));

    let mut bridge = Bridge::try_new(config, registry, |sink| {
        LoopbackTransport::spawn(sink, service, LoopbackOptions::default())
            .context("spawning loopback transport")
    })?;

    bridge.add_interceptor(ClientTag);
    let channel = bridge.open_channel("loop://demo.echo")?;
    let completed = Rc::new(Cell::new(0u32));

    for frame in 0..FRAMES {
        if frame % 20 == 0 {
            let request = HostObject::new("demo.Item").with("id", frame as i32);
            let done = completed.clone();
            bridge.submit_call(
                channel,
                "/demo.Echo/Get",
                &request,
                CallOptions::default().with_metadata("x-frame", &frame.to_string()),
                move |id: CorrelationId, event: CallEvent| {
                    if let CallEvent::Response(obj) = &event {
                        info!("CALL[{}] Get -> {:?}", id, obj.get("value"));
                    }
                    if event.is_terminal() {
                        done.set(done.get() + 1);
                    }
                },
            )?;
        }
        if frame == 30 {
            let request = HostObject::new("demo.Item").with("id", 99);
            bridge.submit_stream(
                channel,
                "/demo.Echo/Watch",
                &request,
                CallOptions::default(),
                LogHandler::from_config("Watch", bridge.config()),
            )?;
        }

        let report = bridge.tick();
        if report.drained.remaining > 0 {
            warn!("frame {}: {} events deferred", frame, report.drained.remaining);
        }
        std::thread::sleep(FRAME);
    }

    info!(
        "Done: {} unary calls completed, {} still in flight, channel {:?}",
        completed.get(),
        bridge.in_flight(),
        bridge.channel_health(channel)?
    );
    bridge.close_channel(channel)?;
    bridge.tick();
    Ok(())
}
