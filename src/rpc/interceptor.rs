//! Request/response interceptors.
//!
//! Registered on the bridge and run on the host thread, in the order they
//! were added: `intercept_request` over the outgoing metadata of every call
//! before it reaches the transport, `intercept_response` with every
//! terminal event before the call's handler sees it.

use super::dispatcher::CallEvent;
use super::events::CorrelationId;
use super::transport::Metadata;
use crate::schema::MethodDescriptor;

/// Hook into every call the bridge makes.
///
/// ```ignore
/// struct Auth(String);
///
/// impl Interceptor for Auth {
///     fn intercept_request(&mut self, _method: &MethodDescriptor, metadata: &mut Metadata) {
///         metadata.push(("authorization".into(), format!("Bearer {}", self.0)));
///     }
/// }
/// ```
pub trait Interceptor {
    /// Inspect or rewrite the metadata of a call about to be sent.
    fn intercept_request(&mut self, _method: &MethodDescriptor, _metadata: &mut Metadata) {}

    /// Observe a call's terminal event.
    fn intercept_response(
        &mut self,
        _id: CorrelationId,
        _method: &MethodDescriptor,
        _event: &CallEvent,
    ) {
    }
}

/// Interceptors composed in registration order.
#[derive(Default)]
pub struct InterceptorChain {
    layers: Vec<Box<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor; it runs after those already registered.
    pub fn push(&mut self, interceptor: Box<dyn Interceptor>) {
        self.layers.push(interceptor);
    }
}

impl Interceptor for InterceptorChain {
    fn intercept_request(&mut self, method: &MethodDescriptor, metadata: &mut Metadata) {
        for layer in &mut self.layers {
            layer.intercept_request(method, metadata);
        }
    }

    fn intercept_response(
        &mut self,
        id: CorrelationId,
        method: &MethodDescriptor,
        event: &CallEvent,
    ) {
        for layer in &mut self.layers {
            layer.intercept_response(id, method, event);
        }
    }
}
