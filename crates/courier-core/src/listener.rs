//! Listener traits for consuming delivered messages.
//!
//! Subscriptions hand every delivered message to a [`MessageListener`]. The
//! listener's return value drives acknowledgement: `Ok` acknowledges the
//! message, `Err` feeds the retry policy. Panics inside a listener are
//! recovered by the delivery engine and treated like errors.

use std::{fmt, future::Future, pin::Pin};

use async_trait::async_trait;

use crate::{message::Message, trace::TraceId};

/// Context for a single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// Trace ID correlating all logs of this attempt.
    pub trace_id: TraceId,

    /// Name of the subscription that received the message.
    pub subscription: String,
}

impl DeliveryContext {
    /// Creates a context with a fresh trace ID.
    pub fn new(subscription: impl Into<String>) -> Self {
        Self { trace_id: TraceId::new(), subscription: subscription.into() }
    }
}

/// Callback invoked for every delivered message.
///
/// Implementations must be safe to call concurrently: the delivery engine
/// fans deliveries out across a worker pool and shares one listener between
/// all in-flight messages of a subscription.
#[async_trait]
pub trait MessageListener: Send + Sync + fmt::Debug {
    /// Processes one delivered message.
    ///
    /// Returning an error requests redelivery (subject to the subscription's
    /// acknowledgement mode and retry budget). The error is logged with the
    /// attempt's trace ID but never propagated past the delivery engine.
    async fn on_message(&self, ctx: DeliveryContext, message: Message) -> anyhow::Result<()>;
}

type ListenerFn = Box<
    dyn Fn(DeliveryContext, Message) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Adapter turning a plain async closure into a [`MessageListener`].
pub struct FnListener {
    handler: ListenerFn,
}

impl FnListener {
    /// Wraps an async closure as a listener.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(DeliveryContext, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self { handler: Box::new(move |ctx, message| Box::pin(handler(ctx, message))) }
    }
}

impl fmt::Debug for FnListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnListener").finish_non_exhaustive()
    }
}

#[async_trait]
impl MessageListener for FnListener {
    async fn on_message(&self, ctx: DeliveryContext, message: Message) -> anyhow::Result<()> {
        (self.handler)(ctx, message).await
    }
}
