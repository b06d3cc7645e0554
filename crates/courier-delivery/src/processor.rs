//! Per-message delivery pipeline.
//!
//! Turns a broker delivery into a listener invocation and settles the
//! outcome: acknowledge on success, negatively acknowledge with a backoff
//! delay while the retry budget lasts, and drop by acknowledging once it is
//! exhausted. Listener panics are recovered and settled like listener
//! errors so one poisoned message cannot take a delivery loop down.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use courier_core::{AckMode, Clock, DeliveryContext, Message, MessageListener, TraceId};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{BackoffDecision, BackoffPolicy},
    broker::{Broker, RawMessage},
};

/// Processes deliveries for one subscription.
///
/// Shared by every fetcher and worker of the subscription; all state is
/// immutable after construction.
pub(crate) struct Processor {
    broker: Arc<dyn Broker>,
    listener: Arc<dyn MessageListener>,
    policy: BackoffPolicy,
    ack_mode: AckMode,
    subscription: String,
    clock: Arc<dyn Clock>,
}

impl Processor {
    pub fn new(
        broker: Arc<dyn Broker>,
        listener: Arc<dyn MessageListener>,
        policy: BackoffPolicy,
        ack_mode: AckMode,
        subscription: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { broker, listener, policy, ack_mode, subscription, clock }
    }

    /// Runs one delivery attempt end to end.
    ///
    /// Never returns an error: every outcome, including broker failures
    /// while settling, is logged under the attempt's trace ID and absorbed
    /// here so callers can keep their loops running.
    pub async fn process(&self, raw: RawMessage) {
        let ctx = DeliveryContext::new(&self.subscription);
        let trace_id = ctx.trace_id;

        if let Some(published_at) = raw.published_at {
            let latency_ms = (self.clock.now() - published_at).num_milliseconds();
            debug!(
                trace_id = %trace_id,
                subject = %raw.subject,
                redelivery_count = raw.redelivery_count,
                latency_ms,
                "received message"
            );
        } else {
            debug!(
                trace_id = %trace_id,
                subject = %raw.subject,
                redelivery_count = raw.redelivery_count,
                "received message"
            );
        }

        let message = self.delivered_message(&raw);
        let outcome =
            AssertUnwindSafe(self.listener.on_message(ctx, message)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => self.settle_success(trace_id, &raw).await,
            Ok(Err(error)) => {
                warn!(
                    trace_id = %trace_id,
                    subject = %raw.subject,
                    error = %error,
                    "listener returned error"
                );
                self.settle_failure(trace_id, &raw).await;
            },
            Err(panic) => {
                error!(
                    trace_id = %trace_id,
                    subject = %raw.subject,
                    panic = %panic_message(panic),
                    "listener panicked"
                );
                self.settle_failure(trace_id, &raw).await;
            },
        }
    }

    /// Maps a broker delivery onto the domain message handed to listeners.
    fn delivered_message(&self, raw: &RawMessage) -> Message {
        Message {
            topic: raw.subject.clone(),
            stream: None,
            payload: raw.payload.clone(),
            headers: raw.headers.clone(),
            deliver_at: None,
            deliver_after: None,
            redelivery_count: raw.redelivery_count,
            subscription: Some(self.subscription.clone()),
        }
    }

    async fn settle_success(&self, trace_id: TraceId, raw: &RawMessage) {
        if let Err(error) = self.broker.ack(raw).await {
            error!(
                trace_id = %trace_id,
                subject = %raw.subject,
                error = %error,
                "failed to acknowledge processed message"
            );
            return;
        }
        info!(trace_id = %trace_id, subject = %raw.subject, "message processed");
    }

    async fn settle_failure(&self, trace_id: TraceId, raw: &RawMessage) {
        match self.policy.decide(self.ack_mode, raw.redelivery_count) {
            BackoffDecision::Retry { delay } => {
                if let Err(error) = self.broker.nack(raw, delay).await {
                    error!(
                        trace_id = %trace_id,
                        subject = %raw.subject,
                        error = %error,
                        "failed to request redelivery"
                    );
                    return;
                }
                warn!(
                    trace_id = %trace_id,
                    subject = %raw.subject,
                    redelivery_count = raw.redelivery_count,
                    retry_delay_s = delay.as_secs(),
                    "delivery failed, retry scheduled"
                );
            },
            BackoffDecision::GiveUp { reason } => {
                if let Err(error) = self.broker.ack(raw).await {
                    error!(
                        trace_id = %trace_id,
                        subject = %raw.subject,
                        error = %error,
                        "failed to drop message"
                    );
                    return;
                }
                error!(
                    trace_id = %trace_id,
                    subject = %raw.subject,
                    redelivery_count = raw.redelivery_count,
                    reason = %reason,
                    "delivery permanently failed, message dropped"
                );
            },
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use courier_core::{AckMode, FnListener, TestClock};

    use super::*;
    use crate::broker::{mock::MockBroker, BrokerError};

    fn processor(
        broker: Arc<MockBroker>,
        listener: Arc<dyn MessageListener>,
        ack_mode: AckMode,
        max_retry_times: u64,
    ) -> Processor {
        Processor::new(
            broker,
            listener,
            BackoffPolicy::new(max_retry_times),
            ack_mode,
            "orders-workers".to_string(),
            Arc::new(TestClock::new()),
        )
    }

    fn ok_listener() -> Arc<dyn MessageListener> {
        Arc::new(FnListener::new(|_ctx, _message| async { Ok(()) }))
    }

    fn failing_listener() -> Arc<dyn MessageListener> {
        Arc::new(FnListener::new(|_ctx, _message| async {
            anyhow::bail!("handler rejected payload")
        }))
    }

    fn panicking_listener() -> Arc<dyn MessageListener> {
        Arc::new(FnListener::new(|_ctx, _message| async { panic!("listener exploded") }))
    }

    #[tokio::test]
    async fn success_acknowledges_the_message() {
        let broker = Arc::new(MockBroker::new());
        let processor = processor(broker.clone(), ok_listener(), AckMode::Manual, 50);

        processor.process(RawMessage::new("orders", b"p".as_slice())).await;

        assert_eq!(broker.acked().await.len(), 1);
        assert!(broker.nacked().await.is_empty());
    }

    #[tokio::test]
    async fn listener_sees_delivery_metadata() {
        let broker = Arc::new(MockBroker::new());
        let seen: Arc<Mutex<Vec<(String, Option<String>, u64)>>> = Arc::default();
        let sink = seen.clone();
        let listener = Arc::new(FnListener::new(move |ctx: DeliveryContext, message: Message| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((
                    ctx.subscription,
                    message.subscription.clone(),
                    message.redelivery_count,
                ));
                Ok(())
            }
        }));
        let processor = processor(broker, listener, AckMode::Manual, 50);

        processor
            .process(RawMessage::new("orders", b"p".as_slice()).with_redelivery_count(4))
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[("orders-workers".to_string(), Some("orders-workers".to_string()), 4)]
        );
    }

    #[tokio::test]
    async fn manual_mode_failure_schedules_retry_with_backoff() {
        let broker = Arc::new(MockBroker::new());
        let processor = processor(broker.clone(), failing_listener(), AckMode::Manual, 50);

        processor.process(RawMessage::new("orders", b"p".as_slice())).await;
        processor
            .process(RawMessage::new("orders", b"p".as_slice()).with_redelivery_count(2))
            .await;

        let nacked = broker.nacked().await;
        assert_eq!(nacked.len(), 2);
        assert_eq!(nacked[0].1, Duration::from_secs(1));
        assert_eq!(nacked[1].1, Duration::from_secs(3));
        assert!(broker.acked().await.is_empty());
    }

    #[tokio::test]
    async fn auto_mode_failure_acknowledges_without_retry() {
        let broker = Arc::new(MockBroker::new());
        let processor = processor(broker.clone(), failing_listener(), AckMode::Auto, 50);

        processor.process(RawMessage::new("orders", b"p".as_slice())).await;

        assert_eq!(broker.acked().await.len(), 1);
        assert!(broker.nacked().await.is_empty());
    }

    #[tokio::test]
    async fn exhausted_retry_budget_drops_by_acknowledging() {
        let broker = Arc::new(MockBroker::new());
        let processor = processor(broker.clone(), failing_listener(), AckMode::Manual, 3);

        // Last attempt inside the budget still retries
        processor
            .process(RawMessage::new("orders", b"p".as_slice()).with_redelivery_count(2))
            .await;
        assert_eq!(broker.nacked().await.len(), 1);

        // At the ceiling the message is dropped
        processor
            .process(RawMessage::new("orders", b"p".as_slice()).with_redelivery_count(3))
            .await;
        assert_eq!(broker.acked().await.len(), 1);
        assert_eq!(broker.nacked().await.len(), 1);
    }

    #[tokio::test]
    async fn panic_is_settled_like_a_listener_error() {
        let broker = Arc::new(MockBroker::new());
        let processor = processor(broker.clone(), panicking_listener(), AckMode::Manual, 50);

        processor.process(RawMessage::new("orders", b"p".as_slice())).await;

        let nacked = broker.nacked().await;
        assert_eq!(nacked.len(), 1);
        assert_eq!(nacked[0].1, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn each_attempt_gets_a_fresh_trace_id() {
        let broker = Arc::new(MockBroker::new());
        let seen: Arc<Mutex<Vec<TraceId>>> = Arc::default();
        let sink = seen.clone();
        let listener = Arc::new(FnListener::new(move |ctx: DeliveryContext, _message| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(ctx.trace_id);
                Ok(())
            }
        }));
        let processor = processor(broker, listener, AckMode::Manual, 50);

        processor.process(RawMessage::new("orders", b"p".as_slice())).await;
        processor.process(RawMessage::new("orders", b"p".as_slice())).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0], seen[1]);
    }

    #[tokio::test]
    async fn acknowledgement_failures_are_contained() {
        let broker = Arc::new(MockBroker::new());
        broker.inject_ack_error(BrokerError::transport("ack timeout")).await;
        let processor = processor(broker.clone(), ok_listener(), AckMode::Manual, 50);

        processor.process(RawMessage::new("orders", b"p".as_slice())).await;
        assert!(broker.acked().await.is_empty());

        // The injected failure is one-shot; the next attempt settles fine
        processor.process(RawMessage::new("orders", b"p".as_slice())).await;
        assert_eq!(broker.acked().await.len(), 1);
    }

    #[tokio::test]
    async fn redelivery_request_failures_are_contained() {
        let broker = Arc::new(MockBroker::new());
        broker.inject_nack_error(BrokerError::transport("nack timeout")).await;
        let processor = processor(broker.clone(), failing_listener(), AckMode::Manual, 50);

        processor.process(RawMessage::new("orders", b"p".as_slice())).await;

        assert!(broker.nacked().await.is_empty());
        assert!(broker.acked().await.is_empty());
    }
}
