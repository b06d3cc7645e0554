//! Subscription setup and delivery-mode selection.
//!
//! Validates consumer metadata against the requested subscription, then
//! starts the matching delivery mode: ungrouped consumers are served by a
//! small set of replicated pull fetchers, grouped consumers by a single
//! bounded push loop. Setup failures surface before any loop starts.

use std::{num::NonZeroUsize, sync::Arc};

use courier_core::{normalize_name, AckMode, Clock, MessageListener};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::{
    backoff::{BackoffPolicy, MAX_RETRY_TIMES},
    broker::{Broker, BrokerError},
    error::{DeliveryError, Result},
    processor::Processor,
    pull::PullLoop,
    push::PushLoop,
};

/// Configuration for one subscription.
///
/// Numeric fields left at zero take the crate defaults when the
/// subscription starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Topic to consume. Normalized like publish topics.
    pub topic: String,

    /// Durable subscription name registered on the broker.
    pub subscription: String,

    /// Stream the subscription is bound to. Defaults to the normalized
    /// topic when unset.
    pub stream: Option<String>,

    /// Acknowledgement mode driving the retry policy.
    pub ack_mode: AckMode,

    /// Redelivery budget for manual acknowledgement mode. Zero means the
    /// built-in maximum of [`MAX_RETRY_TIMES`].
    pub max_retry_times: u64,

    /// Capacity of the push channel and its worker pool. Zero means
    /// [`DEFAULT_CHANNEL_CAPACITY`](crate::DEFAULT_CHANNEL_CAPACITY).
    pub max_channel_size: usize,

    /// Messages requested per pull fetch. Zero means
    /// [`DEFAULT_PULL_BATCH_SIZE`](crate::DEFAULT_PULL_BATCH_SIZE).
    pub pull_batch_size: usize,

    /// When set, subscription setup failures panic instead of returning an
    /// error. Meant for applications that cannot run without their
    /// subscriptions.
    pub error_panic: bool,
}

impl ConsumerOptions {
    /// Creates options for a topic and subscription with all knobs at
    /// their defaults.
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            stream: None,
            ack_mode: AckMode::default(),
            max_retry_times: 0,
            max_channel_size: 0,
            pull_batch_size: 0,
            error_panic: false,
        }
    }

    /// Binds the subscription to an explicit stream.
    #[must_use]
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Sets the acknowledgement mode.
    #[must_use]
    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Sets the redelivery budget.
    #[must_use]
    pub fn with_max_retry_times(mut self, max_retry_times: u64) -> Self {
        self.max_retry_times = max_retry_times;
        self
    }

    /// Sets the push channel capacity.
    #[must_use]
    pub fn with_max_channel_size(mut self, max_channel_size: usize) -> Self {
        self.max_channel_size = max_channel_size;
        self
    }

    /// Sets the pull fetch batch size.
    #[must_use]
    pub fn with_pull_batch_size(mut self, pull_batch_size: usize) -> Self {
        self.pull_batch_size = pull_batch_size;
        self
    }

    /// Makes setup failures panic.
    #[must_use]
    pub fn with_error_panic(mut self, error_panic: bool) -> Self {
        self.error_panic = error_panic;
        self
    }

    /// Normalizes names and replaces zero knobs with crate defaults.
    pub(crate) fn normalized(&self) -> Self {
        let topic = normalize_name(&self.topic);
        let stream = match self.stream.as_deref() {
            Some(stream) if !stream.is_empty() => normalize_name(stream),
            _ => topic.clone(),
        };
        Self {
            topic,
            subscription: normalize_name(&self.subscription),
            stream: Some(stream),
            ack_mode: self.ack_mode,
            max_retry_times: if self.max_retry_times == 0 {
                MAX_RETRY_TIMES
            } else {
                self.max_retry_times
            },
            max_channel_size: if self.max_channel_size == 0 {
                crate::DEFAULT_CHANNEL_CAPACITY
            } else {
                self.max_channel_size
            },
            pull_batch_size: if self.pull_batch_size == 0 {
                crate::DEFAULT_PULL_BATCH_SIZE
            } else {
                self.pull_batch_size
            },
            error_panic: self.error_panic,
        }
    }
}

/// Starts and runs subscriptions against the broker.
pub(crate) struct Subscriber {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
}

impl Subscriber {
    pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>) -> Self {
        Self { broker, clock }
    }

    /// Validates the consumer and runs its delivery loops until the broker
    /// connection closes.
    pub async fn subscribe(
        &self,
        options: ConsumerOptions,
        listener: Arc<dyn MessageListener>,
    ) -> Result<()> {
        let options = options.normalized();
        let stream = options.stream.as_deref().unwrap_or(&options.topic).to_string();
        info!(
            topic = %options.topic,
            subscription = %options.subscription,
            stream = %stream,
            ack_mode = ?options.ack_mode,
            "starting subscription"
        );

        let consumer = match self.broker.consumer_info(&stream, &options.subscription).await {
            Ok(consumer) => consumer,
            Err(BrokerError::NotFound { .. }) => {
                return Err(escalate(
                    options.error_panic,
                    DeliveryError::consumer_not_found(&stream, &options.subscription),
                ));
            },
            Err(error) => return Err(escalate(options.error_panic, error.into())),
        };

        if consumer.topic_filter.is_empty() || consumer.topic_filter != options.topic {
            return Err(escalate(
                options.error_panic,
                DeliveryError::topic_filter_mismatch(
                    &stream,
                    &options.subscription,
                    &consumer.topic_filter,
                    &options.topic,
                ),
            ));
        }

        let processor = Arc::new(Processor::new(
            self.broker.clone(),
            listener,
            BackoffPolicy::new(options.max_retry_times),
            options.ack_mode,
            options.subscription.clone(),
            self.clock.clone(),
        ));

        match consumer.deliver_group {
            None => self.run_pull(&options, &stream, processor).await,
            Some(group) => self.run_push(&options, &stream, &group, processor).await,
        }
    }

    /// Runs replicated pull fetchers, one inline and the rest spawned.
    async fn run_pull(
        &self,
        options: &ConsumerOptions,
        stream: &str,
        processor: Arc<Processor>,
    ) -> Result<()> {
        let fetcher_count = pull_fetchers();
        info!(
            subscription = %options.subscription,
            fetchers = fetcher_count,
            batch_size = options.pull_batch_size,
            "starting pull subscription"
        );

        let mut spawned = Vec::with_capacity(fetcher_count - 1);
        for _ in 1..fetcher_count {
            let cursor = self.open_cursor(options, stream).await?;
            let pull = self.pull_loop(options, processor.clone());
            spawned.push(tokio::spawn(async move { pull.run(cursor).await }));
        }

        let cursor = self.open_cursor(options, stream).await?;
        self.pull_loop(options, processor).run(cursor).await;

        for fetcher in spawned {
            if let Err(error) = fetcher.await {
                if error.is_panic() {
                    warn!(
                        subscription = %options.subscription,
                        "pull fetcher panicked during shutdown"
                    );
                }
            }
        }
        Ok(())
    }

    /// Runs the bounded push loop for a grouped consumer.
    async fn run_push(
        &self,
        options: &ConsumerOptions,
        stream: &str,
        group: &str,
        processor: Arc<Processor>,
    ) -> Result<()> {
        if group != options.subscription {
            return Err(escalate(
                options.error_panic,
                DeliveryError::deliver_group_mismatch(&options.subscription, group),
            ));
        }

        let receiver = self
            .broker
            .open_push_channel(
                stream,
                &options.topic,
                &options.subscription,
                group,
                options.max_channel_size,
            )
            .await
            .map_err(|error| escalate(options.error_panic, error.into()))?;

        info!(
            subscription = %options.subscription,
            channel_capacity = options.max_channel_size,
            "starting push subscription"
        );
        PushLoop::new(options.subscription.clone(), options.max_channel_size, processor)
            .run(receiver)
            .await;
        Ok(())
    }

    async fn open_cursor(
        &self,
        options: &ConsumerOptions,
        stream: &str,
    ) -> Result<Box<dyn crate::broker::PullCursor>> {
        self.broker
            .open_pull_cursor(stream, &options.topic, &options.subscription)
            .await
            .map_err(|error| escalate(options.error_panic, error.into()))
    }

    fn pull_loop(&self, options: &ConsumerOptions, processor: Arc<Processor>) -> PullLoop {
        PullLoop::new(
            options.subscription.clone(),
            options.pull_batch_size,
            processor,
            self.clock.clone(),
        )
    }
}

/// Number of pull fetchers for one subscription: one per core, capped.
fn pull_fetchers() -> usize {
    let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
    cores.min(crate::MAX_PULL_FETCHERS)
}

/// Logs a setup failure and honors the panic escalation knob.
fn escalate(error_panic: bool, error: DeliveryError) -> DeliveryError {
    error!(error = %error, "subscription setup failed");
    if error_panic {
        panic!("subscription setup failed: {error}");
    }
    error
}

#[cfg(test)]
mod tests {
    use courier_core::{FnListener, TestClock};

    use super::*;
    use crate::broker::mock::MockBroker;

    fn noop_listener() -> Arc<dyn MessageListener> {
        Arc::new(FnListener::new(|_ctx, _message| async { Ok(()) }))
    }

    fn subscriber(broker: Arc<MockBroker>) -> Subscriber {
        Subscriber::new(broker, Arc::new(TestClock::new()))
    }

    #[test]
    fn normalized_fills_defaults_and_normalizes_names() {
        let options = ConsumerOptions::new("public/orders", "billing/workers").normalized();

        assert_eq!(options.topic, "public-orders");
        assert_eq!(options.subscription, "billing-workers");
        assert_eq!(options.stream.as_deref(), Some("public-orders"));
        assert_eq!(options.max_retry_times, MAX_RETRY_TIMES);
        assert_eq!(options.max_channel_size, crate::DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(options.pull_batch_size, crate::DEFAULT_PULL_BATCH_SIZE);
    }

    #[test]
    fn normalized_keeps_explicit_settings() {
        let options = ConsumerOptions::new("orders", "workers")
            .with_stream("commerce/events")
            .with_ack_mode(AckMode::Manual)
            .with_max_retry_times(3)
            .with_max_channel_size(16)
            .with_pull_batch_size(8)
            .with_error_panic(false)
            .normalized();

        assert_eq!(options.stream.as_deref(), Some("commerce-events"));
        assert_eq!(options.ack_mode, AckMode::Manual);
        assert_eq!(options.max_retry_times, 3);
        assert_eq!(options.max_channel_size, 16);
        assert_eq!(options.pull_batch_size, 8);
    }

    #[tokio::test]
    async fn missing_consumer_is_a_setup_error() {
        let broker = Arc::new(MockBroker::new());
        let subscriber = subscriber(broker.clone());

        let error = subscriber
            .subscribe(ConsumerOptions::new("orders", "orders-workers"), noop_listener())
            .await
            .unwrap_err();

        assert!(matches!(error, DeliveryError::ConsumerNotFound { .. }));
        assert!(error.is_setup());
        assert_eq!(broker.pull_cursors_opened(), 0);
        assert_eq!(broker.push_channels_opened(), 0);
    }

    #[tokio::test]
    async fn topic_filter_mismatch_is_a_setup_error() {
        let broker = Arc::new(MockBroker::new());
        broker.register_consumer("orders", "orders-workers", "billing", None).await;
        let subscriber = subscriber(broker.clone());

        let error = subscriber
            .subscribe(ConsumerOptions::new("orders", "orders-workers"), noop_listener())
            .await
            .unwrap_err();

        assert!(matches!(error, DeliveryError::TopicFilterMismatch { .. }));
        assert_eq!(broker.pull_cursors_opened(), 0);
    }

    #[tokio::test]
    async fn empty_topic_filter_is_a_setup_error() {
        let broker = Arc::new(MockBroker::new());
        broker.register_consumer("orders", "orders-workers", "", None).await;
        let subscriber = subscriber(broker.clone());

        let error = subscriber
            .subscribe(ConsumerOptions::new("orders", "orders-workers"), noop_listener())
            .await
            .unwrap_err();

        assert!(matches!(error, DeliveryError::TopicFilterMismatch { .. }));
    }

    #[tokio::test]
    async fn deliver_group_mismatch_is_rejected_before_the_channel_opens() {
        let broker = Arc::new(MockBroker::new());
        broker.register_consumer("orders", "orders-workers", "orders", Some("other-group")).await;
        let subscriber = subscriber(broker.clone());

        let error = subscriber
            .subscribe(ConsumerOptions::new("orders", "orders-workers"), noop_listener())
            .await
            .unwrap_err();

        assert!(matches!(error, DeliveryError::DeliverGroupMismatch { .. }));
        assert_eq!(broker.push_channels_opened(), 0);
    }
}
