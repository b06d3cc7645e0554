//! Broker abstraction layer for the delivery engine.
//!
//! Provides trait-based abstractions over the external message broker to
//! enable testability without a running broker. Production implementations
//! adapt a concrete broker client (stream publish, consumer metadata, pull
//! cursors, push channels, ack/nack) while tests use the in-memory
//! [`mock::MockBroker`] for deterministic behavior validation.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised at the broker transport boundary.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// A stream, consumer, or subject does not exist on the broker.
    #[error("not found: {name}")]
    NotFound {
        /// Name of the missing broker object
        name: String,
    },

    /// The connection to the broker is closed or draining.
    ///
    /// This is the signal that unblocks fetch and receive calls when the
    /// client shuts down; delivery loops exit cleanly when they see it.
    #[error("broker connection closed")]
    ConnectionClosed,

    /// A publish was rejected or lost.
    #[error("publish failed on {subject}: {message}")]
    PublishFailed {
        /// Subject the publish targeted
        subject: String,
        /// Broker-reported failure
        message: String,
    },

    /// Any other transport-level failure.
    #[error("broker transport error: {message}")]
    Transport {
        /// Description of the failure
        message: String,
    },
}

impl BrokerError {
    /// Creates a not-found error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Creates a publish failure.
    pub fn publish_failed(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PublishFailed { subject: subject.into(), message: message.into() }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Whether this error means the connection is gone and loops should
    /// stop rather than retry.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

/// Opaque per-delivery correlation token assigned by the broker adapter.
///
/// Adapters use the token to route acknowledgements back to the underlying
/// broker delivery (reply subject, message ID, or similar).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryToken(pub u64);

/// A message as delivered by the broker, before the engine turns it into a
/// domain [`Message`](courier_core::Message).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Subject the message was published on.
    pub subject: String,
    /// Message body.
    pub payload: Bytes,
    /// Headers carried with the message.
    pub headers: HashMap<String, String>,
    /// Number of earlier deliveries of this message.
    pub redelivery_count: u64,
    /// Broker-recorded publish time, when available.
    pub published_at: Option<DateTime<Utc>>,
    /// Correlation token for ack and nack.
    pub token: DeliveryToken,
}

impl RawMessage {
    /// Creates a raw message with no headers and no delivery history.
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            redelivery_count: 0,
            published_at: None,
            token: DeliveryToken(0),
        }
    }

    /// Sets the redelivery count.
    #[must_use]
    pub fn with_redelivery_count(mut self, count: u64) -> Self {
        self.redelivery_count = count;
        self
    }

    /// Sets the broker publish timestamp.
    #[must_use]
    pub fn with_published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Consumer metadata as registered on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    /// Subject filter the consumer is bound to.
    pub topic_filter: String,
    /// Delivery group for push consumers. Pull consumers have none.
    pub deliver_group: Option<String>,
}

/// An outgoing publication assembled by the publisher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Subject to publish on. For wrapped scheduled messages this is the
    /// schedule subject, not the original topic.
    pub subject: String,
    /// Stream expected to own the subject.
    pub stream: String,
    /// Message body.
    pub payload: Bytes,
    /// Headers, including schedule headers for wrapped messages.
    pub headers: HashMap<String, String>,
    /// Native delivery time, populated only for brokers that support
    /// delayed delivery directly.
    pub deliver_at: Option<DateTime<Utc>>,
}

/// Broker confirmation of a synchronous publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Stream that stored the message.
    pub stream: String,
    /// Sequence assigned by the broker.
    pub sequence: u64,
}

/// Publish handle bound to one topic.
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    /// Publishes and waits for the broker confirmation.
    async fn send(&self, envelope: Envelope) -> Result<Receipt, BrokerError>;

    /// Publishes without waiting for confirmation.
    ///
    /// Errors are returned only for failures detected before handoff;
    /// asynchronous completion failures are logged by the adapter.
    async fn send_async(&self, envelope: Envelope) -> Result<(), BrokerError>;
}

/// Cursor over a pull consumer's pending messages.
#[async_trait]
pub trait PullCursor: Send + Sync {
    /// Fetches up to `max_messages` pending messages.
    ///
    /// Long-polls the broker; an empty batch is normal and simply means no
    /// message arrived within the poll window. Returns
    /// [`BrokerError::ConnectionClosed`] once the connection is draining.
    async fn fetch(&mut self, max_messages: usize) -> Result<Vec<RawMessage>, BrokerError>;
}

/// Operations the delivery engine needs from a message broker.
///
/// This trait abstracts the external broker: publication, consumer metadata
/// lookup, pull and push consumption, and per-message acknowledgement.
/// Stream and consumer provisioning is deliberately absent; consumers are
/// expected to exist before a subscription starts.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Creates a publish handle for a topic.
    async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, BrokerError>;

    /// Looks up consumer metadata registered under a subscription name.
    async fn consumer_info(
        &self,
        stream: &str,
        subscription: &str,
    ) -> Result<ConsumerInfo, BrokerError>;

    /// Opens a pull cursor bound to a stream, topic, and subscription.
    async fn open_pull_cursor(
        &self,
        stream: &str,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn PullCursor>, BrokerError>;

    /// Opens a bounded push channel for a grouped consumer.
    ///
    /// The broker stops feeding the channel while it is full; the capacity
    /// is the subscription's configured channel size. The channel closes
    /// when the connection drains.
    async fn open_push_channel(
        &self,
        stream: &str,
        topic: &str,
        subscription: &str,
        deliver_group: &str,
        capacity: usize,
    ) -> Result<mpsc::Receiver<RawMessage>, BrokerError>;

    /// Acknowledges a delivery as processed.
    async fn ack(&self, message: &RawMessage) -> Result<(), BrokerError>;

    /// Negatively acknowledges a delivery, requesting redelivery after the
    /// given delay.
    async fn nack(&self, message: &RawMessage, delay: Duration) -> Result<(), BrokerError>;

    /// Whether the broker can delay delivery natively. When false, the
    /// publisher wraps scheduled messages in schedule envelopes instead.
    fn supports_native_delay(&self) -> bool {
        false
    }

    /// Drains the connection. Pending fetches and push channels unblock
    /// with [`BrokerError::ConnectionClosed`] or close, letting delivery
    /// loops wind down.
    async fn close(&self) -> Result<(), BrokerError>;
}

pub mod mock {
    //! Mock broker implementation for testing.
    //!
    //! Provides a deterministic, in-memory broker for testing publish and
    //! delivery logic without a broker process. Supports scripting consumer
    //! metadata, enqueuing deliveries, injecting failures, and verifying
    //! every publish, ack, and nack the engine performed.

    use std::{
        collections::{HashMap, VecDeque},
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};

    use super::{
        Broker, BrokerError, ConsumerInfo, DeliveryToken, Envelope, Producer, PullCursor,
        RawMessage, Receipt,
    };

    /// How long a mock fetch waits for a message before returning an empty
    /// batch, standing in for the broker's long-poll window.
    const FETCH_WAIT: Duration = Duration::from_millis(25);

    /// How long mock helpers wait for a push channel to be opened.
    const PUSH_CHANNEL_WAIT: Duration = Duration::from_secs(2);

    struct PullQueue {
        messages: Mutex<VecDeque<RawMessage>>,
        notify: Notify,
    }

    impl PullQueue {
        fn new() -> Self {
            Self { messages: Mutex::new(VecDeque::new()), notify: Notify::new() }
        }
    }

    /// Mock broker for testing delivery logic without a broker process.
    ///
    /// Keeps all state in-memory with configurable behavior. Messages reach
    /// subscriptions through [`enqueue_pull`](MockBroker::enqueue_pull) and
    /// [`push`](MockBroker::push) rather than through routing; published
    /// envelopes are recorded for verification instead.
    pub struct MockBroker {
        consumers: RwLock<HashMap<(String, String), ConsumerInfo>>,
        pull_queues: RwLock<HashMap<String, Arc<PullQueue>>>,
        push_senders: RwLock<HashMap<String, mpsc::Sender<RawMessage>>>,
        published: Arc<RwLock<Vec<Envelope>>>,
        acked: RwLock<Vec<RawMessage>>,
        nacked: RwLock<Vec<(RawMessage, Duration)>>,
        token_routes: RwLock<HashMap<DeliveryToken, String>>,
        producer_errors: RwLock<HashMap<String, BrokerError>>,
        publish_error: Arc<RwLock<Option<BrokerError>>>,
        cursor_errors: RwLock<HashMap<String, BrokerError>>,
        fetch_errors: Arc<RwLock<HashMap<String, BrokerError>>>,
        ack_error: RwLock<Option<BrokerError>>,
        nack_error: RwLock<Option<BrokerError>>,
        producer_delay: RwLock<Option<Duration>>,
        producers_created: AtomicUsize,
        pull_cursors_opened: AtomicUsize,
        push_channels_opened: AtomicUsize,
        native_delay: AtomicBool,
        auto_redeliver: AtomicBool,
        next_token: AtomicU64,
        next_sequence: Arc<AtomicU64>,
        closed: watch::Sender<bool>,
    }

    impl MockBroker {
        /// Creates a new mock broker with empty state.
        pub fn new() -> Self {
            let (closed, _) = watch::channel(false);
            Self {
                consumers: RwLock::new(HashMap::new()),
                pull_queues: RwLock::new(HashMap::new()),
                push_senders: RwLock::new(HashMap::new()),
                published: Arc::new(RwLock::new(Vec::new())),
                acked: RwLock::new(Vec::new()),
                nacked: RwLock::new(Vec::new()),
                token_routes: RwLock::new(HashMap::new()),
                producer_errors: RwLock::new(HashMap::new()),
                publish_error: Arc::new(RwLock::new(None)),
                cursor_errors: RwLock::new(HashMap::new()),
                fetch_errors: Arc::new(RwLock::new(HashMap::new())),
                ack_error: RwLock::new(None),
                nack_error: RwLock::new(None),
                producer_delay: RwLock::new(None),
                producers_created: AtomicUsize::new(0),
                pull_cursors_opened: AtomicUsize::new(0),
                push_channels_opened: AtomicUsize::new(0),
                native_delay: AtomicBool::new(false),
                auto_redeliver: AtomicBool::new(false),
                next_token: AtomicU64::new(1),
                next_sequence: Arc::new(AtomicU64::new(1)),
                closed,
            }
        }

        /// Registers consumer metadata for a stream and subscription.
        ///
        /// A `deliver_group` of `None` scripts a pull consumer, `Some`
        /// scripts a push consumer.
        pub async fn register_consumer(
            &self,
            stream: &str,
            subscription: &str,
            topic_filter: &str,
            deliver_group: Option<&str>,
        ) {
            let info = ConsumerInfo {
                topic_filter: topic_filter.to_string(),
                deliver_group: deliver_group.map(str::to_string),
            };
            self.consumers
                .write()
                .await
                .insert((stream.to_string(), subscription.to_string()), info);
        }

        /// Enqueues a message for a pull subscription and returns the token
        /// assigned to the delivery.
        pub async fn enqueue_pull(&self, subscription: &str, mut message: RawMessage) -> DeliveryToken {
            let token = self.assign_token();
            message.token = token;
            self.token_routes.write().await.insert(token, subscription.to_string());
            let queue = self.pull_queue(subscription).await;
            queue.messages.lock().await.push_back(message);
            queue.notify.notify_one();
            token
        }

        /// Delivers a message into a push subscription's channel.
        ///
        /// Waits briefly for the channel to be opened, so tests can push
        /// right after spawning a subscription.
        pub async fn push(
            &self,
            subscription: &str,
            mut message: RawMessage,
        ) -> Result<DeliveryToken, BrokerError> {
            let token = self.assign_token();
            message.token = token;
            let deadline = tokio::time::Instant::now() + PUSH_CHANNEL_WAIT;
            loop {
                let sender = self.push_senders.read().await.get(subscription).cloned();
                if let Some(sender) = sender {
                    return match sender.send(message).await {
                        Ok(()) => Ok(token),
                        Err(_) => Err(BrokerError::ConnectionClosed),
                    };
                }
                if tokio::time::Instant::now() >= deadline {
                    return Err(BrokerError::transport(format!(
                        "no push channel open for {subscription}"
                    )));
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }

        /// Makes nacked pull messages re-enqueue themselves immediately
        /// with an incremented redelivery count.
        pub fn set_auto_redeliver(&self, enabled: bool) {
            self.auto_redeliver.store(enabled, Ordering::SeqCst);
        }

        /// Reports native delayed-delivery support from now on.
        pub fn set_native_delay(&self, enabled: bool) {
            self.native_delay.store(enabled, Ordering::SeqCst);
        }

        /// Slows producer creation down to widen race windows in tests.
        pub async fn set_producer_delay(&self, delay: Duration) {
            *self.producer_delay.write().await = Some(delay);
        }

        /// Injects an error for the next producer creation on a topic.
        pub async fn inject_producer_error(&self, topic: &str, error: BrokerError) {
            self.producer_errors.write().await.insert(topic.to_string(), error);
        }

        /// Injects an error for the next publish on any producer.
        pub async fn inject_publish_error(&self, error: BrokerError) {
            *self.publish_error.write().await = Some(error);
        }

        /// Injects an error for the next cursor open on a subscription.
        pub async fn inject_cursor_error(&self, subscription: &str, error: BrokerError) {
            self.cursor_errors.write().await.insert(subscription.to_string(), error);
        }

        /// Injects an error for the next fetch on a subscription.
        pub async fn inject_fetch_error(&self, subscription: &str, error: BrokerError) {
            self.fetch_errors.write().await.insert(subscription.to_string(), error);
        }

        /// Injects an error for the next ack.
        pub async fn inject_ack_error(&self, error: BrokerError) {
            *self.ack_error.write().await = Some(error);
        }

        /// Injects an error for the next nack.
        pub async fn inject_nack_error(&self, error: BrokerError) {
            *self.nack_error.write().await = Some(error);
        }

        /// Returns all envelopes published through any producer.
        pub async fn published(&self) -> Vec<Envelope> {
            self.published.read().await.clone()
        }

        /// Returns all acknowledged deliveries in order.
        pub async fn acked(&self) -> Vec<RawMessage> {
            self.acked.read().await.clone()
        }

        /// Returns all negatively acknowledged deliveries with their delays.
        pub async fn nacked(&self) -> Vec<(RawMessage, Duration)> {
            self.nacked.read().await.clone()
        }

        /// Number of producers created so far.
        pub fn producer_count(&self) -> usize {
            self.producers_created.load(Ordering::SeqCst)
        }

        /// Number of pull cursors opened so far.
        pub fn pull_cursors_opened(&self) -> usize {
            self.pull_cursors_opened.load(Ordering::SeqCst)
        }

        /// Number of push channels opened so far.
        pub fn push_channels_opened(&self) -> usize {
            self.push_channels_opened.load(Ordering::SeqCst)
        }

        fn assign_token(&self) -> DeliveryToken {
            DeliveryToken(self.next_token.fetch_add(1, Ordering::SeqCst))
        }

        async fn pull_queue(&self, subscription: &str) -> Arc<PullQueue> {
            if let Some(queue) = self.pull_queues.read().await.get(subscription) {
                return queue.clone();
            }
            let mut queues = self.pull_queues.write().await;
            queues.entry(subscription.to_string()).or_insert_with(|| Arc::new(PullQueue::new())).clone()
        }
    }

    impl Default for MockBroker {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl Broker for MockBroker {
        async fn create_producer(&self, topic: &str) -> Result<Arc<dyn Producer>, BrokerError> {
            let delay = *self.producer_delay.read().await;
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(error) = self.producer_errors.write().await.remove(topic) {
                return Err(error);
            }
            self.producers_created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockProducer {
                published: self.published.clone(),
                publish_error: self.publish_error.clone(),
                next_sequence: self.next_sequence.clone(),
            }))
        }

        async fn consumer_info(
            &self,
            stream: &str,
            subscription: &str,
        ) -> Result<ConsumerInfo, BrokerError> {
            self.consumers
                .read()
                .await
                .get(&(stream.to_string(), subscription.to_string()))
                .cloned()
                .ok_or_else(|| BrokerError::not_found(format!("{stream}/{subscription}")))
        }

        async fn open_pull_cursor(
            &self,
            _stream: &str,
            _topic: &str,
            subscription: &str,
        ) -> Result<Box<dyn PullCursor>, BrokerError> {
            if let Some(error) = self.cursor_errors.write().await.remove(subscription) {
                return Err(error);
            }
            let queue = self.pull_queue(subscription).await;
            self.pull_cursors_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockPullCursor {
                subscription: subscription.to_string(),
                queue,
                fetch_errors: self.fetch_errors.clone(),
                closed: self.closed.subscribe(),
            }))
        }

        async fn open_push_channel(
            &self,
            _stream: &str,
            _topic: &str,
            subscription: &str,
            _deliver_group: &str,
            capacity: usize,
        ) -> Result<mpsc::Receiver<RawMessage>, BrokerError> {
            if *self.closed.borrow() {
                return Err(BrokerError::ConnectionClosed);
            }
            let (sender, receiver) = mpsc::channel(capacity.max(1));
            self.push_senders.write().await.insert(subscription.to_string(), sender);
            self.push_channels_opened.fetch_add(1, Ordering::SeqCst);
            Ok(receiver)
        }

        async fn ack(&self, message: &RawMessage) -> Result<(), BrokerError> {
            if let Some(error) = self.ack_error.write().await.take() {
                return Err(error);
            }
            self.acked.write().await.push(message.clone());
            Ok(())
        }

        async fn nack(&self, message: &RawMessage, delay: Duration) -> Result<(), BrokerError> {
            if let Some(error) = self.nack_error.write().await.take() {
                return Err(error);
            }
            self.nacked.write().await.push((message.clone(), delay));
            if self.auto_redeliver.load(Ordering::SeqCst) {
                let route = self.token_routes.read().await.get(&message.token).cloned();
                if let Some(subscription) = route {
                    let redelivery =
                        message.clone().with_redelivery_count(message.redelivery_count + 1);
                    self.enqueue_pull(&subscription, redelivery).await;
                }
            }
            Ok(())
        }

        fn supports_native_delay(&self) -> bool {
            self.native_delay.load(Ordering::SeqCst)
        }

        async fn close(&self) -> Result<(), BrokerError> {
            let _ = self.closed.send(true);
            // Dropping the senders closes every push channel
            self.push_senders.write().await.clear();
            Ok(())
        }
    }

    struct MockProducer {
        published: Arc<RwLock<Vec<Envelope>>>,
        publish_error: Arc<RwLock<Option<BrokerError>>>,
        next_sequence: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Producer for MockProducer {
        async fn send(&self, envelope: Envelope) -> Result<Receipt, BrokerError> {
            if let Some(error) = self.publish_error.write().await.take() {
                return Err(error);
            }
            let receipt = Receipt {
                stream: envelope.stream.clone(),
                sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            };
            self.published.write().await.push(envelope);
            Ok(receipt)
        }

        async fn send_async(&self, envelope: Envelope) -> Result<(), BrokerError> {
            self.send(envelope).await.map(|_| ())
        }
    }

    struct MockPullCursor {
        subscription: String,
        queue: Arc<PullQueue>,
        fetch_errors: Arc<RwLock<HashMap<String, BrokerError>>>,
        closed: watch::Receiver<bool>,
    }

    #[async_trait]
    impl PullCursor for MockPullCursor {
        async fn fetch(&mut self, max_messages: usize) -> Result<Vec<RawMessage>, BrokerError> {
            if let Some(error) = self.fetch_errors.write().await.remove(&self.subscription) {
                return Err(error);
            }
            loop {
                if *self.closed.borrow() {
                    return Err(BrokerError::ConnectionClosed);
                }
                {
                    let mut messages = self.queue.messages.lock().await;
                    if !messages.is_empty() {
                        let take = max_messages.min(messages.len());
                        return Ok(messages.drain(..take).collect());
                    }
                }
                let notified = self.queue.notify.notified();
                tokio::select! {
                    _ = notified => {},
                    _ = self.closed.changed() => {},
                    _ = tokio::time::sleep(FETCH_WAIT) => return Ok(Vec::new()),
                }
            }
        }
    }

}
