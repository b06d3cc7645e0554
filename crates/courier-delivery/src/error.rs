//! Error types for publish and subscription operations.
//!
//! Separates setup failures (bad subscription configuration, missing
//! consumers, producer creation) from broker transport failures. Setup
//! errors surface to the caller before any delivery loop starts; transport
//! errors during consumption are logged and retried inside the loops.

use thiserror::Error;

use crate::broker::BrokerError;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised by publish and subscribe operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Publish was attempted without a destination topic.
    #[error("topic must not be empty")]
    EmptyTopic,

    /// The broker has no consumer registered under the subscription name.
    #[error("consumer not found: stream {stream}, subscription {subscription}")]
    ConsumerNotFound {
        /// Stream that was queried
        stream: String,
        /// Subscription name that was queried
        subscription: String,
    },

    /// The registered consumer filters a different topic than the one
    /// being subscribed.
    #[error(
        "topic filter not matched: stream {stream}, filter {filter}, \
         topic {topic}, subscription {subscription}"
    )]
    TopicFilterMismatch {
        /// Stream holding the consumer
        stream: String,
        /// Subscription whose filter was inspected
        subscription: String,
        /// Filter configured on the consumer
        filter: String,
        /// Topic requested by the subscription
        topic: String,
    },

    /// The consumer's delivery group does not match the subscription name.
    #[error("deliver group {group} does not match subscription {subscription}")]
    DeliverGroupMismatch {
        /// Subscription name requested
        subscription: String,
        /// Delivery group configured on the consumer
        group: String,
    },

    /// Producer creation failed for a topic.
    #[error("failed to create producer for topic {topic}")]
    ProducerCreate {
        /// Topic the producer was requested for
        topic: String,
        /// Underlying broker failure
        #[source]
        source: BrokerError,
    },

    /// A schedule timestamp could not be represented.
    #[error("schedule timestamp out of range")]
    ScheduleOutOfRange,

    /// Broker transport failure.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl DeliveryError {
    /// Creates a consumer-not-found error.
    pub fn consumer_not_found(stream: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self::ConsumerNotFound { stream: stream.into(), subscription: subscription.into() }
    }

    /// Creates a topic-filter mismatch error.
    pub fn topic_filter_mismatch(
        stream: impl Into<String>,
        subscription: impl Into<String>,
        filter: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self::TopicFilterMismatch {
            stream: stream.into(),
            subscription: subscription.into(),
            filter: filter.into(),
            topic: topic.into(),
        }
    }

    /// Creates a deliver-group mismatch error.
    pub fn deliver_group_mismatch(
        subscription: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self::DeliverGroupMismatch { subscription: subscription.into(), group: group.into() }
    }

    /// Creates a producer creation error.
    pub fn producer_create(topic: impl Into<String>, source: BrokerError) -> Self {
        Self::ProducerCreate { topic: topic.into(), source }
    }

    /// Whether this error was raised while setting up a publish or
    /// subscription rather than by broker transport.
    ///
    /// Setup errors indicate misconfiguration and are not retried.
    pub fn is_setup(&self) -> bool {
        match self {
            Self::EmptyTopic
            | Self::ConsumerNotFound { .. }
            | Self::TopicFilterMismatch { .. }
            | Self::DeliverGroupMismatch { .. }
            | Self::ProducerCreate { .. }
            | Self::ScheduleOutOfRange => true,
            Self::Broker(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_errors_classified_correctly() {
        assert!(DeliveryError::EmptyTopic.is_setup());
        assert!(DeliveryError::consumer_not_found("orders", "orders-sub").is_setup());
        assert!(DeliveryError::topic_filter_mismatch("orders", "sub", "other", "orders")
            .is_setup());
        assert!(DeliveryError::deliver_group_mismatch("sub", "group").is_setup());
        assert!(DeliveryError::producer_create("orders", BrokerError::ConnectionClosed)
            .is_setup());
        assert!(DeliveryError::ScheduleOutOfRange.is_setup());

        assert!(!DeliveryError::Broker(BrokerError::ConnectionClosed).is_setup());
    }

    #[test]
    fn error_display_format() {
        let error = DeliveryError::consumer_not_found("orders", "orders-sub");
        assert_eq!(error.to_string(), "consumer not found: stream orders, subscription orders-sub");

        let error = DeliveryError::deliver_group_mismatch("orders-sub", "other-group");
        assert_eq!(error.to_string(), "deliver group other-group does not match subscription orders-sub");
    }

    #[test]
    fn broker_errors_pass_through_display() {
        let error = DeliveryError::from(BrokerError::ConnectionClosed);
        assert_eq!(error.to_string(), "broker connection closed");
    }
}
