//! Message model shared by producers and consumers.
//!
//! A [`Message`] is the unit of publication and delivery. The same record is
//! used on both sides: publishers fill the topic, payload, and optional
//! scheduling fields; the delivery engine fills the redelivery count and
//! subscription name before handing the message to a listener.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Acknowledgement mode for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AckMode {
    /// Every delivery is acknowledged regardless of the listener outcome.
    /// Failed messages are never redelivered.
    #[default]
    Auto,

    /// Failed deliveries are negatively acknowledged so the broker
    /// redelivers them after a backoff delay.
    Manual,
}

/// A message published to, or delivered from, a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Destination topic. Slashes are normalized to dashes before the
    /// message reaches the broker.
    pub topic: String,

    /// Broker stream the topic is bound to. Defaults to the normalized
    /// topic when unset.
    pub stream: Option<String>,

    /// Opaque message body.
    pub payload: Bytes,

    /// Application headers carried alongside the payload.
    pub headers: HashMap<String, String>,

    /// Absolute delivery time for scheduled messages.
    pub deliver_at: Option<DateTime<Utc>>,

    /// Relative delivery delay for scheduled messages. When both scheduling
    /// fields are set, a `deliver_at` in the future wins.
    pub deliver_after: Option<Duration>,

    /// Number of times the broker has delivered this message before,
    /// assigned on consumption. Zero for fresh messages.
    pub redelivery_count: u64,

    /// Subscription that received this message, assigned on consumption.
    pub subscription: Option<String>,
}

impl Message {
    /// Creates a message for the given topic with an empty header set.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            stream: None,
            payload: payload.into(),
            headers: HashMap::new(),
            deliver_at: None,
            deliver_after: None,
            redelivery_count: 0,
            subscription: None,
        }
    }

    /// Binds the message to an explicit broker stream.
    #[must_use]
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Adds a single application header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Replaces the application headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Schedules the message for delivery at an absolute time.
    #[must_use]
    pub fn with_deliver_at(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_at = Some(at);
        self
    }

    /// Schedules the message for delivery after a relative delay.
    #[must_use]
    pub fn with_deliver_after(mut self, after: Duration) -> Self {
        self.deliver_after = Some(after);
        self
    }
}

/// Normalizes a topic, stream, or subscription name for broker use.
///
/// Broker subject grammars reserve `/`, so path-style names like
/// `public/orders/created` become `public-orders-created`.
pub fn normalize_name(name: &str) -> String {
    name.replace('/', "-")
}
