//! Message publication with scheduled-delivery support.
//!
//! Assembles outgoing envelopes: normalizes names, resolves the stream
//! binding, and wraps scheduled messages for brokers without native delayed
//! delivery. A wrapped message is diverted to a per-message schedule subject
//! and carries its real destination and due time in headers; a broker-side
//! scheduling agent republishes it to the target subject when the time
//! comes.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use courier_core::{normalize_name, Clock, Message};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    broker::{Broker, Envelope, Receipt},
    error::{DeliveryError, Result},
    producers::ProducerCache,
};

/// Header naming the absolute due time of a wrapped scheduled message.
pub const SCHEDULE_HEADER: &str = "Courier-Schedule";

/// Header naming the subject a wrapped scheduled message is due on.
pub const SCHEDULE_TARGET_HEADER: &str = "Courier-Schedule-Target";

/// Prefix of the [`SCHEDULE_HEADER`] value, followed by an RFC 3339
/// timestamp.
pub const SCHEDULE_AT_PREFIX: &str = "@at ";

/// Infix of per-message schedule subjects: `<stream>.schedules.<uuid>`.
pub const SCHEDULE_SUBJECT_INFIX: &str = ".schedules.";

pub(crate) struct Publisher {
    broker: Arc<dyn Broker>,
    producers: ProducerCache,
    clock: Arc<dyn Clock>,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>) -> Self {
        let producers = ProducerCache::new(broker.clone());
        Self { broker, producers, clock }
    }

    /// Publishes a message and waits for the broker receipt.
    pub async fn send(&self, message: Message) -> Result<Receipt> {
        let (topic, envelope) = self.assemble(&message)?;
        let producer = self.producers.get_or_create(&topic).await?;
        let payload_bytes = envelope.payload.len();
        let receipt = producer.send(envelope).await?;
        debug!(
            topic,
            stream = %receipt.stream,
            sequence = receipt.sequence,
            payload_bytes,
            "published message"
        );
        Ok(receipt)
    }

    /// Publishes a message without waiting for the broker receipt.
    ///
    /// Only assembly and producer-creation failures are reported here;
    /// completion failures surface in the broker adapter's logs.
    pub async fn send_async(&self, message: Message) -> Result<()> {
        let (topic, envelope) = self.assemble(&message)?;
        let producer = self.producers.get_or_create(&topic).await?;
        producer.send_async(envelope).await?;
        debug!(topic, "queued async publish");
        Ok(())
    }

    /// Builds the outgoing envelope for a message.
    ///
    /// Returns the normalized topic (the producer cache key) alongside the
    /// envelope, whose subject may differ for wrapped scheduled messages.
    fn assemble(&self, message: &Message) -> Result<(String, Envelope)> {
        if message.topic.is_empty() {
            return Err(DeliveryError::EmptyTopic);
        }

        let subject = normalize_name(&message.topic);
        let stream = match &message.stream {
            Some(stream) if !stream.is_empty() => normalize_name(stream),
            _ => subject.clone(),
        };

        let mut envelope = Envelope {
            subject: subject.clone(),
            stream: stream.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            deliver_at: None,
        };

        if let Some(due_at) = self.schedule_time(message)? {
            if self.broker.supports_native_delay() {
                envelope.deliver_at = Some(due_at);
            } else {
                let schedule_subject =
                    format!("{stream}{SCHEDULE_SUBJECT_INFIX}{}", Uuid::new_v4());
                let due = due_at.to_rfc3339_opts(SecondsFormat::Secs, true);
                envelope
                    .headers
                    .insert(SCHEDULE_HEADER.to_string(), format!("{SCHEDULE_AT_PREFIX}{due}"));
                envelope.headers.insert(SCHEDULE_TARGET_HEADER.to_string(), subject.clone());
                envelope.subject = schedule_subject;
                info!(
                    topic = %subject,
                    schedule_subject = %envelope.subject,
                    due = %due,
                    "wrapped scheduled message"
                );
            }
        }

        Ok((subject, envelope))
    }

    /// Resolves the absolute due time of a scheduled message, if any.
    ///
    /// An absolute `deliver_at` in the future wins over `deliver_after`; a
    /// `deliver_at` in the past is ignored so such messages publish
    /// immediately.
    fn schedule_time(&self, message: &Message) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        if let Some(at) = message.deliver_at.filter(|at| *at > now) {
            return Ok(Some(at));
        }
        match message.deliver_after.filter(|after| !after.is_zero()) {
            None => Ok(None),
            Some(after) => {
                let delay = chrono::Duration::from_std(after)
                    .map_err(|_| DeliveryError::ScheduleOutOfRange)?;
                now.checked_add_signed(delay)
                    .ok_or(DeliveryError::ScheduleOutOfRange)
                    .map(Some)
            }
        }
    }
}
