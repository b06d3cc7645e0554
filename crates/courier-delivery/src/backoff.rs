//! Backoff policy for failed deliveries.
//!
//! Decides, per failed delivery attempt, whether the message should be
//! redelivered and after what delay, or given up on. The decision is a pure
//! function of the acknowledgement mode, the redelivery count the broker
//! reports, and the subscription's retry budget.

use std::time::Duration;

use courier_core::AckMode;
use serde::{Deserialize, Serialize};

/// Hard ceiling on redeliveries, applied on top of any configured budget.
pub const MAX_RETRY_TIMES: u64 = 50;

/// Retry budget for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of redeliveries before the message is given up on.
    /// Values above [`MAX_RETRY_TIMES`] are capped at subscribe time.
    pub max_retry_times: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { max_retry_times: MAX_RETRY_TIMES }
    }
}

/// Result of a backoff decision for one failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffDecision {
    /// Negatively acknowledge and redeliver after the delay.
    Retry {
        /// How long the broker should wait before redelivering
        delay: Duration,
    },
    /// Acknowledge the message despite the failure; no further deliveries.
    GiveUp {
        /// Reason why the message should not be retried
        reason: String,
    },
}

impl BackoffPolicy {
    /// Creates a policy with the given redelivery budget.
    pub fn new(max_retry_times: u64) -> Self {
        Self { max_retry_times }
    }

    /// Effective redelivery ceiling: the configured budget capped at
    /// [`MAX_RETRY_TIMES`].
    pub fn retry_ceiling(&self) -> u64 {
        self.max_retry_times.min(MAX_RETRY_TIMES)
    }

    /// Decides what to do with a failed delivery.
    ///
    /// Auto mode never retries: the message is acknowledged as if it had
    /// succeeded. Manual mode retries with a growing delay until the
    /// redelivery count reaches the ceiling.
    pub fn decide(&self, ack_mode: AckMode, redelivery_count: u64) -> BackoffDecision {
        if ack_mode == AckMode::Auto {
            return BackoffDecision::GiveUp { reason: "auto acknowledgement mode".to_string() };
        }

        let ceiling = self.retry_ceiling();
        if redelivery_count >= ceiling {
            return BackoffDecision::GiveUp {
                reason: format!("retry budget ({ceiling}) exhausted"),
            };
        }

        BackoffDecision::Retry { delay: Self::delay_for(redelivery_count) }
    }

    /// Delay before the nth redelivery: `2n - 1` seconds, floored at the
    /// one second minimum.
    ///
    /// Produces 1s, 3s, 5s, 7s... for redelivery counts 1, 2, 3, 4. A count
    /// of zero also maps to the floor rather than underflowing.
    fn delay_for(redelivery_count: u64) -> Duration {
        let seconds = redelivery_count.saturating_mul(2).saturating_sub(1).max(1);
        Duration::from_secs(seconds)
    }
}
