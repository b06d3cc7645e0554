//! Push-mode delivery loop.
//!
//! Consumes a bounded channel fed by the broker and fans deliveries out
//! across a bounded worker pool of the same capacity. When the pool is
//! saturated the loop stops receiving, the channel fills, and the broker
//! holds further deliveries, so a slow listener translates into backpressure
//! instead of unbounded buffering. The loop ends when the channel closes on
//! connection drain.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::{broker::RawMessage, processor::Processor, worker_pool::WorkerPool};

/// Push delivery loop bound to a grouped consumer.
pub(crate) struct PushLoop {
    subscription: String,
    channel_capacity: usize,
    processor: Arc<Processor>,
}

impl PushLoop {
    pub fn new(subscription: String, channel_capacity: usize, processor: Arc<Processor>) -> Self {
        Self { subscription, channel_capacity, processor }
    }

    /// Consumes the push channel until it closes, then drains in-flight
    /// deliveries.
    pub async fn run(&self, mut receiver: mpsc::Receiver<RawMessage>) {
        let mut pool = WorkerPool::new(self.channel_capacity);

        while let Some(raw) = receiver.recv().await {
            let processor = self.processor.clone();
            pool.submit(async move { processor.process(raw).await }).await;
        }

        info!(subscription = %self.subscription, "push channel closed, stopping push loop");
        pool.drain().await;
    }
}
