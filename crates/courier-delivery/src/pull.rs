//! Pull-mode delivery loop.
//!
//! Each fetcher owns one pull cursor and one bounded worker pool. The loop
//! fetches batches, fans the messages out across the pool, and keeps going
//! until the broker connection closes. An empty batch means the poll window
//! expired without traffic and the loop fetches again immediately; fetch
//! failures other than a closed connection pause the loop briefly before it
//! retries.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use tracing::{debug, info, warn};

use crate::{
    broker::PullCursor,
    processor::Processor,
    worker_pool::WorkerPool,
};

/// Pause between fetch attempts after a transient fetch failure.
const FETCH_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// One pull fetcher bound to a subscription.
pub(crate) struct PullLoop {
    subscription: String,
    batch_size: usize,
    processor: Arc<Processor>,
    clock: Arc<dyn Clock>,
}

impl PullLoop {
    pub fn new(
        subscription: String,
        batch_size: usize,
        processor: Arc<Processor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { subscription, batch_size, processor, clock }
    }

    /// Runs the fetch loop until the connection closes, then drains
    /// in-flight deliveries.
    pub async fn run(&self, mut cursor: Box<dyn PullCursor>) {
        let mut pool = WorkerPool::new(self.batch_size * 2);

        loop {
            match cursor.fetch(self.batch_size).await {
                Ok(batch) => {
                    if batch.is_empty() {
                        continue;
                    }
                    debug!(
                        subscription = %self.subscription,
                        batch_len = batch.len(),
                        "fetched message batch"
                    );
                    for raw in batch {
                        let processor = self.processor.clone();
                        pool.submit(async move { processor.process(raw).await }).await;
                    }
                },
                Err(error) if error.is_closed() => {
                    info!(
                        subscription = %self.subscription,
                        "connection closed, stopping pull loop"
                    );
                    break;
                },
                Err(error) => {
                    warn!(
                        subscription = %self.subscription,
                        error = %error,
                        "fetch failed, pausing before retry"
                    );
                    self.clock.sleep(FETCH_RETRY_PAUSE).await;
                },
            }
        }

        pool.drain().await;
    }
}
