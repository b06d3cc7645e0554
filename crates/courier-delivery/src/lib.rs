//! Message delivery engine with scheduled publication and retry control.
//!
//! This crate implements the broker-facing delivery core: producers publish
//! messages with optional scheduled delivery, subscriptions consume them in
//! pull or push mode, and bounded worker pools fan deliveries out to
//! listeners with per-message acknowledgement, linear backoff, and a capped
//! retry budget.
//!
//! # Architecture
//!
//! A [`Client`] owns the broker connection and runs the complete delivery
//! lifecycle for every subscription:
//!
//! 1. **Validate Consumer** - Check registered consumer metadata against
//!    the requested topic and subscription
//! 2. **Select Mode** - Ungrouped consumers get replicated pull fetchers,
//!    grouped consumers one bounded push loop
//! 3. **Dispatch** - Fan deliveries out across a bounded worker pool
//! 4. **Settle** - Acknowledge, retry with a backoff delay, or drop the
//!    message once its retry budget is exhausted
//!
//! # Key Features
//!
//! - **Scheduled Delivery** - Publish-time envelope wrapping for brokers
//!   without native delayed delivery
//! - **Bounded Concurrency** - Worker pools and push channels are sized,
//!   so slow listeners turn into backpressure instead of unbounded buffers
//! - **Panic Isolation** - Listener panics are recovered, logged with the
//!   attempt's trace ID, and settled like listener errors
//! - **Graceful Shutdown** - Draining the broker connection unblocks every
//!   loop; in-flight deliveries finish before the loops return
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{AckMode, FnListener, Message};
//! use courier_delivery::{broker::Broker, Client, ConsumerOptions};
//!
//! # async fn example(broker: Arc<dyn Broker>) -> courier_delivery::Result<()> {
//! let client = Client::new(broker);
//! client.send(Message::new("orders", b"{}".as_slice())).await?;
//!
//! let listener = Arc::new(FnListener::new(|ctx, message| async move {
//!     println!("{} got {} bytes", ctx.subscription, message.payload.len());
//!     Ok(())
//! }));
//! let options =
//!     ConsumerOptions::new("orders", "orders-workers").with_ack_mode(AckMode::Manual);
//! client.subscribe_sync(options, listener).await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod broker;
pub mod client;
pub mod error;
pub mod subscriber;
pub mod worker_pool;

mod processor;
mod producers;
mod publisher;
mod pull;
mod push;

// Re-export main public API
pub use client::{Client, ClientOptions};
pub use error::{DeliveryError, Result};
pub use publisher::{
    SCHEDULE_AT_PREFIX, SCHEDULE_HEADER, SCHEDULE_SUBJECT_INFIX, SCHEDULE_TARGET_HEADER,
};
pub use subscriber::ConsumerOptions;

/// Default number of messages requested per pull fetch.
pub const DEFAULT_PULL_BATCH_SIZE: usize = 34;

/// Default capacity of push channels and their worker pools.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 200;

/// Upper bound on pull fetchers per subscription.
pub const MAX_PULL_FETCHERS: usize = 4;
