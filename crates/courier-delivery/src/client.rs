//! Client facade over a broker connection.
//!
//! Owns the connection handle, the producer cache, and the clock, and
//! exposes the publish and subscribe API. Multiple clients with separate
//! broker connections coexist in one process; nothing here is global.

use std::{sync::Arc, time::Duration};

use courier_core::{Clock, Message, MessageListener, RealClock};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::{
    broker::{Broker, Receipt},
    error::Result,
    publisher::Publisher,
    subscriber::{ConsumerOptions, Subscriber},
};

/// Connection-level configuration consumed by broker adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientOptions {
    /// Broker server URL.
    pub url: String,

    /// Username for authenticated connections.
    pub user: Option<String>,

    /// Password for authenticated connections.
    pub password: Option<String>,

    /// Connection name reported to the broker, typically the service name.
    pub app_name: String,

    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,

    /// Outstanding pings tolerated before the connection is considered
    /// stale.
    pub max_pings_outstanding: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            url: String::new(),
            user: None,
            password: None,
            app_name: String::new(),
            connect_timeout: Duration::from_secs(5),
            max_pings_outstanding: 5,
        }
    }
}

/// Publish and subscribe client bound to one broker connection.
pub struct Client {
    broker: Arc<dyn Broker>,
    options: ClientOptions,
    publisher: Publisher,
    clock: Arc<dyn Clock>,
}

impl Client {
    /// Creates a client with default options and the real clock.
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self::with_options(broker, ClientOptions::default())
    }

    /// Creates a client with explicit options and the real clock.
    pub fn with_options(broker: Arc<dyn Broker>, options: ClientOptions) -> Self {
        Self::with_clock(broker, options, Arc::new(RealClock))
    }

    /// Creates a client with an injected clock. Tests use this to control
    /// schedule timestamps and loop pauses.
    pub fn with_clock(
        broker: Arc<dyn Broker>,
        options: ClientOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(app_name = %options.app_name, "message client ready");
        let publisher = Publisher::new(broker.clone(), clock.clone());
        Self { broker, options, publisher, clock }
    }

    /// Connection options this client was built with.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Publishes a message and waits for the broker receipt.
    pub async fn send(&self, message: Message) -> Result<Receipt> {
        self.publisher.send(message).await
    }

    /// Publishes a message without waiting for the broker receipt.
    pub async fn send_async(&self, message: Message) -> Result<()> {
        self.publisher.send_async(message).await
    }

    /// Starts a subscription on a background task.
    ///
    /// The returned handle resolves when the subscription ends: with a
    /// setup error, or with `Ok` after the connection closes. Errors are
    /// also logged here since most callers detach the handle.
    pub fn subscribe(
        &self,
        options: ConsumerOptions,
        listener: Arc<dyn MessageListener>,
    ) -> JoinHandle<Result<()>> {
        let subscriber = Subscriber::new(self.broker.clone(), self.clock.clone());
        let subscription = options.subscription.clone();
        tokio::spawn(async move {
            let result = subscriber.subscribe(options, listener).await;
            if let Err(error) = &result {
                error!(
                    subscription = %subscription,
                    error = %error,
                    "subscription ended with error"
                );
            }
            result
        })
    }

    /// Runs a subscription on the caller's task.
    ///
    /// Returns a setup error immediately; otherwise runs delivery loops
    /// until the broker connection closes.
    pub async fn subscribe_sync(
        &self,
        options: ConsumerOptions,
        listener: Arc<dyn MessageListener>,
    ) -> Result<()> {
        Subscriber::new(self.broker.clone(), self.clock.clone()).subscribe(options, listener).await
    }

    /// Drains the broker connection, unblocking every delivery loop.
    pub async fn close(&self) -> Result<()> {
        info!("closing message client");
        self.broker.close().await?;
        Ok(())
    }
}
