//! Producer cache with double-checked creation.
//!
//! Producer handles are expensive to create, so at most one is held per
//! topic. The read path is lock-free between callers; creation is
//! serialized behind a mutex and re-checked so concurrent first publishes
//! to the same topic cannot race two handles into existence. A failed
//! creation is never cached and the next publish retries it.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::{
    broker::{Broker, Producer},
    error::{DeliveryError, Result},
};

/// Per-client registry of producer handles, keyed by normalized topic.
pub(crate) struct ProducerCache {
    broker: Arc<dyn Broker>,
    producers: RwLock<HashMap<String, Arc<dyn Producer>>>,
    create_lock: Mutex<()>,
}

impl ProducerCache {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker, producers: RwLock::new(HashMap::new()), create_lock: Mutex::new(()) }
    }

    /// Returns the cached producer for a topic, creating it on first use.
    pub async fn get_or_create(&self, topic: &str) -> Result<Arc<dyn Producer>> {
        if let Some(producer) = self.producers.read().await.get(topic) {
            debug!(topic, "loaded producer from cache");
            return Ok(producer.clone());
        }

        let _guard = self.create_lock.lock().await;
        // Another caller may have created the producer while we waited
        if let Some(producer) = self.producers.read().await.get(topic) {
            debug!(topic, "loaded producer from cache after create race");
            return Ok(producer.clone());
        }

        info!(topic, "creating producer");
        let producer = self
            .broker
            .create_producer(topic)
            .await
            .map_err(|source| DeliveryError::producer_create(topic, source))?;
        self.producers.write().await.insert(topic.to_string(), producer.clone());
        info!(topic, "producer created");
        Ok(producer)
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.producers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::broker::{mock::MockBroker, BrokerError};

    #[tokio::test]
    async fn producer_created_once_and_cached() {
        let broker = Arc::new(MockBroker::new());
        let cache = ProducerCache::new(broker.clone());

        let first = cache.get_or_create("orders").await.unwrap();
        let second = cache.get_or_create("orders").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.producer_count(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn distinct_topics_get_distinct_producers() {
        let broker = Arc::new(MockBroker::new());
        let cache = ProducerCache::new(broker.clone());

        cache.get_or_create("orders").await.unwrap();
        cache.get_or_create("payments").await.unwrap();

        assert_eq!(broker.producer_count(), 2);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn creation_failure_is_not_cached() {
        let broker = Arc::new(MockBroker::new());
        broker.inject_producer_error("orders", BrokerError::transport("connect refused")).await;
        let cache = ProducerCache::new(broker.clone());

        let error = cache.get_or_create("orders").await.err().unwrap();
        assert!(matches!(error, DeliveryError::ProducerCreate { .. }));
        assert_eq!(cache.len().await, 0);

        // The next call retries and succeeds
        cache.get_or_create("orders").await.unwrap();
        assert_eq!(broker.producer_count(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_exactly_one_producer() {
        let broker = Arc::new(MockBroker::new());
        broker.set_producer_delay(Duration::from_millis(20)).await;
        let cache = Arc::new(ProducerCache::new(broker.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_or_create("orders").await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.producer_count(), 1);
    }
}
