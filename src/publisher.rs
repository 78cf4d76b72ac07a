use crate::broker::{BrokerChannel, BrokerConnection, Confirmation, OutgoingMessage};
use crate::device::Device;
use crate::error::PublishError;
use crate::metrics::Metrics;
use crate::routing::{RoutingKey, EXCHANGE_NAME};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Confirmed, mandatory publishing on one channel.
///
/// Sends through one publisher are serialized; use one publisher per channel
/// for independent producers.
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
    confirm_timeout: Duration,
    send_lock: Mutex<()>,
    metrics: Option<Arc<Metrics>>,
}

impl Publisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, confirm_timeout: Duration) -> Self {
        Self {
            channel,
            confirm_timeout,
            send_lock: Mutex::new(()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns once the broker has confirmed the message.
    pub async fn send(
        &self,
        exchange: &str,
        routing_key: &RoutingKey,
        message: OutgoingMessage,
    ) -> Result<(), PublishError> {
        let result = self.send_confirmed(exchange, routing_key, message).await;
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(()) => metrics.events_published.inc(),
                Err(PublishError::Unroutable { .. }) => metrics.events_unroutable.inc(),
                Err(_) => metrics.publish_failures.inc(),
            }
        }
        result
    }

    async fn send_confirmed(
        &self,
        exchange: &str,
        routing_key: &RoutingKey,
        message: OutgoingMessage,
    ) -> Result<(), PublishError> {
        let _guard = self.send_lock.lock().await;
        let started = Instant::now();

        let pending = self
            .channel
            .publish(exchange, routing_key.as_str(), message)
            .await?;
        let confirmation = tokio::time::timeout(self.confirm_timeout, pending)
            .await
            .map_err(|_| {
                warn!(
                    "No confirm for '{}' within {:?}",
                    routing_key, self.confirm_timeout
                );
                PublishError::ConfirmTimeout(self.confirm_timeout)
            })??;

        if let Some(metrics) = &self.metrics {
            metrics
                .confirm_latency
                .observe(started.elapsed().as_secs_f64());
        }

        match confirmation {
            Confirmation::Ack => {
                debug!("Broker confirmed '{}' on '{}'", routing_key, exchange);
                Ok(())
            }
            Confirmation::Returned => {
                warn!("Unroutable message '{}' on '{}'", routing_key, exchange);
                Err(PublishError::Unroutable {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                })
            }
            Confirmation::Nack => Err(PublishError::Nacked {
                routing_key: routing_key.to_string(),
            }),
        }
    }

    /// Publishes `device` to the device exchange under
    /// `device.<type>.<state>` and returns the key used.
    pub async fn publish_device_event(&self, device: &Device) -> Result<RoutingKey, PublishError> {
        let routing_key = device.routing_key()?;
        let body = device
            .to_payload()
            .map_err(|e| PublishError::Encode(e.to_string()))?;

        self.send(EXCHANGE_NAME, &routing_key, OutgoingMessage::json(body))
            .await?;
        Ok(routing_key)
    }

}

const MAX_IDLE_PUBLISHERS: usize = 8;

/// Publishers on separate channels of one connection.
///
/// Each caller of [`PublisherPool::acquire`] gets a publisher no other task
/// holds, so a slow confirm only delays its own caller. Finished publishers
/// go back to the pool unless their channel has closed.
pub struct PublisherPool {
    connection: Arc<dyn BrokerConnection>,
    confirm_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
    idle: parking_lot::Mutex<Vec<Arc<Publisher>>>,
}

impl PublisherPool {
    pub fn new(connection: Arc<dyn BrokerConnection>, confirm_timeout: Duration) -> Self {
        Self {
            connection,
            confirm_timeout,
            metrics: None,
            idle: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn acquire(&self) -> Result<PooledPublisher<'_>, PublishError> {
        if let Some(publisher) = self.take_idle() {
            return Ok(PooledPublisher {
                pool: self,
                publisher,
            });
        }

        let channel = self
            .connection
            .open_channel()
            .await
            .map_err(|e| PublishError::ConnectionLost(e.to_string()))?;
        debug!("Publisher pool opened channel {}", channel.id());

        let mut publisher = Publisher::new(channel, self.confirm_timeout);
        if let Some(metrics) = &self.metrics {
            publisher = publisher.with_metrics(Arc::clone(metrics));
        }
        Ok(PooledPublisher {
            pool: self,
            publisher: Arc::new(publisher),
        })
    }

    /// [`Publisher::publish_device_event`] on a publisher of its own.
    pub async fn publish_device_event(&self, device: &Device) -> Result<RoutingKey, PublishError> {
        let publisher = self.acquire().await?;
        publisher.publish_device_event(device).await
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn take_idle(&self) -> Option<Arc<Publisher>> {
        let mut idle = self.idle.lock();
        while let Some(publisher) = idle.pop() {
            if !publisher.channel.is_closed() {
                return Some(publisher);
            }
        }
        None
    }

    fn release(&self, publisher: Arc<Publisher>) {
        if publisher.channel.is_closed() {
            debug!("Dropping publisher on closed channel {}", publisher.channel.id());
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_PUBLISHERS {
            idle.push(publisher);
        }
    }
}

/// A publisher checked out of a [`PublisherPool`]; returned on drop.
pub struct PooledPublisher<'a> {
    pool: &'a PublisherPool,
    publisher: Arc<Publisher>,
}

impl Deref for PooledPublisher<'_> {
    type Target = Publisher;

    fn deref(&self) -> &Publisher {
        &self.publisher
    }
}

impl Drop for PooledPublisher<'_> {
    fn drop(&mut self) {
        self.pool.release(Arc::clone(&self.publisher));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::topology::{DeviceSelector, TopologyManager};

    async fn setup(broker: &MemoryBroker) -> Publisher {
        let conn = broker.connect("guest", "guest", "/").unwrap();
        let channel = conn.open_channel().await.unwrap();
        TopologyManager::new(Arc::clone(&channel))
            .ensure_device_queue(&DeviceSelector::for_type("tv"))
            .await
            .unwrap();
        Publisher::new(channel, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_publish_device_event_routes_by_type() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;

        let key = publisher
            .publish_device_event(&Device::new("tv1", "tv", "on"))
            .await
            .unwrap();
        assert_eq!(key.as_str(), "device.tv.on");
        assert_eq!(broker.ready_count("tv_queue"), Some(1));
    }

    #[tokio::test]
    async fn test_unroutable_is_reported() {
        let broker = MemoryBroker::new();
        let metrics = Arc::new(Metrics::new().unwrap());
        let publisher = setup(&broker).await.with_metrics(Arc::clone(&metrics));

        let err = publisher
            .publish_device_event(&Device::new("h1", "heater", "heating"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Unroutable { .. }));
        assert_eq!(metrics.events_unroutable.get(), 1);
        assert_eq!(metrics.events_published.get(), 0);
    }

    #[tokio::test]
    async fn test_invalid_device_never_reaches_broker() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;

        let err = publisher
            .publish_device_event(&Device::new("tv1", "tv", "on.off"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidRoutingKey(_)));
        assert_eq!(broker.ready_count("tv_queue"), Some(0));
    }

    #[tokio::test]
    async fn test_confirm_timeout() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;
        broker.hold_confirms(true);

        let err = publisher
            .publish_device_event(&Device::new("tv1", "tv", "on"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::ConfirmTimeout(_)));
    }

    #[tokio::test]
    async fn test_missing_exchange_is_rejected() {
        let broker = MemoryBroker::new();
        let publisher = setup(&broker).await;
        let key = RoutingKey::parse("device.tv.on").unwrap();

        let err = publisher
            .send("no_such_exchange", &key, OutgoingMessage::text("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Rejected(_)));
    }

    async fn pool(broker: &MemoryBroker, confirm_timeout: Duration) -> PublisherPool {
        let conn = broker.connect("guest", "guest", "/").unwrap();
        let channel = conn.open_channel().await.unwrap();
        TopologyManager::new(channel)
            .ensure_device_queue(&DeviceSelector::for_type("tv"))
            .await
            .unwrap();
        PublisherPool::new(Arc::new(conn), confirm_timeout)
    }

    #[tokio::test]
    async fn test_pool_hands_out_separate_channels() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, Duration::from_millis(200)).await;

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        let ids = [first.channel.id(), second.channel.id()];
        assert_ne!(ids[0], ids[1]);
        drop(first);
        drop(second);
        assert_eq!(pool.idle_count(), 2);

        let again = pool.acquire().await.unwrap();
        assert_eq!(pool.idle_count(), 1);
        assert!(ids.contains(&again.channel.id()));
    }

    #[tokio::test]
    async fn test_pool_drops_closed_channels() {
        let broker = MemoryBroker::new();
        let pool = pool(&broker, Duration::from_millis(200)).await;

        let publisher = pool.acquire().await.unwrap();
        publisher.channel.close().await.unwrap();
        drop(publisher);
        assert_eq!(pool.idle_count(), 0);

        let key = pool
            .publish_device_event(&Device::new("tv1", "tv", "on"))
            .await
            .unwrap();
        assert_eq!(key.as_str(), "device.tv.on");
        assert_eq!(broker.ready_count("tv_queue"), Some(1));
    }

    #[tokio::test]
    async fn test_concurrent_confirm_waits_overlap() {
        let broker = MemoryBroker::new();
        let timeout = Duration::from_millis(200);
        let pool = pool(&broker, timeout).await;
        broker.hold_confirms(true);

        let tv1 = Device::new("tv1", "tv", "on");
        let tv2 = Device::new("tv2", "tv", "off");
        let started = Instant::now();
        let (a, b) = tokio::join!(
            pool.publish_device_event(&tv1),
            pool.publish_device_event(&tv2),
        );
        let elapsed = started.elapsed();

        assert!(matches!(a, Err(PublishError::ConfirmTimeout(_))));
        assert!(matches!(b, Err(PublishError::ConfirmTimeout(_))));
        assert!(elapsed < timeout * 3 / 2, "took {:?}", elapsed);
    }
}
