use crate::broker::{BrokerChannel, BrokerConnection, Delivery, DeliveryStream};
use crate::error::{ConsumeError, HandlerError};
use crate::handler::EventHandler;
use crate::metrics::Metrics;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RECOVERY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    /// Handler failed; the broker redelivers once the channel is recovered.
    LeftUnacknowledged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub failed: u64,
    /// Channels replaced to get failed deliveries redelivered.
    pub recoveries: u64,
}

/// Manual-ack subscriber.
///
/// Failed deliveries stay unacknowledged and count against the prefetch
/// window. Once they fill it, [`Consumer::run`] replaces the channel, which
/// hands them back to the broker for redelivery.
pub struct Consumer {
    connection: Arc<dyn BrokerConnection>,
    channel: Mutex<Arc<dyn BrokerChannel>>,
    prefetch: u16,
    handler_timeout: Duration,
    recovery_delay: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Consumer {
    /// Opens a channel on `connection` with the prefetch limit applied.
    /// Zero is rejected.
    pub async fn new(
        connection: Arc<dyn BrokerConnection>,
        prefetch: u16,
    ) -> Result<Self, ConsumeError> {
        if prefetch == 0 {
            return Err(ConsumeError::InvalidPrefetch);
        }
        let channel = open_with_prefetch(connection.as_ref(), prefetch).await?;

        Ok(Self {
            connection,
            channel: Mutex::new(channel),
            prefetch,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            recovery_delay: DEFAULT_RECOVERY_DELAY,
            metrics: None,
        })
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Pause before a replacement channel is opened.
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::clone(&self.channel.lock())
    }

    pub async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, ConsumeError> {
        let consumer_tag = format!("device-router-{}", uuid::Uuid::new_v4());
        self.channel().consume(queue, &consumer_tag).await
    }

    /// Closes the current channel and switches to a fresh one with the same
    /// prefetch limit. The broker requeues everything left unacknowledged on
    /// the old channel, flagged as redelivered. Existing delivery streams end;
    /// call [`Consumer::subscribe`] again.
    pub async fn recover(&self) -> Result<(), ConsumeError> {
        let old = self.channel();
        if let Err(e) = old.close().await {
            warn!("Failed to close consumer channel {}: {}", old.id(), e);
        }

        let fresh = open_with_prefetch(self.connection.as_ref(), self.prefetch).await?;
        info!(
            "Consumer moved from channel {} to channel {}",
            old.id(),
            fresh.id()
        );
        *self.channel.lock() = fresh;
        Ok(())
    }

    /// Runs `handler` on one delivery and acknowledges it only on success.
    pub async fn process(
        &self,
        device_type: &str,
        delivery: &Delivery,
        handler: &dyn EventHandler,
    ) -> Result<DeliveryOutcome, ConsumeError> {
        if let Some(metrics) = &self.metrics {
            metrics.deliveries_received.inc();
        }
        debug!(
            "Delivery {} on '{}' ({} bytes, redelivered: {})",
            delivery.delivery_tag,
            delivery.routing_key,
            delivery.body.len(),
            delivery.redelivered
        );

        let result = tokio::time::timeout(
            self.handler_timeout,
            handler.handle(device_type, &delivery.body),
        )
        .await
        .unwrap_or(Err(HandlerError::TimedOut(self.handler_timeout)));

        match result {
            Ok(()) => {
                delivery.ack().await?;
                if let Some(metrics) = &self.metrics {
                    metrics.deliveries_acked.inc();
                }
                Ok(DeliveryOutcome::Acknowledged)
            }
            Err(e) if e.is_fatal() => {
                error!(
                    "Handler failed fatally on delivery {}: {}",
                    delivery.delivery_tag, e
                );
                Err(ConsumeError::Handler(e))
            }
            Err(e) => {
                warn!(
                    "Leaving delivery {} on '{}' unacknowledged: {}",
                    delivery.delivery_tag, delivery.routing_key, e
                );
                if let Some(metrics) = &self.metrics {
                    metrics.handler_failures.inc();
                }
                Ok(DeliveryOutcome::LeftUnacknowledged)
            }
        }
    }

    /// Consumes `queue` until `shutdown` flips to true, the stream ends, or
    /// the handler fails fatally.
    pub async fn run(
        &self,
        queue: &str,
        device_type: &str,
        handler: Arc<dyn EventHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConsumerStats, ConsumeError> {
        let mut stream = self.subscribe(queue).await?;
        let mut stats = ConsumerStats::default();
        // Unacknowledged deliveries held by the current channel
        let mut outstanding: u16 = 0;
        info!("Consuming '{}' for device type '{}'", queue, device_type);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!("Delivery error on '{}': {}", queue, e);
                    continue;
                }
                None => {
                    warn!("Delivery stream for '{}' ended", queue);
                    return Err(ConsumeError::StreamClosed);
                }
            };

            stats.received += 1;
            match self.process(device_type, &delivery, handler.as_ref()).await {
                Ok(DeliveryOutcome::Acknowledged) => stats.acknowledged += 1,
                Ok(DeliveryOutcome::LeftUnacknowledged) => {
                    stats.failed += 1;
                    outstanding += 1;
                }
                Err(e @ ConsumeError::Handler(_)) => return Err(e),
                Err(e) => {
                    warn!(
                        "Failed to acknowledge delivery {}: {}",
                        delivery.delivery_tag, e
                    );
                    stats.failed += 1;
                    outstanding += 1;
                }
            }

            if outstanding >= self.prefetch {
                warn!(
                    "{} failed deliveries fill the prefetch window on '{}', recovering channel",
                    outstanding, queue
                );
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.recovery_delay) => {}
                }
                self.recover().await?;
                stream = self.subscribe(queue).await?;
                outstanding = 0;
                stats.recoveries += 1;
            }
        }

        info!(
            "Consumer for '{}' stopped: {} received, {} acknowledged, {} failed, {} recoveries",
            queue, stats.received, stats.acknowledged, stats.failed, stats.recoveries
        );
        Ok(stats)
    }
}

async fn open_with_prefetch(
    connection: &dyn BrokerConnection,
    prefetch: u16,
) -> Result<Arc<dyn BrokerChannel>, ConsumeError> {
    let channel = connection.open_channel().await?;
    channel.set_prefetch(prefetch).await?;
    debug!("Prefetch set to {} on channel {}", prefetch, channel.id());
    Ok(channel)
}
