use crate::broker::{BrokerChannel, QueueInfo};
use crate::error::TopologyError;
use crate::routing::{queue_name, BindingPattern, ALL_DEVICES_QUEUE, EXCHANGE_NAME};
use std::sync::Arc;
use tracing::info;

/// Which deliveries a consumer instance wants: a device type (or every type)
/// and a state pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelector {
    /// `None` selects every device type
    pub device_type: Option<String>,
    pub state_pattern: String,
}

impl DeviceSelector {
    pub fn new(device_type: Option<String>, state_pattern: Option<String>) -> Self {
        Self {
            device_type: device_type.filter(|t| !t.is_empty() && t != "*"),
            state_pattern: state_pattern
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "#".to_string()),
        }
    }

    pub fn for_type(device_type: &str) -> Self {
        Self::new(Some(device_type.to_string()), None)
    }

    pub fn queue_name(&self) -> String {
        match &self.device_type {
            Some(device_type) => queue_name(device_type),
            None => ALL_DEVICES_QUEUE.to_string(),
        }
    }

    pub fn binding_pattern(&self) -> Result<BindingPattern, TopologyError> {
        let device_type = self.device_type.as_deref().unwrap_or("*");
        BindingPattern::for_device(device_type, &self.state_pattern).map_err(|e| {
            TopologyError::InvalidName {
                name: format!("{}.{}", device_type, self.state_pattern),
                reason: e.to_string(),
            }
        })
    }

    /// Label used for logging and handler dispatch.
    pub fn device_type_label(&self) -> &str {
        self.device_type.as_deref().unwrap_or("*")
    }
}

/// Declares exchanges, queues and bindings. Every operation is idempotent.
pub struct TopologyManager {
    channel: Arc<dyn BrokerChannel>,
}

impl TopologyManager {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    pub async fn declare_queue(&self, name: &str) -> Result<QueueInfo, TopologyError> {
        let queue = self.channel.declare_queue(name).await?;
        info!(
            "Queue '{}' ready ({} messages, {} consumers)",
            queue.name, queue.message_count, queue.consumer_count
        );
        Ok(queue)
    }

    pub async fn declare_topic_exchange(&self, name: &str) -> Result<(), TopologyError> {
        self.channel.declare_topic_exchange(name).await?;
        info!("Topic exchange '{}' ready", name);
        Ok(())
    }

    pub async fn bind(
        &self,
        queue: &str,
        pattern: &str,
        exchange: &str,
    ) -> Result<(), TopologyError> {
        let pattern = BindingPattern::parse(pattern).map_err(|e| TopologyError::InvalidName {
            name: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.channel
            .bind_queue(queue, pattern.as_str(), exchange)
            .await?;
        info!(
            "Queue '{}' bound to '{}' with '{}'",
            queue, exchange, pattern
        );
        Ok(())
    }

    /// Exchange, queue and binding for one consumer selector.
    pub async fn ensure_device_queue(
        &self,
        selector: &DeviceSelector,
    ) -> Result<QueueInfo, TopologyError> {
        let pattern = selector.binding_pattern()?;
        self.declare_topic_exchange(EXCHANGE_NAME).await?;
        let queue = self.declare_queue(&selector.queue_name()).await?;
        self.bind(&queue.name, pattern.as_str(), EXCHANGE_NAME)
            .await?;
        Ok(queue)
    }
}
