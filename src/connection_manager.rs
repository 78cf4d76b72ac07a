use crate::broker::amqp::AmqpConnection;
use crate::broker::{BrokerChannel, BrokerConnection};
use crate::config::BrokerSettings;
use crate::error::ConnectionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Owns the process-wide broker connection and the channels opened on it.
pub struct ConnectionManager {
    connection: Arc<dyn BrokerConnection>,
    channels: Mutex<Vec<Arc<dyn BrokerChannel>>>,
    label: String,
}

impl ConnectionManager {
    /// Connect to the AMQP broker described by `settings`.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, ConnectionError> {
        let connection = AmqpConnection::connect(settings).await?;
        Ok(Self::from_connection(
            Arc::new(connection),
            format!("{}/{}", settings.host, settings.vhost),
        ))
    }

    pub fn from_connection(connection: Arc<dyn BrokerConnection>, label: impl Into<String>) -> Self {
        Self {
            connection,
            channels: Mutex::new(Vec::new()),
            label: label.into(),
        }
    }

    /// Open an independent channel. Each publisher or consumer gets its own.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        let channel = self.connection.open_channel().await?;
        info!("Opened channel {} on {}", channel.id(), self.label);

        let mut channels = self.channels.lock();
        channels.retain(|c| !c.is_closed());
        channels.push(Arc::clone(&channel));
        Ok(channel)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn open_channel_count(&self) -> usize {
        self.channels
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Close every owned channel, then the connection. Safe to call twice.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let channels: Vec<Arc<dyn BrokerChannel>> = std::mem::take(&mut *self.channels.lock());
        for channel in channels {
            if let Err(e) = channel.close().await {
                warn!("Failed to close channel {}: {}", channel.id(), e);
            }
        }

        if self.connection.is_open() {
            self.connection.close().await?;
            info!("Closed broker connection to {}", self.label);
        }
        Ok(())
    }
}

/// Lets consumers and publisher pools open their own channels while the
/// manager keeps track of them.
#[async_trait]
impl BrokerConnection for ConnectionManager {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        ConnectionManager::open_channel(self).await
    }

    fn is_open(&self) -> bool {
        self.is_connected()
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        ConnectionManager::close(self).await
    }
}
