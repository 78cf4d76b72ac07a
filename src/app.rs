use crate::broker::BrokerConnection;
use crate::config::Settings;
use crate::connection_manager::ConnectionManager;
use crate::consumer::Consumer;
use crate::device::Device;
use crate::device_store::JsonDeviceStore;
use crate::handler::EventHandler;
use crate::metrics::Metrics;
use crate::producer::ProducerClient;
use crate::publisher::PublisherPool;
use crate::routing::EXCHANGE_NAME;
use crate::topology::{DeviceSelector, TopologyManager};
use crate::web_server::{AppState, WebServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Process wiring for the three roles. Startup is sequential and stops at
/// the first failure.
pub struct DeviceRouter {
    settings: Settings,
}

impl DeviceRouter {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub async fn run_server(self) -> Result<()> {
        info!("Starting device event server");
        let metrics = Arc::new(Metrics::new().context("Failed to create metrics")?);

        let store = Arc::new(
            JsonDeviceStore::new(&self.settings.database.path)
                .context("Failed to open device store")?,
        );

        let connection = Arc::new(
            ConnectionManager::connect(&self.settings.broker)
                .await
                .context("Failed to connect to broker")?,
        );
        let channel = connection
            .open_channel()
            .await
            .context("Failed to open topology channel")?;
        TopologyManager::new(Arc::clone(&channel))
            .declare_topic_exchange(EXCHANGE_NAME)
            .await
            .context("Failed to declare device exchange")?;
        channel
            .close()
            .await
            .context("Failed to close topology channel")?;

        let publishers = Arc::new(
            PublisherPool::new(
                Arc::clone(&connection) as Arc<dyn BrokerConnection>,
                self.settings.broker.confirm_timeout(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let state = AppState {
            publishers,
            store,
            connection: Arc::clone(&connection),
            metrics,
        };

        let server = WebServer::new(
            self.settings.server.bind_address.clone(),
            self.settings.server.port,
            state,
        );
        let result = server.run(shutdown_signal()).await;

        info!("Shutting down device event server");
        connection.close().await.context("Failed to close broker connection")?;
        result
    }

    pub async fn run_consumer(
        self,
        selector: DeviceSelector,
        handler: Arc<dyn EventHandler>,
    ) -> Result<()> {
        info!(
            "Starting consumer for device type '{}' with state pattern '{}'",
            selector.device_type_label(),
            selector.state_pattern
        );
        let metrics = Arc::new(Metrics::new().context("Failed to create metrics")?);

        let connection = Arc::new(
            ConnectionManager::connect(&self.settings.broker)
                .await
                .context("Failed to connect to broker")?,
        );
        let channel = connection
            .open_channel()
            .await
            .context("Failed to open topology channel")?;
        let queue = TopologyManager::new(Arc::clone(&channel))
            .ensure_device_queue(&selector)
            .await
            .context("Failed to declare consumer topology")?;
        channel
            .close()
            .await
            .context("Failed to close topology channel")?;

        let consumer = Consumer::new(
            Arc::clone(&connection) as Arc<dyn BrokerConnection>,
            self.settings.consumer.prefetch_count,
        )
        .await
        .context("Failed to open consumer channel")?
        .with_handler_timeout(self.settings.consumer.handler_timeout())
        .with_metrics(metrics);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let device_type = selector.device_type_label().to_string();
        let mut task = tokio::spawn(async move {
            consumer
                .run(&queue.name, &device_type, handler, shutdown_rx)
                .await
        });

        let outcome = tokio::select! {
            joined = &mut task => joined,
            _ = shutdown_signal() => {
                info!("Stopping consumer");
                let _ = shutdown_tx.send(true);
                task.await
            }
        };

        connection.close().await.context("Failed to close broker connection")?;

        match outcome.context("Consumer task panicked")? {
            Ok(stats) => {
                info!(
                    "Consumer finished: {} received, {} acknowledged, {} channel recoveries",
                    stats.received, stats.acknowledged, stats.recoveries
                );
                Ok(())
            }
            Err(e) => {
                error!("Consumer stopped: {}", e);
                Err(e.into())
            }
        }
    }

    /// Registers each device, then publishes its current state.
    pub async fn run_producer(self, devices: Vec<Device>) -> Result<()> {
        let client = ProducerClient::new(&self.settings.producer.server_url)?;
        info!(
            "Producing {} device event(s) through {}",
            devices.len(),
            self.settings.producer.server_url
        );

        for device in &devices {
            client
                .register_device(device)
                .await
                .with_context(|| format!("Failed to register device '{}'", device.id))?;
            match client.publish_event(device).await {
                Ok(routing_key) => info!("Device '{}' event sent as '{}'", device.id, routing_key),
                Err(e) => {
                    warn!("Event for device '{}' failed: {}", device.id, e);
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

/// One event per known device kind.
pub fn sample_devices() -> Vec<Device> {
    vec![
        Device::new("ac1", "air_conditioner", "cooling"),
        Device::new("tv1", "tv", "on"),
        Device::new("lights1", "lights", "off"),
        Device::new("heater1", "heater", "heating"),
    ]
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
