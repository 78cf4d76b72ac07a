#![allow(dead_code)]

use async_trait::async_trait;
use device_router::broker::memory::MemoryBroker;
use device_router::broker::{BrokerChannel, BrokerConnection, Delivery, DeliveryStream};
use device_router::error::HandlerError;
use device_router::{DeviceSelector, EventHandler, Publisher, TopologyManager};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub const CONFIRM_TIMEOUT: Duration = Duration::from_millis(500);

pub fn connect(broker: &MemoryBroker) -> Arc<dyn BrokerConnection> {
    Arc::new(broker.connect("guest", "guest", "/").unwrap())
}

pub async fn open_channel(broker: &MemoryBroker) -> Arc<dyn BrokerChannel> {
    connect(broker).open_channel().await.unwrap()
}

/// Declares the queue and binding for `device_type` and returns a publisher
/// on its own channel.
pub async fn publisher_for(broker: &MemoryBroker, device_types: &[&str]) -> Publisher {
    let channel = open_channel(broker).await;
    let topology = TopologyManager::new(Arc::clone(&channel));
    for device_type in device_types {
        topology
            .ensure_device_queue(&DeviceSelector::for_type(device_type))
            .await
            .unwrap();
    }
    Publisher::new(channel, CONFIRM_TIMEOUT)
}

pub async fn next_delivery(stream: &mut DeliveryStream) -> Option<Delivery> {
    tokio::time::timeout(Duration::from_millis(100), stream.next())
        .await
        .ok()
        .flatten()
        .map(|item| item.unwrap())
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Records every payload and fails the ones listed in `fail_on`, every
/// time or only on their first attempt.
#[derive(Default)]
pub struct RecordingHandler {
    pub seen: Mutex<Vec<(String, Vec<u8>)>>,
    pub fail_on: Vec<Vec<u8>>,
    pub fail_once: bool,
}

impl RecordingHandler {
    pub fn failing_on(payloads: &[&[u8]]) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_on: payloads.iter().map(|p| p.to_vec()).collect(),
            fail_once: false,
        }
    }

    pub fn failing_once_on(payloads: &[&[u8]]) -> Self {
        Self {
            fail_once: true,
            ..Self::failing_on(payloads)
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, device_type: &str, payload: &[u8]) -> Result<(), HandlerError> {
        let attempts = {
            let mut seen = self.seen.lock();
            seen.push((device_type.to_string(), payload.to_vec()));
            seen.iter().filter(|(_, p)| p == payload).count()
        };
        let listed = self.fail_on.iter().any(|p| p == payload);
        if listed && (!self.fail_once || attempts == 1) {
            return Err(HandlerError::Failed("device did not respond".to_string()));
        }
        Ok(())
    }
}

/// Router state over a memory broker and a JSON store in `dir`, with queues
/// for `device_types`.
pub async fn app_state(
    broker: &MemoryBroker,
    dir: &std::path::Path,
    device_types: &[&str],
) -> device_router::web_server::AppState {
    use device_router::metrics::Metrics;
    use device_router::{ConnectionManager, JsonDeviceStore, PublisherPool};

    let connection = Arc::new(ConnectionManager::from_connection(
        Arc::new(broker.connect("guest", "guest", "/").unwrap()),
        "memory",
    ));
    let topology = TopologyManager::new(connection.open_channel().await.unwrap());
    topology
        .declare_topic_exchange(device_router::routing::EXCHANGE_NAME)
        .await
        .unwrap();
    for device_type in device_types {
        topology
            .ensure_device_queue(&DeviceSelector::for_type(device_type))
            .await
            .unwrap();
    }

    let metrics = Arc::new(Metrics::new().unwrap());
    device_router::web_server::AppState {
        publishers: Arc::new(
            PublisherPool::new(
                Arc::clone(&connection) as Arc<dyn BrokerConnection>,
                CONFIRM_TIMEOUT,
            )
            .with_metrics(Arc::clone(&metrics)),
        ),
        store: Arc::new(JsonDeviceStore::new(dir.join("devices.json")).unwrap()),
        connection,
        metrics,
    }
}
