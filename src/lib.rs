pub mod app;
pub mod broker;
pub mod config;
pub mod connection_manager;
pub mod consumer;
pub mod device;
pub mod device_store;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod producer;
pub mod publisher;
pub mod routing;
pub mod topology;
pub mod web_server;

pub use app::DeviceRouter;
pub use config::Settings;
pub use connection_manager::ConnectionManager;
pub use consumer::{Consumer, ConsumerStats, DeliveryOutcome};
pub use device::Device;
pub use device_store::{DeviceStore, JsonDeviceStore};
pub use handler::{DeviceEvent, DeviceEventHandler, EventHandler};
pub use publisher::{PooledPublisher, Publisher, PublisherPool};
pub use routing::{BindingPattern, RoutingKey};
pub use topology::{DeviceSelector, TopologyManager};
