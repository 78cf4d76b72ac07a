use crate::device::Device;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Device persistence used by the HTTP boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Inserts `device`, or overwrites only the state of an existing id.
    async fn upsert(&self, device: Device) -> Result<Device>;

    /// Returns false when no device has this id.
    async fn update_state(&self, id: &str, state: &str) -> Result<bool>;

    async fn get(&self, id: &str) -> Result<Option<Device>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDevice {
    #[serde(flatten)]
    device: Device,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct DeviceFile {
    devices: HashMap<String, StoredDevice>,
}

/// JSON file backed store. Every write is persisted before it returns.
pub struct JsonDeviceStore {
    store_path: PathBuf,
    store: RwLock<DeviceFile>,
}

impl JsonDeviceStore {
    pub fn new<P: AsRef<Path>>(store_path: P) -> Result<Self> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let store = if store_path.exists() {
            let contents = std::fs::read_to_string(&store_path)
                .with_context(|| format!("Failed to read device store: {:?}", store_path))?;

            serde_json::from_str(&contents).unwrap_or_else(|e| {
                error!("Failed to parse device store, starting fresh: {}", e);
                DeviceFile::default()
            })
        } else {
            info!("No existing device store at {:?}, creating new one", store_path);
            DeviceFile::default()
        };
        info!("Loaded {} device(s) from storage", store.devices.len());

        Ok(Self {
            store_path,
            store: RwLock::new(store),
        })
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn save(&self, store: &DeviceFile) -> Result<()> {
        let json =
            serde_json::to_string_pretty(store).context("Failed to serialize device store")?;

        // Write to temp file first, then rename
        let temp_path = self.store_path.with_extension("tmp");
        std::fs::write(&temp_path, json)
            .with_context(|| format!("Failed to write temp file: {:?}", temp_path))?;

        std::fs::rename(&temp_path, &self.store_path)
            .with_context(|| format!("Failed to save device store: {:?}", self.store_path))?;

        Ok(())
    }
}

#[async_trait]
impl DeviceStore for JsonDeviceStore {
    async fn upsert(&self, device: Device) -> Result<Device> {
        let mut store = self.store.write().await;
        let mut next = store.clone();
        let now = Utc::now();

        let stored = match next.devices.get_mut(&device.id) {
            Some(existing) => {
                existing.device.state = device.state;
                existing.updated_at = now;
                existing.device.clone()
            }
            None => {
                next.devices.insert(
                    device.id.clone(),
                    StoredDevice {
                        device: device.clone(),
                        updated_at: now,
                    },
                );
                device
            }
        };

        // Memory only changes once the file has
        self.save(&next)?;
        *store = next;
        info!("Device '{}' stored with state '{}'", stored.id, stored.state);
        Ok(stored)
    }

    async fn update_state(&self, id: &str, state: &str) -> Result<bool> {
        let mut store = self.store.write().await;
        if !store.devices.contains_key(id) {
            return Ok(false);
        }
        let mut next = store.clone();
        if let Some(existing) = next.devices.get_mut(id) {
            existing.device.state = state.to_string();
            existing.updated_at = Utc::now();
        }

        self.save(&next)?;
        *store = next;
        Ok(true)
    }

    async fn get(&self, id: &str) -> Result<Option<Device>> {
        let store = self.store.read().await;
        Ok(store.devices.get(id).map(|s| s.device.clone()))
    }
}
