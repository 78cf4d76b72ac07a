use crate::error::RoutingError;
use crate::routing::RoutingKey;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A device and its last reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    /// Device category (e.g. "tv", "air_conditioner")
    #[serde(rename = "type")]
    pub device_type: String,
    pub state: String,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        device_type: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            device_type: device_type.into(),
            state: state.into(),
        }
    }

    /// Type and state become routing-key segments, so they are held to the
    /// same rules.
    pub fn validate(&self) -> Result<(), RoutingError> {
        if self.id.is_empty() {
            return Err(RoutingError::EmptySegment("id".to_string()));
        }
        self.routing_key().map(|_| ())
    }

    pub fn routing_key(&self) -> Result<RoutingKey, RoutingError> {
        RoutingKey::for_device(&self.device_type, &self.state)
    }

    pub fn to_payload(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_payload(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}
