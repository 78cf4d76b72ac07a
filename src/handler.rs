use crate::device::Device;
use crate::error::HandlerError;
use async_trait::async_trait;
use tracing::{info, warn};

/// Reacts to one consumed event. The consumer acknowledges the delivery only
/// when this returns `Ok`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, device_type: &str, payload: &[u8]) -> Result<(), HandlerError>;
}

/// Known device reactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    AirConditionerCooling,
    AirConditionerOff,
    TvOn,
    TvOff,
    LightsOn,
    LightsOff,
    HeaterHeating,
    HeaterOff,
    Unrecognized { device_type: String, state: String },
}

impl DeviceEvent {
    pub fn classify(device_type: &str, state: &str) -> Self {
        match (device_type, state) {
            ("air_conditioner", "cooling") => DeviceEvent::AirConditionerCooling,
            ("air_conditioner", "off") => DeviceEvent::AirConditionerOff,
            ("tv", "on") => DeviceEvent::TvOn,
            ("tv", "off") => DeviceEvent::TvOff,
            ("lights", "on") => DeviceEvent::LightsOn,
            ("lights", "off") => DeviceEvent::LightsOff,
            ("heater", "heating") => DeviceEvent::HeaterHeating,
            ("heater", "off") => DeviceEvent::HeaterOff,
            _ => DeviceEvent::Unrecognized {
                device_type: device_type.to_string(),
                state: state.to_string(),
            },
        }
    }

    pub fn description(&self) -> String {
        match self {
            DeviceEvent::AirConditionerCooling => "air conditioner started cooling".to_string(),
            DeviceEvent::AirConditionerOff => "air conditioner switched off".to_string(),
            DeviceEvent::TvOn => "tv switched on".to_string(),
            DeviceEvent::TvOff => "tv switched off".to_string(),
            DeviceEvent::LightsOn => "lights switched on".to_string(),
            DeviceEvent::LightsOff => "lights switched off".to_string(),
            DeviceEvent::HeaterHeating => "heater started heating".to_string(),
            DeviceEvent::HeaterOff => "heater switched off".to_string(),
            DeviceEvent::Unrecognized { device_type, state } => {
                format!("unrecognized state '{}' for '{}'", state, device_type)
            }
        }
    }
}

/// Default handler: decodes the device record and logs its reaction.
/// Undecodable and unrecognized events are accepted.
#[derive(Debug, Default, Clone)]
pub struct DeviceEventHandler;

#[async_trait]
impl EventHandler for DeviceEventHandler {
    async fn handle(&self, device_type: &str, payload: &[u8]) -> Result<(), HandlerError> {
        let device = match Device::from_payload(payload) {
            Ok(device) => device,
            Err(e) => {
                warn!(
                    "Discarding undecodable event for '{}' ({} bytes): {}",
                    device_type,
                    payload.len(),
                    e
                );
                return Ok(());
            }
        };

        match DeviceEvent::classify(&device.device_type, &device.state) {
            event @ DeviceEvent::Unrecognized { .. } => {
                warn!("Device {}: {}", device.id, event.description());
            }
            event => {
                info!("Device {}: {}", device.id, event.description());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_and_unknown() {
        assert_eq!(
            DeviceEvent::classify("air_conditioner", "cooling"),
            DeviceEvent::AirConditionerCooling
        );
        assert_eq!(DeviceEvent::classify("tv", "off"), DeviceEvent::TvOff);
        assert_eq!(
            DeviceEvent::classify("tv", "standby"),
            DeviceEvent::Unrecognized {
                device_type: "tv".to_string(),
                state: "standby".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_default_handler_accepts_everything() {
        let handler = DeviceEventHandler;
        let known = Device::new("ac1", "air_conditioner", "cooling")
            .to_payload()
            .unwrap();
        let unknown = Device::new("f1", "fridge", "defrost").to_payload().unwrap();

        assert!(handler.handle("air_conditioner", &known).await.is_ok());
        assert!(handler.handle("fridge", &unknown).await.is_ok());
        assert!(handler.handle("tv", b"not json").await.is_ok());
    }
}
