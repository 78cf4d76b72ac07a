use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "DEVICE_ROUTER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "./config/device-router.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub database: DatabaseSettings,
    #[serde(default)]
    pub server: ServerSettings,
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub producer: ProducerSettings,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    pub user: String,
    pub password: String,
    /// host[:port] of the AMQP broker
    pub host: String,
    pub vhost: String,
    #[serde(default = "default_confirm_timeout")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Path to the device store file
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    pub prefetch_count: u16,
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSettings {
    #[serde(default = "default_server_url")]
    pub server_url: String,
}

fn default_confirm_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handler_timeout() -> u64 {
    30
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_server_port(),
        }
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
        }
    }
}

// Password stays out of logs
impl std::fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("user", &self.user)
            .field("password", &"********")
            .field("host", &self.host)
            .field("vhost", &self.vhost)
            .field("confirm_timeout_secs", &self.confirm_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl BrokerSettings {
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}/{}",
            self.user,
            self.password,
            self.host,
            encode_vhost(&self.vhost)
        )
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// The default vhost `/` has to travel percent-encoded in the URI path.
fn encode_vhost(vhost: &str) -> String {
    vhost.replace('%', "%25").replace('/', "%2F")
}

impl ConsumerSettings {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::from_file(&config_path)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(contents).with_context(|| "Failed to parse TOML configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let broker = &self.broker;
        for (field, value) in [
            ("broker.user", &broker.user),
            ("broker.password", &broker.password),
            ("broker.host", &broker.host),
            ("broker.vhost", &broker.vhost),
            ("database.path", &self.database.path),
        ] {
            if value.trim().is_empty() {
                anyhow::bail!("{} must not be empty", field);
            }
        }
        if self.consumer.prefetch_count == 0 {
            anyhow::bail!("consumer.prefetch_count must be greater than zero");
        }
        if broker.confirm_timeout_secs == 0 {
            anyhow::bail!("broker.confirm_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}
