use crate::device::Device;
use crate::web_server::PublishResponse;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered {status}, expected {expected}: {body}")]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        expected: StatusCode,
        body: String,
    },
}

/// Drives the HTTP API the way a device or app would.
pub struct ProducerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProducerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ProducerError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|source| ProducerError::Request {
                url: base_url.clone(),
                source,
            })?;
        Ok(Self { http, base_url })
    }

    pub async fn register_device(&self, device: &Device) -> Result<Device, ProducerError> {
        let url = format!("{}/devices", self.base_url);
        let response = self.post(&url, device, StatusCode::CREATED).await?;
        let stored = response
            .json::<Device>()
            .await
            .map_err(|source| ProducerError::Request { url, source })?;
        info!("Registered device '{}'", stored.id);
        Ok(stored)
    }

    /// Returns the routing key the server published under.
    pub async fn publish_event(&self, device: &Device) -> Result<String, ProducerError> {
        let url = format!("{}/publish", self.base_url);
        let response = self.post(&url, device, StatusCode::OK).await?;
        let published = response
            .json::<PublishResponse>()
            .await
            .map_err(|source| ProducerError::Request { url, source })?;
        info!(
            "Published '{}' for device '{}'",
            published.routing_key, device.id
        );
        Ok(published.routing_key)
    }

    async fn post(
        &self,
        url: &str,
        device: &Device,
        expected: StatusCode,
    ) -> Result<reqwest::Response, ProducerError> {
        debug!("POST {} for device '{}'", url, device.id);
        let response = self
            .http
            .post(url)
            .json(device)
            .send()
            .await
            .map_err(|source| ProducerError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status != expected {
            let body = response.text().await.unwrap_or_default();
            return Err(ProducerError::UnexpectedStatus {
                url: url.to_string(),
                status,
                expected,
                body,
            });
        }
        Ok(response)
    }
}
