//! Backend device registry polled by the fleet reconciler

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::client::build_http_client;
use crate::config::BackendConfig;
use crate::error::{RegistryError, TransportError};

/// One device declared by the backend. Extra fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetRegistryEntry {
    pub device_id: i64,
    #[serde(default)]
    pub battery_level: Option<i64>,
}

impl FleetRegistryEntry {
    pub fn new(device_id: i64, battery_level: Option<i64>) -> Self {
        Self { device_id, battery_level }
    }
}

#[async_trait]
pub trait RegistryApi: Send + Sync {
    async fn fetch_devices(&self) -> Result<Vec<FleetRegistryEntry>, RegistryError>;
}

#[derive(Clone)]
pub struct HttpRegistryClient {
    http: reqwest::Client,
    config: BackendConfig,
}

impl HttpRegistryClient {
    pub fn new(config: BackendConfig) -> Result<Self, TransportError> {
        let http = build_http_client(&config)?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: BackendConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl RegistryApi for HttpRegistryClient {
    async fn fetch_devices(&self) -> Result<Vec<FleetRegistryEntry>, RegistryError> {
        let response = self
            .http
            .get(&self.config.registry_url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(TransportError::from)?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(RegistryError::Unauthorized),
            status if !status.is_success() => {
                Err(TransportError::BadStatus(status.as_u16()).into())
            }
            _ => {
                let entries = response
                    .json::<Vec<FleetRegistryEntry>>()
                    .await
                    .map_err(TransportError::from)?;
                Ok(entries)
            }
        }
    }
}
