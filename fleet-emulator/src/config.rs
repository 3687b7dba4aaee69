//! Configuration management for the fleet emulator
//!
//! Handles:
//! - Backend endpoints and credentials
//! - Device agent timing and discharge settings
//! - Registry polling settings
//! - TOML file storage in the OS config directory

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "FLEET_EMULATOR_CONFIG";
pub const USERNAME_ENV: &str = "FLEET_EMULATOR_USERNAME";
pub const PASSWORD_ENV: &str = "FLEET_EMULATOR_PASSWORD";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub backend: BackendConfig,
    pub agent: AgentSettings,
    pub fleet: FleetSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Device registry endpoint polled by the reconciler
    pub registry_url: String,
    /// Origin serving `/api/devices/{id}/metrics/latest`
    pub metrics_base_url: String,
    /// Origin receiving metric and device-off posts
    pub collector_base_url: String,
    pub username: String,
    #[serde(skip_serializing)] // Never write the password back to disk
    pub password: String,
    pub request_timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub cycle_period_ms: u64,
    /// Battery drops by one every `discharge_pace` powered cycles
    pub discharge_pace: u64,
    pub default_battery: i64,
    pub default_metric: i64,
    pub rng_seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSettings {
    pub poll_interval_ms: u64,
    pub event_capacity: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            registry_url: "http://localhost:8080/api/devices".to_string(),
            metrics_base_url: "http://localhost:8181".to_string(),
            collector_base_url: "https://localhost:9000".to_string(),
            username: "manager@example.com".to_string(),
            password: String::new(),
            request_timeout_secs: 30,
            accept_invalid_certs: true,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            cycle_period_ms: 1000,
            discharge_pace: 5,
            default_battery: 100,
            default_metric: 50,
            rng_seed: None,
        }
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
            event_capacity: 256,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AgentSettings {
    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }
}

impl FleetSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl EmulatorConfig {
    /// Load config from `FLEET_EMULATOR_CONFIG` or the OS config directory,
    /// then apply credential overrides from the environment
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            Self::from_toml(&content)?
        } else {
            // No file yet - run with defaults
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(content)?)
    }

    /// Get config file path, env override first
    pub fn config_file_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }

        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("fleet-emulator");
        path.push("config.toml");
        Ok(path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(username) = std::env::var(USERNAME_ENV) {
            self.backend.username = username;
        }
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            self.backend.password = password;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.cycle_period_ms == 0 {
            bail!("agent.cycle_period_ms must be greater than zero");
        }
        if self.agent.discharge_pace == 0 {
            bail!("agent.discharge_pace must be greater than zero");
        }
        if self.fleet.poll_interval_ms == 0 {
            bail!("fleet.poll_interval_ms must be greater than zero");
        }
        if self.fleet.event_capacity == 0 {
            bail!("fleet.event_capacity must be greater than zero");
        }
        if self.backend.request_timeout_secs == 0 {
            bail!("backend.request_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}
