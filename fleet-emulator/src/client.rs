//! HTTP telemetry client for device agents
//!
//! Three calls, one uniform timeout/TLS policy:
//! - Latest metric read (seeds an agent's state at start)
//! - Metric post (one per powered, active cycle)
//! - Device-off post (one per depletion edge)
//!
//! Posts never fail: transport errors are captured into the outcome body
//! and the caller's cycle carries on.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::error::TransportError;

/// Last metric known to the backend for one device. Missing fields stay `None`
/// so the caller can fall back to its own defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatestMetricSnapshot {
    pub value: Option<i64>,
    pub battery_level: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LatestMetricSnapshot {
    pub fn from_json(body: &Value) -> Self {
        Self {
            value: body.get("value").and_then(as_integer),
            battery_level: body.get("batteryLevel").and_then(as_integer),
            latitude: body.get("latitude").and_then(Value::as_f64),
            longitude: body.get("longitude").and_then(Value::as_f64),
            timestamp: body
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_timestamp),
        }
    }
}

/// One telemetry report. `charge_level` travels as a query parameter,
/// the rest as the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricReport {
    pub device_id: i64,
    #[serde(skip)]
    pub charge_level: i64,
    pub value: i64,
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Result of a best-effort post, success or not
#[derive(Debug, Clone, PartialEq)]
pub struct PostOutcome {
    pub attempted_at: DateTime<Utc>,
    pub body_or_error: String,
    pub succeeded: bool,
}

impl PostOutcome {
    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            attempted_at: Utc::now(),
            body_or_error: format!("REQUEST ERROR:\n{}", error),
            succeeded: false,
        }
    }
}

/// Backend calls a device agent needs
#[async_trait]
pub trait TelemetryApi: Send + Sync {
    async fn fetch_latest_metric(&self, device_id: i64) -> Result<LatestMetricSnapshot, TransportError>;

    async fn post_metric(&self, report: &MetricReport) -> PostOutcome;

    async fn post_device_off(&self, device_id: i64) -> PostOutcome;
}

/// Build the shared reqwest client (timeout + certificate policy)
pub fn build_http_client(config: &BackendConfig) -> Result<reqwest::Client, TransportError> {
    reqwest::Client::builder()
        .timeout(config.request_timeout())
        .danger_accept_invalid_certs(config.accept_invalid_certs)
        .build()
        .map_err(TransportError::from)
}

/// ISO-8601 UTC at second precision, e.g. `2024-05-01T10:00:00Z`
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[derive(Clone)]
pub struct HttpTelemetryClient {
    http: reqwest::Client,
    config: BackendConfig,
}

impl HttpTelemetryClient {
    pub fn new(config: BackendConfig) -> Result<Self, TransportError> {
        let http = build_http_client(&config)?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: BackendConfig) -> Self {
        Self { http, config }
    }

    fn latest_metric_url(&self, device_id: i64) -> String {
        format!(
            "{}/api/devices/{}/metrics/latest",
            self.config.metrics_base_url.trim_end_matches('/'),
            device_id
        )
    }

    fn metrics_url(&self) -> String {
        format!("{}/api/metrics", self.config.collector_base_url.trim_end_matches('/'))
    }

    fn device_off_url(&self, device_id: i64) -> String {
        format!(
            "{}/api/devices/{}/off",
            self.config.collector_base_url.trim_end_matches('/'),
            device_id
        )
    }
}

#[async_trait]
impl TelemetryApi for HttpTelemetryClient {
    async fn fetch_latest_metric(&self, device_id: i64) -> Result<LatestMetricSnapshot, TransportError> {
        let response = self
            .http
            .get(self.latest_metric_url(device_id))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::BadStatus(status.as_u16()));
        }

        let body: Value = response.json().await?;
        Ok(LatestMetricSnapshot::from_json(&body))
    }

    async fn post_metric(&self, report: &MetricReport) -> PostOutcome {
        let result = self
            .http
            .post(self.metrics_url())
            .query(&[("chargeLevel", report.charge_level)])
            .json(report)
            .send()
            .await;

        match result {
            Ok(response) => render_outcome(report.device_id, "metric", response).await,
            Err(e) => {
                warn!("Device #{} metric POST error: {}", report.device_id, e);
                PostOutcome::failed(e)
            }
        }
    }

    async fn post_device_off(&self, device_id: i64) -> PostOutcome {
        match self.http.post(self.device_off_url(device_id)).send().await {
            Ok(response) => render_outcome(device_id, "off", response).await,
            Err(e) => {
                warn!("Device #{} off POST error: {}", device_id, e);
                PostOutcome::failed(e)
            }
        }
    }
}

/// Turn a collector response into an outcome: pretty JSON when the collector
/// says JSON, raw text otherwise
async fn render_outcome(device_id: i64, kind: &str, response: reqwest::Response) -> PostOutcome {
    let status = response.status();
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);

    let text = match response.text().await {
        Ok(text) => text,
        Err(e) => return PostOutcome::failed(e),
    };

    let body = if is_json {
        serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| serde_json::to_string_pretty(&v).ok())
            .unwrap_or(text)
    } else if text.is_empty() {
        "<empty response>".to_string()
    } else {
        text
    };

    if status.is_success() {
        debug!("Device #{} {} POST accepted ({})", device_id, kind, status);
    } else {
        warn!("Device #{} {} POST failed: {}", device_id, kind, status.as_u16());
    }

    PostOutcome {
        attempted_at: Utc::now(),
        body_or_error: body,
        succeeded: status.is_success(),
    }
}

fn as_integer(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_f64().map(|f| f as i64))
}

/// Accepts RFC 3339 (`Z` or offset) and zone-less ISO-8601, read as UTC
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
