//! In-memory backend doubles for agent and reconciler tests

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::channel::{DeviceSnapshot, FleetEvent};
use crate::client::{LatestMetricSnapshot, MetricReport, PostOutcome, TelemetryApi};
use crate::error::{RegistryError, TransportError};
use crate::registry::{FleetRegistryEntry, RegistryApi};

/// Telemetry double: serves a fixed latest metric (404 when unset) and
/// records every post
#[derive(Default)]
pub struct RecordingTelemetry {
    latest: Mutex<Option<LatestMetricSnapshot>>,
    metrics: Mutex<Vec<MetricReport>>,
    offs: Mutex<Vec<i64>>,
    fetches: Mutex<Vec<i64>>,
    post_delay: Option<Duration>,
}

impl RecordingTelemetry {
    /// Metric posts take `delay` to complete; recorded on completion
    pub fn with_post_delay(delay: Duration) -> Self {
        Self {
            post_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn with_latest(latest: LatestMetricSnapshot) -> Self {
        let telemetry = Self::default();
        *telemetry.latest.lock().unwrap() = Some(latest);
        telemetry
    }

    pub fn metrics(&self) -> Vec<MetricReport> {
        self.metrics.lock().unwrap().clone()
    }

    pub fn metrics_for(&self, device_id: i64) -> usize {
        self.metrics
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.device_id == device_id)
            .count()
    }

    pub fn offs(&self) -> Vec<i64> {
        self.offs.lock().unwrap().clone()
    }

    pub fn fetches(&self) -> Vec<i64> {
        self.fetches.lock().unwrap().clone()
    }

    fn accepted() -> PostOutcome {
        PostOutcome {
            attempted_at: Utc::now(),
            body_or_error: "{}".to_string(),
            succeeded: true,
        }
    }
}

#[async_trait]
impl TelemetryApi for RecordingTelemetry {
    async fn fetch_latest_metric(&self, device_id: i64) -> Result<LatestMetricSnapshot, TransportError> {
        self.fetches.lock().unwrap().push(device_id);
        self.latest
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::BadStatus(404))
    }

    async fn post_metric(&self, report: &MetricReport) -> PostOutcome {
        if let Some(delay) = self.post_delay {
            tokio::time::sleep(delay).await;
        }
        self.metrics.lock().unwrap().push(report.clone());
        Self::accepted()
    }

    async fn post_device_off(&self, device_id: i64) -> PostOutcome {
        self.offs.lock().unwrap().push(device_id);
        Self::accepted()
    }
}

/// Registry double whose next answer the test controls
pub struct StaticRegistry {
    answer: Mutex<Result<Vec<FleetRegistryEntry>, RegistryError>>,
    polls: Mutex<usize>,
    stall: Mutex<Option<Duration>>,
}

impl StaticRegistry {
    pub fn new(entries: Vec<FleetRegistryEntry>) -> Self {
        Self {
            answer: Mutex::new(Ok(entries)),
            polls: Mutex::new(0),
            stall: Mutex::new(None),
        }
    }

    pub fn set_entries(&self, entries: Vec<FleetRegistryEntry>) {
        *self.answer.lock().unwrap() = Ok(entries);
    }

    pub fn set_error(&self, error: RegistryError) {
        *self.answer.lock().unwrap() = Err(error);
    }

    /// Next poll hangs for `delay` before answering
    pub fn stall_next(&self, delay: Duration) {
        *self.stall.lock().unwrap() = Some(delay);
    }

    pub fn polls(&self) -> usize {
        *self.polls.lock().unwrap()
    }
}

#[async_trait]
impl RegistryApi for StaticRegistry {
    async fn fetch_devices(&self) -> Result<Vec<FleetRegistryEntry>, RegistryError> {
        *self.polls.lock().unwrap() += 1;
        let stall = self.stall.lock().unwrap().take();
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        self.answer.lock().unwrap().clone()
    }
}

/// Next snapshot for `device_id`, skipping every other event
pub async fn next_snapshot(rx: &mut broadcast::Receiver<FleetEvent>, device_id: i64) -> DeviceSnapshot {
    loop {
        match rx.recv().await {
            Ok(FleetEvent::Snapshot(snapshot)) if snapshot.device_id == device_id => return snapshot,
            Ok(_) => continue,
            Err(e) => panic!("event stream broken: {e}"),
        }
    }
}

/// First snapshot for `device_id` satisfying `predicate`, within a bounded
/// number of snapshots
pub async fn snapshot_matching<F>(
    rx: &mut broadcast::Receiver<FleetEvent>,
    device_id: i64,
    predicate: F,
) -> DeviceSnapshot
where
    F: Fn(&DeviceSnapshot) -> bool,
{
    for _ in 0..50 {
        let snapshot = next_snapshot(rx, device_id).await;
        if predicate(&snapshot) {
            return snapshot;
        }
    }
    panic!("no matching snapshot for device {device_id}");
}

/// Drain every pending event, returning the last snapshot among them
pub fn drain_latest_snapshot(rx: &mut broadcast::Receiver<FleetEvent>, device_id: i64) -> Option<DeviceSnapshot> {
    let mut latest = None;
    while let Ok(event) = rx.try_recv() {
        if let FleetEvent::Snapshot(snapshot) = event {
            if snapshot.device_id == device_id {
                latest = Some(snapshot);
            }
        }
    }
    latest
}
