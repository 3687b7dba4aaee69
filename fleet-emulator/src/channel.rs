//! Observation/control channel between agents and whoever watches them
//!
//! - `EventHub`: many agents -> many observers, tokio broadcast of `FleetEvent`
//! - `DeviceController`: observer -> one agent, override commands over mpsc
//!
//! The core never knows what sits on the other side (console, UI, tests).

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::error::ControlError;

/// Immutable copy of one device's state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: i64,
    pub battery_level: i64,
    pub metric_level: i64,
    pub is_on: bool,
    pub is_active: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub last_post_timestamp: Option<DateTime<Utc>>,
    pub last_response_body: Option<String>,
}

impl DeviceSnapshot {
    /// Whole seconds since the last post attempt, `None` if never posted
    pub fn seconds_since_last_post(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_post_timestamp
            .map(|ts| (now - ts).num_seconds().max(0))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FleetEvent {
    Snapshot(DeviceSnapshot),
    Status { device_id: i64, message: String },
    AgentStarted { device_id: i64 },
    AgentStopped { device_id: i64 },
    PollFailed { reason: String },
}

impl FleetEvent {
    pub fn device_id(&self) -> Option<i64> {
        match self {
            FleetEvent::Snapshot(s) => Some(s.device_id),
            FleetEvent::Status { device_id, .. }
            | FleetEvent::AgentStarted { device_id }
            | FleetEvent::AgentStopped { device_id } => Some(*device_id),
            FleetEvent::PollFailed { .. } => None,
        }
    }
}

/// Broadcast side of the channel. Cheap to clone, one clone per agent.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget: no observer attached is not an error
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn snapshot(&self, snapshot: DeviceSnapshot) {
        self.publish(FleetEvent::Snapshot(snapshot));
    }

    pub fn status(&self, device_id: i64, message: impl Into<String>) {
        self.publish(FleetEvent::Status {
            device_id,
            message: message.into(),
        });
    }
}

/// Override calls an observer may issue to a running agent
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    SetBattery(i64),
    SetMetric(i64),
    SetPower(bool),
    SetActive(bool),
    SetLatitude(f64),
    SetLongitude(f64),
}

/// Per-agent inbound endpoint; clones all reach the same agent
#[derive(Debug, Clone)]
pub struct DeviceController {
    device_id: i64,
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl DeviceController {
    pub fn channel(device_id: i64) -> (Self, mpsc::UnboundedReceiver<ControlCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { device_id, tx }, rx)
    }

    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    pub fn send(&self, command: ControlCommand) -> Result<(), ControlError> {
        self.tx
            .send(command)
            .map_err(|_| ControlError::AgentGone(self.device_id))
    }

    pub fn set_battery(&self, value: i64) -> Result<(), ControlError> {
        self.send(ControlCommand::SetBattery(value))
    }

    pub fn set_metric(&self, value: i64) -> Result<(), ControlError> {
        self.send(ControlCommand::SetMetric(value))
    }

    pub fn set_power(&self, on: bool) -> Result<(), ControlError> {
        self.send(ControlCommand::SetPower(on))
    }

    pub fn set_active(&self, active: bool) -> Result<(), ControlError> {
        self.send(ControlCommand::SetActive(active))
    }

    pub fn set_latitude(&self, value: f64) -> Result<(), ControlError> {
        self.send(ControlCommand::SetLatitude(value))
    }

    pub fn set_longitude(&self, value: f64) -> Result<(), ControlError> {
        self.send(ControlCommand::SetLongitude(value))
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}
