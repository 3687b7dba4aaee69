//! Simulated device state machine
//!
//! `DeviceState` holds everything one agent owns and the pure transitions of a
//! cycle (discharge, drift, depletion, overrides). The async run loop that
//! drives it lives in `agent`.

pub mod agent;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::channel::{ControlCommand, DeviceSnapshot};
use crate::client::{LatestMetricSnapshot, PostOutcome};

pub const BATTERY_MIN: i64 = 0;
pub const BATTERY_MAX: i64 = 100;
/// Per-axis bound of the position drift applied every powered cycle
pub const POSITION_DRIFT: f64 = 0.0001;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    device_id: i64,
    pub battery_level: i64,
    pub metric_level: i64,
    pub is_on: bool,
    pub is_active: bool,
    pub latitude: f64,
    pub longitude: f64,
    pub last_post_timestamp: Option<DateTime<Utc>>,
    pub last_response_body: Option<String>,
    cycles: u64,
}

impl DeviceState {
    /// Devices start powered; an empty starting battery is taken as a
    /// depletion edge by the first cycle.
    pub fn new(device_id: i64, battery_level: i64, metric_level: i64) -> Self {
        Self {
            device_id,
            battery_level: battery_level.clamp(BATTERY_MIN, BATTERY_MAX),
            metric_level,
            is_on: true,
            is_active: true,
            latitude: 0.0,
            longitude: 0.0,
            last_post_timestamp: None,
            last_response_body: None,
            cycles: 0,
        }
    }

    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    /// Powered cycles run so far
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Seed from the backend's last known metric. An empty battery starts the
    /// device off without an off-post: the backend already knows.
    pub fn seed_from(&mut self, latest: &LatestMetricSnapshot) {
        if let Some(value) = latest.value {
            self.metric_level = value;
        }
        if let Some(battery) = latest.battery_level {
            self.battery_level = battery;
        }
        self.latitude = latest.latitude.unwrap_or(0.0);
        self.longitude = latest.longitude.unwrap_or(0.0);
        if let Some(ts) = latest.timestamp {
            self.last_post_timestamp = Some(ts);
        }

        if self.battery_level <= 0 {
            self.battery_level = 0;
            self.is_on = false;
        }
        self.battery_level = self.battery_level.min(BATTERY_MAX);
    }

    pub fn should_send(&self) -> bool {
        self.is_on && self.is_active && self.battery_level > 0
    }

    /// Battery is empty while the device still believes it is on
    pub fn at_depletion_edge(&self) -> bool {
        self.battery_level <= 0 && self.is_on
    }

    /// Take the depletion edge. Returns false when there is no edge to take,
    /// so a single depletion powers down once.
    pub fn power_down(&mut self) -> bool {
        if !self.at_depletion_edge() {
            return false;
        }
        self.battery_level = 0;
        self.is_on = false;
        true
    }

    /// One simulated step of a powered cycle: position drift, fixed-cadence
    /// discharge, metric drift
    pub fn advance<R: Rng + ?Sized>(&mut self, rng: &mut R, discharge_pace: u64) {
        self.cycles += 1;

        self.latitude += rng.gen_range(-POSITION_DRIFT..=POSITION_DRIFT);
        self.longitude += rng.gen_range(-POSITION_DRIFT..=POSITION_DRIFT);

        if discharge_pace > 0 && self.cycles % discharge_pace == 0 {
            self.battery_level = (self.battery_level - 1).max(BATTERY_MIN);
        }

        self.metric_level += rng.gen_range(-1..=1);
    }

    pub fn apply(&mut self, command: &ControlCommand) {
        match *command {
            ControlCommand::SetBattery(value) => {
                let value = value.clamp(BATTERY_MIN, BATTERY_MAX);
                // Manual revival of a depleted device
                if self.battery_level == 0 && value > 0 {
                    self.is_on = true;
                }
                self.battery_level = value;
            }
            ControlCommand::SetMetric(value) => self.metric_level = value,
            ControlCommand::SetPower(on) => self.is_on = on,
            ControlCommand::SetActive(active) => self.is_active = active,
            ControlCommand::SetLatitude(value) => self.latitude = value,
            ControlCommand::SetLongitude(value) => self.longitude = value,
        }
    }

    pub fn record_post(&mut self, outcome: &PostOutcome) {
        self.last_post_timestamp = Some(outcome.attempted_at);
        self.last_response_body = Some(outcome.body_or_error.clone());
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.device_id,
            battery_level: self.battery_level,
            metric_level: self.metric_level,
            is_on: self.is_on,
            is_active: self.is_active,
            latitude: self.latitude,
            longitude: self.longitude,
            last_post_timestamp: self.last_post_timestamp,
            last_response_body: self.last_response_body.clone(),
        }
    }
}
