//! Device agent: one tokio task per simulated device
//!
//! Lifecycle: `Initializing -> Running <-> Idle -> Stopped`. `Stopped` is only
//! reached through cancellation. Overrides are applied between cycles, never
//! while one is running.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DeviceState;
use crate::channel::{ControlCommand, DeviceController, EventHub};
use crate::client::{iso_timestamp, MetricReport, PostOutcome, TelemetryApi};
use crate::config::AgentSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    Initializing,
    /// Powered on and cycling
    Running,
    /// Powered off, waiting for an external revival
    Idle,
    Stopped,
}

/// Owner-side handle of a running agent
pub struct AgentHandle {
    device_id: i64,
    controller: DeviceController,
    cancel: CancellationToken,
    status: watch::Receiver<AgentStatus>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn device_id(&self) -> i64 {
        self.device_id
    }

    pub fn controller(&self) -> DeviceController {
        self.controller.clone()
    }

    pub fn status(&self) -> AgentStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<AgentStatus> {
        self.status.clone()
    }

    /// Cancel and wait until the agent task has fully stopped. An in-flight
    /// backend call completes first; no further cycle starts.
    pub async fn shutdown(self) -> AgentStatus {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Device #{} agent task failed: {}", self.device_id, e);
        }
        let status = *self.status.borrow();
        status
    }
}

/// Spawn an agent seeded with `battery_level` (registry value or default)
pub fn spawn_agent(
    device_id: i64,
    battery_level: i64,
    telemetry: Arc<dyn TelemetryApi>,
    settings: AgentSettings,
    hub: EventHub,
) -> AgentHandle {
    let (controller, controls) = DeviceController::channel(device_id);
    let (status_tx, status_rx) = watch::channel(AgentStatus::Initializing);
    let cancel = CancellationToken::new();

    let rng = match settings.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ device_id as u64),
        None => StdRng::from_entropy(),
    };

    let agent = DeviceAgent {
        state: DeviceState::new(device_id, battery_level, settings.default_metric),
        telemetry,
        settings,
        hub,
        controls,
        cancel: cancel.clone(),
        status: status_tx,
        rng,
    };

    let task = tokio::spawn(agent.run());

    AgentHandle {
        device_id,
        controller,
        cancel,
        status: status_rx,
        task,
    }
}

struct DeviceAgent {
    state: DeviceState,
    telemetry: Arc<dyn TelemetryApi>,
    settings: AgentSettings,
    hub: EventHub,
    controls: mpsc::UnboundedReceiver<ControlCommand>,
    cancel: CancellationToken,
    status: watch::Sender<AgentStatus>,
    rng: StdRng,
}

impl DeviceAgent {
    async fn run(mut self) {
        let device_id = self.state.device_id();
        debug!("Device #{} agent started", device_id);

        self.initialize().await;
        self.hub.snapshot(self.state.snapshot());
        self.refresh_status();

        let mut ticker = interval(self.settings.cycle_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.wait_for_tick(&mut ticker).await {
            self.run_cycle().await;
        }

        self.set_status(AgentStatus::Stopped);
        info!("Device #{} agent stopped", device_id);
    }

    async fn initialize(&mut self) {
        let device_id = self.state.device_id();
        if self.cancel.is_cancelled() {
            return;
        }

        match self.telemetry.fetch_latest_metric(device_id).await {
            Ok(latest) => {
                self.state.seed_from(&latest);
                info!(
                    "Device #{} initialized from latest metric (battery={}, metric={}, ({}, {}))",
                    device_id,
                    self.state.battery_level,
                    self.state.metric_level,
                    self.state.longitude,
                    self.state.latitude
                );
                self.hub.status(device_id, "initialized from latest metric");
            }
            Err(e) => {
                warn!("Device #{} failed to fetch latest metric: {}", device_id, e);
                self.hub
                    .status(device_id, format!("latest metric unavailable ({}), using defaults", e));
            }
        }
    }

    /// Sleep until the next period boundary, applying overrides as they come.
    /// Returns false once cancelled.
    async fn wait_for_tick(&mut self, ticker: &mut Interval) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                Some(command) = self.controls.recv() => self.apply_control(command),
                _ = ticker.tick() => return true,
            }
        }
    }

    fn apply_control(&mut self, command: ControlCommand) {
        debug!("Device #{} override: {:?}", self.state.device_id(), command);
        self.state.apply(&command);
        self.refresh_status();
    }

    async fn run_cycle(&mut self) {
        // Edge from an override (battery set to 0 while on)
        if self.state.at_depletion_edge() {
            self.power_off().await;
        }

        if !self.state.is_on {
            return;
        }
        self.set_status(AgentStatus::Running);

        self.state.advance(&mut self.rng, self.settings.discharge_pace);

        // Edge from this cycle's discharge
        if self.state.at_depletion_edge() {
            self.power_off().await;
            return;
        }

        if self.state.should_send() {
            if self.cancel.is_cancelled() {
                return;
            }
            let report = MetricReport {
                device_id: self.state.device_id(),
                charge_level: self.state.battery_level,
                value: self.state.metric_level,
                timestamp: iso_timestamp(chrono::Utc::now()),
                latitude: self.state.latitude,
                longitude: self.state.longitude,
            };
            let outcome = self.telemetry.post_metric(&report).await;
            self.record(outcome, "metric");
        }

        self.hub.snapshot(self.state.snapshot());
    }

    async fn power_off(&mut self) {
        let device_id = self.state.device_id();
        if !self.state.power_down() {
            return;
        }
        self.set_status(AgentStatus::Idle);
        info!("Device #{} battery depleted, powering off", device_id);

        if !self.cancel.is_cancelled() {
            let outcome = self.telemetry.post_device_off(device_id).await;
            self.record(outcome, "off");
        }

        self.hub.snapshot(self.state.snapshot());
    }

    fn record(&mut self, outcome: PostOutcome, kind: &str) {
        if !outcome.succeeded {
            self.hub.status(
                self.state.device_id(),
                format!("{} POST failed: {}", kind, outcome.body_or_error),
            );
        }
        self.state.record_post(&outcome);
    }

    fn refresh_status(&self) {
        let status = if self.state.is_on {
            AgentStatus::Running
        } else {
            AgentStatus::Idle
        };
        self.set_status(status);
    }

    fn set_status(&self, status: AgentStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}
