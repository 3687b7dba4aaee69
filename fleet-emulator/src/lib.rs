//! Fleet Emulator - concurrent telemetry device fleet driven by a live backend
//!
//! - `reconciler`: polls the device registry, one agent per declared device
//! - `device`: per-device state machine and its async agent loop
//! - `client` / `registry`: HTTP seams to the telemetry and registry backends
//! - `channel`: snapshot broadcast and override commands for observers

pub mod channel;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod reconciler;
pub mod registry;

#[cfg(test)]
mod testing;

pub use channel::{ControlCommand, DeviceController, DeviceSnapshot, EventHub, FleetEvent};
pub use client::{HttpTelemetryClient, LatestMetricSnapshot, MetricReport, PostOutcome, TelemetryApi};
pub use config::EmulatorConfig;
pub use device::agent::{spawn_agent, AgentHandle, AgentStatus};
pub use error::{ControlError, RegistryError, TransportError};
pub use reconciler::{FleetReconciler, ReconcileReport};
pub use registry::{FleetRegistryEntry, HttpRegistryClient, RegistryApi};
