//! Fleet reconciler: keeps one running agent per device the backend declares
//!
//! Each poll:
//! 1. Fetch the registry (401 or any failure: fleet left as is, reported)
//! 2. Start an agent for every new device id, seeded with the registry battery
//! 3. Stop every agent whose device id disappeared, waiting for it to finish
//!
//! Polls run sequentially on one task, so they never overlap; a poll that
//! overruns its period makes the next one skip rather than queue.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{DeviceController, EventHub, FleetEvent};
use crate::client::TelemetryApi;
use crate::config::{AgentSettings, FleetSettings};
use crate::device::agent::{spawn_agent, AgentHandle, AgentStatus};
use crate::error::RegistryError;
use crate::registry::{FleetRegistryEntry, RegistryApi};

/// What one successful poll changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
    pub unchanged: usize,
}

pub struct FleetReconciler {
    registry: Arc<dyn RegistryApi>,
    telemetry: Arc<dyn TelemetryApi>,
    agent_settings: AgentSettings,
    fleet_settings: FleetSettings,
    hub: EventHub,
    agents: HashMap<i64, AgentHandle>,
    // Creation order, for observers that lay devices out
    order: Vec<i64>,
    fleet_tx: watch::Sender<Vec<DeviceController>>,
}

impl FleetReconciler {
    pub fn new(
        registry: Arc<dyn RegistryApi>,
        telemetry: Arc<dyn TelemetryApi>,
        agent_settings: AgentSettings,
        fleet_settings: FleetSettings,
        hub: EventHub,
    ) -> Self {
        let (fleet_tx, _) = watch::channel(Vec::new());
        Self {
            registry,
            telemetry,
            agent_settings,
            fleet_settings,
            hub,
            agents: HashMap::new(),
            order: Vec::new(),
            fleet_tx,
        }
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Current fleet as control endpoints, in creation order
    pub fn watch_fleet(&self) -> watch::Receiver<Vec<DeviceController>> {
        self.fleet_tx.subscribe()
    }

    pub fn device_ids(&self) -> Vec<i64> {
        self.order.clone()
    }

    pub fn controller(&self, device_id: i64) -> Option<DeviceController> {
        self.agents.get(&device_id).map(AgentHandle::controller)
    }

    pub fn agent_status(&self, device_id: i64) -> Option<AgentStatus> {
        self.agents.get(&device_id).map(AgentHandle::status)
    }

    /// Poll loop; returns once `shutdown` fires and every agent has stopped
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "Fleet reconciler started (poll interval: {}ms)",
            self.fleet_settings.poll_interval_ms
        );

        let mut ticker = interval(self.fleet_settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.reconcile_once().await {
                debug!("Poll ended without changes: {}", e);
            }
        }

        info!("Fleet reconciler shutting down ({} agents)", self.agents.len());
        self.shutdown_all().await;
    }

    /// One registry poll and the add/remove decisions it implies. On error
    /// the fleet is untouched.
    pub async fn reconcile_once(&mut self) -> Result<ReconcileReport, RegistryError> {
        let entries = match self.registry.fetch_devices().await {
            Ok(entries) => entries,
            Err(e) => {
                match e {
                    RegistryError::Unauthorized => warn!("Unauthorized (401), skipping this poll"),
                    ref other => warn!("Registry poll failed: {}", other),
                }
                self.hub.publish(FleetEvent::PollFailed { reason: e.to_string() });
                return Err(e);
            }
        };

        let incoming: HashSet<i64> = entries.iter().map(|e| e.device_id).collect();
        let mut report = ReconcileReport::default();

        for entry in &entries {
            if !self.agents.contains_key(&entry.device_id) {
                self.start_agent(entry);
                report.added.push(entry.device_id);
            }
        }

        let departed: Vec<i64> = self
            .order
            .iter()
            .filter(|id| !incoming.contains(id))
            .copied()
            .collect();
        for device_id in departed {
            self.stop_agent(device_id).await;
            report.removed.push(device_id);
        }

        report.unchanged = self.agents.len() - report.added.len();
        if !report.added.is_empty() || !report.removed.is_empty() {
            self.publish_fleet();
            info!(
                "Fleet reconciled: +{} -{} ({} running)",
                report.added.len(),
                report.removed.len(),
                self.agents.len()
            );
        } else {
            debug!("Fleet unchanged ({} running)", self.agents.len());
        }

        Ok(report)
    }

    /// Cancel every agent, then wait for all of them together
    pub async fn shutdown_all(&mut self) {
        let handles: Vec<AgentHandle> = self
            .order
            .drain(..)
            .filter_map(|id| self.agents.remove(&id))
            .collect();

        let stopped = futures::future::join_all(handles.into_iter().map(|handle| async move {
            let device_id = handle.device_id();
            handle.shutdown().await;
            device_id
        }))
        .await;

        for device_id in stopped {
            self.hub.publish(FleetEvent::AgentStopped { device_id });
        }
        self.publish_fleet();
    }

    fn start_agent(&mut self, entry: &FleetRegistryEntry) {
        // An empty registry battery is treated as unknown
        let battery = match entry.battery_level {
            Some(level) if level > 0 => level,
            _ => self.agent_settings.default_battery,
        };

        let handle = spawn_agent(
            entry.device_id,
            battery,
            self.telemetry.clone(),
            self.agent_settings.clone(),
            self.hub.clone(),
        );

        info!("Added device {} (battery={})", entry.device_id, battery);
        self.agents.insert(entry.device_id, handle);
        self.order.push(entry.device_id);
        self.hub.publish(FleetEvent::AgentStarted {
            device_id: entry.device_id,
        });
    }

    async fn stop_agent(&mut self, device_id: i64) {
        self.order.retain(|id| *id != device_id);
        if let Some(handle) = self.agents.remove(&device_id) {
            handle.shutdown().await;
            info!("Removed device {}", device_id);
            self.hub.publish(FleetEvent::AgentStopped { device_id });
        }
    }

    fn publish_fleet(&self) {
        let fleet: Vec<DeviceController> = self
            .order
            .iter()
            .filter_map(|id| self.agents.get(id).map(AgentHandle::controller))
            .collect();
        self.fleet_tx.send_replace(fleet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ControlError, TransportError};
    use crate::testing::{next_snapshot, snapshot_matching, RecordingTelemetry, StaticRegistry};
    use std::time::Duration;
    use tokio::sync::broadcast;

    fn entry(device_id: i64, battery: Option<i64>) -> FleetRegistryEntry {
        FleetRegistryEntry::new(device_id, battery)
    }

    fn reconciler(
        registry: &Arc<StaticRegistry>,
        telemetry: &Arc<RecordingTelemetry>,
    ) -> (FleetReconciler, broadcast::Receiver<FleetEvent>) {
        let hub = EventHub::new(4096);
        let rx = hub.subscribe();
        let agent_settings = AgentSettings {
            rng_seed: Some(1),
            ..AgentSettings::default()
        };
        let reconciler = FleetReconciler::new(
            registry.clone(),
            telemetry.clone(),
            agent_settings,
            FleetSettings::default(),
            hub,
        );
        (reconciler, rx)
    }

    fn lifecycle_events(rx: &mut broadcast::Receiver<FleetEvent>) -> Vec<FleetEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                FleetEvent::AgentStarted { .. } | FleetEvent::AgentStopped { .. } | FleetEvent::PollFailed { .. } => {
                    events.push(event)
                }
                _ => {}
            }
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_devices_get_agents_seeded_from_registry() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(7, Some(3)), entry(8, None)]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, mut rx) = reconciler(&registry, &telemetry);

        let report = fleet.reconcile_once().await.unwrap();
        assert_eq!(report.added, vec![7, 8]);
        assert!(report.removed.is_empty());
        assert_eq!(fleet.device_ids(), vec![7, 8]);

        assert_eq!(next_snapshot(&mut rx, 7).await.battery_level, 3);
        assert_eq!(next_snapshot(&mut rx, 8).await.battery_level, 100);

        fleet.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_poll_leaves_fleet_unchanged() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(1, Some(50)), entry(2, Some(60))]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, mut rx) = reconciler(&registry, &telemetry);

        fleet.reconcile_once().await.unwrap();
        let before = fleet.device_ids();
        lifecycle_events(&mut rx);

        registry.set_error(RegistryError::Unauthorized);
        let err = fleet.reconcile_once().await.unwrap_err();
        assert_eq!(err, RegistryError::Unauthorized);
        assert_eq!(fleet.device_ids(), before);
        assert!(fleet.agent_status(1).is_some());
        assert!(fleet.controller(1).unwrap().is_connected());
        assert!(fleet.controller(2).unwrap().is_connected());

        let events = lifecycle_events(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], FleetEvent::PollFailed { .. }));

        fleet.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_leaves_fleet_unchanged() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(1, Some(50))]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, mut rx) = reconciler(&registry, &telemetry);
        fleet.reconcile_once().await.unwrap();
        // Agent has initialised once its first snapshot is out
        next_snapshot(&mut rx, 1).await;

        registry.set_error(RegistryError::Transport(TransportError::BadStatus(500)));
        assert!(fleet.reconcile_once().await.is_err());
        registry.set_error(RegistryError::Transport(TransportError::NetworkFailure("refused".into())));
        assert!(fleet.reconcile_once().await.is_err());

        assert_eq!(fleet.device_ids(), vec![1]);
        assert_eq!(telemetry.fetches(), vec![1]);

        fleet.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_surviving_device_keeps_its_agent() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(4, Some(90))]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, mut rx) = reconciler(&registry, &telemetry);
        fleet.reconcile_once().await.unwrap();
        next_snapshot(&mut rx, 4).await;

        // Local-only mutation the registry knows nothing about
        fleet.controller(4).unwrap().set_active(false).unwrap();
        snapshot_matching(&mut rx, 4, |s| !s.is_active).await;

        // Registry now reports a different battery: must not reach the agent
        registry.set_entries(vec![entry(4, Some(10))]);
        let report = fleet.reconcile_once().await.unwrap();
        assert!(report.added.is_empty());
        assert_eq!(report.unchanged, 1);

        let snapshot = next_snapshot(&mut rx, 4).await;
        assert!(!snapshot.is_active);
        assert!(snapshot.battery_level >= 88);
        assert_eq!(telemetry.fetches(), vec![4]);

        fleet.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_device_is_stopped_before_poll_returns() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(1, Some(50)), entry(2, Some(50))]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, _rx) = reconciler(&registry, &telemetry);
        fleet.reconcile_once().await.unwrap();

        let controller = fleet.controller(2).unwrap();
        let status = fleet.agents.get(&2).unwrap().watch_status();

        registry.set_entries(vec![entry(1, Some(50))]);
        let report = fleet.reconcile_once().await.unwrap();

        assert_eq!(report.removed, vec![2]);
        assert_eq!(*status.borrow(), AgentStatus::Stopped);
        assert_eq!(controller.set_power(true), Err(ControlError::AgentGone(2)));
        assert_eq!(fleet.device_ids(), vec![1]);
        assert_eq!(fleet.agent_status(2), None);

        fleet.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_readded_device_gets_a_fresh_agent() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(3, Some(70)), entry(5, Some(70))]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, mut rx) = reconciler(&registry, &telemetry);
        fleet.reconcile_once().await.unwrap();
        next_snapshot(&mut rx, 3).await;
        next_snapshot(&mut rx, 5).await;
        lifecycle_events(&mut rx);

        registry.set_entries(vec![entry(5, Some(70))]);
        fleet.reconcile_once().await.unwrap();
        registry.set_entries(vec![entry(3, Some(70)), entry(5, Some(70))]);
        let report = fleet.reconcile_once().await.unwrap();

        assert_eq!(report.added, vec![3]);
        assert_eq!(
            lifecycle_events(&mut rx),
            vec![
                FleetEvent::AgentStopped { device_id: 3 },
                FleetEvent::AgentStarted { device_id: 3 },
            ]
        );
        // Fresh agent re-initialises from the backend; re-added goes last
        next_snapshot(&mut rx, 3).await;
        assert_eq!(telemetry.fetches().iter().filter(|id| **id == 3).count(), 2);
        assert_eq!(fleet.device_ids(), vec![5, 3]);

        fleet.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_registry_entries_start_one_agent() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(9, Some(10)), entry(9, Some(20))]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, mut rx) = reconciler(&registry, &telemetry);

        let report = fleet.reconcile_once().await.unwrap();
        assert_eq!(report.added, vec![9]);
        assert_eq!(fleet.device_ids(), vec![9]);
        assert_eq!(next_snapshot(&mut rx, 9).await.battery_level, 10);

        fleet.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_battery_seeds_default() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(7, Some(0)), entry(8, Some(-4))]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, mut rx) = reconciler(&registry, &telemetry);
        fleet.reconcile_once().await.unwrap();

        let initial = next_snapshot(&mut rx, 7).await;
        assert_eq!(initial.battery_level, 100);
        assert!(initial.is_on);
        assert_eq!(next_snapshot(&mut rx, 8).await.battery_level, 100);

        let first_cycle = next_snapshot(&mut rx, 7).await;
        assert!(first_cycle.is_on);
        assert!(telemetry.offs().is_empty());
        assert_eq!(telemetry.metrics_for(7), 1);

        fleet.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_poll_skips_missed_ticks() {
        let registry = Arc::new(StaticRegistry::new(vec![]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (fleet, _rx) = reconciler(&registry, &telemetry);

        // First poll takes 12s against a 5s interval
        registry.stall_next(Duration::from_millis(12_000));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(fleet.run(shutdown.clone()));

        // Missed ticks at 5s and 10s collapse into one poll at 12s
        tokio::time::sleep(Duration::from_millis(12_500)).await;
        assert_eq!(registry.polls(), 2);

        // Back on the 5s grid: 15s, 20s
        tokio::time::sleep(Duration::from_millis(8_500)).await;
        assert_eq!(registry.polls(), 4);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_watch_follows_creation_order() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(2, None), entry(1, None)]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (mut fleet, _rx) = reconciler(&registry, &telemetry);
        let watch = fleet.watch_fleet();

        fleet.reconcile_once().await.unwrap();
        let ids: Vec<i64> = watch.borrow().iter().map(DeviceController::device_id).collect();
        assert_eq!(ids, vec![2, 1]);

        registry.set_entries(vec![entry(1, None), entry(6, None)]);
        fleet.reconcile_once().await.unwrap();
        let ids: Vec<i64> = watch.borrow().iter().map(DeviceController::device_id).collect();
        assert_eq!(ids, vec![1, 6]);

        fleet.shutdown_all().await;
        assert!(watch.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_until_shutdown_then_stops_every_agent() {
        let registry = Arc::new(StaticRegistry::new(vec![entry(1, Some(80)), entry(2, Some(80))]));
        let telemetry = Arc::new(RecordingTelemetry::default());
        let (fleet, mut rx) = reconciler(&registry, &telemetry);
        let watch = fleet.watch_fleet();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(fleet.run(shutdown.clone()));

        // Polls at 0s, 5s and 10s
        tokio::time::sleep(Duration::from_millis(12_000)).await;
        assert_eq!(registry.polls(), 3);
        assert_eq!(watch.borrow().len(), 2);
        let controllers = watch.borrow().clone();

        shutdown.cancel();
        task.await.unwrap();

        assert!(controllers.iter().all(|c| !c.is_connected()));
        let stopped = lifecycle_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, FleetEvent::AgentStopped { .. }))
            .count();
        assert_eq!(stopped, 2);
        assert!(watch.borrow().is_empty());
    }

    // Real clock and real HTTP: registry [{7, battery 3}], nothing stored for
    // device 7, battery drops every cycle.
    #[tokio::test]
    async fn test_depleting_device_against_http_backend() {
        use crate::client::HttpTelemetryClient;
        use crate::config::BackendConfig;
        use crate::registry::HttpRegistryClient;
        use fleet_devkit::{BackendPayloads, Route, TestHarness};

        let mut harness = TestHarness::new().await.unwrap();
        harness.backend.require_credentials("manager@example.com", "managerpass");
        harness
            .backend
            .set_devices(vec![BackendPayloads::registry_entry(7, Some(3))]);

        let backend_config = BackendConfig {
            registry_url: harness.backend.registry_url(),
            metrics_base_url: harness.backend.base_url(),
            collector_base_url: harness.backend.base_url(),
            username: "manager@example.com".to_string(),
            password: "managerpass".to_string(),
            request_timeout_secs: 5,
            accept_invalid_certs: true,
        };
        let agent_settings = AgentSettings {
            cycle_period_ms: 20,
            discharge_pace: 1,
            rng_seed: Some(3),
            ..AgentSettings::default()
        };

        let fleet = FleetReconciler::new(
            Arc::new(HttpRegistryClient::new(backend_config.clone()).unwrap()),
            Arc::new(HttpTelemetryClient::new(backend_config).unwrap()),
            agent_settings,
            FleetSettings::default(),
            EventHub::new(256),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(fleet.run(shutdown.clone()));

        assert!(harness.wait_until(3000, |b| !b.off_calls().is_empty()).await);
        // Powered-off device stays quiet for a few more cycles
        tokio::time::sleep(Duration::from_millis(150)).await;

        harness
            .expect_requests(Route::Registry, 1)
            .expect_requests(Route::LatestMetric, 1)
            .expect_requests(Route::PostMetric, 2)
            .expect_requests(Route::DeviceOff, 1);
        harness.verify_expectations().unwrap();

        let metrics = harness.backend.metrics_for(7);
        assert_eq!(metrics[0].charge_level, Some(2));
        assert_eq!(metrics[1].charge_level, Some(1));
        assert_eq!(harness.backend.off_calls(), vec![7]);

        shutdown.cancel();
        task.await.unwrap();
    }
}
