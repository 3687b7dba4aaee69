/*!
Backend HTTP simulé pour tester l'émulateur sans serveur réel

Sert les quatre routes utilisées par l'émulateur sur un port éphémère:
- GET  /api/devices                      (registre, basic auth)
- GET  /api/devices/{id}/metrics/latest  (dernière métrique, basic auth)
- POST /api/metrics?chargeLevel=N        (collecteur)
- POST /api/devices/{id}/off             (collecteur)

Enregistre toutes les requêtes reçues pour les assertions de tests.
*/

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Routes servies par le backend simulé
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Registry,
    LatestMetric,
    PostMetric,
    DeviceOff,
}

/// Métrique reçue par le collecteur
#[derive(Debug, Clone)]
pub struct RecordedMetric {
    pub charge_level: Option<i64>,
    pub body: Value,
}

#[derive(Debug, Clone)]
struct CollectorResponse {
    status: u16,
    content_type: String,
    body: String,
}

impl Default for CollectorResponse {
    fn default() -> Self {
        Self {
            status: 200,
            content_type: "application/json".to_string(),
            body: r#"{"status":"ok"}"#.to_string(),
        }
    }
}

#[derive(Default)]
struct BackendState {
    credentials: Option<(String, String)>,
    devices: Vec<Value>,
    registry_status: Option<u16>,
    latest: HashMap<i64, Value>,
    collector: CollectorResponse,
    metrics: Vec<RecordedMetric>,
    offs: Vec<i64>,
    hits: HashMap<Route, usize>,
}

impl BackendState {
    fn hit(&mut self, route: Route) {
        *self.hits.entry(route).or_insert(0) += 1;
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some((username, password)) = &self.credentials else {
            return true;
        };

        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .and_then(|raw| String::from_utf8(raw).ok())
            .map(|decoded| decoded == format!("{}:{}", username, password))
            .unwrap_or(false)
    }
}

type Shared = Arc<Mutex<BackendState>>;

/// Backend simulé; le serveur s'arrête quand l'instance est droppée
pub struct MockBackend {
    addr: SocketAddr,
    state: Shared,
    shutdown: Option<oneshot::Sender<()>>,
}

impl MockBackend {
    /// Démarre le serveur sur 127.0.0.1 avec un port éphémère
    pub async fn start() -> Result<Self> {
        let state: Shared = Arc::new(Mutex::new(BackendState::default()));

        let app = Router::new()
            .route("/api/devices", get(list_devices))
            .route("/api/devices/{id}/metrics/latest", get(latest_metric))
            .route("/api/devices/{id}/off", post(device_off))
            .route("/api/metrics", post(collect_metric))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                shutdown_rx.await.ok();
            });
            if let Err(e) = server.await {
                log::error!("❌ [MOCK] Backend server error: {}", e);
            }
        });

        log::info!("🧪 [MOCK] Backend listening on {}", addr);
        Ok(Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn registry_url(&self) -> String {
        format!("{}/api/devices", self.base_url())
    }

    /// Active le basic auth sur le registre et la dernière métrique
    pub fn require_credentials(&self, username: &str, password: &str) {
        self.state.lock().unwrap().credentials = Some((username.to_string(), password.to_string()));
    }

    pub fn set_devices(&self, devices: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state.devices = devices;
        state.registry_status = None;
    }

    /// Force un statut d'erreur sur le registre
    pub fn set_registry_status(&self, status: u16) {
        self.state.lock().unwrap().registry_status = Some(status);
    }

    pub fn set_latest_metric(&self, device_id: i64, payload: Value) {
        self.state.lock().unwrap().latest.insert(device_id, payload);
    }

    /// Réponse renvoyée par les deux routes du collecteur
    pub fn set_collector_response(&self, status: u16, content_type: &str, body: &str) {
        self.state.lock().unwrap().collector = CollectorResponse {
            status,
            content_type: content_type.to_string(),
            body: body.to_string(),
        };
    }

    pub fn posted_metrics(&self) -> Vec<RecordedMetric> {
        self.state.lock().unwrap().metrics.clone()
    }

    /// Métriques reçues pour un device donné
    pub fn metrics_for(&self, device_id: i64) -> Vec<RecordedMetric> {
        self.posted_metrics()
            .into_iter()
            .filter(|m| m.body["deviceId"].as_i64() == Some(device_id))
            .collect()
    }

    pub fn off_calls(&self) -> Vec<i64> {
        self.state.lock().unwrap().offs.clone()
    }

    pub fn request_count(&self, route: Route) -> usize {
        self.state
            .lock()
            .unwrap()
            .hits
            .get(&route)
            .copied()
            .unwrap_or(0)
    }

    /// Reset des requêtes enregistrées (la configuration est conservée)
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.metrics.clear();
        state.offs.clear();
        state.hits.clear();
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn collector_reply(collector: &CollectorResponse) -> Response {
    (
        status(collector.status),
        [(header::CONTENT_TYPE, collector.content_type.clone())],
        collector.body.clone(),
    )
        .into_response()
}

async fn list_devices(State(state): State<Shared>, headers: HeaderMap) -> Response {
    let mut state = state.lock().unwrap();
    state.hit(Route::Registry);

    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if let Some(code) = state.registry_status {
        return status(code).into_response();
    }
    Json(Value::Array(state.devices.clone())).into_response()
}

async fn latest_metric(
    State(state): State<Shared>,
    Path(device_id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let mut state = state.lock().unwrap();
    state.hit(Route::LatestMetric);

    if !state.authorized(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.latest.get(&device_id) {
        Some(payload) => Json(payload.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn collect_metric(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    let mut state = state.lock().unwrap();
    state.hit(Route::PostMetric);

    let metric = RecordedMetric {
        charge_level: params.get("chargeLevel").and_then(|v| v.parse().ok()),
        body: serde_json::from_str(&body).unwrap_or(Value::Null),
    };
    log::info!("📥 [MOCK] Metric received: {}", body);
    state.metrics.push(metric);

    collector_reply(&state.collector)
}

async fn device_off(State(state): State<Shared>, Path(device_id): Path<i64>) -> Response {
    let mut state = state.lock().unwrap();
    state.hit(Route::DeviceOff);

    log::info!("🔌 [MOCK] Device {} off", device_id);
    state.offs.push(device_id);

    collector_reply(&state.collector)
}

/// Helper pour créer des payloads au format du backend
pub struct BackendPayloads;

impl BackendPayloads {
    /// Entrée du registre (champs superflus inclus, comme le vrai backend)
    pub fn registry_entry(device_id: i64, battery_level: Option<i64>) -> Value {
        serde_json::json!({
            "deviceId": device_id,
            "batteryLevel": battery_level,
            "clientId": 1,
            "model": "emulated-tracker"
        })
    }

    /// Réponse de /metrics/latest
    pub fn latest_metric(value: i64, battery_level: i64, latitude: f64, longitude: f64, timestamp: &str) -> Value {
        serde_json::json!({
            "value": value,
            "batteryLevel": battery_level,
            "latitude": latitude,
            "longitude": longitude,
            "timestamp": timestamp
        })
    }
}
