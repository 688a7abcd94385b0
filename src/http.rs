use crate::metrics::Metrics;
use crate::state::{GuestSnapshot, LastError, State as CollectorState};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<CollectorState>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub name: String,
    pub state: Option<String>,
    pub attributes: BTreeMap<u64, String>,
    pub guests: Vec<GuestSnapshot>,
    pub nodes: Vec<String>,
    pub started_at_unix: i64,
    pub last_collect_timestamp_seconds: i64,
    pub last_success_unix: Option<i64>,
    pub last_update: Option<String>,
    pub last_error: Option<LastError>,
    pub cycles_total: u64,
    pub cycles_failed: u64,
    pub consecutive_failures: u32,
}

impl From<&CollectorState> for ApiState {
    fn from(value: &CollectorState) -> Self {
        Self {
            name: value.name.clone(),
            state: value.state.clone(),
            attributes: value.attributes.clone(),
            guests: value.guests.clone(),
            nodes: value.nodes.clone(),
            started_at_unix: value.started_at_unix,
            last_collect_timestamp_seconds: value.last_collect_timestamp_seconds,
            last_success_unix: value.last_success_unix,
            last_update: value.last_success_unix.map(format_unix),
            last_error: value.last_error.clone(),
            cycles_total: value.cycles_total,
            cycles_failed: value.cycles_failed,
            consecutive_failures: value.consecutive_failures,
        }
    }
}

fn format_unix(ts: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64);
    humantime::format_rfc3339_seconds(st).to_string()
}

pub fn build_router(metrics: Arc<Metrics>, state: Arc<RwLock<CollectorState>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .with_state(HttpAppState { metrics, state })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(ApiState::from(&*guard))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::CycleReport;
    use crate::proxmox::ErrorCategory;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_returns_ok() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let state = Arc::new(RwLock::new(CollectorState::new(0, "pve")));
        let app = build_router(metrics, state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn metrics_contains_uptime() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let state = Arc::new(RwLock::new(CollectorState::new(0, "pve")));
        let app = build_router(metrics, state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("pvewatch_uptime_seconds"));
        assert!(text.contains("pvewatch_scrape_count_total 1"));
    }

    #[tokio::test]
    async fn scrape_leaves_collector_gauges_untouched() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut collected = CollectorState::new(0, "pve");
        collected.publish_success(
            100,
            "Updated - x".to_string(),
            CycleReport {
                nodes: vec!["pve1".to_string()],
                attributes: BTreeMap::new(),
                guests: vec![GuestSnapshot {
                    vmid: 100,
                    kind: crate::proxmox::GuestKind::Qemu,
                    node: "pve1".to_string(),
                    name: "web".to_string(),
                    status: "running".to_string(),
                    uptime_seconds: 1,
                    memory_used_bytes: 1,
                    memory_max_bytes: 2,
                    cpu_fraction: 0.1,
                    cpus: 1.0,
                    net_in_bytes: 0,
                    net_out_bytes: 0,
                    disk_max_bytes: 0,
                }],
            },
        );
        metrics.update_from_state(&collected);

        // router state lags behind; the scrape must not rebuild gauges from it
        let stale = Arc::new(RwLock::new(CollectorState::new(0, "pve")));
        let app = build_router(metrics, stale);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("pvewatch_guest_running{"));
        assert!(text.contains("pvewatch_up 1"));
    }

    #[tokio::test]
    async fn api_state_returns_attributes_and_label() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let mut inner = CollectorState::new(10, "proxmox_server_status");
        let mut attributes = BTreeMap::new();
        attributes.insert(100, "web,running,".to_string());
        inner.publish_success(
            1_700_000_000,
            "Updated - 14-Nov-23 22:13:20".to_string(),
            CycleReport {
                nodes: vec!["pve1".to_string()],
                attributes,
                guests: vec![],
            },
        );
        inner.publish_failure(1_700_000_060, ErrorCategory::Validation, "null".to_string());
        let app = build_router(metrics, Arc::new(RwLock::new(inner)));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["name"], "proxmox_server_status");
        assert_eq!(body["state"], "Error - ValueError");
        assert_eq!(body["attributes"]["100"], "web,running,");
        assert_eq!(body["last_update"], "2023-11-14T22:13:20Z");
        assert_eq!(body["last_error"]["category"], "validation");
    }
}
