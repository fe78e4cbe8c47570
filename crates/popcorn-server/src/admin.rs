//! Read-only HTTP view of the broker for operators.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use popcorn_telemetry::MetricsRecorder;

use crate::app_server::AppServer;
use crate::assets::AssetResolver;
use crate::broker::Broker;

/// Shared state passed to admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub broker: Arc<Broker>,
    pub apps: Arc<AppServer>,
    pub assets: Arc<dyn AssetResolver>,
    pub metrics: Option<Arc<MetricsRecorder>>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct MachineView {
    name: String,
    owner: Option<String>,
    abandoned: bool,
    subscribers: usize,
    paths: usize,
    provided_at: DateTime<Utc>,
    assets_dir: Option<PathBuf>,
}

/// Build the admin router.
pub fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/machines", get(machines_handler))
        .route("/machines/{name}", get(machine_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health_handler(State(state): State<AdminState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
        "consumers": state.broker.clients().count(),
        "producers": state.apps.app_count(),
        "machines": state.broker.machine_count(),
    }))
}

async fn machines_handler(State(state): State<AdminState>) -> impl IntoResponse {
    let views: Vec<MachineView> = state
        .broker
        .machines()
        .into_iter()
        .map(|info| MachineView {
            owner: state.apps.owner_name(&info.name),
            assets_dir: state.assets.resolve_assets_dir(&info.name),
            name: info.name,
            abandoned: info.abandoned,
            subscribers: info.subscribers,
            paths: info.paths,
            provided_at: info.provided_at,
        })
        .collect();
    Json(views)
}

async fn machine_handler(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.broker.snapshot(&name) {
        Some(lines) => (
            StatusCode::OK,
            Json(json!({ "name": name, "serialization": lines })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no such machine: {name}") })),
        ),
    }
}

async fn metrics_handler(State(state): State<AdminState>) -> impl IntoResponse {
    match &state.metrics {
        Some(metrics) => (StatusCode::OK, Json(json!(metrics.snapshot()))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "metrics disabled" })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use popcorn_core::Machine;
    use tokio::sync::mpsc;

    use super::*;
    use crate::app_server::Requester;
    use crate::assets::StaticAssetResolver;
    use crate::client::ClientRegistry;
    use crate::config::SubscribePolicy;

    async fn serve(state: AdminState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.ok();
        });
        format!("http://{addr}")
    }

    fn state() -> AdminState {
        let metrics = Arc::new(MetricsRecorder::new());
        let clients = Arc::new(ClientRegistry::new(16, Duration::from_secs(90)));
        let broker = Arc::new(Broker::new(clients, SubscribePolicy::FailFast, Some(metrics.clone())));
        let (tx, _rx) = mpsc::unbounded_channel();
        let apps = Arc::new(AppServer::new(tx, Some(metrics.clone())));
        AdminState {
            broker,
            apps,
            assets: Arc::new(StaticAssetResolver::default().with_dir("demo", "/srv/demo")),
            metrics: Some(metrics),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let state = state();
        let base = serve(state.clone()).await;
        let body: serde_json::Value = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["machines"], 0);
    }

    #[tokio::test]
    async fn machines_list_and_detail() {
        let state = state();
        let mut tree = Machine::new();
        tree.interpret(["P .hinge/open", "D .hinge/open yes"]).unwrap();
        state.broker.provide("demo", tree.into_shared());
        state
            .apps
            .execute(&Requester::OneShot, "provide other\nP .x")
            .unwrap();
        let base = serve(state).await;

        let list: serde_json::Value = reqwest::get(format!("{base}/machines"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(list[0]["name"], "demo");
        assert_eq!(list[0]["assets_dir"], "/srv/demo");
        assert_eq!(list[0]["abandoned"], false);

        let detail: serde_json::Value = reqwest::get(format!("{base}/machines/demo"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(
            detail["serialization"],
            json!(["P", "P .hinge", "P .hinge/open", "D .hinge/open yes"])
        );

        let missing = reqwest::get(format!("{base}/machines/nope")).await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_snapshot_is_served() {
        let state = state();
        if let Some(m) = &state.metrics {
            m.counter_inc("frames.sent", &[], 3);
        }
        let base = serve(state).await;
        let body: serde_json::Value = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["samples"][0]["name"], "frames.sent");
        assert_eq!(body["samples"][0]["value"], 3);
    }
}
