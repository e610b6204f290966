//! Read-only HTTP API.
//!
//! Two snapshot endpoints backed by the state engine, plus peer and
//! health views. No write endpoints — the hub is driven by its sensors
//! and its peers, not by HTTP. Transport trouble never surfaces here:
//! whatever the node currently knows is what gets served.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::node::HubContext;
use crate::peers::Peer;
use crate::proto::SensorEntry;
use crate::state::{group_by_origin, StateMetrics};

/// Entry as served over HTTP: the key is implied by its position in the
/// grouped map, so only the value and its provenance remain.
#[derive(Debug, Serialize)]
pub struct SensorEntryView {
    pub value: serde_json::Value,
    pub ts_ms: i64,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

impl From<SensorEntry> for SensorEntryView {
    fn from(entry: SensorEntry) -> Self {
        Self {
            value: entry.value,
            ts_ms: entry.ts_ms,
            origin: entry.origin,
            meta: entry.meta,
        }
    }
}

type GroupedView = BTreeMap<String, BTreeMap<String, SensorEntryView>>;

fn to_view(grouped: BTreeMap<String, BTreeMap<String, SensorEntry>>) -> GroupedView {
    grouped
        .into_iter()
        .map(|(origin, sensors)| {
            let sensors = sensors
                .into_iter()
                .map(|(id, entry)| (id, SensorEntryView::from(entry)))
                .collect();
            (origin, sensors)
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    node_id: String,
    peers: usize,
    keys: usize,
    uptime_secs: u64,
    state: StateMetrics,
    queue_drops: u64,
    reconnects: u64,
}

pub fn router(hub: Arc<HubContext>) -> Router {
    Router::new()
        .route("/api/state", get(api_state))
        .route("/api/updates", get(api_updates))
        .route("/api/peers", get(api_peers))
        .route("/api/health", get(api_health))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(hub)
}

/// Serve the API until shutdown flips.
pub async fn serve(
    listener: tokio::net::TcpListener,
    hub: Arc<HubContext>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let app = router(hub);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        tracing::error!("HTTP server error: {e}");
    }
    tracing::info!("HTTP API stopped");
}

/// Whole-map snapshot, grouped by origin.
async fn api_state(State(hub): State<Arc<HubContext>>) -> Json<GroupedView> {
    Json(to_view(hub.state.snapshot_state()))
}

/// Entries accepted since the previous call, grouped like `/api/state`.
/// The drain is consume-once: two callers split the stream between them.
async fn api_updates(State(hub): State<Arc<HubContext>>) -> Json<GroupedView> {
    let drained = hub.state.drain_ui_updates();
    Json(to_view(group_by_origin(drained)))
}

async fn api_peers(State(hub): State<Arc<HubContext>>) -> Json<Vec<Peer>> {
    Json(hub.peers.snapshot())
}

async fn api_health(State(hub): State<Arc<HubContext>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        node_id: hub.node_id().to_string(),
        peers: hub.peers.len(),
        keys: hub.state.key_count(),
        uptime_secs: hub.uptime().as_secs(),
        state: hub.state.metrics(),
        queue_drops: hub.outbound.dropped_total(),
        reconnects: hub.outbound.reconnects_total(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, ts_ms: i64, origin: &str) -> SensorEntry {
        SensorEntry {
            key: key.into(),
            value: json!(1),
            ts_ms,
            origin: origin.into(),
            meta: None,
        }
    }

    #[test]
    fn view_drops_the_redundant_key_and_absent_meta() {
        let view = SensorEntryView::from(entry("n1:t", 10, "n1"));
        let text = serde_json::to_string(&view).unwrap();
        assert!(!text.contains("\"key\""));
        assert!(!text.contains("\"meta\""));
        assert!(text.contains("\"origin\":\"n1\""));
    }

    #[test]
    fn grouped_view_nests_origin_then_sensor() {
        let grouped = group_by_origin(vec![entry("a:x", 1, "a"), entry("b:y", 2, "b")]);
        let view = to_view(grouped);
        let text = serde_json::to_value(&view).unwrap();
        assert_eq!(text["a"]["x"]["ts_ms"], 1);
        assert_eq!(text["b"]["y"]["ts_ms"], 2);
    }
}
