use axum::{extract::State, Json};
use std::sync::Arc;

use super::AppState;

/// Health check endpoint
///
/// `remote` is `online`/`offline` on a kiosk with a remote configured and
/// `disabled` otherwise.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let remote = match &state.replication_manager {
        Some(manager) => match manager.remote_reachable().await {
            Some(true) => "online",
            Some(false) => "offline",
            None => "disabled",
        },
        None => "disabled",
    };

    Json(serde_json::json!({
        "status": "ok",
        "node_id": state.node_id,
        "mode": state.mode,
        "remote": remote,
        "log": state.log.stats(),
        "build_profile": if cfg!(debug_assertions) { "debug" } else { "release" },
    }))
}
