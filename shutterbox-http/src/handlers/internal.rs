use crate::handlers::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use shutterbox::ShutterboxError;
use shutterbox_replication::{BlobUploadResponse, RemoteError, RemoteStore, UpsertBatchRequest};
use std::sync::Arc;

fn not_central() -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "error": "This node is not a central store"
        })),
    )
        .into_response()
}

/// POST /internal/records/upsert
/// Receive a batch from a kiosk and apply it to the central log
pub async fn upsert_records(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpsertBatchRequest>,
) -> impl IntoResponse {
    let Some(central) = &state.central else {
        return not_central();
    };

    match central.upsert_batch(&req.node_id, &req.records).await {
        Ok(resp) => (StatusCode::OK, Json(resp)).into_response(),
        Err(e) => {
            tracing::error!(
                "[SYNC] failed to apply {} records from {}: {}",
                req.records.len(),
                req.node_id,
                e
            );
            ShutterboxError::from(e).into_response()
        }
    }
}

/// PUT /internal/blobs/:id
/// Store a kiosk's photo ahead of the record that points at it
pub async fn put_blob(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(central) = &state.central else {
        return not_central();
    };
    if body.is_empty() {
        return ShutterboxError::InvalidRecord("photo is empty".into()).into_response();
    }

    match central.put_blob(&id, body.to_vec()).await {
        Ok(remote_url) => {
            (StatusCode::OK, Json(BlobUploadResponse { remote_url })).into_response()
        }
        Err(RemoteError::Rejected(reason)) => {
            tracing::warn!("[SYNC] refused photo {}: {}", id, reason);
            ShutterboxError::InvalidRecord(reason).into_response()
        }
        Err(RemoteError::Unavailable(reason)) => {
            tracing::error!("[SYNC] failed to store photo {}: {}", id, reason);
            ShutterboxError::Storage(reason).into_response()
        }
    }
}

/// GET /internal/status
/// Return replication status for monitoring
pub async fn replication_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let replication = state.replication_manager.as_ref().map(|m| m.status());
    let enabled = replication
        .as_ref()
        .is_some_and(|status| status.replication_enabled);

    Json(serde_json::json!({
        "node_id": state.node_id,
        "mode": state.mode,
        "replication_enabled": enabled,
        "replication": replication,
        "log": state.log.stats(),
    }))
}

/// POST /internal/sync
/// Run a replication tick now instead of waiting for the schedule
pub async fn trigger_sync(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let triggered = state
        .replication_manager
        .as_ref()
        .is_some_and(|m| m.trigger_now());

    if triggered {
        (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "triggered": true })),
        )
    } else {
        (
            StatusCode::CONFLICT,
            Json(serde_json::json!({
                "triggered": false,
                "error": "Replication is disabled or scheduled by another process"
            })),
        )
    }
}
