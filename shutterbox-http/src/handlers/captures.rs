use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use shutterbox::{Contact, Record, RecordStatus, ShutterboxError};
use std::sync::Arc;

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    /// JPEG bytes, plain base64 or a `data:image/...;base64,` URL.
    pub photo_base64: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub background_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryResponse {
    pub retried: bool,
    /// A replication tick was queued right away.
    pub triggered: bool,
    pub status: RecordStatus,
}

fn decode_photo(encoded: &str) -> Result<Vec<u8>, ShutterboxError> {
    let data = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| ShutterboxError::InvalidRecord(format!("photo is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(ShutterboxError::InvalidRecord("photo is empty".into()));
    }
    Ok(bytes)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// POST /api/captures
///
/// Returns 201 only once the record is durable in the local log. A blob
/// written for a capture that then fails to append is removed again.
pub async fn create_capture(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CaptureRequest>,
) -> Result<(StatusCode, Json<Record>), ShutterboxError> {
    let bytes = decode_photo(&req.photo_base64)?;
    if !(req.metadata.is_object() || req.metadata.is_null()) {
        return Err(ShutterboxError::InvalidRecord(
            "metadata must be a JSON object".into(),
        ));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let payload = state.blobs.put(&id, &bytes)?;

    let mut record = Record::with_id(id.clone())
        .payload(payload.clone())
        .contact(Contact {
            phone: non_empty(req.phone),
            email: non_empty(req.email),
        })
        .metadata(req.metadata);
    record.background_id = non_empty(req.background_id);

    if let Err(e) = state.log.append(record.clone()) {
        tracing::error!("[LOG] capture {} not persisted: {}", id, e);
        if let Err(cleanup) = state.blobs.delete(&payload) {
            tracing::warn!("[LOG] failed to remove blob for {}: {}", id, cleanup);
        }
        return Err(e);
    }

    tracing::info!(
        "[LOG] captured {} ({} bytes, phone={})",
        id,
        bytes.len(),
        record.contact.phone.is_some()
    );
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/captures/:id
pub async fn capture_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RecordStatus>, ShutterboxError> {
    let record = state
        .log
        .get(&id)
        .ok_or(ShutterboxError::RecordNotFound(id))?;
    Ok(Json(RecordStatus::from(&record)))
}

/// POST /api/captures/:id/retry
///
/// Clears failure counters and the dead-letter flag, then asks for an
/// immediate replication tick. A replicated record is left as is.
pub async fn retry_capture(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RetryResponse>, ShutterboxError> {
    if state.log.get(&id).is_none() {
        return Err(ShutterboxError::RecordNotFound(id));
    }
    let retried = state.log.retry(&id)?;
    let triggered = retried
        && state
            .replication_manager
            .as_ref()
            .is_some_and(|m| m.trigger_now());

    let record = state
        .log
        .get(&id)
        .ok_or_else(|| ShutterboxError::RecordNotFound(id.clone()))?;
    if retried {
        tracing::info!("[SYNC] retry requested for {} (triggered={})", id, triggered);
    }
    Ok(Json(RetryResponse {
        retried,
        triggered,
        status: RecordStatus::from(&record),
    }))
}
