use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
};
use shutterbox::{blob_file_name, ShutterboxError};
use std::sync::Arc;

use super::AppState;

/// GET /uploads/:file
///
/// Serves a stored photo by the file name its `remote_url` points at.
pub async fn serve_upload(
    State(state): State<Arc<AppState>>,
    Path(file): Path<String>,
) -> Result<Response, ShutterboxError> {
    let id = file
        .rsplit_once('.')
        .map(|(id, _)| id)
        .filter(|id| blob_file_name(id) == file)
        .ok_or_else(|| ShutterboxError::RecordNotFound(file.clone()))?;

    match state.blobs.read(id) {
        Ok(Some(bytes)) => Ok(([(header::CONTENT_TYPE, "image/jpeg")], bytes).into_response()),
        Ok(None) | Err(ShutterboxError::InvalidRecord(_)) => {
            Err(ShutterboxError::RecordNotFound(file))
        }
        Err(e) => Err(e),
    }
}
