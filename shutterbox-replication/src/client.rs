use super::remote::{RemoteError, RemoteStore};
use super::types::{BlobUploadResponse, UpsertBatchRequest, UpsertBatchResponse};
use async_trait::async_trait;
use shutterbox::Record;
use std::time::Duration;

/// HTTP client for the central store's internal endpoints
pub struct HttpRemoteStore {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Map a central-store response onto the retry classes: 5xx, 408 and 429
/// are transient, any other 4xx is a refusal.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        return Err(RemoteError::Unavailable(format!(
            "central store returned {}",
            status
        )));
    }
    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(RemoteError::Rejected(format!("{}: {}", status, body)));
    }
    if !status.is_success() {
        return Err(RemoteError::Unavailable(format!(
            "unexpected status {}",
            status
        )));
    }
    Ok(response)
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert_batch(
        &self,
        node_id: &str,
        records: &[Record],
    ) -> Result<UpsertBatchResponse, RemoteError> {
        let url = format!("{}/internal/records/upsert", self.base_url);
        let req = UpsertBatchRequest {
            node_id: node_id.to_string(),
            records: records.to_vec(),
        };

        let response = self
            .http_client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(format!("failed to reach {}: {}", url, e)))?;
        let response = check_status(response).await?;

        // A garbled body after a 2xx leaves the commit state unknown; the
        // upsert is idempotent, so treat it as retryable.
        response
            .json()
            .await
            .map_err(|e| RemoteError::Unavailable(format!("failed to parse response: {}", e)))
    }

    async fn put_blob(&self, id: &str, bytes: Vec<u8>) -> Result<String, RemoteError> {
        let url = format!("{}/internal/blobs/{}", self.base_url, id);
        let response = self
            .http_client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(bytes)
            .send()
            .await
            .map_err(|e| RemoteError::Unavailable(format!("failed to reach {}: {}", url, e)))?;
        let response = check_status(response).await?;

        let ack: BlobUploadResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Unavailable(format!("failed to parse response: {}", e)))?;
        Ok(ack.remote_url)
    }

    async fn ping(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http_client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::debug!("[SYNC] health probe returned {}", resp.status());
                false
            }
            Err(e) => {
                tracing::debug!("[SYNC] health probe failed: {}", e);
                false
            }
        }
    }
}
