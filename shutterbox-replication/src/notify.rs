//! Post-replication notification of the person who took the capture.
//! Failures are reported to the caller and logged; they never undo
//! replication.

use async_trait::async_trait;
use serde::Serialize;
use shutterbox::Record;
use std::time::Duration;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, record: &Record) -> Result<(), String>;
}

pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _record: &Record) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct SmsJob<'a> {
    sender: &'a str,
    receivers: Vec<&'a str>,
    message: String,
}

/// Sends the download link by SMS through an HTTP gateway.
pub struct SmsNotifier {
    url: String,
    sender: String,
    public_url: String,
    http_client: reqwest::Client,
}

impl SmsNotifier {
    pub fn new(url: &str, sender: &str, public_url: &str) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        SmsNotifier {
            url: url.to_string(),
            sender: sender.to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
            http_client,
        }
    }

    pub fn download_url(&self, record: &Record) -> String {
        let path = record
            .payload_ref
            .remote_url
            .clone()
            .unwrap_or_else(|| format!("/uploads/{}.jpg", record.id));
        format!("{}{}", self.public_url, path)
    }

    pub fn message_for(&self, record: &Record) -> String {
        format!(
            "Your photo is ready! Download it here: {}",
            self.download_url(record)
        )
    }
}

#[async_trait]
impl Notifier for SmsNotifier {
    async fn notify(&self, record: &Record) -> Result<(), String> {
        let Some(phone) = record.contact.phone.as_deref() else {
            return Ok(());
        };

        let job = SmsJob {
            sender: &self.sender,
            receivers: vec![phone],
            message: self.message_for(record),
        };

        let response = self
            .http_client
            .post(&self.url)
            .json(&job)
            .send()
            .await
            .map_err(|e| format!("SMS gateway unreachable: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("SMS gateway returned {}", response.status()));
        }

        tracing::info!("[NOTIFY] SMS sent for capture {}", record.id);
        Ok(())
    }
}
