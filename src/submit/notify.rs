use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use crate::api::request::JobId;

/// Stage-completion message posted to a job's webhook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobNotification {
    pub render_job_id: JobId,
    pub status: &'static str,
    pub blend: String,
    pub batch_job: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, url: &str, notification: &JobNotification) -> Result<()>;
}

/// Posts notifications as JSON. One attempt, no retries.
pub struct HttpNotifier {
    client: Client,
}

impl HttpNotifier {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, url: &str, notification: &JobNotification) -> Result<()> {
        let resp = self.client.post(url).json(notification).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("webhook HTTP {}", status.as_u16()));
        }
        debug!("webhook delivered url={} status={}", url, status.as_u16());
        Ok(())
    }
}
