use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Body, Client};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Destination for produced scene files.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `local` under `key` and return the object's remote URI.
    async fn upload(&self, local: &Path, key: &str) -> Result<String>;
}

fn gs_uri(bucket: &str, key: &str) -> String {
    format!("gs://{}/{}", bucket, key)
}

/// Uploads through the Cloud Storage JSON API.
pub struct GcsObjectStore {
    client: Client,
    endpoint: String,
    bucket: String,
    access_token: Option<String>,
}

impl GcsObjectStore {
    pub fn new(bucket: impl Into<String>, access_token: Option<String>) -> Self {
        Self::with_endpoint("https://storage.googleapis.com", bucket, access_token)
    }

    pub fn with_endpoint(
        endpoint: impl Into<String>,
        bucket: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bucket: bucket.into(),
            access_token,
        }
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<String> {
        let file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("opening {}", local.display()))?;
        let len = file.metadata().await?.len();

        let url = format!("{}/upload/storage/v1/b/{}/o", self.endpoint, self.bucket);
        let mut req = self
            .client
            .post(&url)
            .query(&[("uploadType", "media"), ("name", key)])
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", len)
            .body(Body::wrap_stream(ReaderStream::new(file)));
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(anyhow!("storage upload HTTP {}: {}", status.as_u16(), detail));
        }

        let uri = gs_uri(&self.bucket, key);
        info!("uploaded {} ({} bytes) to {}", local.display(), len, uri);
        Ok(uri)
    }
}

/// Copies into a locally mounted bucket (e.g. a FUSE mount of `bucket`).
pub struct MountedBucketStore {
    mount: PathBuf,
    bucket: String,
}

impl MountedBucketStore {
    pub fn new(mount: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for MountedBucketStore {
    async fn upload(&self, local: &Path, key: &str) -> Result<String> {
        if key.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(anyhow!("invalid object key: {:?}", key));
        }
        let dest = self.mount.join(key);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(local, &dest)
            .await
            .with_context(|| format!("copying {} to {}", local.display(), dest.display()))?;
        debug!("copied {} bytes into mounted bucket at {}", bytes, dest.display());
        Ok(gs_uri(&self.bucket, key))
    }
}
