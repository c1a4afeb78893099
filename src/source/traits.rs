use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A place remote assets are retrieved from.
#[async_trait]
pub trait AssetSource: Send + Sync {
    /// Retrieve the full body behind `url`. Any non-success outcome is an error.
    async fn fetch(&self, url: &str) -> Result<Bytes>;
}
