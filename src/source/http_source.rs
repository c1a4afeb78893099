use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};

use super::traits::AssetSource;

/// Fetches assets over HTTP(S) with a shared connection pool.
pub struct HttpSource {
    client: Client,
    headers: HashMap<String, String>,
}

impl HttpSource {
    pub fn new(headers: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            headers,
        }
    }

    /// Build a source whose requests fail if no connection is made within
    /// `connect_timeout`. Transfers themselves are not bounded.
    pub fn with_connect_timeout(
        headers: HashMap<String, String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client, headers })
    }

    fn build_request(&self, url: &str) -> RequestBuilder {
        let mut req = self.client.get(url);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

#[async_trait]
impl AssetSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        let resp = self.build_request(url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            warn!("http fetch failed status={} url={}", status.as_u16(), url);
            return Err(anyhow!("HTTP {}", status.as_u16()));
        }

        let bytes = resp.bytes().await?;
        debug!("http fetch ok url={} bytes={}", url, bytes.len());
        Ok(bytes)
    }
}
