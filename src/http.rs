//! Outbound HTTP for the fetch cache: a HEAD probe and a streamed download.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderName, CONTENT_LENGTH, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use std::any::Any;
use std::fmt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

use crate::cache::ProbeMetadata;
use crate::config::Config;

#[async_trait]
pub trait SourceClient: Send + Sync + Any {
    /// Lightweight metadata probe. An `Err` is a transient failure.
    async fn probe(&self, url: &str) -> Result<ProbeMetadata>;

    /// Download `url` into `dest`, replacing its contents. Returns bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}

#[derive(Clone)]
pub struct HttpSourceClient {
    http: Client,
}

impl fmt::Debug for HttpSourceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSourceClient").finish_non_exhaustive()
    }
}

impl HttpSourceClient {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let http = Client::builder()
            .user_agent(cfg.fetcher.user_agent.clone())
            .timeout(cfg.request_timeout())
            .danger_accept_invalid_certs(cfg.fetcher.tls_insecure)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }
}

/// HEAD answered with "not supported": treat as a probe without metadata.
fn head_unsupported(status: StatusCode) -> bool {
    status == StatusCode::METHOD_NOT_ALLOWED || status == StatusCode::NOT_IMPLEMENTED
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn probe(&self, url: &str) -> Result<ProbeMetadata> {
        let resp = self
            .http
            .head(url)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", url))?;
        let status = resp.status();
        if head_unsupported(status) {
            return Ok(ProbeMetadata::default());
        }
        if !status.is_success() {
            return Err(anyhow!("HEAD {} returned {}", url, status));
        }
        let header = |name: HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Ok(ProbeMetadata {
            last_modified: header(LAST_MODIFIED),
            content_length: header(CONTENT_LENGTH),
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut resp = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} rejected", url))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut written = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .with_context(|| format!("reading body of {} failed", url))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {}", dest.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}
