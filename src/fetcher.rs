//! Fetch cache: keeps a local copy of every active source and advances the
//! source's `updated` watermark only when new content was stored.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cache::{self, CachedFile};
use crate::context::AppContext;
use crate::db;
use crate::db::FetchableSource;
use crate::http::SourceClient;
use crate::scheduler::{PassReport, PeriodicJob};

/// What happened to one source during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Probe failed; nothing was recorded.
    ProbeFailed,
    /// Probed, cache still current.
    UpToDate,
    /// New content stored.
    Downloaded { bytes: u64 },
    /// Download or write failed; the previous cache is untouched.
    DownloadFailed,
}

impl FetchOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, FetchOutcome::ProbeFailed | FetchOutcome::DownloadFailed)
    }
}

#[derive(Clone)]
pub struct Fetcher {
    ctx: AppContext,
    client: Arc<dyn SourceClient>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl Fetcher {
    pub fn new(ctx: AppContext, client: Arc<dyn SourceClient>) -> Self {
        Self { ctx, client }
    }

    fn cache_path_for(&self, url: &str) -> PathBuf {
        cache::cache_path(
            Path::new(&self.ctx.config.fetcher.store_dir),
            url,
            self.ctx.config.fetcher.shard_depth,
        )
    }

    /// Download into a sibling temp file and move it into place once complete.
    async fn download_into(&self, url: &str, dest: &Path) -> Result<u64> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("cache path {} has no parent", dest.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let tmp = dest.with_extension("part");
        let bytes = match self.client.download(url, &tmp).await {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err);
            }
        };
        tokio::fs::rename(&tmp, dest)
            .await
            .with_context(|| format!("failed to move download into {}", dest.display()))?;
        Ok(bytes)
    }

    /// Probe one source, download it if stale, and record the watermarks.
    #[instrument(skip_all, fields(source_id = source.id))]
    pub async fn refresh_source(&self, source: &FetchableSource) -> Result<FetchOutcome> {
        let pool = &self.ctx.pool;
        let url = source.url();
        let path = self.cache_path_for(&url);

        if db::ensure_source_status(pool, source.id).await? {
            debug!(%url, "created status row");
        }

        let probe = match self.client.probe(&url).await {
            Ok(probe) => probe,
            Err(err) => {
                warn!(%url, ?err, "probe failed; retrying next pass");
                return Ok(FetchOutcome::ProbeFailed);
            }
        };

        // Only a download recorded against this source counts as cached. A file
        // left by a crash before the watermark write, or by a removed source
        // with the same URL, is fetched again.
        let cache_path = path.to_string_lossy();
        let recorded = source.cache_path.as_deref() == Some(cache_path.as_ref());
        let cached = if recorded {
            CachedFile::stat(&path).await
        } else {
            None
        };
        let reason = cache::needs_download(&probe, cached.as_ref());

        db::mark_source_refreshed(pool, source.id, self.ctx.clock.now()).await?;

        let Some(reason) = reason else {
            debug!(%url, "up to date");
            return Ok(FetchOutcome::UpToDate);
        };

        info!(%url, path = %path.display(), reason = reason.as_str(), "downloading");
        match self.download_into(&url, &path).await {
            Ok(bytes) => {
                db::mark_source_updated(pool, source.id, self.ctx.clock.now(), &cache_path)
                    .await?;
                info!(%url, bytes, "download stored");
                Ok(FetchOutcome::Downloaded { bytes })
            }
            Err(err) => {
                warn!(%url, ?err, "download failed; keeping previous cache");
                Ok(FetchOutcome::DownloadFailed)
            }
        }
    }

    /// One pass over every active source. A failure on one source never
    /// stops the others.
    pub async fn fetch_pass(&self) -> Result<PassReport> {
        let sources = db::fetchable_sources(&self.ctx.pool).await?;
        info!(count = sources.len(), "refreshing sources");

        let concurrency = self.ctx.config.fetcher.concurrency.max(1);
        let outcomes: Vec<(i64, Result<FetchOutcome>)> = stream::iter(sources)
            .map(|source| {
                let this = self.clone();
                async move {
                    let outcome = this.refresh_source(&source).await;
                    (source.id, outcome)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = PassReport {
            candidates: outcomes.len(),
            ..Default::default()
        };
        for (source_id, outcome) in outcomes {
            match outcome {
                Ok(o) if o.is_failure() => report.failed += 1,
                Ok(_) => report.succeeded += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(source_id, ?err, "storage error while refreshing source");
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for Fetcher {
    fn name(&self) -> &'static str {
        "fetcher"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.fetch_interval()
    }

    async fn run_pass(&self) -> Result<PassReport> {
        self.fetch_pass().await
    }
}
