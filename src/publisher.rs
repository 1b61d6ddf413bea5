//! Publish gate: hands every freshly merged artifact to an external command.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::context::AppContext;
use crate::db;
use crate::db::PublishCandidate;
use crate::scheduler::{PassReport, PeriodicJob};

#[async_trait]
pub trait Publisher: Send + Sync + Any {
    /// Publish the artifact at `path`, reachable at `public_url`.
    async fn publish(&self, path: &str, public_url: &str) -> Result<()>;
}

/// Runs `<command> <artifact path> <public url>`; exit status 0 is success.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    program: String,
}

impl CommandPublisher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn publish(&self, path: &str, public_url: &str) -> Result<()> {
        let status = Command::new(&self.program)
            .arg(path)
            .arg(public_url)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to spawn {}", self.program))?;
        if !status.success() {
            return Err(anyhow!("{} exited with status {}", self.program, status));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PublishGate {
    ctx: AppContext,
    publisher: Arc<dyn Publisher>,
}

impl std::fmt::Debug for PublishGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishGate").field("ctx", &self.ctx).finish_non_exhaustive()
    }
}

impl PublishGate {
    pub fn new(ctx: AppContext, publisher: Arc<dyn Publisher>) -> Self {
        Self { ctx, publisher }
    }

    /// Publish one candidate. On success `published` is set to the merge
    /// watermark the candidate was selected with, so a merge that lands
    /// while the command runs keeps the compilation in the queue.
    #[instrument(skip_all, fields(compilation = %candidate.id))]
    pub async fn publish_one(&self, candidate: &PublishCandidate) -> Result<()> {
        let path = candidate
            .output_path
            .as_deref()
            .ok_or_else(|| anyhow!("compilation {} has no output path", candidate.id))?;
        let url = candidate
            .public_url
            .as_deref()
            .ok_or_else(|| anyhow!("compilation {} has no public url", candidate.id))?;

        self.publisher.publish(path, url).await?;

        if !db::mark_compilation_published(&self.ctx.pool, &candidate.id, candidate.updated_at)
            .await?
        {
            warn!("status row missing; published watermark not recorded");
        }
        info!(path, url, "published");
        Ok(())
    }

    /// One pass over every publish candidate.
    pub async fn publish_pass(&self) -> Result<PassReport> {
        let queue = db::publish_candidates(&self.ctx.pool).await?;
        if queue.is_empty() {
            debug!("no compilations need publishing");
        } else {
            info!(count = queue.len(), "compilations to publish");
        }

        let mut report = PassReport {
            candidates: queue.len(),
            ..Default::default()
        };
        for candidate in &queue {
            match self.publish_one(candidate).await {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(compilation = %candidate.id, ?err, "publishing failed; retrying next pass");
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for PublishGate {
    fn name(&self) -> &'static str {
        "publisher"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.publish_interval()
    }

    async fn run_pass(&self) -> Result<PassReport> {
        self.publish_pass().await
    }
}
