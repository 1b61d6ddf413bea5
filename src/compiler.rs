//! Merge engine: rebuilds a compilation's output feed from its members'
//! cached files whenever any member changed after the last merge.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rss::{ChannelBuilder, EnclosureBuilder, GuidBuilder, ItemBuilder};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::context::AppContext;
use crate::db;
use crate::db::CompilationForMerge;
use crate::filter::TitleFilter;
use crate::model::FeedItem;
use crate::scheduler::{PassReport, PeriodicJob};

/// Sort newest first; items without a timestamp go last. Stable, so items
/// with equal timestamps keep their source order. `max_items == 0` keeps all.
pub fn order_and_truncate(items: &mut Vec<FeedItem>, max_items: usize) {
    items.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    if max_items > 0 {
        items.truncate(max_items);
    }
}

/// Parse one cached source file into normalized items.
pub async fn read_source_items(path: &Path) -> Result<Vec<FeedItem>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let feed = feed_rs::parser::parse(&bytes[..])
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(feed.entries.into_iter().map(FeedItem::from_entry).collect())
}

/// Collect and filter the items of every readable member file. Unreadable or
/// unparseable files are skipped.
pub async fn collect_items(files: &[String], filter: &TitleFilter) -> Vec<FeedItem> {
    let mut kept = Vec::new();
    for file in files {
        let items = match read_source_items(Path::new(file)).await {
            Ok(items) => items,
            Err(err) => {
                warn!(file = %file, ?err, "skipping member feed");
                continue;
            }
        };
        let total = items.len();
        let before = kept.len();
        kept.extend(items.into_iter().filter(|item| filter.keeps(&item.title)));
        debug!(file = %file, total, kept = kept.len() - before, "parsed member feed");
    }
    kept
}

fn to_rss_item(item: &FeedItem) -> rss::Item {
    let mut builder = ItemBuilder::default();
    builder
        .title(Some(item.title.clone()))
        .description(item.description.clone())
        .content(item.content.clone())
        .link(item.link.clone())
        .author(item.author.as_ref().map(|a| a.to_rss()))
        .pub_date(item.timestamp.map(|t| t.to_rfc2822()));
    if !item.id.is_empty() {
        builder.guid(Some(
            GuidBuilder::default()
                .value(item.id.clone())
                .permalink(false)
                .build(),
        ));
    }
    if let Some(enc) = &item.enclosure {
        builder.enclosure(Some(
            EnclosureBuilder::default()
                .url(enc.url.clone())
                .length(enc.length.unwrap_or(0).to_string())
                .mime_type(
                    enc.mime_type
                        .clone()
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                )
                .build(),
        ));
    }
    builder.build()
}

/// Render the merged feed as an RSS 2.0 document.
pub fn render_feed(title: &str, link: &str, generated: DateTime<Utc>, items: &[FeedItem]) -> Result<Vec<u8>> {
    let channel = ChannelBuilder::default()
        .title(title.to_string())
        .link(link.to_string())
        .description(title.to_string())
        .last_build_date(Some(generated.to_rfc2822()))
        .pub_date(Some(generated.to_rfc2822()))
        .items(items.iter().map(to_rss_item).collect::<Vec<_>>())
        .build();
    channel
        .write_to(Vec::new())
        .map_err(|err| anyhow!("failed to render feed: {}", err))
}

/// Write `bytes` to a sibling temporary file, then rename it over `path`, so
/// readers see either the old or the new document, never a partial one.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("output path {} has no file name", path.display()))?
        .to_string_lossy();
    let tmp: PathBuf = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    if let Err(err) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err).with_context(|| format!("failed to write {}", tmp.display()));
    }
    if let Err(err) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err).with_context(|| format!("failed to replace {}", path.display()));
    }
    Ok(())
}

/// Merge one compilation and write its artifact. Does not touch watermarks.
pub async fn build_compilation(
    compilation: &CompilationForMerge,
    files: &[String],
    max_items: usize,
    generated: DateTime<Utc>,
) -> Result<usize> {
    let output = compilation
        .output_path
        .as_deref()
        .ok_or_else(|| anyhow!("compilation {} has no output path", compilation.id))?;
    let link = compilation.public_url.as_deref().unwrap_or_default();

    let filter = TitleFilter::new(
        compilation.filter_include.as_deref(),
        compilation.filter_exclude.as_deref(),
    );
    let mut items = collect_items(files, &filter).await;
    order_and_truncate(&mut items, max_items);

    let doc = render_feed(&compilation.name, link, generated, &items)?;
    write_atomically(Path::new(output), &doc).await?;
    Ok(items.len())
}

/// Merge engine stage.
#[derive(Debug, Clone)]
pub struct Compiler {
    ctx: AppContext,
}

impl Compiler {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    /// Merge one candidate and advance its `updated` watermark on success.
    #[instrument(skip(self))]
    pub async fn compile_one(&self, id: &str) -> Result<usize> {
        // Sampled before reading members: a source refreshed during this
        // merge ends up newer than the compilation and is merged next pass.
        let started = self.ctx.clock.now();

        let compilation = db::compilation_for_merge(&self.ctx.pool, id)
            .await?
            .ok_or_else(|| anyhow!("compilation {} disappeared", id))?;
        let files = db::member_cache_files(&self.ctx.pool, id).await?;

        let count = build_compilation(
            &compilation,
            &files,
            self.ctx.config.compiler.max_items,
            started,
        )
        .await?;

        if !db::mark_compilation_updated(&self.ctx.pool, id, started).await? {
            warn!(compilation = id, "status row missing; watermark not advanced");
        }
        info!(
            compilation = id,
            members = files.len(),
            items = count,
            output = compilation.output_path.as_deref().unwrap_or_default(),
            "compilation updated"
        );
        Ok(count)
    }

    /// One pass over every compile candidate.
    pub async fn compile_pass(&self) -> Result<PassReport> {
        let created = db::ensure_compilation_statuses(&self.ctx.pool).await?;
        if created > 0 {
            info!(created, "initialized missing compilation status rows");
        }

        let queue = db::compile_candidates(&self.ctx.pool).await?;
        if queue.is_empty() {
            debug!("no compilations need updating");
        }

        let mut report = PassReport {
            candidates: queue.len(),
            ..Default::default()
        };
        for id in &queue {
            match self.compile_one(id).await {
                Ok(_) => report.succeeded += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(compilation = %id, ?err, "compilation failed; retrying next pass");
                }
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicJob for Compiler {
    fn name(&self) -> &'static str {
        "compiler"
    }

    fn interval(&self) -> Duration {
        self.ctx.config.compile_interval()
    }

    async fn run_pass(&self) -> Result<PassReport> {
        self.compile_pass().await
    }
}
