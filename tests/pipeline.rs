use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use rssmix::cache::{self, ProbeMetadata};
use rssmix::catalog::{self, Changeset, NewCompilation};
use rssmix::clock::{from_millis, ManualClock};
use rssmix::compiler::Compiler;
use rssmix::config::Config;
use rssmix::context::AppContext;
use rssmix::db;
use rssmix::db::FetchableSource;
use rssmix::fetcher::{FetchOutcome, Fetcher};
use rssmix::http::SourceClient;
use rssmix::publisher::{PublishGate, Publisher};

const START: i64 = 1_700_000_000_000;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.fetcher.store_dir = root.join("cache").to_string_lossy().to_string();
    cfg.fetcher.shard_depth = 2;
    cfg.fetcher.concurrency = 2;
    cfg.public.hostname = "feeds.test".into();
    cfg.public.output_dir = root.join("public").to_string_lossy().to_string();
    cfg
}

async fn setup(root: &Path, tweak: impl FnOnce(&mut Config)) -> (AppContext, Arc<ManualClock>) {
    let mut cfg = test_config(root);
    tweak(&mut cfg);
    let clock = Arc::new(ManualClock::at_millis(START));
    let ctx = AppContext::with_clock(setup_pool().await, cfg, clock.clone());
    (ctx, clock)
}

/// RSS 2.0 document with `(title, guid, pubDate)` items.
fn rss(items: &[(&str, &str, &str)]) -> Vec<u8> {
    let mut doc = String::from(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>upstream</title><link>http://up.test/</link><description>d</description>"#,
    );
    for (title, guid, date) in items {
        doc.push_str(&format!(
            "<item><title>{}</title><guid>{}</guid><pubDate>{}</pubDate></item>",
            title, guid, date
        ));
    }
    doc.push_str("</channel></rss>");
    doc.into_bytes()
}

/// Upstream stand-in: serves configured bodies, reports their length on
/// probe, and can be told to fail either call per URL.
#[derive(Clone, Default)]
struct FakeUpstream {
    bodies: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    failing_probes: Arc<Mutex<HashSet<String>>>,
    failing_downloads: Arc<Mutex<HashSet<String>>>,
    probes: Arc<Mutex<Vec<String>>>,
    downloads: Arc<Mutex<Vec<String>>>,
}

impl FakeUpstream {
    async fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().await.insert(url.to_string(), body);
    }

    async fn fail_probe(&self, url: &str, fail: bool) {
        let mut set = self.failing_probes.lock().await;
        if fail {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    async fn fail_download(&self, url: &str, fail: bool) {
        let mut set = self.failing_downloads.lock().await;
        if fail {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    async fn probes(&self) -> Vec<String> {
        self.probes.lock().await.clone()
    }

    async fn downloads(&self) -> Vec<String> {
        self.downloads.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl SourceClient for FakeUpstream {
    async fn probe(&self, url: &str) -> Result<ProbeMetadata> {
        self.probes.lock().await.push(url.to_string());
        if self.failing_probes.lock().await.contains(url) {
            return Err(anyhow!("connection refused"));
        }
        let len = self
            .bodies
            .lock()
            .await
            .get(url)
            .map(|b| b.len().to_string());
        Ok(ProbeMetadata {
            last_modified: None,
            content_length: len,
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        self.downloads.lock().await.push(url.to_string());
        if self.failing_downloads.lock().await.contains(url) {
            return Err(anyhow!("connection reset"));
        }
        let body = self
            .bodies
            .lock()
            .await
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow!("404 for {}", url))?;
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }
}

#[derive(Clone, Default)]
struct RecordingPublisher {
    responses: Arc<Mutex<VecDeque<Result<()>>>>,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingPublisher {
    fn with_responses(responses: Vec<Result<()>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, path: &str, public_url: &str) -> Result<()> {
        self.calls
            .lock()
            .await
            .push((path.to_string(), public_url.to_string()));
        self.responses.lock().await.pop_front().unwrap_or(Ok(()))
    }
}

async fn new_compilation(ctx: &AppContext, urls: &[&str], exclude: Option<&str>) -> String {
    catalog::create_compilation(
        ctx,
        &NewCompilation {
            name: "Morning mix".into(),
            urls: urls.iter().map(|u| u.to_string()).collect(),
            filter_exclude: exclude.map(str::to_string),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .id
}

async fn source_id(ctx: &AppContext, url: &str) -> i64 {
    let u = catalog::normalize_source_url(url).unwrap();
    db::find_source_id(&ctx.pool, &u.scheme, &u.urn)
        .await
        .unwrap()
        .unwrap()
}

/// The single active source, as the fetcher would see it at the start of a pass.
async fn only_source(ctx: &AppContext) -> FetchableSource {
    db::fetchable_sources(&ctx.pool).await.unwrap().remove(0)
}

fn artifact_titles(path: &Path) -> Vec<String> {
    let bytes = std::fs::read(path).unwrap();
    let feed = feed_rs::parser::parse(&bytes[..]).unwrap();
    feed.entries
        .into_iter()
        .map(|e| e.title.map(|t| t.content).unwrap_or_default())
        .collect()
}

const A: &str = "http://a.test/feed.xml";
const B: &str = "http://b.test/feed.xml";

#[tokio::test]
async fn changes_flow_from_fetch_to_publish() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    upstream
        .serve(A, rss(&[("A old", "a1", "Mon, 01 Jan 2024 08:00:00 GMT"), ("A new", "a2", "Wed, 03 Jan 2024 08:00:00 GMT")]))
        .await;
    upstream
        .serve(B, rss(&[("B mid", "b1", "Tue, 02 Jan 2024 08:00:00 GMT")]))
        .await;
    let id = new_compilation(&ctx, &[A, B], None).await;

    let fetcher = Fetcher::new(ctx.clone(), Arc::new(upstream.clone()));
    let compiler = Compiler::new(ctx.clone());
    let publisher = RecordingPublisher::default();
    let gate = PublishGate::new(ctx.clone(), Arc::new(publisher.clone()));

    let report = fetcher.fetch_pass().await.unwrap();
    assert_eq!((report.candidates, report.succeeded, report.failed), (2, 2, 0));

    let a = source_id(&ctx, A).await;
    let status = db::source_status(&ctx.pool, a).await.unwrap().unwrap();
    assert_eq!(status.updated_at, Some(from_millis(START)));
    assert_eq!(status.refreshed_at, Some(from_millis(START)));
    let cached = cache::cache_path(Path::new(&ctx.config.fetcher.store_dir), A, 2);
    assert!(cached.is_file());

    clock.advance_millis(1_000);
    let report = compiler.compile_pass().await.unwrap();
    assert_eq!((report.candidates, report.succeeded), (1, 1));
    let out = catalog::output_path(&ctx.config.public, &id);
    assert_eq!(artifact_titles(&out), vec!["A new", "B mid", "A old"]);
    let status = db::compilation_status(&ctx.pool, &id).await.unwrap().unwrap();
    assert_eq!(status.updated_at, from_millis(START + 1_000));
    assert_eq!(status.published_at, None);

    // Nothing changed upstream: no further merge.
    assert_eq!(compiler.compile_pass().await.unwrap().candidates, 0);

    let report = gate.publish_pass().await.unwrap();
    assert_eq!((report.candidates, report.succeeded), (1, 1));
    let calls = publisher.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, out.to_string_lossy());
    assert_eq!(calls[0].1, catalog::public_url(&ctx.config.public, &id));
    let status = db::compilation_status(&ctx.pool, &id).await.unwrap().unwrap();
    assert_eq!(status.published_at, Some(status.updated_at));
    assert_eq!(gate.publish_pass().await.unwrap().candidates, 0);

    // A later upstream change goes around again.
    clock.advance_millis(1_000);
    upstream
        .serve(B, rss(&[("B mid", "b1", "Tue, 02 Jan 2024 08:00:00 GMT"), ("B newest", "b2", "Thu, 04 Jan 2024 08:00:00 GMT")]))
        .await;
    fetcher.fetch_pass().await.unwrap();
    clock.advance_millis(1_000);
    assert_eq!(compiler.compile_pass().await.unwrap().succeeded, 1);
    assert_eq!(artifact_titles(&out)[0], "B newest");
    assert_eq!(gate.publish_pass().await.unwrap().succeeded, 1);
    assert_eq!(publisher.calls().await.len(), 2);
}

#[tokio::test]
async fn unchanged_upstream_is_not_downloaded_again() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    upstream.serve(A, rss(&[("one", "1", "Mon, 01 Jan 2024 08:00:00 GMT")])).await;
    new_compilation(&ctx, &[A], None).await;
    let fetcher = Fetcher::new(ctx.clone(), Arc::new(upstream.clone()));
    let a = source_id(&ctx, A).await;

    assert!(matches!(
        fetcher.refresh_source(&only_source(&ctx).await).await.unwrap(),
        FetchOutcome::Downloaded { .. }
    ));

    clock.advance_millis(5_000);
    assert_eq!(
        fetcher.refresh_source(&only_source(&ctx).await).await.unwrap(),
        FetchOutcome::UpToDate
    );
    assert_eq!(upstream.downloads().await.len(), 1);

    let status = db::source_status(&ctx.pool, a).await.unwrap().unwrap();
    assert_eq!(status.updated_at, Some(from_millis(START)));
    assert_eq!(status.refreshed_at, Some(from_millis(START + 5_000)));

    // A size change is enough to fetch again.
    clock.advance_millis(5_000);
    upstream
        .serve(A, rss(&[("one", "1", "Mon, 01 Jan 2024 08:00:00 GMT"), ("two", "2", "Tue, 02 Jan 2024 08:00:00 GMT")]))
        .await;
    assert!(matches!(
        fetcher.refresh_source(&only_source(&ctx).await).await.unwrap(),
        FetchOutcome::Downloaded { .. }
    ));
    let status = db::source_status(&ctx.pool, a).await.unwrap().unwrap();
    assert_eq!(status.updated_at, Some(from_millis(START + 10_000)));
}

#[tokio::test]
async fn failed_probe_records_nothing() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, _clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    upstream.serve(A, rss(&[])).await;
    upstream.fail_probe(A, true).await;
    new_compilation(&ctx, &[A], None).await;
    let fetcher = Fetcher::new(ctx.clone(), Arc::new(upstream.clone()));

    let report = fetcher.fetch_pass().await.unwrap();
    assert_eq!((report.candidates, report.failed), (1, 1));
    assert!(upstream.downloads().await.is_empty());

    let status = db::source_status(&ctx.pool, source_id(&ctx, A).await)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.refreshed_at, None);
    assert_eq!(status.updated_at, None);
    let sources = db::fetchable_sources(&ctx.pool).await.unwrap();
    assert_eq!(sources[0].cache_path, None);
}

#[tokio::test]
async fn failed_download_keeps_previous_cache() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    let first = rss(&[("one", "1", "Mon, 01 Jan 2024 08:00:00 GMT")]);
    upstream.serve(A, first.clone()).await;
    new_compilation(&ctx, &[A], None).await;
    let fetcher = Fetcher::new(ctx.clone(), Arc::new(upstream.clone()));
    let sid = only_source(&ctx).await.id;
    fetcher.refresh_source(&only_source(&ctx).await).await.unwrap();

    clock.advance_millis(1_000);
    upstream
        .serve(A, rss(&[("one", "1", "Mon, 01 Jan 2024 08:00:00 GMT"), ("two", "2", "Tue, 02 Jan 2024 08:00:00 GMT")]))
        .await;
    upstream.fail_download(A, true).await;
    assert_eq!(
        fetcher.refresh_source(&only_source(&ctx).await).await.unwrap(),
        FetchOutcome::DownloadFailed
    );

    let cached = cache::cache_path(Path::new(&ctx.config.fetcher.store_dir), A, 2);
    assert_eq!(std::fs::read(&cached).unwrap(), first);
    let leftovers: Vec<PathBuf> = std::fs::read_dir(cached.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(leftovers, vec![cached.clone()]);

    let status = db::source_status(&ctx.pool, sid).await.unwrap().unwrap();
    assert_eq!(status.updated_at, Some(from_millis(START)));
    assert_eq!(status.refreshed_at, Some(from_millis(START + 1_000)));

    upstream.fail_download(A, false).await;
    clock.advance_millis(1_000);
    assert!(matches!(
        fetcher.refresh_source(&only_source(&ctx).await).await.unwrap(),
        FetchOutcome::Downloaded { .. }
    ));
}

#[tokio::test]
async fn inactive_sources_are_skipped() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, _clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    upstream.serve(A, rss(&[])).await;
    upstream.serve(B, rss(&[])).await;
    new_compilation(&ctx, &[A, B], None).await;
    db::set_source_active(&ctx.pool, source_id(&ctx, B).await, false)
        .await
        .unwrap();

    let fetcher = Fetcher::new(ctx.clone(), Arc::new(upstream.clone()));
    let report = fetcher.fetch_pass().await.unwrap();
    assert_eq!(report.candidates, 1);
    assert_eq!(upstream.probes().await, vec![A.to_string()]);
}

#[tokio::test]
async fn merge_applies_filters_and_item_limit() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, clock) = setup(td.path(), |cfg| cfg.compiler.max_items = 2).await;
    let upstream = FakeUpstream::default();
    upstream
        .serve(
            A,
            rss(&[
                ("Sponsored: buy now", "s", "Fri, 05 Jan 2024 08:00:00 GMT"),
                ("Release notes", "r", "Thu, 04 Jan 2024 08:00:00 GMT"),
                ("Weekly digest", "w", "Wed, 03 Jan 2024 08:00:00 GMT"),
                ("Old news", "o", "Mon, 01 Jan 2024 08:00:00 GMT"),
            ]),
        )
        .await;
    let id = new_compilation(&ctx, &[A], Some("^Sponsored")).await;

    Fetcher::new(ctx.clone(), Arc::new(upstream))
        .fetch_pass()
        .await
        .unwrap();
    clock.advance_millis(1);
    Compiler::new(ctx.clone()).compile_pass().await.unwrap();

    let out = catalog::output_path(&ctx.config.public, &id);
    assert_eq!(artifact_titles(&out), vec!["Release notes", "Weekly digest"]);
}

#[tokio::test]
async fn new_member_waits_for_its_first_download() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    upstream.serve(A, rss(&[("a", "a", "Mon, 01 Jan 2024 08:00:00 GMT")])).await;
    upstream.serve(B, rss(&[("b", "b", "Tue, 02 Jan 2024 08:00:00 GMT")])).await;
    let id = new_compilation(&ctx, &[A], None).await;
    let fetcher = Fetcher::new(ctx.clone(), Arc::new(upstream));
    let compiler = Compiler::new(ctx.clone());

    fetcher.fetch_pass().await.unwrap();
    clock.advance_millis(1_000);
    compiler.compile_pass().await.unwrap();

    catalog::update_compilation(
        &ctx,
        &id,
        None,
        &Changeset {
            add: vec![B.to_string()],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert!(db::compile_candidates(&ctx.pool).await.unwrap().is_empty());

    clock.advance_millis(1_000);
    fetcher.fetch_pass().await.unwrap();
    assert_eq!(db::compile_candidates(&ctx.pool).await.unwrap(), vec![id.clone()]);
    clock.advance_millis(1_000);
    compiler.compile_pass().await.unwrap();
    let out = catalog::output_path(&ctx.config.public, &id);
    assert_eq!(artifact_titles(&out), vec!["b", "a"]);
}

#[tokio::test]
async fn failed_publish_is_retried() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    upstream.serve(A, rss(&[("a", "a", "Mon, 01 Jan 2024 08:00:00 GMT")])).await;
    let id = new_compilation(&ctx, &[A], None).await;
    Fetcher::new(ctx.clone(), Arc::new(upstream))
        .fetch_pass()
        .await
        .unwrap();
    clock.advance_millis(1_000);
    Compiler::new(ctx.clone()).compile_pass().await.unwrap();

    let publisher = RecordingPublisher::with_responses(vec![Err(anyhow!("upload failed"))]);
    let gate = PublishGate::new(ctx.clone(), Arc::new(publisher.clone()));

    let report = gate.publish_pass().await.unwrap();
    assert_eq!((report.candidates, report.failed), (1, 1));
    let status = db::compilation_status(&ctx.pool, &id).await.unwrap().unwrap();
    assert_eq!(status.published_at, None);

    let report = gate.publish_pass().await.unwrap();
    assert_eq!((report.candidates, report.succeeded), (1, 1));
    assert_eq!(publisher.calls().await.len(), 2);
    assert_eq!(gate.publish_pass().await.unwrap().candidates, 0);
}

#[tokio::test]
async fn merge_during_publish_keeps_compilation_queued() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    upstream.serve(A, rss(&[("a", "a", "Mon, 01 Jan 2024 08:00:00 GMT")])).await;
    let id = new_compilation(&ctx, &[A], None).await;
    Fetcher::new(ctx.clone(), Arc::new(upstream))
        .fetch_pass()
        .await
        .unwrap();
    clock.advance_millis(1_000);
    Compiler::new(ctx.clone()).compile_pass().await.unwrap();

    let candidate = db::publish_candidates(&ctx.pool).await.unwrap().remove(0);
    // A newer merge lands between selection and completion.
    db::mark_compilation_updated(&ctx.pool, &id, from_millis(START + 5_000))
        .await
        .unwrap();

    let gate = PublishGate::new(ctx.clone(), Arc::new(RecordingPublisher::default()));
    gate.publish_one(&candidate).await.unwrap();

    let status = db::compilation_status(&ctx.pool, &id).await.unwrap().unwrap();
    assert_eq!(status.published_at, Some(from_millis(START + 1_000)));
    let queue = db::publish_candidates(&ctx.pool).await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].updated_at, from_millis(START + 5_000));
}

#[tokio::test]
async fn unrecorded_cache_file_is_downloaded_again() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, _clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    let body = rss(&[("fresh", "f", "Mon, 01 Jan 2024 08:00:00 GMT")]);
    upstream.serve(A, body.clone()).await;
    new_compilation(&ctx, &[A], None).await;

    // Same size as upstream, but no download was ever recorded for it.
    let cached = cache::cache_path(Path::new(&ctx.config.fetcher.store_dir), A, 2);
    std::fs::create_dir_all(cached.parent().unwrap()).unwrap();
    std::fs::write(&cached, vec![b' '; body.len()]).unwrap();

    let fetcher = Fetcher::new(ctx.clone(), Arc::new(upstream.clone()));
    assert!(matches!(
        fetcher.refresh_source(&only_source(&ctx).await).await.unwrap(),
        FetchOutcome::Downloaded { .. }
    ));
    assert_eq!(std::fs::read(&cached).unwrap(), body);
    let source = only_source(&ctx).await;
    assert_eq!(source.cache_path.as_deref(), Some(cached.to_string_lossy().as_ref()));
    let status = db::source_status(&ctx.pool, source.id).await.unwrap().unwrap();
    assert_eq!(status.updated_at, Some(from_millis(START)));
}

#[tokio::test]
async fn source_readded_after_cleanup_reaches_the_artifact() {
    let td = tempfile::tempdir().unwrap();
    let (ctx, clock) = setup(td.path(), |_| {}).await;
    let upstream = FakeUpstream::default();
    upstream.serve(A, rss(&[("kept", "k", "Mon, 01 Jan 2024 08:00:00 GMT")])).await;
    let fetcher = Fetcher::new(ctx.clone(), Arc::new(upstream.clone()));
    let compiler = Compiler::new(ctx.clone());

    let first = new_compilation(&ctx, &[A], None).await;
    fetcher.fetch_pass().await.unwrap();
    catalog::delete_compilation(&ctx.pool, &first, None).await.unwrap();
    assert_eq!(catalog::cleanup_orphan_sources(&ctx.pool).await.unwrap(), 1);

    // The old cache file is still on disk; the new source row knows nothing of it.
    clock.advance_millis(1_000);
    let second = new_compilation(&ctx, &[A], None).await;
    let report = fetcher.fetch_pass().await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(upstream.downloads().await.len(), 2);

    let status = db::source_status(&ctx.pool, source_id(&ctx, A).await)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.updated_at, Some(from_millis(START + 1_000)));

    clock.advance_millis(1_000);
    assert_eq!(db::compile_candidates(&ctx.pool).await.unwrap(), vec![second.clone()]);
    assert_eq!(compiler.compile_pass().await.unwrap().succeeded, 1);
    let out = catalog::output_path(&ctx.config.public, &second);
    assert_eq!(artifact_titles(&out), vec!["kept"]);
}
