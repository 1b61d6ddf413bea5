use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use rssmix::compiler::Compiler;
use rssmix::config;
use rssmix::context::AppContext;
use rssmix::db;
use rssmix::fetcher::Fetcher;
use rssmix::http::HttpSourceClient;
use rssmix::publisher::{CommandPublisher, PublishGate};
use rssmix::scheduler::{PeriodicJob, Scheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Stage {
    All,
    Fetch,
    Compile,
    Publish,
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Fetch, merge and publish RSS compilations")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Pipeline stage(s) to run in this process
    #[arg(long, value_enum, default_value_t = Stage::All)]
    stage: Stage,

    /// Run a single pass of the selected stage(s) and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let wants = |s: Stage| args.stage == Stage::All || args.stage == s;
    // Fail at startup rather than on the first publish pass.
    let publish_command = if wants(Stage::Publish) {
        Some(cfg.publish_command()?.to_string())
    } else {
        None
    };

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let ctx = AppContext::new(pool, cfg);

    // Upstream first, so a one-shot run carries changes all the way through.
    let mut jobs: Vec<Arc<dyn PeriodicJob>> = Vec::new();
    if wants(Stage::Fetch) {
        let client = Arc::new(HttpSourceClient::from_config(&ctx.config)?);
        jobs.push(Arc::new(Fetcher::new(ctx.clone(), client)));
    }
    if wants(Stage::Compile) {
        jobs.push(Arc::new(Compiler::new(ctx.clone())));
    }
    if let Some(command) = publish_command {
        let publisher = Arc::new(CommandPublisher::new(command));
        jobs.push(Arc::new(PublishGate::new(ctx.clone(), publisher)));
    }

    if args.once {
        for job in &jobs {
            let report = job.run_pass().await?;
            info!(job = job.name(), ?report, "pass done");
        }
        return Ok(());
    }

    let scheduler = jobs
        .into_iter()
        .fold(Scheduler::new(), |s, job| s.with_arc_job(job));
    info!(jobs = scheduler.job_count(), stage = ?args.stage, "starting scheduler");
    scheduler.start();
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.shutdown().await;
    Ok(())
}
