//! Periodic job runner for the pipeline stages.
//!
//! Each registered job runs in its own tokio task: one pass, then a sleep of
//! `interval - pass duration` so passes start on a roughly constant cadence.
//! A slow pass that overruns the interval is followed immediately by the
//! next one. [`Scheduler::shutdown`] stops every loop between passes.
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Outcome counters of one pass, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub candidates: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[async_trait]
pub trait PeriodicJob: Send + Sync {
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    /// One full, idempotent pass over the stage's candidates.
    async fn run_pass(&self) -> Result<PassReport>;
}

/// Time left to sleep after a pass that took `elapsed`.
pub fn next_delay(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

pub struct Scheduler {
    jobs: Vec<Arc<dyn PeriodicJob>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: Vec::new(),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Adds a job. Jobs are not started until [`start`](Self::start) is called.
    pub fn with_job<J: PeriodicJob + 'static>(mut self, job: J) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn with_arc_job(mut self, job: Arc<dyn PeriodicJob>) -> Self {
        self.jobs.push(job);
        self
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Spawns one loop per job and returns immediately.
    pub fn start(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for job in &self.jobs {
            let job = Arc::clone(job);
            let shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(run_job_loop(job, shutdown)));
        }
    }

    /// Signals every loop to stop and waits for the in-flight passes to end.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                error!(?err, "scheduler task ended abnormally");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_job_loop(job: Arc<dyn PeriodicJob>, mut shutdown: watch::Receiver<bool>) {
    let name = job.name();
    let interval = job.interval();
    info!(job = name, interval_secs = interval.as_secs(), "job started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let started = Instant::now();
        match job.run_pass().await {
            Ok(report) => debug!(
                job = name,
                candidates = report.candidates,
                succeeded = report.succeeded,
                failed = report.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "pass finished"
            ),
            Err(err) => error!(job = name, ?err, "pass failed"),
        }

        let delay = next_delay(interval, started.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(job = name, "job stopped");
}
