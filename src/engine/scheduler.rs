use crate::core::config::Config;
use crate::core::error::{Error, Result};
use crate::core::model::RefreshScope;
use crate::engine::progress::{CancellationToken, LogProgress};
use crate::engine::{CacheEngine, InvalidationOutcome};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle as TaskHandle;
use tokio::time::MissedTickBehavior;

/// Work handed to the scheduler loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Invalidate(PathBuf),
    Scan,
    Refresh(RefreshScope),
    HealthCheck,
}

/// Cloneable, non-blocking producer side of the job queue
#[derive(Debug, Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Queue `job` without blocking. A full queue drops it; the next periodic
    /// scan picks up whatever change it described.
    pub fn enqueue(&self, job: Job) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(job)) => {
                tracing::warn!(?job, "job queue full, dropping job");
                false
            }
            Err(TrySendError::Closed(job)) => {
                tracing::debug!(?job, "scheduler stopped, dropping job");
                false
            }
        }
    }
}

/// Drives periodic scans and queued jobs on one dedicated thread. Refreshes
/// run on a blocking worker so the loop keeps draining the queue.
pub struct Scheduler;

impl Scheduler {
    pub fn start(engine: Arc<CacheEngine>, config: &Config) -> Result<SchedulerHandle> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let interval = config.scan_interval();

        let thread = std::thread::Builder::new()
            .name("mapperlink-scheduler".to_string())
            .spawn(move || {
                runtime.block_on(run_loop(engine, rx, shutdown_rx, interval));
            })
            .map_err(|e| Error::Config(format!("Failed to start scheduler thread: {}", e)))?;

        tracing::debug!(interval_secs = interval.as_secs(), "scheduler started");
        Ok(SchedulerHandle {
            queue: JobQueue { tx },
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

/// Owner of a running scheduler; stopping it flushes queued invalidations
pub struct SchedulerHandle {
    queue: JobQueue,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn enqueue(&self, job: Job) -> bool {
        self.queue.enqueue(job)
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Flush pending invalidations, then stop and join the loop
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    engine: Arc<CacheEngine>,
    mut rx: mpsc::Receiver<Job>,
    mut shutdown: oneshot::Receiver<()>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut refresh_task: Option<TaskHandle<()>> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                if let Some(task) = refresh_task.take() {
                    tracing::debug!("waiting for running refresh before shutdown");
                    if task.await.is_err() {
                        tracing::error!("refresh worker panicked");
                    }
                }
                rx.close();
                let mut pending = Vec::new();
                while let Ok(job) = rx.try_recv() {
                    pending.push(job);
                }
                let invalidations: Vec<Job> = pending
                    .into_iter()
                    .filter(|job| matches!(job, Job::Invalidate(_)))
                    .collect();
                if !invalidations.is_empty() {
                    tracing::debug!(jobs = invalidations.len(), "flushing invalidations before shutdown");
                    process_batch(&engine, invalidations, &mut refresh_task);
                }
                break;
            }
            job = rx.recv() => {
                let Some(job) = job else { break };
                let mut batch = vec![job];
                while let Ok(job) = rx.try_recv() {
                    batch.push(job);
                }
                process_batch(&engine, batch, &mut refresh_task);
            }
            _ = ticker.tick() => {
                run_scan(&engine);
                run_health_check(&engine);
            }
        }
    }
    tracing::debug!("scheduler stopped");
}

/// Run a drained batch: invalidations first, de-duplicated, then the rest in
/// arrival order with repeats dropped. A refresh is handed to a blocking
/// worker and skipped while the previous one is still running.
fn process_batch(
    engine: &Arc<CacheEngine>,
    batch: Vec<Job>,
    refresh_task: &mut Option<TaskHandle<()>>,
) {
    let mut invalidations = BTreeSet::new();
    let mut others: Vec<Job> = Vec::new();
    for job in batch {
        match job {
            Job::Invalidate(path) => {
                invalidations.insert(path);
            }
            other if !others.contains(&other) => others.push(other),
            _ => {}
        }
    }

    for path in invalidations {
        match engine.invalidate_file(&path) {
            Ok(InvalidationOutcome::Reparsed {
                reparsed,
                purged,
                failed,
            }) => tracing::debug!(path = %path.display(), reparsed, purged, failed, "invalidated"),
            Ok(outcome) => tracing::debug!(path = %path.display(), ?outcome, "invalidation handled"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "invalidation failed"),
        }
    }

    for job in others {
        match job {
            Job::Scan => run_scan(engine),
            Job::HealthCheck => run_health_check(engine),
            Job::Refresh(scope) => {
                if refresh_task.as_ref().is_some_and(|task| !task.is_finished()) {
                    tracing::warn!(scope = %scope, "refresh skipped, one is already running");
                    continue;
                }
                let engine = Arc::clone(engine);
                *refresh_task = Some(tokio::task::spawn_blocking(move || run_refresh(&engine, scope)));
            }
            Job::Invalidate(_) => {}
        }
    }
}

fn run_refresh(engine: &CacheEngine, scope: RefreshScope) {
    match engine.refresh_scope(scope, &LogProgress, &CancellationToken::new()) {
        Ok(_) => {}
        Err(Error::Busy) => tracing::warn!(scope = %scope, "refresh skipped, engine busy"),
        Err(e) => tracing::error!(scope = %scope, error = %e, "refresh failed"),
    }
}

fn run_scan(engine: &CacheEngine) {
    match engine.periodic_scan() {
        Ok(Some(report)) => tracing::debug!(?report, "scan finished"),
        Ok(None) => tracing::debug!("scan skipped, engine busy"),
        Err(e) => tracing::error!(error = %e, "periodic scan failed"),
    }
}

fn run_health_check(engine: &CacheEngine) {
    if let Err(e) = engine.run_health_check() {
        tracing::error!(error = %e, "health check failed");
    }
}
