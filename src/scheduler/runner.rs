//! Job runner: one coordinating loop that drains a job's pending tasks.
//!
//! The loop admits pending tasks in URL order while fewer than
//! `max_concurrency` dispatches are in flight, then waits for either a
//! dispatch to return or a pause/cancel signal. Signals only stop
//! admissions; dispatched tasks always run to completion and write their
//! outcome through the store.
//!
//! ```text
//! Idle ──start──▶ Draining ──┬── pause ──▶ Paused
//!                            ├── cancel ─▶ Cancelled
//!                            └── empty ──▶ Drained
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ExtractError, StoreError};
use crate::extractor::PageExtractor;
use crate::store::{
    ExtractionConfig, Job, JobSettings, JobStatus, Task, TaskResult, TaskStore, TaskUpdate,
};

use super::registry::{RunnerControl, RunnerRegistry, Signal};
use super::retry::RetryPolicy;

/// Default time a runner lease survives without a heartbeat.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

/// Configuration shared by every runner a controller spawns.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Backoff applied between attempts of a failing task.
    pub retry_policy: RetryPolicy,
    /// A lease whose heartbeat is older than this belongs to a dead runner.
    /// Live runners renew theirs three times per TTL.
    pub lease_ttl: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the retry backoff policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Heartbeats older than the returned instant are stale at `now`.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease_ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_millis(1))
    }
}

/// How a runner's draining loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    /// Nothing pending or in flight was left.
    Drained,
    Paused,
    Cancelled,
    /// The job record was deleted underneath the runner.
    Deleted,
}

impl From<Signal> for RunnerExit {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Pause => RunnerExit::Paused,
            Signal::Cancel => RunnerExit::Cancelled,
        }
    }
}

/// Everything a single dispatch needs, shared across the job's dispatches.
struct Dispatcher {
    job_id: Uuid,
    config: ExtractionConfig,
    settings: JobSettings,
    retry_policy: RetryPolicy,
    store: Arc<dyn TaskStore>,
    extractor: Arc<dyn PageExtractor>,
    control: RunnerControl,
}

impl Dispatcher {
    /// Runs one claimed task and records its outcome.
    ///
    /// Store failures are logged here and never reach the loop, so one bad
    /// write cannot abort the job's other in-flight tasks.
    async fn dispatch(self: Arc<Self>, task: Task) {
        let outcome = self
            .extractor
            .extract(&task.url, &self.config, self.settings.rendering)
            .await;

        let recorded = match outcome {
            Ok(rows) => {
                let result = TaskResult::new(rows);
                debug!(
                    job_id = %self.job_id,
                    task_id = %task.id,
                    rows = result.row_count(),
                    "Task completed"
                );
                self.store
                    .update_task(task.id, TaskUpdate::completed(result, Utc::now()))
                    .await
            }
            Err(err) if task.retry_count < self.settings.max_retries => {
                self.requeue(&task, err).await
            }
            Err(err) => {
                warn!(
                    job_id = %self.job_id,
                    task_id = %task.id,
                    url = %task.url,
                    retries = task.retry_count,
                    error = %err,
                    "Task failed permanently"
                );
                self.store
                    .update_task(task.id, TaskUpdate::failed(err.to_string(), Utc::now()))
                    .await
            }
        };

        if let Err(e) = recorded {
            error!(
                job_id = %self.job_id,
                task_id = %task.id,
                error = %e,
                "Failed to record task outcome"
            );
        }
    }

    /// Waits out the backoff, then returns the task to the pending pool.
    ///
    /// A pause or cancel cuts the wait short. After a cancel the task is
    /// marked cancelled instead of requeued.
    async fn requeue(&self, task: &Task, err: ExtractError) -> Result<Task, StoreError> {
        let delay = self.retry_policy.delay(task.retry_count);
        warn!(
            job_id = %self.job_id,
            task_id = %task.id,
            url = %task.url,
            attempt = task.retry_count + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Extraction failed, retrying after backoff"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.control.stopped() => {}
        }

        if self.control.is_cancelled() {
            return self
                .store
                .update_task(task.id, TaskUpdate::cancelled(Utc::now()))
                .await;
        }
        self.store
            .update_task(task.id, TaskUpdate::requeue(task.retry_count + 1))
            .await
    }
}

/// Keeps the runner's lease fresh until aborted.
///
/// Losing the lease means another runner took the job over, so admissions
/// stop.
async fn heartbeat(store: Arc<dyn TaskStore>, control: RunnerControl, every: Duration) {
    let job_id = control.job_id();
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match store.renew_lease(job_id, control.runner_id(), Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                error!(job_id = %job_id, "Runner lease taken over; stopping admissions");
                control.pause();
                return;
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to renew lease"),
        }
    }
}

/// The draining loop for one job.
///
/// Created by `JobController::start_job` after the registry entry and the
/// job's lease are held; `run` releases both and fires the control's
/// `finished` signal on every exit path.
pub struct JobRunner {
    job_id: Uuid,
    settings: JobSettings,
    store: Arc<dyn TaskStore>,
    registry: Arc<RunnerRegistry>,
    control: RunnerControl,
    dispatcher: Arc<Dispatcher>,
    heartbeat_interval: Duration,
}

impl JobRunner {
    pub(crate) fn new(
        job: Job,
        store: Arc<dyn TaskStore>,
        extractor: Arc<dyn PageExtractor>,
        registry: Arc<RunnerRegistry>,
        control: RunnerControl,
        config: &RunnerConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher {
            job_id: job.id,
            config: job.config,
            settings: job.settings.clone(),
            retry_policy: config.retry_policy,
            store: Arc::clone(&store),
            extractor,
            control: control.clone(),
        });

        Self {
            job_id: job.id,
            settings: job.settings,
            store,
            registry,
            control,
            dispatcher,
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    /// Drains the job until it is empty or signalled.
    pub async fn run(self) -> Result<RunnerExit, StoreError> {
        info!(
            job_id = %self.job_id,
            max_concurrency = self.settings.max_concurrency,
            max_retries = self.settings.max_retries,
            "Runner started"
        );

        let heartbeat_task = tokio::spawn(heartbeat(
            Arc::clone(&self.store),
            self.control.clone(),
            self.heartbeat_interval,
        ));

        let mut in_flight = JoinSet::new();
        let drained = self.drain(&mut in_flight).await;

        // In-flight tasks always finish, whatever ended the loop.
        self.join_all(&mut in_flight).await;

        let result = match drained {
            Ok(RunnerExit::Drained) => self.complete().await.map(|()| RunnerExit::Drained),
            Ok(RunnerExit::Cancelled) => self
                .store
                .cancel_pending_tasks(self.job_id, Utc::now())
                .await
                .map(|_| RunnerExit::Cancelled),
            other => other,
        };

        heartbeat_task.abort();
        if let Err(e) = self
            .store
            .release_lease(self.job_id, self.control.runner_id())
            .await
        {
            warn!(job_id = %self.job_id, error = %e, "Failed to release lease");
        }
        self.registry.release(&self.control);
        self.control.finish();
        self.registry.forget(&self.control);

        match &result {
            Ok(exit) => info!(job_id = %self.job_id, exit = ?exit, "Runner exited"),
            Err(e) => error!(job_id = %self.job_id, error = %e, "Runner aborted"),
        }
        result
    }

    async fn drain(&self, in_flight: &mut JoinSet<()>) -> Result<RunnerExit, StoreError> {
        let max_concurrency = self.settings.max_concurrency.max(1) as usize;
        let delay = self.settings.delay_between_requests();

        loop {
            if let Some(signal) = self.control.signal() {
                debug!(
                    job_id = %self.job_id,
                    in_flight = in_flight.len(),
                    signal = ?signal,
                    "Stopping admissions"
                );
                return Ok(signal.into());
            }

            // Another process may have paused or cancelled the job.
            match self.store.get_job(self.job_id).await? {
                None => return Ok(RunnerExit::Deleted),
                Some(job) if job.status == JobStatus::Paused => {
                    self.control.pause();
                    continue;
                }
                Some(job) if job.status == JobStatus::Cancelled => {
                    self.control.cancel();
                    continue;
                }
                Some(_) => {}
            }

            let mut queue: VecDeque<Task> = self.store.list_pending_tasks(self.job_id).await?.into();

            while in_flight.len() < max_concurrency && !self.control.is_signalled() {
                let Some(next) = queue.pop_front() else {
                    break;
                };
                let Some(task) = self.store.claim_task(next.id, Utc::now()).await? else {
                    continue;
                };

                debug!(
                    job_id = %self.job_id,
                    task_id = %task.id,
                    url = %task.url,
                    attempt = task.retry_count,
                    "Task admitted"
                );
                in_flight.spawn(Arc::clone(&self.dispatcher).dispatch(task));
                self.control.set_in_flight(in_flight.len());

                if !delay.is_zero() && !queue.is_empty() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.control.stopped() => {}
                    }
                }
            }

            if in_flight.is_empty() {
                if !queue.is_empty() || self.control.is_signalled() {
                    continue;
                }
                if self.registry.release_if_idle(&self.control) {
                    return Ok(RunnerExit::Drained);
                }
                debug!(job_id = %self.job_id, "New work queued while draining");
                continue;
            }

            tokio::select! {
                Some(joined) = in_flight.join_next() => {
                    if let Err(e) = joined {
                        error!(job_id = %self.job_id, error = %e, "Dispatch task panicked");
                    }
                    self.control.set_in_flight(in_flight.len());
                }
                _ = self.control.stopped() => {}
            }
        }
    }

    async fn join_all(&self, in_flight: &mut JoinSet<()>) {
        if !in_flight.is_empty() {
            debug!(
                job_id = %self.job_id,
                in_flight = in_flight.len(),
                "Waiting for in-flight tasks"
            );
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(job_id = %self.job_id, error = %e, "Dispatch task panicked");
            }
            self.control.set_in_flight(in_flight.len());
        }
    }

    /// Marks the job completed unless it was paused or cancelled meanwhile.
    ///
    /// The compare-and-set lets a persisted pause win over this loop's
    /// view that it simply ran out of work.
    async fn complete(&self) -> Result<(), StoreError> {
        let Some(job) = self.store.get_job(self.job_id).await? else {
            debug!(job_id = %self.job_id, "Job deleted while running");
            return Ok(());
        };

        if job.status != JobStatus::Running || !job.statistics.is_drained() {
            debug!(
                job_id = %self.job_id,
                status = %job.status,
                pending = job.statistics.pending,
                running = job.statistics.running,
                "Drained without completing job"
            );
            return Ok(());
        }

        if self
            .store
            .transition_job(self.job_id, JobStatus::Running, JobStatus::Completed)
            .await?
        {
            info!(
                job_id = %self.job_id,
                completed = job.statistics.completed,
                failed = job.statistics.failed,
                total_rows = job.statistics.total_rows,
                "Job completed"
            );
        }
        Ok(())
    }
}
