//! Command surface for job execution.
//!
//! `JobController` owns the runner registry and turns start, pause, resume,
//! cancel and retry commands into registry lookups, runner signals and store
//! writes. Commands return as soon as the state change is recorded; progress
//! is observed through `TaskStore::subscribe` or by awaiting `wait`.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SchedulerError, StoreError};
use crate::extractor::PageExtractor;
use crate::store::{Job, JobStatus, JobUpdate, TaskStatus, TaskStore, TaskUpdate};

use super::registry::{RunnerRegistry, WakeOutcome};
use super::runner::{JobRunner, RunnerConfig};

/// Starts, signals and tracks job runners.
#[derive(Clone)]
pub struct JobController {
    store: Arc<dyn TaskStore>,
    extractor: Arc<dyn PageExtractor>,
    registry: Arc<RunnerRegistry>,
    config: RunnerConfig,
}

impl JobController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        extractor: Arc<dyn PageExtractor>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            registry: Arc::new(RunnerRegistry::new()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RunnerRegistry> {
        &self.registry
    }

    /// Returns whether a runner is registered for the job.
    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.registry.contains(job_id)
    }

    /// Jobs with a registered runner.
    pub fn active_jobs(&self) -> Vec<Uuid> {
        self.registry.job_ids()
    }

    /// Starts a runner for the job.
    ///
    /// Fails with `AlreadyRunning` without touching anything if the job
    /// already has one in this process, and with `LeaseHeld` if a live
    /// runner elsewhere holds the job's lease. Tasks left `running` by a
    /// runner whose lease went stale are returned to the pending pool first.
    pub async fn start_job(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let job = self.load_job(job_id).await?;
        if self.registry.contains(job_id) {
            return Err(SchedulerError::AlreadyRunning(job_id));
        }
        if job.status == JobStatus::Cancelled {
            return Err(invalid_state(&job, "start"));
        }

        let control = self
            .registry
            .register(job_id)
            .ok_or(SchedulerError::AlreadyRunning(job_id))?;

        let job = match self.prepare(job_id, control.runner_id()).await {
            Ok(job) => job,
            Err(e) => {
                self.registry.release(&control);
                control.finish();
                self.registry.forget(&control);
                return Err(e);
            }
        };

        info!(
            job_id = %job_id,
            pending = job.statistics.pending,
            total = job.statistics.total,
            "Starting job"
        );

        let runner = JobRunner::new(
            job,
            Arc::clone(&self.store),
            Arc::clone(&self.extractor),
            Arc::clone(&self.registry),
            control,
            &self.config,
        );
        tokio::spawn(async move {
            // Errors are logged by the runner itself.
            let _ = runner.run().await;
        });

        Ok(())
    }

    /// Takes the job's lease, then recovers interrupted tasks and marks the
    /// job running.
    ///
    /// Tasks are only recovered under the lease: a `running` task is either
    /// this runner's own or was left by a runner whose lease went stale.
    async fn prepare(&self, job_id: Uuid, runner_id: Uuid) -> Result<Job, SchedulerError> {
        let now = Utc::now();
        let acquired = self
            .store
            .acquire_lease(job_id, runner_id, now, self.config.stale_before(now))
            .await?;
        if !acquired {
            let owner = self
                .store
                .get_lease(job_id)
                .await?
                .map(|lease| lease.owner)
                .unwrap_or_default();
            warn!(job_id = %job_id, owner = %owner, "Job is leased by another runner");
            return Err(SchedulerError::LeaseHeld { job_id, owner });
        }

        match self.recover_and_mark_running(job_id).await {
            Ok(job) => Ok(job),
            Err(e) => {
                if let Err(release) = self.store.release_lease(job_id, runner_id).await {
                    warn!(job_id = %job_id, error = %release, "Failed to release lease");
                }
                Err(e.into())
            }
        }
    }

    async fn recover_and_mark_running(&self, job_id: Uuid) -> Result<Job, StoreError> {
        let recovered = self.store.recover_interrupted_tasks(job_id).await?;
        if recovered > 0 {
            warn!(job_id = %job_id, recovered = recovered, "Recovered interrupted tasks");
        }
        self.store
            .update_job(job_id, JobUpdate::status(JobStatus::Running))
            .await
    }

    /// Stops admissions and marks the job paused.
    ///
    /// The job is marked paused even when no runner is registered.
    /// In-flight tasks finish and record their outcome.
    pub async fn pause_job(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let job = self.load_job(job_id).await?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
            return Err(invalid_state(&job, "pause"));
        }

        if let Some(control) = self.registry.get(job_id) {
            control.pause();
            debug!(job_id = %job_id, in_flight = control.in_flight(), "Pause signalled");
        }
        self.store
            .update_job(job_id, JobUpdate::status(JobStatus::Paused))
            .await?;

        info!(job_id = %job_id, "Job paused");
        Ok(())
    }

    /// Restarts a paused job from the tasks still pending.
    ///
    /// Waits for a runner that is still finishing in-flight work to exit
    /// before starting the new one.
    pub async fn resume_job(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let job = self.load_job(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(invalid_state(&job, "resume"));
        }

        if let Some(control) = self.registry.get(job_id) {
            // A runner that has not seen the pause yet stops at its next
            // iteration anyway.
            control.pause();
            debug!(job_id = %job_id, "Waiting for paused runner to wind down");
            control.finished().await;
        }

        info!(job_id = %job_id, "Resuming job");
        self.start_job(job_id).await
    }

    /// Cancels the job: stops admissions and cancels every pending task.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        let job = self.load_job(job_id).await?;
        match job.status {
            JobStatus::Cancelled => return Ok(()),
            JobStatus::Completed => return Err(invalid_state(&job, "cancel")),
            _ => {}
        }

        if let Some(control) = self.registry.get(job_id) {
            control.cancel();
        }
        self.store
            .update_job(job_id, JobUpdate::status(JobStatus::Cancelled))
            .await?;
        let cancelled = self.store.cancel_pending_tasks(job_id, Utc::now()).await?;

        info!(job_id = %job_id, cancelled_tasks = cancelled, "Job cancelled");
        Ok(())
    }

    /// Returns every failed task to the pending pool with a fresh retry
    /// budget and makes sure a runner drains them.
    pub async fn retry_failed_urls(&self, job_id: Uuid) -> Result<u64, SchedulerError> {
        self.load_job(job_id).await?;
        self.await_wind_down(job_id).await;

        let reset = self.store.reset_tasks(job_id, &[TaskStatus::Failed]).await?;
        if reset == 0 {
            info!(job_id = %job_id, "No failed tasks to retry");
            return Ok(0);
        }

        info!(job_id = %job_id, reset = reset, "Retrying failed tasks");
        self.reopen(job_id).await?;
        self.ensure_runner(job_id).await?;
        Ok(reset)
    }

    /// Returns one failed or cancelled task to the pending pool and makes
    /// sure a runner drains it.
    pub async fn retry_url(&self, job_id: Uuid, task_id: Uuid) -> Result<(), SchedulerError> {
        self.load_job(job_id).await?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .filter(|task| task.job_id == job_id)
            .ok_or(SchedulerError::TaskNotFound { job_id, task_id })?;

        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Cancelled) {
            return Err(SchedulerError::InvalidTaskState {
                task_id,
                status: task.status.to_string(),
            });
        }

        self.await_wind_down(job_id).await;
        self.store.update_task(task_id, TaskUpdate::reset()).await?;

        info!(job_id = %job_id, task_id = %task_id, url = %task.url, "Retrying task");
        self.reopen(job_id).await?;
        self.ensure_runner(job_id).await
    }

    /// Resolves once the job's current runner has exited; immediately if
    /// there is none.
    pub async fn wait(&self, job_id: Uuid) {
        if let Some(control) = self.registry.get(job_id) {
            control.finished().await;
        }
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Job, SchedulerError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    async fn await_wind_down(&self, job_id: Uuid) {
        if let Some(control) = self.registry.get(job_id) {
            if control.is_signalled() {
                control.finished().await;
            }
        }
    }

    /// Moves a cancelled job back to pending so it can be started again.
    async fn reopen(&self, job_id: Uuid) -> Result<(), StoreError> {
        if self
            .store
            .transition_job(job_id, JobStatus::Cancelled, JobStatus::Pending)
            .await?
        {
            debug!(job_id = %job_id, "Reopened cancelled job");
        }
        Ok(())
    }

    /// Hands newly pending tasks to the live runner, or starts one.
    ///
    /// A runner in another process that holds the lease picks the tasks up
    /// on its own.
    ///
    /// A runner that was signalled in the meantime is left alone; the
    /// tasks wait for the next resume.
    async fn ensure_runner(&self, job_id: Uuid) -> Result<(), SchedulerError> {
        loop {
            match self.registry.wake(job_id) {
                WakeOutcome::Woken => return Ok(()),
                WakeOutcome::WindingDown(_) => {
                    debug!(job_id = %job_id, "Runner winding down, leaving tasks pending");
                    return Ok(());
                }
                WakeOutcome::Idle => match self.start_job(job_id).await {
                    Err(SchedulerError::AlreadyRunning(_)) => continue,
                    Err(SchedulerError::LeaseHeld { owner, .. }) => {
                        if let Some(previous) = self.registry.exiting(owner) {
                            // Our own runner drained and is still letting go
                            // of the lease.
                            previous.finished().await;
                            continue;
                        }
                        // That runner re-lists pending tasks every iteration.
                        info!(
                            job_id = %job_id,
                            owner = %owner,
                            "Tasks left to the runner holding the lease"
                        );
                        return Ok(());
                    }
                    other => return other,
                },
            }
        }
    }
}

fn invalid_state(job: &Job, operation: &'static str) -> SchedulerError {
    SchedulerError::InvalidState {
        job_id: job.id,
        status: job.status.to_string(),
        operation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExtractError;
    use crate::store::{ExtractionConfig, InMemoryTaskStore, JobSettings, NewJob, RenderingMode, Row};
    use async_trait::async_trait;
    use std::time::Duration;

    struct EmptyPage;

    #[async_trait]
    impl PageExtractor for EmptyPage {
        async fn extract(
            &self,
            _url: &str,
            _config: &ExtractionConfig,
            _rendering: RenderingMode,
        ) -> Result<Vec<Row>, ExtractError> {
            Ok(vec![Row::new()])
        }
    }

    fn controller() -> JobController {
        JobController::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(EmptyPage),
            RunnerConfig::default(),
        )
    }

    async fn create_job(controller: &JobController, urls: &[&str]) -> Job {
        let settings = JobSettings::default().with_delay_between_requests(Duration::ZERO);
        controller
            .store()
            .create_job(
                NewJob::new(
                    ExtractionConfig::new("body"),
                    urls.iter().map(|u| u.to_string()).collect(),
                )
                .with_settings(settings),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_unknown_job() {
        let controller = controller();
        let err = controller.start_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::JobNotFound(_)));
        assert!(controller.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_pause_without_runner_marks_paused() {
        let controller = controller();
        let job = create_job(&controller, &["https://a.test"]).await;

        controller.pause_job(job.id).await.unwrap();

        let job = controller.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.statistics.pending, 1);
    }

    #[tokio::test]
    async fn test_resume_requires_paused() {
        let controller = controller();
        let job = create_job(&controller, &["https://a.test"]).await;

        let err = controller.resume_job(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::InvalidState { operation: "resume", .. }
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_cancelled_job() {
        let controller = controller();
        let job = create_job(&controller, &["https://a.test", "https://b.test"]).await;

        controller.cancel_job(job.id).await.unwrap();
        let err = controller.start_job(job.id).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidState { operation: "start", .. }));

        let job = controller.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.statistics.cancelled, 2);
    }

    #[tokio::test]
    async fn test_retry_url_checks_ownership_and_state() {
        let controller = controller();
        let first = create_job(&controller, &["https://a.test"]).await;
        let second = create_job(&controller, &["https://b.test"]).await;
        let foreign = controller.store().list_tasks(second.id).await.unwrap()[0].id;

        let err = controller.retry_url(first.id, foreign).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TaskNotFound { .. }));

        let own = controller.store().list_tasks(first.id).await.unwrap()[0].id;
        let err = controller.retry_url(first.id, own).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTaskState { .. }));
    }

    #[tokio::test]
    async fn test_start_then_wait_completes() {
        let controller = controller();
        let job = create_job(&controller, &["https://a.test", "https://b.test"]).await;

        controller.start_job(job.id).await.unwrap();
        controller.wait(job.id).await;

        let job = controller.store().get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.statistics.completed, 2);
        assert_eq!(job.statistics.total_rows, 2);
        assert!(!controller.is_running(job.id));
    }
}
