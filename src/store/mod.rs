//! Durable storage for jobs and their per-URL tasks.
//!
//! The task store is the only state shared across jobs. It owns two tables,
//! `jobs` and `tasks`, and keeps each job's `Statistics` in sync with its
//! tasks by recomputing the aggregate inside every task write.
//!
//! # Overview
//!
//! - **TaskStore**: the storage port used by the scheduler and the CLI
//! - **InMemoryTaskStore**: single-lock in-process implementation
//! - **SqliteTaskStore**: sqlx/SQLite implementation, one transaction per write
//! - **StoreEvent**: push-on-change notifications for progress observers
//!
//! # Usage
//!
//! ```rust,ignore
//! use scrape_batch::store::{NewJob, SqliteTaskStore, TaskStore, ExtractionConfig};
//!
//! let store = SqliteTaskStore::open("scrape_batch.db").await?;
//! let config = ExtractionConfig::new("table tr").with_column("name", "td:nth-child(1)");
//! let job = store.create_job(NewJob::new(config, urls)).await?;
//! assert_eq!(job.statistics.total as usize, job.urls.len());
//! ```

pub mod events;
pub mod memory;
pub mod migrations;
pub mod model;
pub mod schema;
pub mod sqlite;
pub mod statistics;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::StoreError;

pub use events::{EventBus, StoreEvent};
pub use memory::InMemoryTaskStore;
pub use migrations::MigrationRunner;
pub use model::{
    ColumnSpec, ExtractionConfig, Job, JobSettings, JobStatus, JobUpdate, NewJob, RenderingMode,
    Row, RunnerLease, Statistics, Task, TaskResult, TaskStatus, TaskUpdate,
};
pub use sqlite::SqliteTaskStore;

/// Storage port for jobs and tasks.
///
/// Every successful write bumps the owning job's `updated_at`. Every write
/// that touches a task also recomputes and persists that job's statistics as
/// part of the same atomic operation, so no reader can observe a task state
/// without the matching aggregate.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Creates a job together with one pending task per URL.
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// All jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError>;

    /// Sets the job's status to `to` only if it is currently `from`.
    ///
    /// Returns whether the transition happened.
    async fn transition_job(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError>;

    /// Removes the job and all of its tasks atomically.
    ///
    /// Returns `false` if the job did not exist.
    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// All tasks of a job in URL order.
    async fn list_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Pending tasks of a job in admission (URL) order.
    async fn list_pending_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Terminally failed tasks of a job in URL order.
    async fn list_failed_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Applies a partial update to a task and recomputes its job's statistics.
    async fn update_task(&self, id: Uuid, update: TaskUpdate) -> Result<Task, StoreError>;

    /// Atomically moves a task from `pending` to `running`.
    ///
    /// Returns `None` if the task is no longer pending.
    async fn claim_task(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Resets every task of the job whose status is in `statuses` to a fresh
    /// pending state. Returns the number of tasks reset.
    async fn reset_tasks(&self, job_id: Uuid, statuses: &[TaskStatus])
        -> Result<u64, StoreError>;

    /// Marks every pending task of the job as cancelled.
    async fn cancel_pending_tasks(
        &self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Returns tasks left `running` by a runner that no longer exists to the
    /// pending pool. Only valid while no runner is active for the job.
    async fn recover_interrupted_tasks(&self, job_id: Uuid) -> Result<u64, StoreError>;

    /// Takes the job's runner lease for `owner`.
    ///
    /// Succeeds when no lease exists, when `owner` already holds it, or when
    /// the holder's last heartbeat is older than `stale_before`. Returns
    /// whether `owner` holds the lease afterwards.
    async fn acquire_lease(
        &self,
        job_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Refreshes the heartbeat. Returns `false` if `owner` lost the lease.
    async fn renew_lease(
        &self,
        job_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drops the lease if `owner` still holds it.
    async fn release_lease(&self, job_id: Uuid, owner: Uuid) -> Result<bool, StoreError>;

    async fn get_lease(&self, job_id: Uuid) -> Result<Option<RunnerLease>, StoreError>;

    /// Subscribes to change notifications.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Update applied by `recover_interrupted_tasks`.
pub(crate) fn interrupted_update() -> TaskUpdate {
    TaskUpdate {
        status: Some(TaskStatus::Pending),
        clear_timestamps: true,
        ..Default::default()
    }
}
