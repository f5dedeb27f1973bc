//! In-process task store.
//!
//! Both tables live behind one lock, so a task write and its job's
//! statistics recompute are a single critical section. Useful for tests,
//! embedding, and short-lived batches that need no durability.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

use super::events::{EventBus, StoreEvent};
use super::model::{
    Job, JobStatus, JobUpdate, NewJob, RunnerLease, Task, TaskStatus, TaskUpdate,
};
use super::{interrupted_update, statistics, TaskStore};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    tasks: HashMap<Uuid, Task>,
    /// Task ids per job, in URL order.
    tasks_by_job: HashMap<Uuid, Vec<Uuid>>,
    leases: HashMap<Uuid, RunnerLease>,
}

impl Tables {
    fn job_tasks(&self, job_id: Uuid) -> impl Iterator<Item = &Task> {
        self.tasks_by_job
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tasks.get(id))
    }

    /// Recomputes the job's statistics from scratch and bumps `updated_at`.
    fn refresh_job(&mut self, job_id: Uuid, now: DateTime<Utc>) {
        let stats = statistics::compute(self.job_tasks(job_id));
        if let Some(job) = self.jobs.get_mut(&job_id) {
            job.statistics = stats;
            job.updated_at = now;
        }
    }

    /// Applies `update` to every task of the job matching `filter`.
    fn update_where(
        &mut self,
        job_id: Uuid,
        filter: impl Fn(&Task) -> bool,
        update: impl Fn() -> TaskUpdate,
    ) -> u64 {
        let ids = self.tasks_by_job.get(&job_id).cloned().unwrap_or_default();
        let mut count = 0;
        for id in ids {
            if let Some(task) = self.tasks.get_mut(&id) {
                if filter(task) {
                    update().apply(task);
                    count += 1;
                }
            }
        }
        count
    }
}

/// Task store held entirely in memory.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tables: RwLock<Tables>,
    events: EventBus,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn bulk_update(
        &self,
        job_id: Uuid,
        filter: impl Fn(&Task) -> bool,
        update: impl Fn() -> TaskUpdate,
    ) -> Result<u64, StoreError> {
        let count = {
            let mut tables = self.tables.write().await;
            if !tables.jobs.contains_key(&job_id) {
                return Err(StoreError::JobNotFound(job_id));
            }
            let count = tables.update_where(job_id, filter, update);
            if count > 0 {
                tables.refresh_job(job_id, Utc::now());
            }
            count
        };
        if count > 0 {
            self.events.publish(StoreEvent::TasksChanged { job_id, count });
        }
        Ok(count)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let (job, tasks) = new_job.build(Utc::now())?;
        {
            let mut tables = self.tables.write().await;
            tables
                .tasks_by_job
                .insert(job.id, tasks.iter().map(|t| t.id).collect());
            for task in tasks {
                tables.tasks.insert(task.id, task);
            }
            tables.jobs.insert(job.id, job.clone());
        }
        debug!(job_id = %job.id, tasks = job.urls.len(), "Job created");
        self.events.publish(StoreEvent::JobChanged { job_id: job.id });
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.tables.read().await.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.tables.read().await.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
        let job = {
            let mut tables = self.tables.write().await;
            let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
            update.apply(job, Utc::now())?;
            job.clone()
        };
        self.events.publish(StoreEvent::JobChanged { job_id: id });
        Ok(job)
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let changed = {
            let mut tables = self.tables.write().await;
            let job = tables.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))?;
            if job.status == from {
                job.status = to;
                job.updated_at = Utc::now();
                true
            } else {
                false
            }
        };
        if changed {
            self.events.publish(StoreEvent::JobChanged { job_id: id });
        }
        Ok(changed)
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let existed = {
            let mut tables = self.tables.write().await;
            let existed = tables.jobs.remove(&id).is_some();
            tables.leases.remove(&id);
            if let Some(task_ids) = tables.tasks_by_job.remove(&id) {
                for task_id in task_ids {
                    tables.tasks.remove(&task_id);
                }
            }
            existed
        };
        if existed {
            self.events.publish(StoreEvent::JobDeleted { job_id: id });
        }
        Ok(existed)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self.tables.read().await.job_tasks(job_id).cloned().collect())
    }

    async fn list_pending_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .job_tasks(job_id)
            .filter(|t| t.status == TaskStatus::Pending)
            .cloned()
            .collect())
    }

    async fn list_failed_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .job_tasks(job_id)
            .filter(|t| t.status == TaskStatus::Failed)
            .cloned()
            .collect())
    }

    async fn update_task(&self, id: Uuid, update: TaskUpdate) -> Result<Task, StoreError> {
        let task = {
            let mut tables = self.tables.write().await;
            let task = tables.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
            update.apply(task);
            let task = task.clone();
            tables.refresh_job(task.job_id, Utc::now());
            task
        };
        self.events.publish(StoreEvent::TaskChanged {
            job_id: task.job_id,
            task_id: id,
        });
        Ok(task)
    }

    async fn claim_task(
        &self,
        id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let claimed = {
            let mut tables = self.tables.write().await;
            let task = tables.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }
            TaskUpdate::running(started_at).apply(task);
            let task = task.clone();
            tables.refresh_job(task.job_id, Utc::now());
            task
        };
        self.events.publish(StoreEvent::TaskChanged {
            job_id: claimed.job_id,
            task_id: id,
        });
        Ok(Some(claimed))
    }

    async fn reset_tasks(
        &self,
        job_id: Uuid,
        statuses: &[TaskStatus],
    ) -> Result<u64, StoreError> {
        self.bulk_update(job_id, |t| statuses.contains(&t.status), TaskUpdate::reset)
            .await
    }

    async fn cancel_pending_tasks(
        &self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.bulk_update(
            job_id,
            |t| t.status == TaskStatus::Pending,
            || TaskUpdate::cancelled(at),
        )
        .await
    }

    async fn recover_interrupted_tasks(&self, job_id: Uuid) -> Result<u64, StoreError> {
        self.bulk_update(
            job_id,
            |t| t.status == TaskStatus::Running,
            interrupted_update,
        )
        .await
    }

    async fn acquire_lease(
        &self,
        job_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.jobs.contains_key(&job_id) {
            return Err(StoreError::JobNotFound(job_id));
        }
        let free = match tables.leases.get(&job_id) {
            None => true,
            Some(lease) => lease.owner == owner || lease.is_stale(stale_before),
        };
        if free {
            tables.leases.insert(
                job_id,
                RunnerLease {
                    owner,
                    heartbeat_at: now,
                },
            );
        }
        Ok(free)
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        match tables.leases.get_mut(&job_id) {
            Some(lease) if lease.owner == owner => {
                lease.heartbeat_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, job_id: Uuid, owner: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        if tables.leases.get(&job_id).is_some_and(|lease| lease.owner == owner) {
            tables.leases.remove(&job_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get_lease(&self, job_id: Uuid) -> Result<Option<RunnerLease>, StoreError> {
        Ok(self.tables.read().await.leases.get(&job_id).copied())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{ExtractionConfig, Row, TaskResult};

    fn new_job(n: usize) -> NewJob {
        let urls = (0..n).map(|i| format!("https://example.com/p/{}", i)).collect();
        NewJob::new(ExtractionConfig::new("article"), urls)
    }

    async fn assert_consistent(store: &InMemoryTaskStore, job_id: Uuid) {
        let job = store.get_job(job_id).await.unwrap().unwrap();
        let tasks = store.list_tasks(job_id).await.unwrap();
        assert_eq!(job.statistics, statistics::compute(&tasks));
        assert_eq!(job.statistics.total as usize, job.urls.len());
    }

    #[tokio::test]
    async fn test_create_and_get_job() {
        let store = InMemoryTaskStore::new();
        let job = store.create_job(new_job(3)).await.unwrap();

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched, job);
        assert_eq!(store.list_pending_tasks(job.id).await.unwrap().len(), 3);
        assert_consistent(&store, job.id).await;
    }

    #[tokio::test]
    async fn test_update_task_recomputes_statistics() {
        let store = InMemoryTaskStore::new();
        let job = store.create_job(new_job(2)).await.unwrap();
        let tasks = store.list_tasks(job.id).await.unwrap();

        let mut row = Row::new();
        row.insert("title".into(), "hello".into());
        store
            .update_task(
                tasks[0].id,
                TaskUpdate::completed(TaskResult::new(vec![row.clone(), row]), Utc::now()),
            )
            .await
            .unwrap();
        store
            .update_task(tasks[1].id, TaskUpdate::failed("404", Utc::now()))
            .await
            .unwrap();

        let job_after = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job_after.statistics.completed, 1);
        assert_eq!(job_after.statistics.failed, 1);
        assert_eq!(job_after.statistics.total_rows, 2);
        assert!(job_after.updated_at >= job.updated_at);
        assert_eq!(store.list_failed_tasks(job.id).await.unwrap().len(), 1);
        assert_consistent(&store, job.id).await;
    }

    #[tokio::test]
    async fn test_claim_task_only_from_pending() {
        let store = InMemoryTaskStore::new();
        let job = store.create_job(new_job(1)).await.unwrap();
        let task_id = store.list_tasks(job.id).await.unwrap()[0].id;

        let claimed = store.claim_task(task_id, Utc::now()).await.unwrap();
        assert_eq!(claimed.unwrap().status, TaskStatus::Running);
        assert!(store.claim_task(task_id, Utc::now()).await.unwrap().is_none());
        assert_eq!(store.get_job(job.id).await.unwrap().unwrap().statistics.running, 1);
    }

    #[tokio::test]
    async fn test_transition_job_is_compare_and_set() {
        let store = InMemoryTaskStore::new();
        let job = store.create_job(new_job(1)).await.unwrap();

        assert!(store
            .transition_job(job.id, JobStatus::Pending, JobStatus::Running)
            .await
            .unwrap());
        assert!(!store
            .transition_job(job.id, JobStatus::Pending, JobStatus::Completed)
            .await
            .unwrap());
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let store = InMemoryTaskStore::new();
        let job = store.create_job(new_job(4)).await.unwrap();
        let tasks = store.list_tasks(job.id).await.unwrap();

        store.claim_task(tasks[0].id, Utc::now()).await.unwrap();
        store
            .update_task(tasks[1].id, TaskUpdate::failed("dns", Utc::now()))
            .await
            .unwrap();

        assert_eq!(
            store
                .cancel_pending_tasks(job.id, Utc::now())
                .await
                .unwrap(),
            2
        );
        assert_eq!(store.recover_interrupted_tasks(job.id).await.unwrap(), 1);
        assert_eq!(
            store
                .reset_tasks(job.id, &[TaskStatus::Failed, TaskStatus::Cancelled])
                .await
                .unwrap(),
            3
        );

        let stats = store.get_job(job.id).await.unwrap().unwrap().statistics;
        assert_eq!(stats.pending, 4);
        assert_consistent(&store, job.id).await;
    }

    #[tokio::test]
    async fn test_delete_job_removes_tasks() {
        let store = InMemoryTaskStore::new();
        let job = store.create_job(new_job(2)).await.unwrap();
        let task_id = store.list_tasks(job.id).await.unwrap()[0].id;

        assert!(store.delete_job(job.id).await.unwrap());
        assert!(store.get_job(job.id).await.unwrap().is_none());
        assert!(store.get_task(task_id).await.unwrap().is_none());
        assert!(store.list_tasks(job.id).await.unwrap().is_empty());
        assert!(!store.delete_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_has_one_live_owner() {
        let store = InMemoryTaskStore::new();
        let job = store.create_job(new_job(1)).await.unwrap();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(30);

        assert!(store.acquire_lease(job.id, first, now, stale_before).await.unwrap());
        assert!(store.acquire_lease(job.id, first, now, stale_before).await.unwrap());
        assert!(!store.acquire_lease(job.id, second, now, stale_before).await.unwrap());
        assert!(!store.renew_lease(job.id, second, now).await.unwrap());
        assert_eq!(store.get_lease(job.id).await.unwrap().unwrap().owner, first);

        // A heartbeat older than the cutoff no longer protects the lease.
        let later = now + chrono::Duration::seconds(60);
        assert!(store
            .acquire_lease(job.id, second, later, later - chrono::Duration::seconds(30))
            .await
            .unwrap());
        assert!(!store.renew_lease(job.id, first, later).await.unwrap());
        assert!(!store.release_lease(job.id, first).await.unwrap());
        assert!(store.release_lease(job.id, second).await.unwrap());
        assert!(store.get_lease(job.id).await.unwrap().is_none());

        assert!(matches!(
            store.acquire_lease(Uuid::new_v4(), first, now, stale_before).await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_records() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            store.update_task(id, TaskUpdate::reset()).await,
            Err(StoreError::TaskNotFound(_))
        ));
        assert!(matches!(
            store.update_job(id, JobUpdate::status(JobStatus::Paused)).await,
            Err(StoreError::JobNotFound(_))
        ));
        assert!(matches!(
            store.reset_tasks(id, &[TaskStatus::Failed]).await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_publish_events() {
        let store = InMemoryTaskStore::new();
        let mut events = store.subscribe();
        let job = store.create_job(new_job(1)).await.unwrap();
        let task_id = store.list_tasks(job.id).await.unwrap()[0].id;
        store.claim_task(task_id, Utc::now()).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::JobChanged { job_id: job.id }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            StoreEvent::TaskChanged {
                job_id: job.id,
                task_id
            }
        );
    }
}
