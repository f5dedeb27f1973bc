//! SQLite-backed task store.
//!
//! Every mutation runs in one transaction that starts with a write, so the
//! connection holds SQLite's write lock before it reads anything. The
//! task write, the statistics recompute and the `updated_at` bump therefore
//! commit together or not at all.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;

use super::events::{EventBus, StoreEvent};
use super::migrations::MigrationRunner;
use super::model::{
    Job, JobStatus, JobUpdate, NewJob, RunnerLease, Statistics, Task, TaskResult, TaskStatus,
    TaskUpdate,
};
use super::statistics::add_grouped;
use super::TaskStore;

/// Default size of the connection pool for file databases.
const DEFAULT_MAX_CONNECTIONS: u32 = 4;

const TASK_COLUMNS: &str = "id, job_id, url, position, status, result, error, retry_count, \
                            started_at, completed_at";

/// Task store persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
    events: EventBus,
}

impl SqliteTaskStore {
    /// Opens (creating if missing) the database file at `path` and applies
    /// the schema.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        Self::open_with(path, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn open_with(path: &str, max_connections: u32) -> Result<Self, StoreError> {
        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(opts)
            .await?;

        let store = Self::from_pool(pool).await?;
        info!(path = path, "Task store opened");
        Ok(store)
    }

    /// A private in-memory database. A single connection keeps every query
    /// on the same database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        MigrationRunner::new(pool.clone()).run_migrations().await?;
        Ok(Self {
            pool,
            events: EventBus::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_tasks(
        &self,
        job_id: Uuid,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>, StoreError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM tasks WHERE job_id = ?1 AND status = ?2 ORDER BY position",
                    TASK_COLUMNS
                ))
                .bind(job_id.to_string())
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM tasks WHERE job_id = ?1 ORDER BY position",
                    TASK_COLUMNS
                ))
                .bind(job_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(task_from_row).collect()
    }
}

// =========================================================================
// Row mapping
// =========================================================================

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|e| StoreError::Corrupt(format!("bad id '{}': {}", value, e)))
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    Ok(Job {
        id: parse_uuid(row.try_get("id")?)?,
        name: row.try_get("name")?,
        config: serde_json::from_str(row.try_get("config")?)?,
        urls: serde_json::from_str(row.try_get("urls")?)?,
        status: row.try_get::<&str, _>("status")?.parse()?,
        settings: serde_json::from_str(row.try_get("settings")?)?,
        statistics: serde_json::from_str(row.try_get("statistics")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let result: Option<&str> = row.try_get("result")?;
    let result: Option<TaskResult> = result.map(serde_json::from_str).transpose()?;

    Ok(Task {
        id: parse_uuid(row.try_get("id")?)?,
        job_id: parse_uuid(row.try_get("job_id")?)?,
        url: row.try_get("url")?,
        position: row.try_get::<i64, _>("position")? as u32,
        status: row.try_get::<&str, _>("status")?.parse()?,
        result,
        error: row.try_get("error")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn lease_from_row(row: &SqliteRow) -> Result<RunnerLease, StoreError> {
    let heartbeat_ms: i64 = row.try_get("heartbeat_ms")?;
    let heartbeat_at = DateTime::<Utc>::from_timestamp_millis(heartbeat_ms).ok_or_else(|| {
        StoreError::Corrupt(format!("bad lease heartbeat: {}", heartbeat_ms))
    })?;
    Ok(RunnerLease {
        owner: parse_uuid(row.try_get("owner")?)?,
        heartbeat_at,
    })
}

// =========================================================================
// Transaction helpers
// =========================================================================

/// Bumps the job's `updated_at`, taking the write lock. Fails with
/// `JobNotFound` if the job does not exist.
async fn touch_job(
    conn: &mut SqliteConnection,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let result = sqlx::query("UPDATE jobs SET updated_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(job_id.to_string())
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::JobNotFound(job_id));
    }
    Ok(())
}

async fn load_task(conn: &mut SqliteConnection, id: Uuid) -> Result<Task, StoreError> {
    let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::TaskNotFound(id))?;
    task_from_row(&row)
}

async fn write_task(conn: &mut SqliteConnection, task: &Task) -> Result<(), StoreError> {
    let result_json = task.result.as_ref().map(serde_json::to_string).transpose()?;
    sqlx::query(
        r#"
        UPDATE tasks SET
            status = ?1,
            result = ?2,
            row_count = ?3,
            error = ?4,
            retry_count = ?5,
            started_at = ?6,
            completed_at = ?7
        WHERE id = ?8
        "#,
    )
    .bind(task.status.as_str())
    .bind(result_json)
    .bind(task.row_count() as i64)
    .bind(&task.error)
    .bind(task.retry_count as i64)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.id.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Recomputes the job's statistics from its task rows and persists them.
async fn refresh_statistics(
    conn: &mut SqliteConnection,
    job_id: Uuid,
) -> Result<Statistics, StoreError> {
    let groups = sqlx::query(
        r#"
        SELECT status, COUNT(*) AS n, COALESCE(SUM(row_count), 0) AS row_total
        FROM tasks
        WHERE job_id = ?1
        GROUP BY status
        "#,
    )
    .bind(job_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    let mut stats = Statistics::default();
    for group in &groups {
        let status: TaskStatus = group.try_get::<&str, _>("status")?.parse()?;
        let count: i64 = group.try_get("n")?;
        let rows: i64 = group.try_get("row_total")?;
        add_grouped(&mut stats, status, count as u64, rows as u64);
    }

    sqlx::query("UPDATE jobs SET statistics = ?1 WHERE id = ?2")
        .bind(serde_json::to_string(&stats)?)
        .bind(job_id.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(stats)
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let (job, tasks) = new_job.build(Utc::now())?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, config, urls, status, settings, statistics, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.name)
        .bind(serde_json::to_string(&job.config)?)
        .bind(serde_json::to_string(&job.urls)?)
        .bind(job.status.as_str())
        .bind(serde_json::to_string(&job.settings)?)
        .bind(serde_json::to_string(&job.statistics)?)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await?;

        for task in &tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (id, job_id, url, position, status, retry_count)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(task.id.to_string())
            .bind(job.id.to_string())
            .bind(&task.url)
            .bind(task.position as i64)
            .bind(task.status.as_str())
            .bind(task.retry_count as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(job_id = %job.id, tasks = tasks.len(), "Job created");
        self.events.publish(StoreEvent::JobChanged { job_id: job.id });
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn update_job(&self, id: Uuid, update: JobUpdate) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        touch_job(&mut tx, id, now).await?;

        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let mut job = job_from_row(&row)?;
        update.apply(&mut job, now)?;

        sqlx::query("UPDATE jobs SET name = ?1, status = ?2, settings = ?3 WHERE id = ?4")
            .bind(&job.name)
            .bind(job.status.as_str())
            .bind(serde_json::to_string(&job.settings)?)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.events.publish(StoreEvent::JobChanged { job_id: id });
        Ok(job)
    }

    async fn transition_job(
        &self,
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE jobs SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4")
                .bind(to.as_str())
                .bind(Utc::now())
                .bind(id.to_string())
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 1 {
            self.events.publish(StoreEvent::JobChanged { job_id: id });
            return Ok(true);
        }
        match self.get_job(id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::JobNotFound(id)),
        }
    }

    async fn delete_job(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM job_leases WHERE job_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM tasks WHERE job_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if deleted > 0 {
            self.events.publish(StoreEvent::JobDeleted { job_id: id });
        }
        Ok(deleted > 0)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError> {
        self.fetch_tasks(job_id, None).await
    }

    async fn list_pending_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError> {
        self.fetch_tasks(job_id, Some(TaskStatus::Pending)).await
    }

    async fn list_failed_tasks(&self, job_id: Uuid) -> Result<Vec<Task>, StoreError> {
        self.fetch_tasks(job_id, Some(TaskStatus::Failed)).await
    }

    async fn update_task(&self, id: Uuid, update: TaskUpdate) -> Result<Task, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            "UPDATE jobs SET updated_at = ?1 WHERE id = (SELECT job_id FROM tasks WHERE id = ?2)",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(id));
        }

        let mut task = load_task(&mut tx, id).await?;
        update.apply(&mut task);
        write_task(&mut tx, &task).await?;
        refresh_statistics(&mut tx, task.job_id).await?;
        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE tasks SET status = ?1, started_at = ?2
            WHERE id = ?3 AND status = ?4
            "#,
        )
        .bind(TaskStatus::Running.as_str())
        .bind(started_at)
        .bind(id.to_string())
        .bind(TaskStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let task = load_task(&mut tx, id).await?;
        if claimed == 0 {
            return Ok(None);
        }

        touch_job(&mut tx, task.job_id, Utc::now()).await?;
        refresh_statistics(&mut tx, task.job_id).await?;
        tx.commit().await?;

        self.events.publish(StoreEvent::TaskChanged {
            job_id: task.job_id,
            task_id: id,
        });
        Ok(Some(task))
    }

    async fn reset_tasks(
        &self,
        job_id: Uuid,
        statuses: &[TaskStatus],
    ) -> Result<u64, StoreError> {
        if statuses.is_empty() {
            return Ok(0);
        }
        let placeholders: Vec<String> = (0..statuses.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            r#"
            UPDATE tasks SET
                status = ?1, retry_count = 0, result = NULL, row_count = 0, error = NULL,
                started_at = NULL, completed_at = NULL
            WHERE job_id = ?2 AND status IN ({})
            "#,
            placeholders.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        touch_job(&mut tx, job_id, Utc::now()).await?;

        let mut query = sqlx::query(&sql)
            .bind(TaskStatus::Pending.as_str())
            .bind(job_id.to_string());
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let count = query.execute(&mut *tx).await?.rows_affected();

        if count == 0 {
            return Ok(0);
        }
        refresh_statistics(&mut tx, job_id).await?;
        tx.commit().await?;

        self.events.publish(StoreEvent::TasksChanged { job_id, count });
        Ok(count)
    }

    async fn cancel_pending_tasks(
        &self,
        job_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        touch_job(&mut tx, job_id, Utc::now()).await?;

        let count = sqlx::query(
            r#"
            UPDATE tasks SET status = ?1, completed_at = ?2, result = NULL, row_count = 0, error = NULL
            WHERE job_id = ?3 AND status = ?4
            "#,
        )
        .bind(TaskStatus::Cancelled.as_str())
        .bind(at)
        .bind(job_id.to_string())
        .bind(TaskStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if count == 0 {
            return Ok(0);
        }
        refresh_statistics(&mut tx, job_id).await?;
        tx.commit().await?;

        self.events.publish(StoreEvent::TasksChanged { job_id, count });
        Ok(count)
    }

    async fn recover_interrupted_tasks(&self, job_id: Uuid) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        touch_job(&mut tx, job_id, Utc::now()).await?;

        let count = sqlx::query(
            r#"
            UPDATE tasks SET status = ?1, started_at = NULL, completed_at = NULL
            WHERE job_id = ?2 AND status = ?3
            "#,
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(job_id.to_string())
        .bind(TaskStatus::Running.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if count == 0 {
            return Ok(0);
        }
        refresh_statistics(&mut tx, job_id).await?;
        tx.commit().await?;

        self.events.publish(StoreEvent::TasksChanged { job_id, count });
        Ok(count)
    }

    async fn acquire_lease(
        &self,
        job_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        // The SELECT makes a missing job insert nothing instead of
        // tripping the foreign key.
        let acquired = sqlx::query(
            r#"
            INSERT INTO job_leases (job_id, owner, heartbeat_ms)
            SELECT id, ?2, ?3 FROM jobs WHERE id = ?1
            ON CONFLICT(job_id) DO UPDATE SET
                owner = excluded.owner,
                heartbeat_ms = excluded.heartbeat_ms
            WHERE job_leases.owner = excluded.owner OR job_leases.heartbeat_ms < ?4
            "#,
        )
        .bind(job_id.to_string())
        .bind(owner.to_string())
        .bind(now.timestamp_millis())
        .bind(stale_before.timestamp_millis())
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if acquired {
            debug!(job_id = %job_id, owner = %owner, "Lease acquired");
            return Ok(true);
        }
        match self.get_job(job_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::JobNotFound(job_id)),
        }
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let renewed = sqlx::query(
            "UPDATE job_leases SET heartbeat_ms = ?1 WHERE job_id = ?2 AND owner = ?3",
        )
        .bind(now.timestamp_millis())
        .bind(job_id.to_string())
        .bind(owner.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(renewed == 1)
    }

    async fn release_lease(&self, job_id: Uuid, owner: Uuid) -> Result<bool, StoreError> {
        let released = sqlx::query("DELETE FROM job_leases WHERE job_id = ?1 AND owner = ?2")
            .bind(job_id.to_string())
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(released == 1)
    }

    async fn get_lease(&self, job_id: Uuid) -> Result<Option<RunnerLease>, StoreError> {
        let row = sqlx::query("SELECT owner, heartbeat_ms FROM job_leases WHERE job_id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lease_from_row).transpose()
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::model::{ExtractionConfig, JobSettings, Row};
    use crate::store::statistics;

    fn new_job(n: usize) -> NewJob {
        let urls = (0..n).map(|i| format!("https://shop.example/{}", i)).collect();
        NewJob::new(
            ExtractionConfig::new(".product").with_attribute_column("link", "a", "href"),
            urls,
        )
        .with_name("products")
        .with_settings(JobSettings::default().with_max_concurrency(2))
    }

    async fn assert_consistent(store: &SqliteTaskStore, job_id: Uuid) {
        let job = store.get_job(job_id).await.unwrap().unwrap();
        let tasks = store.list_tasks(job_id).await.unwrap();
        assert_eq!(job.statistics, statistics::compute(&tasks));
        assert_eq!(job.statistics.total as usize, tasks.len());
    }

    #[tokio::test]
    async fn test_create_job_round_trips() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let job = store.create_job(new_job(3)).await.unwrap();

        let fetched = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, job.id);
        assert_eq!(fetched.name, "products");
        assert_eq!(fetched.config, job.config);
        assert_eq!(fetched.urls, job.urls);
        assert_eq!(fetched.settings.max_concurrency, 2);
        assert_eq!(fetched.statistics.pending, 3);

        let pending = store.list_pending_tasks(job.id).await.unwrap();
        let positions: Vec<u32> = pending.iter().map(|t| t.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_task_lifecycle_keeps_statistics_in_sync() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let job = store.create_job(new_job(3)).await.unwrap();
        let tasks = store.list_tasks(job.id).await.unwrap();

        let claimed = store.claim_task(tasks[0].id, Utc::now()).await.unwrap();
        assert_eq!(claimed.unwrap().status, TaskStatus::Running);
        assert!(store.claim_task(tasks[0].id, Utc::now()).await.unwrap().is_none());
        assert_consistent(&store, job.id).await;

        let mut row = Row::new();
        row.insert("link".into(), "/a".into());
        let done = store
            .update_task(
                tasks[0].id,
                TaskUpdate::completed(TaskResult::new(vec![row]), Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(done.result.as_ref().unwrap().row_count(), 1);

        store
            .update_task(tasks[1].id, TaskUpdate::failed("connection reset", Utc::now()))
            .await
            .unwrap();

        let job_after = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job_after.statistics.completed, 1);
        assert_eq!(job_after.statistics.failed, 1);
        assert_eq!(job_after.statistics.pending, 1);
        assert_eq!(job_after.statistics.total_rows, 1);
        assert!(job_after.updated_at >= job.updated_at);

        let failed = store.list_failed_tasks(job.id).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_deref(), Some("connection reset"));
        assert_consistent(&store, job.id).await;
    }

    #[tokio::test]
    async fn test_bulk_operations() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let job = store.create_job(new_job(4)).await.unwrap();
        let tasks = store.list_tasks(job.id).await.unwrap();

        store.claim_task(tasks[0].id, Utc::now()).await.unwrap();
        store
            .update_task(tasks[1].id, TaskUpdate::failed("503", Utc::now()))
            .await
            .unwrap();

        assert_eq!(store.cancel_pending_tasks(job.id, Utc::now()).await.unwrap(), 2);
        assert_eq!(store.recover_interrupted_tasks(job.id).await.unwrap(), 1);
        assert_eq!(store.reset_tasks(job.id, &[TaskStatus::Failed]).await.unwrap(), 1);
        assert_eq!(store.reset_tasks(job.id, &[]).await.unwrap(), 0);

        let stats = store.get_job(job.id).await.unwrap().unwrap().statistics;
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.cancelled, 2);
        assert_consistent(&store, job.id).await;
    }

    #[tokio::test]
    async fn test_transition_job() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let job = store.create_job(new_job(1)).await.unwrap();

        assert!(store
            .transition_job(job.id, JobStatus::Pending, JobStatus::Running)
            .await
            .unwrap());
        assert!(!store
            .transition_job(job.id, JobStatus::Paused, JobStatus::Running)
            .await
            .unwrap());
        assert!(matches!(
            store
                .transition_job(Uuid::new_v4(), JobStatus::Pending, JobStatus::Running)
                .await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_job_and_delete() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let job = store.create_job(new_job(2)).await.unwrap();

        let updated = store
            .update_job(job.id, JobUpdate::status(JobStatus::Paused).with_name("renamed"))
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Paused);
        assert_eq!(
            store.get_job(job.id).await.unwrap().unwrap().name,
            "renamed"
        );

        assert!(store.delete_job(job.id).await.unwrap());
        assert!(store.get_job(job.id).await.unwrap().is_none());
        assert!(store.list_tasks(job.id).await.unwrap().is_empty());
        assert!(!store.delete_job(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_lease_is_shared_between_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let path = path.to_str().unwrap();

        let first = SqliteTaskStore::open(path).await.unwrap();
        let second = SqliteTaskStore::open(path).await.unwrap();
        let job = first.create_job(new_job(1)).await.unwrap();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(30);

        assert!(first.acquire_lease(job.id, a, now, stale_before).await.unwrap());
        assert!(!second.acquire_lease(job.id, b, now, stale_before).await.unwrap());
        assert!(second.renew_lease(job.id, a, now).await.unwrap());

        let lease = second.get_lease(job.id).await.unwrap().unwrap();
        assert_eq!(lease.owner, a);
        assert_eq!(lease.heartbeat_at.timestamp_millis(), now.timestamp_millis());

        // Stale heartbeat: the lease can be taken over.
        let later = now + chrono::Duration::seconds(60);
        assert!(second
            .acquire_lease(job.id, b, later, later - chrono::Duration::seconds(30))
            .await
            .unwrap());
        assert!(!first.renew_lease(job.id, a, later).await.unwrap());
        assert!(!first.release_lease(job.id, a).await.unwrap());

        assert!(first.delete_job(job.id).await.unwrap());
        assert!(second.get_lease(job.id).await.unwrap().is_none());
        assert!(matches!(
            first.acquire_lease(job.id, a, now, stale_before).await,
            Err(StoreError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_task_is_reported() {
        let store = SqliteTaskStore::in_memory().await.unwrap();
        let err = store
            .update_task(Uuid::new_v4(), TaskUpdate::reset())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn test_statistics_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let path = path.to_str().unwrap();

        let job_id = {
            let store = SqliteTaskStore::open(path).await.unwrap();
            let job = store.create_job(new_job(2)).await.unwrap();
            let task = &store.list_tasks(job.id).await.unwrap()[0];
            store
                .update_task(task.id, TaskUpdate::completed(TaskResult::default(), Utc::now()))
                .await
                .unwrap();
            store.close().await;
            job.id
        };

        let store = SqliteTaskStore::open(path).await.unwrap();
        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.statistics.completed, 1);
        assert_eq!(job.statistics.pending, 1);
        assert_consistent(&store, job_id).await;
    }
}
