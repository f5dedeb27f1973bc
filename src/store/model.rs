//! Job and task records for the task store.
//!
//! This module defines the persisted data model:
//!
//! - `Job`: one scraping run over an immutable, ordered list of URLs
//! - `Task`: one URL's unit of work within a job
//! - `Statistics`: aggregate counts derived from a job's tasks
//! - `RunnerLease`: which runner currently owns a job
//! - `JobUpdate` / `TaskUpdate`: partial updates applied by the store

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, StoreError};

/// Default number of tasks dispatched concurrently per job.
const DEFAULT_MAX_CONCURRENCY: u32 = 3;

/// Default pause between two admissions, in milliseconds.
const DEFAULT_DELAY_BETWEEN_REQUESTS_MS: u64 = 1000;

/// Default number of retries after the first failed attempt.
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Lifecycle status of a job.
///
/// There is deliberately no `Failed` variant: task failures never escalate
/// to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(StoreError::Corrupt(format!("invalid job status: {}", s))),
        }
    }
}

/// Lifecycle status of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Returns whether the task has reached a state the runner will not leave
    /// on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(StoreError::Corrupt(format!("invalid task status: {}", s))),
        }
    }
}

/// How the extractor should load a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderingMode {
    /// Full browser rendering; scripts run and the page settles first.
    #[default]
    Browser,
    /// Raw document only.
    Static,
}

impl std::fmt::Display for RenderingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderingMode::Browser => write!(f, "browser"),
            RenderingMode::Static => write!(f, "static"),
        }
    }
}

/// One column of the extraction rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name used as the key in every extracted row.
    pub name: String,
    /// Selector evaluated relative to each root candidate.
    pub selector: String,
    /// Attribute to read instead of the element text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

/// Row/column extraction rule.
///
/// The scheduler treats this as opaque and only hands it to the extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Selector enumerating one candidate element per row.
    pub root_selector: String,
    /// Per-column sub-selectors.
    #[serde(default)]
    pub columns: Vec<ColumnSpec>,
}

impl ExtractionConfig {
    pub fn new(root_selector: impl Into<String>) -> Self {
        Self {
            root_selector: root_selector.into(),
            columns: Vec::new(),
        }
    }

    /// Adds a text column.
    pub fn with_column(mut self, name: impl Into<String>, selector: impl Into<String>) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            selector: selector.into(),
            attribute: None,
        });
        self
    }

    /// Adds a column that reads an attribute of the matched element.
    pub fn with_attribute_column(
        mut self,
        name: impl Into<String>,
        selector: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            selector: selector.into(),
            attribute: Some(attribute.into()),
        });
        self
    }
}

/// One extracted row, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Rows extracted from a single page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub rows: Vec<Row>,
}

impl TaskResult {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }
}

/// Per-job execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSettings {
    /// Maximum number of tasks in flight at once. Must be at least 1.
    pub max_concurrency: u32,
    /// Pause between two admissions, in milliseconds.
    pub delay_between_requests_ms: u64,
    /// Retries allowed after the first failed attempt.
    pub max_retries: u32,
    /// Rendering mode passed to the extractor.
    pub rendering: RenderingMode,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            delay_between_requests_ms: DEFAULT_DELAY_BETWEEN_REQUESTS_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            rendering: RenderingMode::default(),
        }
    }
}

impl JobSettings {
    /// Sets the concurrency limit.
    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the admission delay.
    pub fn with_delay_between_requests(mut self, delay: Duration) -> Self {
        self.delay_between_requests_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the rendering mode.
    pub fn with_rendering(mut self, rendering: RenderingMode) -> Self {
        self.rendering = rendering;
        self
    }

    pub fn delay_between_requests(&self) -> Duration {
        Duration::from_millis(self.delay_between_requests_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Aggregate counts over a job's tasks.
///
/// Never written directly; the store recomputes it from the task records
/// on every task mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Sum of row counts over completed tasks.
    pub total_rows: u64,
}

impl Statistics {
    /// Returns whether nothing is left for a runner to do.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.running == 0
    }

    /// Percentage of tasks in a terminal state.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        let done = self.completed + self.failed + self.cancelled;
        (done as f64 / self.total as f64) * 100.0
    }
}

/// A scraping run over a fixed list of URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub config: ExtractionConfig,
    pub urls: Vec<String>,
    pub status: JobStatus,
    pub settings: JobSettings,
    pub statistics: Statistics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One URL's unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub job_id: Uuid,
    pub url: String,
    /// Index of the URL in the job's list; defines FIFO admission order.
    pub position: u32,
    pub status: TaskStatus,
    /// Set iff `status == Completed`.
    pub result: Option<TaskResult>,
    /// Set iff `status == Failed`.
    pub error: Option<String>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Rows contributed to `Statistics::total_rows`.
    pub fn row_count(&self) -> u64 {
        match (self.status, &self.result) {
            (TaskStatus::Completed, Some(result)) => result.row_count(),
            _ => 0,
        }
    }
}

/// Claim a runner holds on a job while it drains it.
///
/// Shared through the store, so runners in different processes see each
/// other. The owner renews `heartbeat_at` while it runs; a lease whose
/// heartbeat is older than the lease TTL belongs to a runner that is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerLease {
    pub owner: Uuid,
    pub heartbeat_at: DateTime<Utc>,
}

impl RunnerLease {
    pub fn is_stale(&self, stale_before: DateTime<Utc>) -> bool {
        self.heartbeat_at < stale_before
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub config: ExtractionConfig,
    pub urls: Vec<String>,
    pub name: Option<String>,
    pub settings: Option<JobSettings>,
}

impl NewJob {
    pub fn new(config: ExtractionConfig, urls: Vec<String>) -> Self {
        Self {
            config,
            urls,
            name: None,
            settings: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Builds the job record and one pending task per URL.
    ///
    /// Both store implementations persist exactly what this returns.
    pub fn build(self, now: DateTime<Utc>) -> Result<(Job, Vec<Task>), StoreError> {
        if self.urls.is_empty() {
            return Err(StoreError::Validation(
                "a job needs at least one URL".to_string(),
            ));
        }
        let settings = self.settings.unwrap_or_default();
        settings.validate()?;

        let job_id = Uuid::new_v4();
        let tasks: Vec<Task> = self
            .urls
            .iter()
            .enumerate()
            .map(|(position, url)| Task {
                id: Uuid::new_v4(),
                job_id,
                url: url.clone(),
                position: position as u32,
                status: TaskStatus::Pending,
                result: None,
                error: None,
                retry_count: 0,
                started_at: None,
                completed_at: None,
            })
            .collect();

        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("Job {}", now.format("%Y-%m-%d %H:%M:%S")));

        let job = Job {
            id: job_id,
            name,
            config: self.config,
            urls: self.urls,
            status: JobStatus::Pending,
            settings,
            statistics: super::statistics::compute(&tasks),
            created_at: now,
            updated_at: now,
        };

        Ok((job, tasks))
    }
}

/// Partial update of a job record.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub status: Option<JobStatus>,
    pub settings: Option<JobSettings>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Applies the update in place and bumps `updated_at`.
    pub fn apply(self, job: &mut Job, now: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(settings) = &self.settings {
            settings.validate()?;
        }
        if let Some(name) = self.name {
            job.name = name;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(settings) = self.settings {
            job.settings = settings;
        }
        job.updated_at = now;
        Ok(())
    }
}

/// Partial update of a task record.
///
/// `apply` keeps the result/error invariant: a result survives only on a
/// completed task and an error only on a failed one.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Clears `started_at` and `completed_at`.
    pub clear_timestamps: bool,
}

impl TaskUpdate {
    pub fn running(started_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Running),
            started_at: Some(started_at),
            ..Default::default()
        }
    }

    pub fn completed(result: TaskResult, completed_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Completed),
            result: Some(result),
            completed_at: Some(completed_at),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>, completed_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(error.into()),
            completed_at: Some(completed_at),
            ..Default::default()
        }
    }

    /// Back to the pending pool for another attempt.
    pub fn requeue(retry_count: u32) -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            retry_count: Some(retry_count),
            ..Default::default()
        }
    }

    /// Fresh pending state with the retry budget restored.
    pub fn reset() -> Self {
        Self {
            status: Some(TaskStatus::Pending),
            retry_count: Some(0),
            clear_timestamps: true,
            ..Default::default()
        }
    }

    pub fn cancelled(completed_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(TaskStatus::Cancelled),
            completed_at: Some(completed_at),
            ..Default::default()
        }
    }

    pub fn apply(self, task: &mut Task) {
        if self.clear_timestamps {
            task.started_at = None;
            task.completed_at = None;
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(error) = self.error {
            task.error = Some(error);
        }
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count;
        }
        if let Some(started_at) = self.started_at {
            task.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = Some(completed_at);
        }

        match task.status {
            TaskStatus::Completed => task.error = None,
            TaskStatus::Failed => task.result = None,
            _ => {
                task.result = None;
                task.error = None;
            }
        }
    }
}
