//! Database schema constants.
//!
//! This module contains the SQL schema definitions for the SQLite task
//! store: the `jobs` and `tasks` tables plus the indexes that keep pending
//! and failed scans off a full table walk.

/// SQL schema for creating the jobs table.
///
/// `statistics` is a JSON-encoded `Statistics` value, rewritten by every
/// task mutation.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    config      TEXT NOT NULL,
    urls        TEXT NOT NULL,
    status      TEXT NOT NULL,
    settings    TEXT NOT NULL,
    statistics  TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
)
"#;

/// SQL schema for creating the tasks table.
pub const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id            TEXT PRIMARY KEY,
    job_id        TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    url           TEXT NOT NULL,
    position      INTEGER NOT NULL,
    status        TEXT NOT NULL,
    result        TEXT,
    row_count     INTEGER NOT NULL DEFAULT 0,
    error         TEXT,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    started_at    TEXT,
    completed_at  TEXT
)
"#;

/// SQL schema for the runner lease table.
///
/// At most one row per job. `heartbeat_ms` is milliseconds since the epoch
/// so staleness checks compare integers.
pub const CREATE_JOB_LEASES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_leases (
    job_id        TEXT PRIMARY KEY REFERENCES jobs(id) ON DELETE CASCADE,
    owner         TEXT NOT NULL,
    heartbeat_ms  INTEGER NOT NULL
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_tasks_job_id ON tasks(job_id);
CREATE INDEX IF NOT EXISTS idx_tasks_job_id_status ON tasks(job_id, status);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_TASKS_TABLE,
        CREATE_INDEXES,
        CREATE_JOB_LEASES_TABLE,
    ]
}

/// Table names in the schema.
pub mod tables {
    /// Jobs table name.
    pub const JOBS: &str = "jobs";
    /// Tasks table name.
    pub const TASKS: &str = "tasks";
    /// Runner lease table name.
    pub const JOB_LEASES: &str = "job_leases";
}
