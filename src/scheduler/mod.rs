//! Bounded-concurrency execution of scrape jobs.
//!
//! This module turns a job's pending tasks into extracted rows:
//!
//! - **RetryPolicy**: exponential backoff with jitter for failing tasks
//! - **JobRunner**: the per-job draining loop over a `PageExtractor`
//! - **RunnerRegistry**: at most one active runner per job in this process,
//!   plus its signals; the store's runner lease extends that across processes
//! - **JobController**: the start/pause/resume/cancel/retry command surface
//!
//! # Architecture
//!
//! ```text
//!   command ──▶ JobController ──▶ RunnerRegistry
//!                    │                  │ signals
//!                    ▼                  ▼
//!               TaskStore ◀──────── JobRunner ──▶ PageExtractor
//!                    │
//!                    └──▶ StoreEvent subscribers
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use scrape_batch::scheduler::{JobController, RunnerConfig};
//! use scrape_batch::store::SqliteTaskStore;
//!
//! let store = Arc::new(SqliteTaskStore::open("scrape_batch.db").await?);
//! let controller = JobController::new(store, extractor, RunnerConfig::default());
//!
//! controller.start_job(job_id).await?;
//! controller.pause_job(job_id).await?;
//! controller.resume_job(job_id).await?;
//! controller.wait(job_id).await;
//! ```

pub mod controller;
pub mod registry;
pub mod retry;
pub mod runner;

pub use controller::JobController;
pub use registry::{RunnerControl, RunnerRegistry, Signal, WakeOutcome};
pub use retry::{backoff_delay, RetryPolicy};
pub use runner::{JobRunner, RunnerConfig, RunnerExit, DEFAULT_LEASE_TTL};
