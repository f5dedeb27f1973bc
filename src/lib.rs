//! scrape-batch: durable batch scraping with bounded concurrency.
//!
//! A job applies one row/column extraction rule to a fixed list of URLs.
//! The library stores jobs and their per-URL tasks, drains pending tasks
//! through an external page extractor with retries and backoff, and supports
//! pause, resume, cancel and retry while keeping per-job statistics exact.

pub mod cli;
pub mod config;
pub mod error;
pub mod extractor;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use error::{ConfigError, ExtractError, SchedulerError, StoreError};
pub use extractor::{CommandExtractor, PageExtractor};
pub use scheduler::{JobController, RetryPolicy, RunnerConfig};
pub use store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};
