//! Page extraction port.
//!
//! The scheduler never renders or parses pages itself. It hands each URL and
//! the job's extraction rule to a `PageExtractor` and stores whatever rows
//! come back. Any error is treated as transient and retried up to the job's
//! `max_retries`.
//!
//! - **PageExtractor**: the trait the scheduler consumes
//! - **CommandExtractor**: runs an external program (a headless browser
//!   wrapper, typically) once per URL over a JSON stdin/stdout protocol

pub mod command;

use async_trait::async_trait;

use crate::error::ExtractError;
use crate::store::{ExtractionConfig, RenderingMode, Row};

pub use command::{CommandExtractor, CommandExtractorConfig, ExtractionRequest};

/// Renders a page and applies an extraction rule to it.
///
/// Implementations must return one row per root-selector candidate, keeping
/// rows whose columns all came back empty.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(
        &self,
        url: &str,
        config: &ExtractionConfig,
        rendering: RenderingMode,
    ) -> Result<Vec<Row>, ExtractError>;
}
