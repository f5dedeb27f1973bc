//! Subprocess-backed page extractor.
//!
//! For every URL the configured program is spawned, receives one JSON
//! `ExtractionRequest` on stdin, and must print the extracted rows on stdout
//! before exiting with status 0. Accepted output shapes:
//!
//! ```text
//! [{"title": "a"}, {"title": "b"}]
//! {"rows": [{"title": "a"}]}
//! {"error": "navigation timeout"}
//! ```

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ExtractError;
use crate::store::{ExtractionConfig, RenderingMode, Row};

use super::PageExtractor;

/// Longest stderr excerpt kept in an error message.
const MAX_STDERR_CHARS: usize = 2000;

/// Request written to the extractor's stdin.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionRequest<'a> {
    pub url: &'a str,
    pub config: &'a ExtractionConfig,
    pub rendering: RenderingMode,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExtractorResponse {
    Rows(Vec<Row>),
    Wrapped { rows: Vec<Row> },
    Error { error: String },
}

/// Configuration for the subprocess extractor.
#[derive(Debug, Clone)]
pub struct CommandExtractorConfig {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Environment variables set for the program.
    pub env: Vec<(String, String)>,
    /// Kill the program if it runs longer than this.
    pub timeout: Option<Duration>,
}

impl CommandExtractorConfig {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            timeout: None,
        }
    }

    /// Sets the argument list.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the per-page timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Parses a shell-like command line: program followed by
    /// whitespace-separated arguments.
    pub fn from_command_line(command_line: &str) -> Option<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program).with_args(parts))
    }
}

/// Extractor that delegates every page to an external program.
pub struct CommandExtractor {
    config: CommandExtractorConfig,
}

impl CommandExtractor {
    pub fn new(config: CommandExtractorConfig) -> Self {
        Self { config }
    }

    async fn run(&self, request: &[u8]) -> Result<std::process::Output, ExtractError> {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.config.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ExtractError::Spawn(format!("{}: {}", self.config.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExtractError::Spawn("failed to capture stdin".to_string()))?;
        stdin.write_all(request).await?;
        stdin.shutdown().await?;
        drop(stdin);

        Ok(child.wait_with_output().await?)
    }
}

/// Interprets the extractor's stdout.
fn parse_output(stdout: &[u8]) -> Result<Vec<Row>, ExtractError> {
    let response: ExtractorResponse = serde_json::from_slice(stdout)
        .map_err(|e| ExtractError::Parse(e.to_string()))?;
    match response {
        ExtractorResponse::Rows(rows) | ExtractorResponse::Wrapped { rows } => Ok(rows),
        ExtractorResponse::Error { error } => Err(ExtractError::Failed(error)),
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .trim()
        .chars()
        .take(MAX_STDERR_CHARS)
        .collect()
}

#[async_trait]
impl PageExtractor for CommandExtractor {
    async fn extract(
        &self,
        url: &str,
        config: &ExtractionConfig,
        rendering: RenderingMode,
    ) -> Result<Vec<Row>, ExtractError> {
        let request = serde_json::to_vec(&ExtractionRequest {
            url,
            config,
            rendering,
        })
        .map_err(|e| ExtractError::Parse(e.to_string()))?;

        debug!(url = url, program = %self.config.program, "Spawning extractor");

        let output = match self.config.timeout {
            Some(limit) => timeout(limit, self.run(&request))
                .await
                .map_err(|_| ExtractError::Timeout(limit))??,
            None => self.run(&request).await?,
        };

        if !output.status.success() {
            return Err(ExtractError::Process {
                code: output.status.code().unwrap_or(-1),
                stderr: stderr_excerpt(&output.stderr),
            });
        }

        parse_output(&output.stdout)
    }
}
