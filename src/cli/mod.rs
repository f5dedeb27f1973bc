//! Command-line interface for scrape-batch.
//!
//! Provides commands for creating jobs, running them to completion, and
//! inspecting, retrying, cancelling and deleting them.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
