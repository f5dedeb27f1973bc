//! CLI command definitions for scrape-batch.
//!
//! Every command opens the SQLite task store, performs its operation and
//! exits. `run`, `retry-failed` and `retry-url` additionally drive a runner
//! in this process and stay attached until it exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{load_extraction_config, load_urls, AppConfig, DEFAULT_DATABASE_PATH};
use crate::error::SchedulerError;
use crate::extractor::CommandExtractor;
use crate::scheduler::{JobController, RetryPolicy};
use crate::store::{
    Job, JobSettings, JobStatus, JobUpdate, NewJob, RenderingMode, SqliteTaskStore, Statistics,
    TaskStatus, TaskStore,
};

/// Batch URL scraper with durable, resumable jobs.
#[derive(Parser)]
#[command(name = "scrape-batch")]
#[command(about = "Apply a row/column extraction rule to a batch of URLs")]
#[command(version)]
#[command(
    long_about = "scrape-batch stores scraping jobs in SQLite and drains them through an external extractor program with bounded concurrency, retries and pause/resume.\n\nExample usage:\n  scrape-batch create --config rule.json --urls urls.txt --max-concurrency 4\n  scrape-batch run <job> --extractor 'node render.js'"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// SQLite database holding jobs and tasks.
    #[arg(long, env = "SCRAPE_BATCH_DB", default_value = DEFAULT_DATABASE_PATH, global = true)]
    pub db: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create a job from an extraction rule and a URL list.
    Create(CreateArgs),

    /// List all jobs.
    #[command(alias = "ls")]
    List,

    /// Show a job's status and statistics.
    Status(StatusArgs),

    /// Show a job's tasks.
    Tasks(TasksArgs),

    /// Start or resume a job and wait until its runner exits.
    ///
    /// Ctrl-C pauses the job: no new pages are admitted and the command
    /// exits once in-flight pages have finished.
    Run(RunArgs),

    /// Pause a job.
    Pause(JobArgs),

    /// Return all failed tasks to the queue and run the job.
    RetryFailed(RunArgs),

    /// Return one failed or cancelled task to the queue and run the job.
    RetryUrl(RetryUrlArgs),

    /// Cancel a job and all of its pending tasks.
    Cancel(JobArgs),

    /// Delete a job and all of its tasks.
    #[command(alias = "rm")]
    Delete(JobArgs),
}

/// Arguments for `scrape-batch create`.
#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// JSON file with the extraction rule (`root_selector`, `columns`).
    #[arg(short, long)]
    pub config: PathBuf,

    /// File with one URL per line.
    #[arg(short, long)]
    pub urls: PathBuf,

    /// Job name (defaults to a timestamp).
    #[arg(short, long)]
    pub name: Option<String>,

    /// Maximum pages extracted at the same time.
    #[arg(long, default_value_t = 3)]
    pub max_concurrency: u32,

    /// Delay between page admissions, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub delay_ms: u64,

    /// Retries per page before it is marked failed.
    #[arg(long, default_value_t = 2)]
    pub max_retries: u32,

    /// Fetch pages without a browser.
    #[arg(long = "static")]
    pub static_rendering: bool,
}

/// Arguments naming one job.
#[derive(Parser, Debug)]
pub struct JobArgs {
    /// Job id or unique id prefix.
    pub job: String,
}

/// Arguments for `scrape-batch status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Job id or unique id prefix.
    pub job: String,

    /// Print the job as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `scrape-batch tasks`.
#[derive(Parser, Debug)]
pub struct TasksArgs {
    /// Job id or unique id prefix.
    pub job: String,

    /// Only show tasks with this status.
    #[arg(short, long)]
    pub status: Option<TaskStatus>,

    /// Print tasks as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Extractor settings for commands that run a job.
#[derive(Parser, Debug)]
pub struct ExtractorArgs {
    /// Extractor command line; receives a JSON request on stdin and prints
    /// the rows as JSON on stdout.
    #[arg(short, long, env = "SCRAPE_BATCH_EXTRACTOR")]
    pub extractor: Option<String>,

    /// Per-page extractor timeout in seconds.
    #[arg(long, env = "SCRAPE_BATCH_EXTRACTOR_TIMEOUT")]
    pub extractor_timeout: Option<u64>,

    /// Base retry delay in milliseconds (doubles per attempt).
    #[arg(long, default_value_t = 1000)]
    pub retry_base_ms: u64,
}

/// Arguments for `scrape-batch run` and `scrape-batch retry-failed`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Job id or unique id prefix.
    pub job: String,

    #[command(flatten)]
    pub extractor: ExtractorArgs,
}

/// Arguments for `scrape-batch retry-url`.
#[derive(Parser, Debug)]
pub struct RetryUrlArgs {
    /// Job id or unique id prefix.
    pub job: String,

    /// Task id or unique id prefix.
    pub task: String,

    #[command(flatten)]
    pub extractor: ExtractorArgs,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let base = AppConfig::new()
        .with_database_path(cli.db)
        .with_log_level(cli.log_level);

    match cli.command {
        Commands::Create(args) => run_create_command(base, args).await,
        Commands::List => run_list_command(base).await,
        Commands::Status(args) => run_status_command(base, args).await,
        Commands::Tasks(args) => run_tasks_command(base, args).await,
        Commands::Run(args) => run_job_command(base, args).await,
        Commands::Pause(args) => run_pause_command(base, args).await,
        Commands::RetryFailed(args) => run_retry_failed_command(base, args).await,
        Commands::RetryUrl(args) => run_retry_url_command(base, args).await,
        Commands::Cancel(args) => run_cancel_command(base, args).await,
        Commands::Delete(args) => run_delete_command(base, args).await,
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteTaskStore>> {
    config.validate()?;
    let store = SqliteTaskStore::open(&config.database_url())
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to open database {}: {}",
                config.database_path.display(),
                e
            )
        })?;
    Ok(Arc::new(store))
}

fn with_extractor(config: AppConfig, args: &ExtractorArgs) -> AppConfig {
    let mut config = config.with_retry_policy(RetryPolicy::new(
        Duration::from_millis(args.retry_base_ms),
        crate::scheduler::retry::DEFAULT_MAX_JITTER,
    ));
    if let Some(command) = &args.extractor {
        config = config.with_extractor_command(command.clone());
    }
    if let Some(secs) = args.extractor_timeout {
        config = config.with_extractor_timeout(Duration::from_secs(secs));
    }
    config
}

async fn build_controller(
    config: &AppConfig,
) -> anyhow::Result<(Arc<SqliteTaskStore>, JobController)> {
    let extractor = CommandExtractor::new(config.extractor_config()?);
    let store = open_store(config).await?;
    let controller = JobController::new(
        store.clone(),
        Arc::new(extractor),
        config.runner_config(),
    );
    Ok((store, controller))
}

/// Resolves a full job id or a unique prefix of one.
async fn resolve_job(store: &dyn TaskStore, reference: &str) -> anyhow::Result<Job> {
    if let Ok(id) = Uuid::parse_str(reference) {
        return store
            .get_job(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Job not found: {}", reference));
    }

    let mut matches: Vec<Job> = store
        .list_jobs()
        .await?
        .into_iter()
        .filter(|job| job.id.to_string().starts_with(reference))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("Job not found: {}", reference),
        1 => Ok(matches.remove(0)),
        n => anyhow::bail!("Job reference '{}' is ambiguous ({} matches)", reference, n),
    }
}

async fn resolve_task(store: &dyn TaskStore, job_id: Uuid, reference: &str) -> anyhow::Result<Uuid> {
    let mut matches: Vec<Uuid> = store
        .list_tasks(job_id)
        .await?
        .into_iter()
        .map(|task| task.id)
        .filter(|id| id.to_string().starts_with(reference))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("Task not found in job {}: {}", job_id, reference),
        1 => Ok(matches.remove(0)),
        n => anyhow::bail!("Task reference '{}' is ambiguous ({} matches)", reference, n),
    }
}

fn format_statistics(stats: &Statistics) -> String {
    format!(
        "{}/{} done ({:.0}%), pending {}, running {}, failed {}, cancelled {}, rows {}",
        stats.completed + stats.failed + stats.cancelled,
        stats.total,
        stats.progress(),
        stats.pending,
        stats.running,
        stats.failed,
        stats.cancelled,
        stats.total_rows
    )
}

async fn run_create_command(config: AppConfig, args: CreateArgs) -> anyhow::Result<()> {
    let extraction = load_extraction_config(&args.config)?;
    let urls = load_urls(&args.urls)?;
    if urls.is_empty() {
        anyhow::bail!("No URLs found in {}", args.urls.display());
    }

    let rendering = if args.static_rendering {
        RenderingMode::Static
    } else {
        RenderingMode::Browser
    };
    let settings = JobSettings::default()
        .with_max_concurrency(args.max_concurrency)
        .with_delay_between_requests(Duration::from_millis(args.delay_ms))
        .with_max_retries(args.max_retries)
        .with_rendering(rendering);
    settings.validate()?;

    let mut new_job = NewJob::new(extraction, urls).with_settings(settings);
    if let Some(name) = args.name {
        new_job = new_job.with_name(name);
    }

    let store = open_store(&config).await?;
    let job = store.create_job(new_job).await?;

    info!(job_id = %job.id, urls = job.urls.len(), "Job created");
    println!("Created job {} ({}) with {} URLs", job.id, job.name, job.urls.len());
    Ok(())
}

async fn run_list_command(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let jobs = store.list_jobs().await?;
    if jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<9}  {:>11}  {:>6}  {:>7}  NAME",
        "ID", "STATUS", "DONE/TOTAL", "FAILED", "ROWS"
    );
    for job in jobs {
        let stats = job.statistics;
        println!(
            "{:<36}  {:<9}  {:>11}  {:>6}  {:>7}  {}",
            job.id,
            job.status,
            format!("{}/{}", stats.completed, stats.total),
            stats.failed,
            stats.total_rows,
            job.name
        );
    }
    Ok(())
}

async fn run_status_command(config: AppConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let job = resolve_job(store.as_ref(), &args.job).await?;

    if args.json {
        let json = serde_json::to_string_pretty(&job)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json);
        return Ok(());
    }

    println!("Job:        {} ({})", job.id, job.name);
    println!("Status:     {}", job.status);
    println!(
        "Settings:   concurrency {}, delay {}ms, retries {}, rendering {}",
        job.settings.max_concurrency,
        job.settings.delay_between_requests_ms,
        job.settings.max_retries,
        job.settings.rendering
    );
    println!("Progress:   {}", format_statistics(&job.statistics));
    println!("Created:    {}", job.created_at.to_rfc3339());
    println!("Updated:    {}", job.updated_at.to_rfc3339());
    Ok(())
}

async fn run_tasks_command(config: AppConfig, args: TasksArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let job = resolve_job(store.as_ref(), &args.job).await?;
    let tasks: Vec<_> = store
        .list_tasks(job.id)
        .await?
        .into_iter()
        .filter(|task| args.status.map_or(true, |status| task.status == status))
        .collect();

    if args.json {
        let json = serde_json::to_string_pretty(&tasks)
            .map_err(|e| anyhow::anyhow!("Failed to serialize JSON output: {}", e))?;
        println!("{}", json);
        return Ok(());
    }

    println!(
        "{:>4}  {:<36}  {:<9}  {:>7}  {:>5}  URL",
        "#", "TASK", "STATUS", "RETRIES", "ROWS"
    );
    for task in &tasks {
        println!(
            "{:>4}  {:<36}  {:<9}  {:>7}  {:>5}  {}",
            task.position,
            task.id,
            task.status,
            task.retry_count,
            task.row_count(),
            task.url
        );
        if let Some(error) = &task.error {
            println!("      error: {}", error);
        }
    }
    Ok(())
}

async fn run_job_command(config: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    let config = with_extractor(config, &args.extractor);
    let (store, controller) = build_controller(&config).await?;
    let job = resolve_job(store.as_ref(), &args.job).await?;

    let started = match job.status {
        JobStatus::Paused => controller.resume_job(job.id).await,
        JobStatus::Completed if job.statistics.is_drained() => {
            println!("Job {} is already completed.", job.id);
            println!("Progress:   {}", format_statistics(&job.statistics));
            return Ok(());
        }
        _ => controller.start_job(job.id).await,
    };
    started.map_err(|e| explain_start_error(e, &config))?;

    watch_job(&controller, job.id).await
}

fn explain_start_error(err: SchedulerError, config: &AppConfig) -> anyhow::Error {
    match err {
        SchedulerError::LeaseHeld { job_id, owner } => anyhow::anyhow!(
            "Job {} is being run by another process (runner {}). \
             If that process died, the job can be started again {}s after its last heartbeat.",
            job_id,
            owner,
            config.runner_config().lease_ttl.as_secs()
        ),
        other => other.into(),
    }
}

async fn run_retry_failed_command(config: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    let config = with_extractor(config, &args.extractor);
    let (store, controller) = build_controller(&config).await?;
    let job = resolve_job(store.as_ref(), &args.job).await?;

    let reset = controller.retry_failed_urls(job.id).await?;
    if reset == 0 {
        println!("Job {} has no failed tasks.", job.id);
        return Ok(());
    }
    println!("Retrying {} failed tasks.", reset);
    watch_job(&controller, job.id).await
}

async fn run_retry_url_command(config: AppConfig, args: RetryUrlArgs) -> anyhow::Result<()> {
    let config = with_extractor(config, &args.extractor);
    let (store, controller) = build_controller(&config).await?;
    let job = resolve_job(store.as_ref(), &args.job).await?;
    let task_id = resolve_task(store.as_ref(), job.id, &args.task).await?;

    controller.retry_url(job.id, task_id).await?;
    watch_job(&controller, job.id).await
}

/// Prints progress until the job's runner exits. Ctrl-C pauses the job.
async fn watch_job(controller: &JobController, job_id: Uuid) -> anyhow::Result<()> {
    let store = controller.store();
    let mut events = store.subscribe();
    let mut last: Option<Statistics> = None;
    let mut interrupted = false;

    let finished = controller.wait(job_id);
    tokio::pin!(finished);

    loop {
        tokio::select! {
            _ = &mut finished => break,
            event = events.recv() => match event {
                Ok(event) if event.job_id() == job_id => {
                    if let Some(job) = store.get_job(job_id).await? {
                        if last != Some(job.statistics) {
                            println!("{}", format_statistics(&job.statistics));
                            last = Some(job.statistics);
                        }
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "Progress events lagged");
                }
                Err(RecvError::Closed) => {
                    (&mut finished).await;
                    break;
                }
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal?;
                interrupted = true;
                warn!(job_id = %job_id, "Interrupted, pausing job");
                println!("Pausing; waiting for in-flight pages to finish...");
                controller.pause_job(job_id).await?;
            }
        }
    }

    let job = store
        .get_job(job_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Job {} was deleted while running", job_id))?;
    println!("Job {} is {}.", job.id, job.status);
    println!("Progress:   {}", format_statistics(&job.statistics));
    if job.statistics.failed > 0 {
        println!(
            "{} tasks failed; see `scrape-batch tasks {} --status failed`.",
            job.statistics.failed, job.id
        );
    }
    Ok(())
}

async fn run_pause_command(config: AppConfig, args: JobArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let job = resolve_job(store.as_ref(), &args.job).await?;
    if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
        anyhow::bail!("Cannot pause job {} while it is {}", job.id, job.status);
    }

    // A runner in another process notices the persisted status on its next
    // iteration and stops admitting.
    store
        .update_job(job.id, JobUpdate::status(JobStatus::Paused))
        .await?;
    println!("Paused job {}.", job.id);
    Ok(())
}

async fn run_cancel_command(config: AppConfig, args: JobArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let job = resolve_job(store.as_ref(), &args.job).await?;
    match job.status {
        JobStatus::Cancelled => {
            println!("Job {} is already cancelled.", job.id);
            return Ok(());
        }
        JobStatus::Completed => {
            anyhow::bail!("Cannot cancel job {} while it is completed", job.id)
        }
        _ => {}
    }

    store
        .update_job(job.id, JobUpdate::status(JobStatus::Cancelled))
        .await?;
    let cancelled = store.cancel_pending_tasks(job.id, chrono::Utc::now()).await?;
    println!("Cancelled job {} ({} pending tasks cancelled).", job.id, cancelled);
    Ok(())
}

async fn run_delete_command(config: AppConfig, args: JobArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let job = resolve_job(store.as_ref(), &args.job).await?;
    if job.status == JobStatus::Running {
        warn!(job_id = %job.id, "Deleting a job that is marked running");
    }
    store.delete_job(job.id).await?;
    println!("Deleted job {} and its {} tasks.", job.id, job.statistics.total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create() {
        let cli = Cli::try_parse_from([
            "scrape-batch",
            "--db",
            "jobs.db",
            "create",
            "--config",
            "rule.json",
            "--urls",
            "urls.txt",
            "--max-concurrency",
            "5",
            "--static",
        ])
        .unwrap();

        assert_eq!(cli.db, PathBuf::from("jobs.db"));
        match cli.command {
            Commands::Create(args) => {
                assert_eq!(args.max_concurrency, 5);
                assert_eq!(args.delay_ms, 1000);
                assert_eq!(args.max_retries, 2);
                assert!(args.static_rendering);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_parse_tasks_status_filter() {
        let cli = Cli::try_parse_from(["scrape-batch", "tasks", "abc", "--status", "failed"]).unwrap();
        match cli.command {
            Commands::Tasks(args) => assert_eq!(args.status, Some(TaskStatus::Failed)),
            _ => panic!("expected tasks"),
        }
    }

    #[tokio::test]
    async fn test_resolve_job_by_prefix() {
        let store = crate::store::InMemoryTaskStore::new();
        let job = store
            .create_job(NewJob::new(
                crate::store::ExtractionConfig::new("li"),
                vec!["https://a.test".to_string()],
            ))
            .await
            .unwrap();

        let prefix = &job.id.to_string()[..8];
        let resolved = resolve_job(&store, prefix).await.unwrap();
        assert_eq!(resolved.id, job.id);
        assert!(resolve_job(&store, "zzzz").await.is_err());
    }
}
