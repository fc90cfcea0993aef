use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use forum_cron::config::{AppConfig, CliConfig, FileConfig};
use forum_cron::dispatch::Dispatcher;
use forum_cron::mail::NullMailQueue;
use forum_cron::report::TracingErrorReporter;
use forum_cron::runner::TaskRunner;
use forum_cron::server::run_server;
use forum_cron::task_store::SqliteTaskStore;
use forum_cron::tasks;

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
#[command(
    name = "forum-cron",
    about = "Background task queue and scheduled-trigger engine"
)]
struct CliArgs {
    /// Directory holding the cron database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Optional TOML config file; its values override CLI flags.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// The port for the HTTP trigger (serve subcommand only).
    #[clap(short, long, default_value_t = 3080)]
    pub port: u16,

    /// Wall-clock budget per engine invocation, in seconds.
    #[clap(long, default_value_t = 10)]
    pub budget_secs: u64,

    /// Accepted clock skew on the HTTP trigger timestamp, in seconds.
    #[clap(long, default_value_t = 900)]
    pub trigger_window_secs: i64,

    /// Days to retain scheduled-task run-log entries.
    #[clap(long, default_value_t = 30)]
    pub log_retention_days: i64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// One full engine invocation: promote due tasks, drain the queue,
    /// then drain mail with any leftover budget.
    Run,
    /// A single promote + claim + dispatch cycle.
    RunOne,
    /// Run the named scheduled tasks immediately, bypassing their schedules.
    RunTask {
        #[clap(required = true)]
        names: Vec<String>,
    },
    /// Install the built-in scheduled tasks into the registry.
    Seed,
    /// Print scheduled task summaries as JSON.
    Status,
    /// Serve the HTTP pixel trigger.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = cli_args
        .config
        .as_deref()
        .map(FileConfig::load)
        .transpose()?;

    let cli_config = CliConfig {
        db_dir: cli_args.db_dir.clone(),
        port: cli_args.port,
        budget_secs: cli_args.budget_secs,
        trigger_window_secs: cli_args.trigger_window_secs,
        log_retention_days: cli_args.log_retention_days,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;
    let budget = Duration::from_secs(config.budget_secs);

    info!("Opening cron database at {:?}", config.cron_db_path());
    let store = Arc::new(SqliteTaskStore::new(config.cron_db_path())?);

    let registry = tasks::default_registry(config.log_retention_days);
    let dispatcher = Dispatcher::new(store.clone(), registry, Arc::new(TracingErrorReporter));
    let runner = Arc::new(TaskRunner::new(
        store.clone(),
        dispatcher,
        Arc::new(NullMailQueue),
    ));

    match cli_args.command {
        Command::Run => {
            let summary = runner.run_with_budget(budget)?;
            info!(
                "Done: {} promoted, {} completed, {} failed, {} poisoned",
                summary.promoted, summary.completed, summary.failed, summary.poisoned
            );
        }
        Command::RunOne => {
            let summary = runner.run_one_task()?;
            info!(
                "Done: {} promoted, {} completed, {} failed, {} poisoned",
                summary.promoted, summary.completed, summary.failed, summary.poisoned
            );
        }
        Command::RunTask { names } => {
            let ran = runner.run_named_tasks_now(&names)?;
            info!("Ran {} of {} named tasks", ran, names.len());
        }
        Command::Seed => {
            let seeded = tasks::seed_scheduled_tasks(store.as_ref(), runner.registry())?;
            info!("Seeded {} scheduled tasks", seeded);
        }
        Command::Status => {
            let infos = runner.scheduled_task_infos()?;
            println!("{}", serde_json::to_string_pretty(&infos)?);
        }
        Command::Serve => {
            run_server(runner, config.port, config.trigger_window_secs, budget).await?;
        }
    }

    Ok(())
}
