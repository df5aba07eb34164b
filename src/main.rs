//! gridsync: keeps local copies of periodically published gridded datasets
//! (weather model runs, rainfall estimates) in step with their archives.
//!
//! Each dataset resolves the newest published version by probing candidate
//! timestamps, fetches only the byte ranges its request selects through the
//! archive's sidecar indexes, hands the result to an external transform,
//! persist and notify chain, and only then records the version as synced.

#![warn(clippy::all)]

mod cli;
mod config;
mod delegate;
mod fetch;
mod remote;
mod request;
mod resolver;
pub mod retry;
mod runner;
mod scheduler;
mod shutdown;
mod state;
mod types;
mod version;
mod workflow;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use config::{Config, DatasetConfig};
use delegate::{CommandTransform, DirectoryPersist, WebhookConfig, WebhookNotifier};
use remote::HttpArchive;
use scheduler::{ScheduledDataset, Scheduler};
use state::{JsonStateStore, StateLock, StateStore};
use workflow::{Collaborators, RunRegistry, SyncWorkflow};

/// Run the status command.
async fn run_status(config: &Config) -> anyhow::Result<()> {
    let store = JsonStateStore::open(&config.state_dir).await?;
    let entries = store.read_all().await?;

    println!("State file: {}", store.path().display());
    println!();
    if entries.is_empty() {
        println!("No datasets synced yet.");
        return Ok(());
    }
    for (id, entry) in entries {
        match entry.last_version() {
            Some(version) => println!("  {:<24} {}", id, version),
            None => println!("  {:<24} (never synced)", id),
        }
    }
    Ok(())
}

/// Run the reset-state command.
async fn run_reset_state(config: &Config, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let _lock = StateLock::acquire(&config.state_dir).await?;
    let store = JsonStateStore::open(&config.state_dir).await?;
    store.remove_stale_temps().await?;

    if !args.yes {
        println!("This will forget the synced version of '{}'.", args.dataset);
        println!("The next run will fetch it again from scratch.");
        println!();
        print!("Are you sure? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if !input.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    if store.remove(&args.dataset).await? {
        println!("State for '{}' removed.", args.dataset);
    } else {
        println!("No state recorded for '{}'.", args.dataset);
    }
    Ok(())
}

fn build_collaborators(
    dataset: &DatasetConfig,
    archive: &HttpArchive,
    webhook: &WebhookConfig,
) -> anyhow::Result<Collaborators> {
    let transform = match &dataset.transform {
        Some(t) => CommandTransform::new(&t.command, t.output_extension.clone())?,
        None => CommandTransform::passthrough(),
    };
    let notifier = WebhookNotifier::new(
        archive.client().clone(),
        WebhookConfig {
            args: dataset.webhook_args.clone().or_else(|| webhook.args.clone()),
            ..webhook.clone()
        },
        dataset.retry,
    );
    if !notifier.is_configured() {
        tracing::debug!(dataset = %dataset.id, "Ingest webhook not configured");
    }

    Ok(Collaborators {
        transform: Arc::new(transform),
        persist: Arc::new(DirectoryPersist::new(dataset.output_dir(), dataset.cleanup_past)),
        notify: Arc::new(notifier),
    })
}

/// Run the sync and watch commands.
async fn run_datasets(config: &Config, only: &[String], watch: bool) -> anyhow::Result<()> {
    let datasets = config.datasets(only)?;
    if datasets.is_empty() {
        anyhow::bail!("No datasets defined in {}", config.config_path.display());
    }

    let lock = StateLock::acquire(&config.state_dir).await?;
    tracing::debug!(lock = %lock.path().display(), "State directory locked");
    let json_store = JsonStateStore::open(&config.state_dir).await?;
    json_store.remove_stale_temps().await?;
    let store: Arc<dyn StateStore> = Arc::new(json_store);
    let archive = HttpArchive::new(config.timeout)?;
    let registry = RunRegistry::new();

    let mut scheduled = Vec::with_capacity(datasets.len());
    for dataset in &datasets {
        let workflow = SyncWorkflow::new(
            dataset.plan(&config.work_dir)?,
            Arc::new(archive.clone()),
            store.clone(),
            registry.clone(),
            build_collaborators(dataset, &archive, &config.webhook)?,
        );
        scheduled.push(ScheduledDataset {
            workflow,
            interval: dataset.interval(),
            deadline: dataset.deadline(),
        });
    }

    tracing::info!(
        datasets = scheduled.len(),
        state_dir = %config.state_dir.display(),
        watch,
        "Starting gridsync"
    );

    let shutdown_token = shutdown::install_signal_handler()?;
    let scheduler = Scheduler::new(scheduled, shutdown_token);
    let summary = if watch {
        scheduler.watch().await
    } else {
        scheduler.run_once().await
    };

    if summary.has_failures() {
        anyhow::bail!(
            "{} dataset run(s) failed, {} timed out",
            summary.failed,
            summary.timed_out
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_filter())),
        )
        .init();

    let config = Config::from_cli(&cli)?;
    tracing::debug!(?config, "Configuration loaded");

    match cli.command {
        Command::Status => run_status(&config).await,
        Command::ResetState(args) => run_reset_state(&config, args).await,
        Command::Sync(args) => run_datasets(&config, &args.datasets, false).await,
        Command::Watch(args) => run_datasets(&config, &args.datasets, true).await,
    }
}
