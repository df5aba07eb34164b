use clap::{Parser, Subcommand};

use crate::types::LogLevel;

#[derive(Parser, Debug)]
#[command(
    name = "gridsync",
    version,
    about = "Incrementally sync versioned weather-model archives"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Dataset definitions (JSON)
    #[arg(long, env = "GRIDSYNC_CONFIG", default_value = "~/.gridsync/datasets.json", global = true)]
    pub config: String,

    /// Directory holding state.json and the process lock
    #[arg(long, env = "DATASET_STATE_DIR", default_value = "~/.gridsync/state", global = true)]
    pub state_dir: String,

    /// Scratch directory for partial downloads (default: <state-dir>/work)
    #[arg(long, global = true)]
    pub work_dir: Option<String>,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, env = "LOG", value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Timeout in seconds for each HTTP request
    #[arg(long, default_value_t = 60, global = true)]
    pub timeout_secs: u64,

    /// Ingest webhook endpoint notified after each persisted layer
    #[arg(long, env = "GSKY_INGEST_LAYER_WEBHOOK_URL", global = true)]
    pub webhook_url: Option<String>,

    /// Shared secret used to sign webhook bodies
    #[arg(long, env = "GSKY_WEBHOOK_SECRET", hide_env_values = true, global = true)]
    pub webhook_secret: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one sync pass over every dataset (or only the named ones)
    Sync(SelectArgs),

    /// Sync each dataset on its own interval until interrupted
    Watch(SelectArgs),

    /// Print the stored state of every dataset
    Status,

    /// Forget a dataset's stored version so the next run starts over
    ResetState(ResetStateArgs),
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct SelectArgs {
    /// Dataset id to process (repeatable; default: all)
    #[arg(short = 'd', long = "dataset")]
    pub datasets: Vec<String>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ResetStateArgs {
    /// Dataset id whose entry is removed
    pub dataset: String,

    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}
