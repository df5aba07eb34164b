use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// How a dataset finds the version to process next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Probe backward from the current publication slot for the newest
    /// complete version.
    #[default]
    Latest,
    /// Step forward from the stored version and try to fetch the next one.
    Next,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Latest => "latest",
            Strategy::Next => "next",
        }
    }
}
