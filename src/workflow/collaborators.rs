//! Seams between the sync engine and the processing that happens to a
//! version once its bytes are local: transform, persist, notify.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::fetch::FetchResult;
use crate::version::Version;

/// What a run hands to its collaborators besides the data itself.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub dataset_id: String,
    /// Output namespace (layer name) the dataset publishes under.
    pub namespace: String,
    pub version: Version,
    pub cancel: CancellationToken,
}

/// Files produced by a transform, ready to persist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistAck {
    /// Final locations of the persisted files.
    pub stored: Vec<PathBuf>,
    /// Auxiliary state keys to merge into the dataset's persisted state.
    pub aux: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyAck {
    Sent,
    /// No endpoint configured.
    Unavailable,
}

#[async_trait]
pub trait Transform: Send + Sync {
    async fn transform(&self, fetched: &FetchResult, ctx: &RunContext) -> anyhow::Result<Artifact>;
}

#[async_trait]
pub trait Persist: Send + Sync {
    async fn persist(&self, artifact: Artifact, ctx: &RunContext) -> anyhow::Result<PersistAck>;
}

#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, namespace: &str, path: &Path, ctx: &RunContext)
        -> anyhow::Result<NotifyAck>;
}
