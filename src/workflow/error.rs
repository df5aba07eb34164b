use thiserror::Error;

use super::phase::Phase;
use crate::fetch::FetchError;
use crate::request::RequestError;
use crate::resolver::ResolveError;
use crate::state::StateError;
use crate::version::VersionError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Another run for the same dataset holds its permit.
    #[error("A sync run for dataset '{0}' is already in progress")]
    AlreadyRunning(String),

    #[error("Dataset '{dataset}': invalid phase transition {from} -> {to}")]
    InvalidTransition {
        dataset: String,
        from: Phase,
        to: Phase,
    },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Version(#[from] VersionError),

    /// Transform, persist or notify failed. Nothing was committed.
    #[error("{stage} failed: {cause:#}")]
    Delegation {
        stage: &'static str,
        cause: anyhow::Error,
    },

    #[error("Run cancelled before commit")]
    Cancelled,
}
