use thiserror::Error;

use super::index::IndexParseError;
use crate::remote::TransportError;

#[derive(Debug, Error)]
pub enum FetchError {
    /// No URLs were handed to the fetcher.
    #[error("Fetch request contains no resource URLs")]
    EmptyRequest,

    /// The index was read but none of its records match the selector.
    #[error("No index entries in {url} match the requested dimensions")]
    ResourceUnmatched { url: String },

    #[error("Malformed index at {url}: {source}")]
    Index {
        url: String,
        source: IndexParseError,
    },

    #[error("Retrieving {url} failed: {source}")]
    Transport {
        url: String,
        source: TransportError,
    },

    #[error("Cannot prepare work directory: {0}")]
    WorkDir(#[source] std::io::Error),
}

impl FetchError {
    /// The resource (or its data file) has not been published yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Transport { source, .. } if source.is_not_found())
    }
}
