//! Remote version discovery by bounded backward probing.

use futures_util::stream::{self, StreamExt};
use thiserror::Error;

use crate::remote::{self, Archive};
use crate::request::{ArchiveLayout, RequestDescriptor, RequestError, ResourceKey};
use crate::retry::RetryConfig;
use crate::version::{Step, Version, VersionError};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Cannot build resource URLs: {0}")]
    Request(#[from] RequestError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("Request expands to no resource URLs")]
    NoResources,
}

/// Result of checking one candidate version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Every resource of the candidate exists.
    Found(Version),
    /// At least one resource answered a definitive not-found.
    NotYetPublished,
    /// Some existence check kept failing after retries.
    TransientError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(Version),
    NotFound {
        probes: u32,
        /// Last transient failure seen while probing, for operator logs.
        last_transient: Option<String>,
    },
}

pub struct VersionResolver<'a> {
    archive: &'a dyn Archive,
    layout: &'a ArchiveLayout,
    retry: &'a RetryConfig,
    concurrency: usize,
}

impl<'a> VersionResolver<'a> {
    pub fn new(
        archive: &'a dyn Archive,
        layout: &'a ArchiveLayout,
        retry: &'a RetryConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            archive,
            layout,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Walk backward from `start` in `step` decrements, checking at most
    /// `max_probes` candidates, and return the first one for which every
    /// resource in the URL product exists.
    pub async fn resolve(
        &self,
        url_dimensions: &RequestDescriptor,
        start: Version,
        step: Step,
        max_probes: u32,
    ) -> Result<Resolution, ResolveError> {
        let mut candidate = start;
        let mut last_transient = None;

        for probe in 0..max_probes {
            if probe > 0 {
                candidate = candidate.checked_sub(step)?;
            }
            match self.probe(url_dimensions, candidate).await? {
                ProbeOutcome::Found(version) => {
                    tracing::info!(version = %version, probes = probe + 1, "Resolved remote version");
                    return Ok(Resolution::Found(version));
                }
                ProbeOutcome::NotYetPublished => {
                    tracing::debug!(version = %candidate, "Candidate not published");
                }
                ProbeOutcome::TransientError(cause) => {
                    tracing::warn!(version = %candidate, "Candidate probe failed: {}", cause);
                    last_transient = Some(cause);
                }
            }
        }

        Ok(Resolution::NotFound {
            probes: max_probes,
            last_transient,
        })
    }

    /// Check every resource URL of one candidate version concurrently.
    pub async fn probe(
        &self,
        url_dimensions: &RequestDescriptor,
        version: Version,
    ) -> Result<ProbeOutcome, ResolveError> {
        let keys = self.layout.resource_keys(url_dimensions, version)?;
        if keys.is_empty() {
            return Err(ResolveError::NoResources);
        }

        let archive = self.archive;
        let retry = self.retry;
        let results: Vec<_> = stream::iter(keys)
            .map(|key: ResourceKey| async move {
                let result = remote::exists_with_retry(archive, &key.url, retry).await;
                (key, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut transient = None;
        for (key, result) in results {
            match result {
                Ok(true) => {}
                Ok(false) => {
                    tracing::trace!(url = %key.url, "missing");
                    return Ok(ProbeOutcome::NotYetPublished);
                }
                Err(e) if e.is_not_found() => return Ok(ProbeOutcome::NotYetPublished),
                Err(e) => transient = Some(e.to_string()),
            }
        }

        Ok(match transient {
            Some(cause) => ProbeOutcome::TransientError(cause),
            None => ProbeOutcome::Found(version),
        })
    }
}
