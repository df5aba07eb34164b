//! Per-dataset sync state machine.
//!
//! One run walks `Idle -> ResolvingVersion -> {NoNewVersion -> Idle} |
//! {VersionFound -> Fetching -> Delegating -> CommittingState -> Idle}`,
//! dropping to `Failed` on any unrecoverable error. The state store is only
//! touched in `CommittingState`, and only when delegation fully succeeded and
//! the run was not cancelled.

pub mod collaborators;
pub mod error;
pub mod phase;
pub mod registry;
#[cfg(test)]
pub(crate) mod testkit;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

pub use collaborators::{Artifact, Notify, NotifyAck, Persist, PersistAck, RunContext, Transform};
pub use error::WorkflowError;
pub use phase::{Phase, PhaseTracker};
pub use registry::RunRegistry;

use crate::fetch::{FetchOptions, FetchResult, IndexedPartialFetcher, RetrievalMode};
use crate::remote::Archive;
use crate::request::{ArchiveLayout, RequestDescriptor};
use crate::resolver::{Resolution, VersionResolver};
use crate::state::{PersistedState, StateStore};
use crate::types::Strategy;
use crate::version::{Step, Version};

/// Everything needed to sync one dataset.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub dataset_id: String,
    pub namespace: String,
    pub layout: ArchiveLayout,
    /// Full request: URL dimensions plus index selector dimensions.
    pub request: RequestDescriptor,
    pub step: Step,
    pub strategy: Strategy,
    pub max_probes: u32,
    /// `latest`: probe start instead of the current slot.
    /// `next`: first version to fetch when nothing is stored.
    pub start: Option<Version>,
    /// `work_dir` is the root; each run fetches into a per-version subdirectory.
    pub fetch: FetchOptions,
}

/// The processing chain a fetched version is handed to.
#[derive(Clone)]
pub struct Collaborators {
    pub transform: Arc<dyn Transform>,
    pub persist: Arc<dyn Persist>,
    pub notify: Arc<dyn Notify>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    NoNewVersion {
        stored: Option<Version>,
    },
    Committed {
        version: Version,
        files: usize,
        bytes: u64,
        notified: usize,
    },
}

#[derive(Clone)]
pub struct SyncWorkflow {
    plan: Arc<SyncPlan>,
    archive: Arc<dyn Archive>,
    store: Arc<dyn StateStore>,
    registry: RunRegistry,
    collaborators: Collaborators,
}

impl SyncWorkflow {
    pub fn new(
        plan: SyncPlan,
        archive: Arc<dyn Archive>,
        store: Arc<dyn StateStore>,
        registry: RunRegistry,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            plan: Arc::new(plan),
            archive,
            store,
            registry,
            collaborators,
        }
    }

    pub fn dataset_id(&self) -> &str {
        &self.plan.dataset_id
    }

    /// Execute one run. Rejected with `AlreadyRunning` if another run for the
    /// same dataset holds a permit.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunOutcome, WorkflowError> {
        let _permit = self.registry.try_acquire(&self.plan.dataset_id)?;
        let mut phase = PhaseTracker::new(&self.plan.dataset_id);

        match self.drive(&mut phase, &cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                phase.fail(&e);
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        phase: &mut PhaseTracker,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, WorkflowError> {
        let plan = &*self.plan;
        phase.advance(Phase::ResolvingVersion)?;

        let previous = self.store.read(&plan.dataset_id).await?;
        let stored = previous.as_ref().and_then(PersistedState::last_version);
        let (url_dims, selector) = plan.request.split(&plan.layout.template);

        let Some(version) = self.candidate(&url_dims, stored).await? else {
            phase.advance(Phase::NoNewVersion)?;
            phase.advance(Phase::Idle)?;
            return Ok(RunOutcome::NoNewVersion { stored });
        };
        phase.advance(Phase::VersionFound)?;
        tracing::info!(
            dataset = %plan.dataset_id,
            version = %version,
            stored = ?stored.map(|v| v.to_iso8601()),
            strategy = plan.strategy.as_str(),
            "New version"
        );

        phase.advance(Phase::Fetching)?;
        let urls: Vec<String> = plan
            .layout
            .resource_keys(&url_dims, version)?
            .into_iter()
            .map(|k| k.url)
            .collect();
        let options = FetchOptions {
            work_dir: plan
                .fetch
                .work_dir
                .join(&plan.dataset_id)
                .join(version.as_datetime().format("%Y%m%d%H%M%S").to_string()),
            ..plan.fetch.clone()
        };
        let fetcher = IndexedPartialFetcher::new(self.archive.as_ref(), &options);
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkflowError::Cancelled),
            r = fetcher.fetch(&urls, &selector) => r,
        };
        let fetched = match fetched {
            Ok(f) => f,
            Err(e) if e.is_not_found() => {
                tracing::info!(
                    dataset = %plan.dataset_id,
                    version = %version,
                    "Data not yet published: {}",
                    e
                );
                phase.advance(Phase::NoNewVersion)?;
                phase.advance(Phase::Idle)?;
                discard_work_dir(&options).await;
                return Ok(RunOutcome::NoNewVersion { stored });
            }
            Err(e) => return Err(e.into()),
        };

        for file in &fetched.files {
            let ranges = match file.mode {
                RetrievalMode::Ranges(n) => Some(n),
                RetrievalMode::Full => None,
            };
            tracing::debug!(
                dataset = %plan.dataset_id,
                url = %file.url,
                ranges = ?ranges,
                records = file.matched.len(),
                bytes = file.bytes,
                "Fetched"
            );
        }
        if !fetched.no_coverage.is_empty() {
            let missing: Vec<String> = fetched
                .no_coverage
                .iter()
                .map(|g| format!("{}={}", g.dimension, g.value))
                .collect();
            tracing::warn!(
                dataset = %plan.dataset_id,
                version = %version,
                missing = ?missing,
                "Version fetched without some requested values"
            );
        }

        phase.advance(Phase::Delegating)?;
        let ctx = RunContext {
            dataset_id: plan.dataset_id.clone(),
            namespace: plan.namespace.clone(),
            version,
            cancel: cancel.clone(),
        };
        let delegated = self.delegate(&fetched, &ctx).await;
        discard_work_dir(&options).await;
        let (ack, notified) = delegated?;

        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        phase.advance(Phase::CommittingState)?;
        let next = PersistedState::advance(previous.as_ref(), version, ack.aux);
        self.store.commit(&plan.dataset_id, next).await?;
        phase.advance(Phase::Idle)?;

        Ok(RunOutcome::Committed {
            version,
            files: fetched.files.len(),
            bytes: fetched.total_bytes(),
            notified,
        })
    }

    /// The version this run should process, or `None` when there is nothing
    /// new.
    async fn candidate(
        &self,
        url_dims: &RequestDescriptor,
        stored: Option<Version>,
    ) -> Result<Option<Version>, WorkflowError> {
        let plan = &*self.plan;
        let current_slot = Version::latest_slot(Utc::now(), plan.step);

        match plan.strategy {
            Strategy::Latest => {
                let resolver = VersionResolver::new(
                    self.archive.as_ref(),
                    &plan.layout,
                    &plan.fetch.retry,
                    plan.fetch.concurrency,
                );
                let start = plan.start.unwrap_or(current_slot);
                match resolver
                    .resolve(url_dims, start, plan.step, plan.max_probes)
                    .await?
                {
                    Resolution::Found(v) if Some(v) == stored => {
                        tracing::info!(dataset = %plan.dataset_id, version = %v, "Already up to date");
                        Ok(None)
                    }
                    Resolution::Found(v) => Ok(Some(v)),
                    Resolution::NotFound {
                        probes,
                        last_transient,
                    } => {
                        match last_transient {
                            Some(cause) => tracing::warn!(
                                dataset = %plan.dataset_id,
                                probes,
                                "No complete version found; last transient error: {}",
                                cause
                            ),
                            None => tracing::info!(
                                dataset = %plan.dataset_id,
                                probes,
                                "No complete version found"
                            ),
                        }
                        Ok(None)
                    }
                }
            }
            Strategy::Next => {
                let next = match stored {
                    Some(last) => last.checked_add(plan.step)?,
                    None => plan.start.unwrap_or(current_slot),
                };
                if next > current_slot {
                    tracing::info!(
                        dataset = %plan.dataset_id,
                        next = %next,
                        "Next version is not due yet"
                    );
                    return Ok(None);
                }
                Ok(Some(next))
            }
        }
    }

    /// Transform, persist, then notify each stored file. Returns the persist
    /// acknowledgement and the number of notifications actually sent.
    async fn delegate(
        &self,
        fetched: &FetchResult,
        ctx: &RunContext,
    ) -> Result<(PersistAck, usize), WorkflowError> {
        let c = &self.collaborators;
        let artifact = c
            .transform
            .transform(fetched, ctx)
            .await
            .map_err(|cause| WorkflowError::Delegation {
                stage: "transform",
                cause,
            })?;
        let ack = c
            .persist
            .persist(artifact, ctx)
            .await
            .map_err(|cause| WorkflowError::Delegation {
                stage: "persist",
                cause,
            })?;

        // One ingest request per layer directory, however many files landed in it.
        let mut notified_dirs = HashSet::new();
        let mut sent = 0;
        for path in &ack.stored {
            if !notified_dirs.insert(path.parent().unwrap_or(path)) {
                continue;
            }
            match c.notify.notify(&ctx.namespace, path, ctx).await {
                Ok(NotifyAck::Sent) => sent += 1,
                Ok(NotifyAck::Unavailable) => {
                    tracing::debug!(dataset = %ctx.dataset_id, "Notification endpoint not configured");
                }
                Err(cause) => {
                    return Err(WorkflowError::Delegation {
                        stage: "notify",
                        cause,
                    })
                }
            }
        }
        Ok((ack, sent))
    }
}

async fn discard_work_dir(options: &FetchOptions) {
    if let Err(e) = tokio::fs::remove_dir_all(&options.work_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(dir = %options.work_dir.display(), "Could not remove work dir: {}", e);
        }
    }
}
