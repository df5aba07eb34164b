//! Shared fixtures for workflow and runner tests: an in-memory archive
//! publishing one small indexed dataset, a commit-counting state store and
//! recording collaborators.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::remote::memory::MemoryArchive;
use crate::remote::index_url_for;
use crate::request::UrlTemplate;
use crate::retry::RetryConfig;
use crate::state::{JsonStateStore, StateError};

pub const DATASET: &str = "ecmwf-hres";

/// Delegates to a real `JsonStateStore` and counts commits.
pub struct CountingStore {
    inner: JsonStateStore,
    commits: AtomicUsize,
}

impl CountingStore {
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for CountingStore {
    async fn read(&self, dataset_id: &str) -> Result<Option<PersistedState>, StateError> {
        self.inner.read(dataset_id).await
    }

    async fn commit(&self, dataset_id: &str, state: PersistedState) -> Result<(), StateError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit(dataset_id, state).await
    }

    async fn read_all(&self) -> Result<BTreeMap<String, PersistedState>, StateError> {
        self.inner.read_all().await
    }

    async fn remove(&self, dataset_id: &str) -> Result<bool, StateError> {
        self.inner.remove(dataset_id).await
    }
}

/// Passes fetched files through, optionally after a delay.
#[derive(Default)]
pub struct RecordingTransform {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl RecordingTransform {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transform for RecordingTransform {
    async fn transform(&self, fetched: &FetchResult, _ctx: &RunContext) -> anyhow::Result<Artifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Artifact {
            files: fetched.files.iter().map(|f| f.path.clone()).collect(),
        })
    }
}

/// Reports the artifact files as stored and records how many there were in
/// the auxiliary state.
#[derive(Default)]
pub struct RecordingPersist {
    calls: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingPersist {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Persist for RecordingPersist {
    async fn persist(&self, artifact: Artifact, _ctx: &RunContext) -> anyhow::Result<PersistAck> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.swap(false, Ordering::SeqCst) {
            anyhow::bail!("database unavailable");
        }
        let mut aux = serde_json::Map::new();
        aux.insert("persisted_files".into(), json!(artifact.files.len()));
        Ok(PersistAck {
            stored: artifact.files,
            aux,
        })
    }
}

pub struct UnavailableNotify;

#[async_trait]
impl Notify for UnavailableNotify {
    async fn notify(&self, _: &str, _: &Path, _: &RunContext) -> anyhow::Result<NotifyAck> {
        Ok(NotifyAck::Unavailable)
    }
}

/// Reports every notification as sent and remembers the paths it was given.
#[derive(Default)]
pub struct RecordingNotify {
    paths: std::sync::Mutex<Vec<PathBuf>>,
}

impl RecordingNotify {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notify for RecordingNotify {
    async fn notify(&self, _: &str, path: &Path, _: &RunContext) -> anyhow::Result<NotifyAck> {
        self.paths.lock().unwrap().push(path.to_path_buf());
        Ok(NotifyAck::Sent)
    }
}

pub struct FailingNotify;

#[async_trait]
impl Notify for FailingNotify {
    async fn notify(&self, _: &str, _: &Path, _: &RunContext) -> anyhow::Result<NotifyAck> {
        anyhow::bail!("connection refused")
    }
}

pub struct Fixture {
    pub archive: Arc<MemoryArchive>,
    pub store: Arc<CountingStore>,
    pub registry: RunRegistry,
    pub transform: Arc<RecordingTransform>,
    pub persist: Arc<RecordingPersist>,
    pub plan: SyncPlan,
    pub v0: Version,
}

impl Fixture {
    pub async fn new(name: &str) -> Self {
        let root = std::env::temp_dir()
            .join("gridsync_tests")
            .join("workflow")
            .join(name);
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();

        let inner = JsonStateStore::open(&root.join("state")).await.unwrap();

        let layout = ArchiveLayout::new(
            "https://data.example/forecasts",
            UrlTemplate::parse("{_url}/{_yyyymmdd}/{_H}z/{stream}/{_yyyymmddHHMMSS}-{step}h.{_extension}")
                .unwrap(),
        );
        let request = RequestDescriptor::new([
            ("stream", vec!["oper"]),
            ("step", vec!["0"]),
            ("param", vec!["2t"]),
        ])
        .unwrap();

        Self {
            archive: Arc::new(MemoryArchive::new()),
            store: Arc::new(CountingStore {
                inner,
                commits: AtomicUsize::new(0),
            }),
            registry: RunRegistry::new(),
            transform: Arc::new(RecordingTransform::default()),
            persist: Arc::new(RecordingPersist::default()),
            plan: SyncPlan {
                dataset_id: DATASET.to_string(),
                namespace: "ecmwf_2t".to_string(),
                layout,
                request,
                step: Step::Hours(6),
                strategy: Strategy::Latest,
                max_probes: 4,
                start: Version::from_ymd_h(2024, 3, 7, 12),
                fetch: FetchOptions {
                    use_index: true,
                    concurrency: 2,
                    retry: RetryConfig::immediate(0),
                    work_dir: root.join("work"),
                },
            },
            v0: Version::from_ymd_h(2024, 3, 7, 12).unwrap(),
        }
    }

    /// Publish `version`: a 20-byte data file whose index puts `2t` at
    /// 0..10 and `msl` at 10..20.
    pub fn publish(&self, version: Version) {
        let (url_dims, _) = self.plan.request.split(&self.plan.layout.template);
        for key in self.plan.layout.resource_keys(&url_dims, version).unwrap() {
            self.archive.put(
                index_url_for(&key.url),
                concat!(
                    r#"{"param": "2t", "_offset": 0, "_length": 10}"#,
                    "\n",
                    r#"{"param": "msl", "_offset": 10, "_length": 10}"#,
                    "\n",
                ),
            );
            self.archive.put(key.url, b"2t-2t-2t-msl-msl-msl".to_vec());
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            transform: self.transform.clone(),
            persist: self.persist.clone(),
            notify: Arc::new(UnavailableNotify),
        }
    }

    pub fn workflow(&self) -> SyncWorkflow {
        self.workflow_with(self.collaborators())
    }

    pub fn workflow_with(&self, collaborators: Collaborators) -> SyncWorkflow {
        SyncWorkflow::new(
            self.plan.clone(),
            self.archive.clone(),
            self.store.clone(),
            self.registry.clone(),
            collaborators,
        )
    }

    pub fn work_dir(&self) -> PathBuf {
        self.plan.fetch.work_dir.clone()
    }
}
