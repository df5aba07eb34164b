//! State store trait and the `state.json` implementation.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::error::StateError;
use super::types::PersistedState;

pub const STATE_FILE: &str = "state.json";

/// Durable mapping from dataset id to its last processed version.
///
/// This trait is object-safe and can be used with `Arc<dyn StateStore>` for
/// shared access across dataset tasks.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// The stored state for `dataset_id`, or `None` if it was never committed.
    async fn read(&self, dataset_id: &str) -> Result<Option<PersistedState>, StateError>;

    /// Replace the stored state for `dataset_id`. Either the whole new
    /// document becomes visible or the previous one stays in place.
    async fn commit(&self, dataset_id: &str, state: PersistedState) -> Result<(), StateError>;

    /// Every dataset entry currently stored.
    async fn read_all(&self) -> Result<BTreeMap<String, PersistedState>, StateError>;

    /// Drop a dataset's entry. Returns whether one existed.
    async fn remove(&self, dataset_id: &str) -> Result<bool, StateError>;
}

/// All datasets share one JSON document keyed by dataset id.
pub struct JsonStateStore {
    path: PathBuf,
    /// Serializes read-modify-write of the document within this process.
    /// All file operations run under `spawn_blocking`.
    guard: Arc<Mutex<()>>,
}

impl std::fmt::Debug for JsonStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonStateStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JsonStateStore {
    /// Open the store in `state_dir`, creating the directory and an empty
    /// `{}` document if they do not exist.
    pub async fn open(state_dir: &Path) -> Result<Self, StateError> {
        let path = state_dir.join(STATE_FILE);
        let dir = state_dir.to_path_buf();
        let file = path.clone();
        tokio::task::spawn_blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;
            if !file.exists() {
                write_document(&file, &Map::new())?;
            }
            Ok::<_, StateError>(())
        })
        .await??;

        Ok(Self {
            path,
            guard: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete temp documents left behind by a commit that died before its
    /// rename. Only safe while holding the [`StateLock`](super::StateLock):
    /// another process may be mid-commit otherwise.
    pub async fn remove_stale_temps(&self) -> Result<usize, StateError> {
        self.with_document(|path| {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let prefix = format!(".{}.", file_name(path));
            let mut removed = 0;
            for entry in fs::read_dir(dir).map_err(|e| StateError::io(dir, e))? {
                let entry = entry.map_err(|e| StateError::io(dir, e))?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !(name.starts_with(&prefix) && name.ends_with(".tmp")) {
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!(
                        path = %entry.path().display(),
                        "Could not remove stale state temp file: {}",
                        e
                    ),
                }
            }
            if removed > 0 {
                tracing::info!(removed, "Removed stale state temp files");
            }
            Ok(removed)
        })
        .await
    }

    /// Run `op` on the blocking pool with the document mutex held.
    async fn with_document<T, F>(&self, op: F) -> Result<T, StateError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StateError> + Send + 'static,
    {
        let guard = Arc::clone(&self.guard);
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let _held = guard
                .lock()
                .map_err(|e| StateError::Poisoned(e.to_string()))?;
            op(&path)
        })
        .await?
    }
}

#[async_trait]
impl StateStore for JsonStateStore {
    async fn read(&self, dataset_id: &str) -> Result<Option<PersistedState>, StateError> {
        let id = dataset_id.to_string();
        self.with_document(move |path| {
            let Some(doc) = load_document(path)? else {
                return heal(path, &id).map(Some);
            };
            let Some(entry) = doc.get(&id).cloned() else {
                return Ok(None);
            };
            match serde_json::from_value::<PersistedState>(entry) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    tracing::warn!(dataset = %id, "Stored entry is malformed ({}), resetting it", e);
                    let mut doc = doc;
                    let empty = PersistedState::default();
                    doc.insert(id, serde_json::to_value(&empty)?);
                    write_document(path, &doc)?;
                    Ok(Some(empty))
                }
            }
        })
        .await
    }

    async fn commit(&self, dataset_id: &str, state: PersistedState) -> Result<(), StateError> {
        let id = dataset_id.to_string();
        self.with_document(move |path| {
            let mut doc = load_document(path)?.unwrap_or_else(|| {
                tracing::warn!(path = %path.display(), "Replacing malformed state file on commit");
                Map::new()
            });
            tracing::debug!(dataset = %id, last_update = %state.last_update, "Committing state");
            doc.insert(id, serde_json::to_value(&state)?);
            write_document(path, &doc)
        })
        .await
    }

    async fn read_all(&self) -> Result<BTreeMap<String, PersistedState>, StateError> {
        self.with_document(|path| {
            let doc = load_document(path)?.unwrap_or_default();
            Ok(doc
                .into_iter()
                .filter_map(|(id, v)| serde_json::from_value(v).ok().map(|s| (id, s)))
                .collect())
        })
        .await
    }

    async fn remove(&self, dataset_id: &str) -> Result<bool, StateError> {
        let id = dataset_id.to_string();
        self.with_document(move |path| {
            let Some(mut doc) = load_document(path)? else {
                return Ok(false);
            };
            if doc.remove(&id).is_none() {
                return Ok(false);
            }
            write_document(path, &doc)?;
            Ok(true)
        })
        .await
    }
}

/// Load the document. `Ok(None)` means the file exists but is not a JSON
/// object; a missing file reads as empty.
fn load_document(path: &Path) -> Result<Option<Map<String, Value>>, StateError> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Some(Map::new())),
        Err(e) => return Err(StateError::io(path, e)),
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        _ => Ok(None),
    }
}

/// Rewrite a malformed document as `{"<id>": {"last_update": ""}}`.
fn heal(path: &Path, dataset_id: &str) -> Result<PersistedState, StateError> {
    tracing::warn!(
        dataset = %dataset_id,
        path = %path.display(),
        "State file is not valid JSON, resetting it"
    );
    let empty = PersistedState::default();
    let mut doc = Map::new();
    doc.insert(dataset_id.to_string(), serde_json::to_value(&empty)?);
    write_document(path, &doc)?;
    Ok(empty)
}

fn write_document(path: &Path, doc: &Map<String, Value>) -> Result<(), StateError> {
    stage(path, doc)?.publish()
}

/// A fully written and synced temp file not yet renamed into place.
///
/// Dropping it without `publish` leaves the canonical file untouched, which
/// is exactly what a crash between the two steps does.
#[derive(Debug)]
pub(crate) struct StagedDocument {
    temp: PathBuf,
    target: PathBuf,
}

impl StagedDocument {
    pub(crate) fn publish(self) -> Result<(), StateError> {
        fs::rename(&self.temp, &self.target).map_err(|e| StateError::io(&self.target, e))?;
        sync_parent(&self.target);
        Ok(())
    }
}

pub(crate) fn stage(path: &Path, doc: &Map<String, Value>) -> Result<StagedDocument, StateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let temp = dir.join(format!(".{}.{}.tmp", file_name(path), uuid::Uuid::new_v4()));

    let bytes = serde_json::to_vec_pretty(doc)?;
    let mut file = File::create(&temp).map_err(|e| StateError::io(&temp, e))?;
    file.write_all(&bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| {
            let _ = fs::remove_file(&temp);
            StateError::io(&temp, e)
        })?;

    Ok(StagedDocument {
        temp,
        target: path.to_path_buf(),
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| STATE_FILE.to_string())
}

/// Persist the rename itself. Best effort: not every platform can fsync a
/// directory handle.
fn sync_parent(path: &Path) {
    if let Some(dir) = path.parent() {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}
