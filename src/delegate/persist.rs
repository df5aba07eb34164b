use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;

use crate::version::Version;
use crate::workflow::{Artifact, Persist, PersistAck, RunContext};

/// Moves artifacts into `<output_dir>/<namespace>/` under dated names
/// (`<namespace>_2024-03-07T12:00:00.000Z.tif`), optionally deleting files of
/// earlier versions from that directory.
#[derive(Debug, Clone)]
pub struct DirectoryPersist {
    output_dir: PathBuf,
    cleanup_past: bool,
}

impl DirectoryPersist {
    pub fn new(output_dir: PathBuf, cleanup_past: bool) -> Self {
        Self {
            output_dir,
            cleanup_past,
        }
    }

    fn file_name(namespace: &str, version: Version, index: Option<usize>, ext: &str) -> String {
        match index {
            Some(i) => format!("{}_{}_{}.{}", namespace, version.file_stamp(), i, ext),
            None => format!("{}_{}.{}", namespace, version.file_stamp(), ext),
        }
    }
}

#[async_trait]
impl Persist for DirectoryPersist {
    async fn persist(&self, artifact: Artifact, ctx: &RunContext) -> anyhow::Result<PersistAck> {
        let dir = self.output_dir.join(&ctx.namespace);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;

        let many = artifact.files.len() > 1;
        let mut stored = Vec::with_capacity(artifact.files.len());
        for (i, file) in artifact.files.iter().enumerate() {
            let ext = file.extension().and_then(|e| e.to_str()).unwrap_or("dat");
            let dest = dir.join(Self::file_name(
                &ctx.namespace,
                ctx.version,
                many.then_some(i),
                ext,
            ));
            move_file(file, &dest).await?;
            tracing::info!(dataset = %ctx.dataset_id, path = %dest.display(), "Stored artifact");
            stored.push(dest);
        }

        if self.cleanup_past {
            let removed = remove_older(&dir, &ctx.namespace, ctx.version).await?;
            if removed > 0 {
                tracing::info!(dataset = %ctx.dataset_id, removed, "Removed past data files");
            }
        }

        Ok(PersistAck {
            stored,
            aux: Default::default(),
        })
    }
}

/// Rename, falling back to copy-and-delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> anyhow::Result<()> {
    if fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .await
        .with_context(|| format!("Failed to move {} to {}", from.display(), to.display()))?;
    if let Err(e) = fs::remove_file(from).await {
        tracing::debug!(path = %from.display(), "Could not remove source after copy: {}", e);
    }
    Ok(())
}

/// Delete `<namespace>_<stamp>...` files in `dir` whose stamp precedes
/// `version`. Files that do not follow the naming scheme are left alone.
async fn remove_older(dir: &Path, namespace: &str, version: Version) -> anyhow::Result<usize> {
    let prefix = format!("{}_", namespace);
    let mut removed = 0;
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(rest) = name.strip_prefix(&prefix) else { continue };
        let Some(stamp) = rest.get(..24) else { continue };
        let Ok(stamped) = Version::parse(stamp) else { continue };
        if stamped < version {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}
