//! Process-level advisory lock on the state directory.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use super::error::StateError;

pub const LOCK_FILE: &str = "state.lock";

/// Held for as long as this process drives the state directory. The OS
/// releases the lock when the file handle is dropped.
#[derive(Debug)]
pub struct StateLock {
    _file: File,
    path: PathBuf,
}

impl StateLock {
    pub async fn acquire(state_dir: &Path) -> Result<Self, StateError> {
        let dir = state_dir.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;
            let path = dir.join(LOCK_FILE);
            let file = File::create(&path).map_err(|e| StateError::io(&path, e))?;
            if file.try_lock_exclusive().is_err() {
                return Err(StateError::Locked { path });
            }
            Ok(Self { _file: file, path })
        })
        .await?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_lock_rejected_until_released() {
        let dir = std::env::temp_dir()
            .join("gridsync_tests")
            .join("state_lock");
        let _ = std::fs::remove_dir_all(&dir);

        let first = StateLock::acquire(&dir).await.unwrap();
        assert!(first.path().ends_with(LOCK_FILE));
        assert!(matches!(
            StateLock::acquire(&dir).await,
            Err(StateError::Locked { .. })
        ));

        drop(first);
        assert!(StateLock::acquire(&dir).await.is_ok());
    }
}
