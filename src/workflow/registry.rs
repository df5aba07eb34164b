use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::WorkflowError;

/// Hands out at most one run permit per dataset id.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, dataset_id: &str) -> Result<RunPermit, WorkflowError> {
        if !self.lock().insert(dataset_id.to_string()) {
            return Err(WorkflowError::AlreadyRunning(dataset_id.to_string()));
        }
        Ok(RunPermit {
            registry: self.clone(),
            dataset_id: dataset_id.to_string(),
        })
    }

    #[cfg(test)]
    pub fn is_running(&self, dataset_id: &str) -> bool {
        self.lock().contains(dataset_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-insert.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Released when dropped, including when the owning task is aborted.
#[derive(Debug)]
pub struct RunPermit {
    registry: RunRegistry,
    dataset_id: String,
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.dataset_id);
    }
}
