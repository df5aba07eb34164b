use std::fmt;

use super::error::WorkflowError;

/// Where a single sync run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ResolvingVersion,
    NoNewVersion,
    VersionFound,
    Fetching,
    Delegating,
    CommittingState,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::ResolvingVersion => "resolving_version",
            Phase::NoNewVersion => "no_new_version",
            Phase::VersionFound => "version_found",
            Phase::Fetching => "fetching",
            Phase::Delegating => "delegating",
            Phase::CommittingState => "committing_state",
            Phase::Failed => "failed",
        }
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        match (self, next) {
            (Idle, ResolvingVersion) => true,
            (ResolvingVersion, NoNewVersion | VersionFound) => true,
            (VersionFound, Fetching) => true,
            // Catalog entries can appear before the data behind them.
            (Fetching, Delegating | NoNewVersion) => true,
            (Delegating, CommittingState) => true,
            (NoNewVersion | CommittingState, Idle) => true,
            (Idle | Failed, Failed) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validates and logs the phase transitions of one run.
#[derive(Debug)]
pub struct PhaseTracker {
    dataset: String,
    current: Phase,
    history: Vec<Phase>,
}

impl PhaseTracker {
    pub fn new(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            current: Phase::Idle,
            history: vec![Phase::Idle],
        }
    }

    #[cfg(test)]
    pub fn current(&self) -> Phase {
        self.current
    }

    #[cfg(test)]
    pub fn history(&self) -> &[Phase] {
        &self.history
    }

    pub fn advance(&mut self, next: Phase) -> Result<(), WorkflowError> {
        if !self.current.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                dataset: self.dataset.clone(),
                from: self.current,
                to: next,
            });
        }
        tracing::info!(dataset = %self.dataset, from = %self.current, to = %next, "Phase transition");
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Failed` from wherever the run stopped. No-op when the run
    /// never left `Idle`.
    pub fn fail(&mut self, error: &WorkflowError) {
        if self.current.can_transition_to(Phase::Failed) {
            tracing::error!(
                dataset = %self.dataset,
                from = %self.current,
                to = %Phase::Failed,
                phases = ?self.history,
                "Run failed: {}",
                error
            );
            self.current = Phase::Failed;
            self.history.push(Phase::Failed);
        }
    }
}
