//! Deadline-bounded execution of one sync run.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
pub enum RunnerOutcome<T> {
    Completed(T),
    /// The deadline elapsed; the task was cancelled and aborted.
    DeadlineExceeded,
    /// The task was cancelled by the runtime before it finished.
    Cancelled,
    /// The task panicked.
    Aborted(String),
}

/// Spawns each run as its own task with a child of the shutdown token.
#[derive(Debug, Clone)]
pub struct BoundedTaskRunner {
    shutdown: CancellationToken,
}

impl BoundedTaskRunner {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }

    /// Run `task` on a fresh tokio task. If `deadline` elapses first the
    /// task's token is cancelled, the task is aborted and the runner returns
    /// `DeadlineExceeded` without waiting for it.
    ///
    /// Aborting cannot interrupt blocking work the task already handed off.
    /// A state commit that was in flight at the deadline still lands, whole.
    pub async fn run<F, Fut, T>(&self, label: &str, deadline: Duration, task: F) -> RunnerOutcome<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = self.shutdown.child_token();
        let mut handle = tokio::spawn(task(token.clone()));

        tokio::select! {
            joined = &mut handle => match joined {
                Ok(value) => RunnerOutcome::Completed(value),
                Err(e) if e.is_cancelled() => RunnerOutcome::Cancelled,
                Err(e) => {
                    tracing::error!(task = %label, "Run panicked: {}", e);
                    RunnerOutcome::Aborted(e.to_string())
                }
            },
            _ = tokio::time::sleep(deadline) => {
                token.cancel();
                handle.abort();
                tracing::warn!(
                    task = %label,
                    deadline_secs = deadline.as_secs_f64(),
                    "Deadline exceeded, run cancelled; a state commit already under way may still complete"
                );
                RunnerOutcome::DeadlineExceeded
            }
        }
    }
}
