//! Shared cancellation scope for a console program's supervised tasks.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::ConsoleError;

/// A group of tasks that live and die together.
///
/// The scope starts alive. It becomes dying the first time [`Scope::kill`]
/// is called or a task spawned with [`Scope::go`] returns an error; the
/// first error is kept as the scope's terminal error.
#[derive(Default)]
pub struct Scope {
    dying: CancellationToken,
    err: Mutex<Option<ConsoleError>>,
    tracker: TaskTracker,
}

impl Scope {
    /// A new, alive scope.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn a task in the scope. An error kills the scope.
    pub fn go<F>(self: &Arc<Self>, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), ConsoleError>> + Send + 'static,
    {
        let scope = self.clone();
        self.tracker.spawn(async move {
            if let Err(e) = task.await {
                tracing::debug!(task = name, error = %e, "Supervised task failed");
                scope.kill(e);
            }
        });
    }

    /// Record `err` (if no error is recorded yet) and mark the scope dying.
    pub fn kill(&self, err: ConsoleError) {
        {
            let mut slot = self.err.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.dying.cancel();
    }

    /// Resolves once the scope is dying.
    pub async fn dying(&self) {
        self.dying.cancelled().await
    }

    /// True once the scope is dying.
    pub fn is_dying(&self) -> bool {
        self.dying.is_cancelled()
    }

    /// The terminal error, if any.
    pub fn err(&self) -> Option<ConsoleError> {
        self.err.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait for every task spawned so far to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
