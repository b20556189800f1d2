//! Ordered, run-once cleanup list.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type Action = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Deferred actions run exactly once, in registration order.
///
/// Every action is isolated: an error or a panic is logged and the remaining
/// actions still run. Actions registered after the list has run are executed
/// immediately.
pub struct CleanupActions {
    label: String,
    actions: Mutex<Vec<(&'static str, Action)>>,
    ran: AtomicBool,
}

impl CleanupActions {
    /// Create an empty list. `label` is used in log lines.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            actions: Mutex::new(Vec::new()),
            ran: AtomicBool::new(false),
        }
    }

    /// Register an action.
    pub fn push<F>(&self, name: &'static str, action: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        {
            let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
            if !self.ran.load(Ordering::Acquire) {
                actions.push((name, Box::new(action)));
                return;
            }
        }
        self.run_one(name, Box::new(action));
    }

    /// Run every registered action. Returns `false` if the list had already
    /// run.
    pub fn run(&self) -> bool {
        let actions = {
            let mut actions = self.actions.lock().unwrap_or_else(|e| e.into_inner());
            if self.ran.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *actions)
        };

        tracing::debug!(label = %self.label, count = actions.len(), "Running cleanup");
        for (name, action) in actions {
            self.run_one(name, action);
        }
        true
    }

    /// True once [`CleanupActions::run`] has been called.
    pub fn has_run(&self) -> bool {
        self.ran.load(Ordering::Acquire)
    }

    /// Number of actions still pending.
    pub fn pending(&self) -> usize {
        self.actions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn run_one(&self, name: &'static str, action: Action) {
        match catch_unwind(AssertUnwindSafe(action)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(label = %self.label, action = name, error = %e, "Cleanup action failed");
            }
            Err(_) => {
                tracing::warn!(label = %self.label, action = name, "Cleanup action panicked");
            }
        }
    }
}

/// Runs the wrapped cleanup list when dropped.
pub(super) struct CleanupGuard<'a>(pub(super) &'a CleanupActions);

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.0.run();
    }
}
