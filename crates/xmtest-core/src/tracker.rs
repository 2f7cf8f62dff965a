//! Registry of managed (persistently defined) domains.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use xmtest_vm::{ControlTool, ToolCommand};

use crate::error::Result;

/// Names of domains registered with the tool's persistent store by this
/// process.
///
/// Cloning yields another handle on the same set. A name is tracked when a
/// managed start registers the domain and untracked when a managed destroy
/// deletes it; [`destroy_all`](Self::destroy_all) cleans up whatever is left
/// at the end of a run.
#[derive(Debug, Clone, Default)]
pub struct ManagedDomainTracker {
    names: Arc<Mutex<BTreeSet<String>>>,
}

impl ManagedDomainTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `name`. Returns `false` if it was already tracked.
    pub fn track(&self, name: &str) -> bool {
        let added = self.lock().insert(name.to_string());
        tracing::debug!(domain = name, added, "Tracking managed domain");
        added
    }

    /// Stop tracking `name`. Returns `false` if it was not tracked.
    pub fn untrack(&self, name: &str) -> bool {
        let removed = self.lock().remove(name);
        tracing::debug!(domain = name, removed, "Untracking managed domain");
        removed
    }

    /// Whether `name` is tracked.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains(name)
    }

    /// Tracked names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Number of tracked names.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Destroy and delete every tracked domain.
    ///
    /// Nonzero exit codes are logged and the name is untracked regardless;
    /// only a failure to run the tool at all aborts. Returns the number of
    /// domains cleaned up.
    pub async fn destroy_all(&self, tool: &ControlTool) -> Result<usize> {
        let names = self.names();
        for name in &names {
            let destroyed = tool.exec(&ToolCommand::Destroy(name.clone())).await?;
            let deleted = tool.exec(&ToolCommand::Delete(name.clone())).await?;
            if !deleted.success() {
                tracing::warn!(
                    domain = %name,
                    destroy_code = destroyed.code,
                    delete_code = deleted.code,
                    "Managed domain cleanup failed"
                );
            }
            self.untrack(name);
        }

        if !names.is_empty() {
            tracing::info!(count = names.len(), "Managed domains cleaned up");
        }
        Ok(names.len())
    }
}
