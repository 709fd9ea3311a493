//! Path-keyed advisory locks shared by every sweep of one engine.

use dashmap::DashSet;
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct PathLocks {
    held: Arc<DashSet<String>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key`, or `None` if another pass holds it.
    pub fn try_lock(&self, key: impl Into<String>) -> Option<PathGuard> {
        let key = key.into();
        if self.held.insert(key.clone()) {
            Some(PathGuard {
                held: Arc::clone(&self.held),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.held.contains(key)
    }
}

/// Releases its key on drop.
pub struct PathGuard {
    held: Arc<DashSet<String>>,
    key: String,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}
