//! Per-target exclusivity for lifecycle operations.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

/// In-memory table of targets that currently have a job executing.
#[derive(Clone, Default, Debug)]
pub struct ResourceLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `target` without waiting. Returns `None` if it is already held.
    ///
    /// The returned guard releases the target when dropped, so every exit
    /// path of the holder (success, error, timeout, panic) frees it.
    pub fn try_acquire(&self, target: &str) -> Option<ResourceLockGuard> {
        if self.table().insert(target.to_string()) {
            tracing::trace!(target_name = %target, "resource lock acquired");
            Some(ResourceLockGuard {
                locks: self.clone(),
                target: target.to_string(),
            })
        } else {
            None
        }
    }

    /// Release `target`. Releasing a target that is not held is a no-op.
    pub fn release(&self, target: &str) {
        if self.table().remove(target) {
            tracing::trace!(target_name = %target, "resource lock released");
        }
    }

    pub fn is_locked(&self, target: &str) -> bool {
        self.table().contains(target)
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    // A poisoned table only means a holder panicked mid-insert/remove; the
    // set itself is still consistent.
    fn table(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
#[must_use = "the target is released as soon as the guard is dropped"]
pub struct ResourceLockGuard {
    locks: ResourceLocks,
    target: String,
}

impl ResourceLockGuard {
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Drop for ResourceLockGuard {
    fn drop(&mut self) {
        self.locks.release(&self.target);
    }
}
