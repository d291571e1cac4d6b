//! Named URI locks
//!
//! Work on any given `(output, URI)` must be serialized: an add and a remove
//! racing on one downstream URI would leave the mirror table and the index
//! disagreeing. Callers take advisory locks named `"{output}:{uri}"` around
//! that work through a [`LockRegistry`].
//!
//! Multi-name acquisition is all-or-nothing: a waiter holds none of its
//! names until every one is free, so overlapping sets cannot observe a
//! partial grab and cannot deadlock against each other. The in-process
//! implementation is a mutex-guarded name set with a notifier; clustered
//! deployments substitute a distributed lock service behind the same trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::Result;

/// Advisory named locks, process- or cluster-wide.
#[async_trait]
pub trait LockRegistry: Send + Sync {
    /// Block until every name in `names` is held by this caller. `names`
    /// must be sorted and free of duplicates; [`lock_all`] does that.
    async fn acquire(&self, names: &[String]) -> Result<()>;

    /// Release names previously acquired. Synchronous so it can run from a
    /// drop guard on every exit path.
    fn release(&self, names: &[String]);
}

/// Holds a set of acquired names; releases them on drop.
pub struct LockGuard {
    registry: Arc<dyn LockRegistry>,
    names: Vec<String>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.names);
    }
}

/// Sort, dedupe, and acquire a set of lock names, returning a guard that
/// releases them when dropped. Sorting gives cluster implementations that
/// grab one name at a time a deadlock-free order.
pub async fn lock_all(registry: Arc<dyn LockRegistry>, mut names: Vec<String>) -> Result<LockGuard> {
    names.sort();
    names.dedup();
    registry.acquire(&names).await?;
    Ok(LockGuard { registry, names })
}

/// In-process lock registry.
#[derive(Default)]
pub struct InProcessLockRegistry {
    held: Mutex<HashSet<String>>,
    notify: Notify,
}

impl InProcessLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_acquire(&self, names: &[String]) -> bool {
        let mut held = self.held.lock();
        if names.iter().any(|n| held.contains(n)) {
            return false;
        }
        held.extend(names.iter().cloned());
        true
    }
}

#[async_trait]
impl LockRegistry for InProcessLockRegistry {
    async fn acquire(&self, names: &[String]) -> Result<()> {
        loop {
            // Register for wakeup before checking, so a release between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.try_acquire(names) {
                return Ok(());
            }
            notified.await;
        }
    }

    fn release(&self, names: &[String]) {
        {
            let mut held = self.held.lock();
            for name in names {
                held.remove(name);
            }
        }
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for InProcessLockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLockRegistry")
            .field("held", &self.held.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_disjoint_sets_do_not_block() {
        let registry: Arc<dyn LockRegistry> = Arc::new(InProcessLockRegistry::new());
        let a = lock_all(registry.clone(), names(&["web:u1"])).await.unwrap();
        let b = lock_all(registry.clone(), names(&["web:u2"])).await.unwrap();
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn test_overlapping_set_waits_for_release() {
        let registry: Arc<dyn LockRegistry> = Arc::new(InProcessLockRegistry::new());
        let guard = lock_all(registry.clone(), names(&["web:u1", "web:u2"]))
            .await
            .unwrap();

        let contender = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = lock_all(registry, names(&["web:u2", "web:u3"]))
                    .await
                    .unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), contender)
            .await
            .expect("contender should finish after release")
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiter_holds_nothing_while_blocked() {
        let registry: Arc<dyn LockRegistry> = Arc::new(InProcessLockRegistry::new());
        let blocker = lock_all(registry.clone(), names(&["web:a"])).await.unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _guard = lock_all(registry, names(&["web:a", "web:c"])).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // "web:c" must still be free: the waiter grabs all-or-nothing.
        let c = tokio::time::timeout(
            Duration::from_secs(5),
            lock_all(registry.clone(), names(&["web:c"])),
        )
        .await
        .expect("c must be acquirable while the waiter blocks")
        .unwrap();

        drop(c);
        drop(blocker);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let registry: Arc<dyn LockRegistry> = Arc::new(InProcessLockRegistry::new());
        {
            let _guard = lock_all(registry.clone(), names(&["web:u1"])).await.unwrap();
        }
        // Immediately reacquirable.
        let again = lock_all(registry.clone(), names(&["web:u1"])).await.unwrap();
        drop(again);
    }

    #[tokio::test]
    async fn test_duplicate_names_collapse() {
        let registry: Arc<dyn LockRegistry> = Arc::new(InProcessLockRegistry::new());
        let guard = lock_all(registry.clone(), names(&["web:u1", "web:u1"]))
            .await
            .unwrap();
        drop(guard);
        let again = lock_all(registry, names(&["web:u1"])).await.unwrap();
        drop(again);
    }
}
