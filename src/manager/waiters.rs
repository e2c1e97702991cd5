//! Registry of callers blocked until a lease becomes free.

use std::collections::HashMap;

use crate::lease::LeaseKey;
use crate::utils::LeaseError;

use tokio::sync::oneshot;

/// Done-signal of one blocked caller. A caller that gives up (cancelled or
/// dropped) closes its receiving end, which is how the registry tells live
/// waiters from detached ones.
pub(crate) type WaitSignal = oneshot::Sender<Result<(), LeaseError>>;

/// Pending waiters per lease. Owned by the coordinator task.
#[derive(Debug, Default)]
pub(crate) struct WaiterRegistry {
    waiters: HashMap<LeaseKey, Vec<WaitSignal>>,
}

impl WaiterRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of registered waiters, detached ones included until pruned.
    pub(crate) fn len(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }

    /// Adds a waiter for `key`, dropping detached waiters of the same key on
    /// the way.
    pub(crate) fn register(&mut self, key: LeaseKey, signal: WaitSignal) {
        let list = self.waiters.entry(key).or_default();
        list.retain(|s| !s.is_closed());
        list.push(signal);
    }

    /// Wakes every waiter of `key`, returning how many were still listening.
    pub(crate) fn wake(&mut self, key: &LeaseKey) -> usize {
        match self.waiters.remove(key) {
            Some(list) => list
                .into_iter()
                .filter_map(|signal| signal.send(Ok(())).ok())
                .count(),
            None => 0,
        }
    }

    /// Drops all detached waiters. Returns how many were dropped.
    pub(crate) fn prune(&mut self) -> usize {
        let before = self.len();
        self.waiters.retain(|_, list| {
            list.retain(|s| !s.is_closed());
            !list.is_empty()
        });
        before - self.len()
    }

    /// Releases every waiter with the given error, e.g., on shutdown.
    pub(crate) fn release_all(&mut self, err: LeaseError) {
        for (_, list) in self.waiters.drain() {
            for signal in list {
                let _ = signal.send(Err(err.clone()));
            }
        }
    }
}

#[cfg(test)]
mod waiters_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn wake_all_of_key() -> Result<(), LeaseError> {
        let mut registry = WaiterRegistry::new();
        let mysql = LeaseKey::new("leadership", "mysql");
        let redis = LeaseKey::new("leadership", "redis");
        let (tx0, rx0) = oneshot::channel();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        registry.register(mysql.clone(), tx0);
        registry.register(mysql.clone(), tx1);
        registry.register(redis.clone(), tx2);
        assert_eq!(registry.len(), 3);

        assert_eq!(registry.wake(&mysql), 2);
        assert_eq!(rx0.await?, Ok(()));
        assert_eq!(rx1.await?, Ok(()));
        assert!(rx2.try_recv().is_err());
        assert_eq!(registry.wake(&mysql), 0);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn detached_waiters_pruned() {
        let mut registry = WaiterRegistry::new();
        let key = LeaseKey::new("leadership", "mysql");
        let (tx0, rx0) = oneshot::channel();
        let (tx1, _rx1) = oneshot::channel();
        registry.register(key.clone(), tx0);
        drop(rx0);
        registry.register(key.clone(), tx1);
        assert_eq!(registry.len(), 1);

        let (tx2, rx2) = oneshot::channel();
        registry.register(LeaseKey::new("leadership", "redis"), tx2);
        drop(rx2);
        assert_eq!(registry.prune(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.wake(&key), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn release_on_shutdown() -> Result<(), LeaseError> {
        let mut registry = WaiterRegistry::new();
        let (tx, rx) = oneshot::channel();
        registry.register(LeaseKey::new("leadership", "mysql"), tx);
        registry.release_all(LeaseError::Stopped);
        assert_eq!(rx.await?, Err(LeaseError::Stopped));
        assert_eq!(registry.len(), 0);
        Ok(())
    }
}
