use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-pane send serialisation.
///
/// Concurrent hook handlers writing to the same pane would interleave their
/// key streams; each pane gets one short-lived async mutex that senders hold
/// across the whole send sequence. Different panes proceed concurrently.
#[derive(Debug, Default)]
pub struct SendLockRegistry {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SendLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, pane_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(pane_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the pane's lock entry entirely; called on agent unregistration.
    pub fn release(&self, pane_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.remove(pane_id);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_pane_sends_are_serialised() {
        let registry = Arc::new(SendLockRegistry::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let _guard = registry.acquire("%1").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_panes_run_concurrently() {
        let registry = Arc::new(SendLockRegistry::new());
        let guard_a = registry.acquire("%1").await;
        // A second pane is not blocked by the first pane's holder.
        let guard_b = tokio::time::timeout(Duration::from_millis(100), registry.acquire("%2"))
            .await
            .expect("independent pane must not block");
        drop(guard_a);
        drop(guard_b);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn release_forgets_the_pane() {
        let registry = SendLockRegistry::new();
        drop(registry.acquire("%1").await);
        assert_eq!(registry.len(), 1);
        registry.release("%1");
        assert!(registry.is_empty());
    }
}
