//! Per-identifier advisory locks
//!
//! Serializes the check-then-rename publish step for a single identifier on
//! filesystems where hard links cannot be used as an atomic create-if-absent.
//! Locks are created on demand and dropped from the arena once nothing
//! references them anymore.

use crate::identifier::BlobId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Arena of locks keyed by blob identifier
#[derive(Default)]
pub struct PublishLocks {
    locks: DashMap<BlobId, Arc<Mutex<()>>>,
}

impl PublishLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn lock(&self, id: &BlobId) -> PublishGuard<'_> {
        let mutex = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;

        PublishGuard {
            locks: self,
            id: id.clone(),
            guard: Some(guard),
        }
    }

    /// Number of identifiers that currently have a live lock
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Held while publishing one identifier
pub struct PublishGuard<'a> {
    locks: &'a PublishLocks,
    id: BlobId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PublishGuard<'_> {
    fn drop(&mut self) {
        // Release first so the arena entry is the last strong reference
        // unless another task is queued on it.
        self.guard.take();
        self.locks
            .locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::HashAlgorithm;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_released_and_collected() {
        let locks = PublishLocks::new();
        let id = HashAlgorithm::Sha256.digest(b"a");

        {
            let _guard = locks.lock(&id).await;
            assert_eq!(locks.len(), 1);
        }

        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let locks = Arc::new(PublishLocks::new());
        let id = HashAlgorithm::Sha256.digest(b"shared");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let id = id.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock(&id).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_ids_do_not_block() {
        let locks = PublishLocks::new();
        let a = HashAlgorithm::Sha256.digest(b"a");
        let b = HashAlgorithm::Sha256.digest(b"b");

        let _ga = locks.lock(&a).await;
        let gb = tokio::time::timeout(Duration::from_millis(100), locks.lock(&b)).await;
        assert!(gb.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
