//! Bounded worker pool
//!
//! A counting gate used to cap the number of concurrent streams per session.
//! `add` blocks until a slot is free and fails once the pool has been closed;
//! `close` refuses new entrants and waits for every outstanding slot to be
//! released.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};

use crate::error::{Error, Result};

/// Bounded concurrent-task gate shared by a session and its streams
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

struct Inner {
    slots: Semaphore,
    active: AtomicUsize,
    drained: Notify,
}

impl WorkerPool {
    /// Create a pool with `size` slots
    pub fn new(size: usize) -> WorkerPool {
        WorkerPool {
            inner: Arc::new(Inner {
                slots: Semaphore::new(size),
                active: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Reserve one slot, waiting for one to free up if the pool is saturated.
    ///
    /// Fails with `Cancelled` once the pool has been closed.
    pub async fn add(&self) -> Result<()> {
        match self.inner.slots.acquire().await {
            Ok(permit) => {
                permit.forget();
                self.inner.active.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(_) => Err(Error::Cancelled),
        }
    }

    /// Release one slot
    pub fn done(&self) {
        let prev = self.inner.active.fetch_sub(1, Ordering::SeqCst);
        self.inner.slots.add_permits(1);
        if prev == 1 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Refuse new `add` calls and wait until every outstanding slot has been
    /// released.
    pub async fn close(&self) {
        self.inner.slots.close();
        loop {
            let drained = self.inner.drained.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_add_done() {
        let pool = WorkerPool::new(2);
        pool.add().await.unwrap();
        pool.add().await.unwrap();
        pool.done();
        pool.add().await.unwrap();
        pool.done();
        pool.done();
    }

    #[tokio::test]
    async fn test_add_blocks_when_saturated() {
        let pool = WorkerPool::new(1);
        pool.add().await.unwrap();

        let contender = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.add().await })
        };

        // The contender cannot make progress until a slot frees up.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        pool.done();
        contender.await.unwrap().unwrap();
        pool.done();
    }

    #[tokio::test]
    async fn test_close_refuses_new_adds() {
        let pool = WorkerPool::new(1);
        pool.close().await;
        assert!(pool.add().await.is_err());
    }

    #[tokio::test]
    async fn test_close_waits_for_drain() {
        let pool = WorkerPool::new(1);
        pool.add().await.unwrap();

        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());

        pool.done();
        closer.await.unwrap();
    }
}
