//! Single-flight sync lock.
//!
//! At most one sync runs at a time. The lock is released when its
//! [`SyncGuard`] drops, so every exit path (success, error, timeout, panic)
//! releases it. A lock held longer than the configured timeout is treated as
//! abandoned and force-released by the next acquisition attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: u64,
    acquired_at: Instant,
}

#[derive(Debug)]
pub struct SyncLock {
    held: Mutex<Option<Holder>>,
    next_token: AtomicU64,
    timeout: Duration,
}

impl SyncLock {
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            held: Mutex::new(None),
            next_token: AtomicU64::new(1),
            timeout,
        })
    }

    fn state(&self) -> MutexGuard<'_, Option<Holder>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take the lock, or `None` if a live holder has it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SyncGuard> {
        let mut held = self.state();
        if let Some(holder) = *held {
            let age = holder.acquired_at.elapsed();
            if age < self.timeout {
                return None;
            }
            tracing::warn!(
                held_for_secs = age.as_secs(),
                timeout_secs = self.timeout.as_secs(),
                "force-releasing stale sync lock"
            );
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        *held = Some(Holder {
            token,
            acquired_at: Instant::now(),
        });
        Some(SyncGuard {
            lock: Arc::clone(self),
            token,
        })
    }

    /// True while a holder that has not gone stale has the lock.
    pub fn is_held(&self) -> bool {
        self.state()
            .is_some_and(|holder| holder.acquired_at.elapsed() < self.timeout)
    }

    /// How long the current holder has had the lock.
    pub fn held_for(&self) -> Option<Duration> {
        self.state().map(|holder| holder.acquired_at.elapsed())
    }
}

/// Proof of holding the [`SyncLock`].
#[derive(Debug)]
pub struct SyncGuard {
    lock: Arc<SyncLock>,
    token: u64,
}

impl SyncGuard {
    /// False once a later acquisition has force-released this guard.
    pub fn is_current(&self) -> bool {
        self.lock
            .state()
            .is_some_and(|holder| holder.token == self.token)
    }
}

impl Drop for SyncGuard {
    fn drop(&mut self) {
        let mut held = self.lock.state();
        // A force-released guard must not release its successor.
        if held.is_some_and(|holder| holder.token == self.token) {
            *held = None;
        }
    }
}
