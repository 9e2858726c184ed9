use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::lock;

/// Delayed-task primitive with a liveness flag.
///
/// Clones share the same timer set. Once [`Scheduler::shutdown`] has run,
/// pending timers are aborted, any timer that still wakes up returns
/// without running its task, and new timers are never spawned.
///
/// Timers sleep on `tokio::time`, so tests can drive them with a paused
/// clock.
#[derive(Debug, Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Debug)]
struct SchedulerInner {
    alive: AtomicBool,
    next_id: AtomicU64,
    timers: Mutex<HashMap<u64, AbortHandle>>,
}

/// Handle to one scheduled timer.
#[derive(Debug)]
pub struct TimerHandle {
    id: u64,
    scheduler: Weak<SchedulerInner>,
}

impl TimerHandle {
    /// Cancels the timer if it has not fired yet. Idempotent.
    pub fn cancel(&self) {
        let Some(inner) = self.scheduler.upgrade() else {
            return;
        };
        let removed = lock(&inner.timers).remove(&self.id);
        if let Some(handle) = removed {
            handle.abort();
        }
    }

    /// Returns whether the timer is still waiting to fire.
    pub fn is_pending(&self) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|inner| lock(&inner.timers).contains_key(&self.id))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                alive: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Runs `task` once after `delay`, unless cancelled or shut down first.
    pub fn schedule<F, Fut>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = TimerHandle {
            id,
            scheduler: Arc::downgrade(&self.inner),
        };

        if !self.is_alive() {
            return handle;
        }

        let weak = Arc::downgrade(&self.inner);
        // Hold the map while spawning so the timer cannot deregister itself
        // before it has been registered.
        let mut timers = lock(&self.inner.timers);
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.alive.load(Ordering::Acquire) {
                    return;
                }
                if lock(&inner.timers).remove(&id).is_none() {
                    return;
                }
            }
            task().await;
        });
        timers.insert(id, join.abort_handle());
        handle
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::Acquire)
    }

    /// Number of timers that have not fired yet.
    pub fn pending(&self) -> usize {
        lock(&self.inner.timers).len()
    }

    /// Marks the scheduler dead and aborts every pending timer. Idempotent.
    pub fn shutdown(&self) {
        self.inner.alive.store(false, Ordering::Release);
        let drained: Vec<AbortHandle> = lock(&self.inner.timers)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in drained {
            handle.abort();
        }
    }
}
