//! Priority-ordered cleanup registry.
//!
//! Components register named cleanups when they acquire something that must
//! be released (timers, listeners, the transport). [`LifecycleRegistry::run_all`]
//! runs every cleanup exactly once, lowest priority number first, and
//! empties the registry. Concurrent `run_all` calls share one in-flight run.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use crate::lock;

/// Failure reported by a single cleanup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cleanup failed: {0}")]
pub struct CleanupError(pub String);

impl CleanupError {
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// Outcome of one [`LifecycleRegistry::run_all`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Names of cleanups that completed, in execution order.
    pub completed: Vec<String>,
    /// Names and reasons of cleanups that failed or panicked.
    pub failed: Vec<(String, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.completed.len() + self.failed.len()
    }
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), CleanupError>> + Send>;
type SharedRun = Shared<BoxFuture<'static, CleanupReport>>;

struct Entry {
    priority: i32,
    seq: u64,
    cleanup: CleanupFn,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    in_flight: Option<SharedRun>,
}

#[derive(Clone, Default)]
pub struct LifecycleRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl std::fmt::Debug for LifecycleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("LifecycleRegistry")
            .field("entries", &state.entries.len())
            .field("running", &state.in_flight.is_some())
            .finish()
    }
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `cleanup` under `name`. Lower `priority` runs first; ties run
    /// in registration order. Re-registering a name replaces the old entry.
    pub fn register<F, Fut>(&self, name: impl Into<String>, priority: i32, cleanup: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CleanupError>> + Send + 'static,
    {
        let name = name.into();
        let mut state = lock(&self.state);
        let seq = state.next_seq;
        state.next_seq += 1;
        let replaced = state
            .entries
            .insert(
                name.clone(),
                Entry {
                    priority,
                    seq,
                    cleanup: Box::new(move || cleanup().boxed()),
                },
            )
            .is_some();
        if replaced {
            tracing::debug!(name = %name, "replaced lifecycle cleanup");
        }
    }

    /// Removes a cleanup without running it.
    pub fn unregister(&self, name: &str) -> bool {
        lock(&self.state).entries.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs every registered cleanup once, in priority order.
    ///
    /// Individual failures and panics are logged and recorded in the report
    /// without stopping the remaining cleanups.
    pub async fn run_all(&self) -> CleanupReport {
        let run = {
            let mut state = lock(&self.state);
            if let Some(run) = state.in_flight.as_ref() {
                run.clone()
            } else {
                let mut entries: Vec<(String, Entry)> = state.entries.drain().collect();
                entries.sort_by_key(|(_, entry)| (entry.priority, entry.seq));
                let registry = Arc::downgrade(&self.state);
                let run = async move {
                    let report = execute(entries).await;
                    if let Some(state) = registry.upgrade() {
                        lock(&state).in_flight = None;
                    }
                    report
                }
                .boxed()
                .shared();
                state.in_flight = Some(run.clone());
                run
            }
        };
        run.await
    }
}

async fn execute(entries: Vec<(String, Entry)>) -> CleanupReport {
    let mut report = CleanupReport::default();
    for (name, entry) in entries {
        let outcome = AssertUnwindSafe((entry.cleanup)()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(name = %name, priority = entry.priority, "cleanup completed");
                report.completed.push(name);
            }
            Ok(Err(e)) => {
                tracing::warn!(name = %name, "cleanup failed: {}", e);
                report.failed.push((name, e.to_string()));
            }
            Err(_) => {
                tracing::error!(name = %name, "cleanup panicked");
                report.failed.push((name, "panicked".to_string()));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<String>>>, name: &str) {
        lock(log).push(name.to_string());
    }

    async fn explode() -> Result<(), CleanupError> {
        panic!("boom")
    }

    #[tokio::test]
    async fn runs_in_priority_order_then_clears() {
        let registry = LifecycleRegistry::new();
        let log = recorder();

        for (name, priority) in [("transport", 20), ("timers", 10), ("credential", 30)] {
            let log = log.clone();
            registry.register(name, priority, move || async move {
                push(&log, name);
                Ok(())
            });
        }

        let report = registry.run_all().await;
        assert!(report.is_clean());
        assert_eq!(*lock(&log), vec!["timers", "transport", "credential"]);
        assert!(registry.is_empty());

        let second = registry.run_all().await;
        assert_eq!(second.total(), 0);
        assert_eq!(lock(&log).len(), 3);
    }

    #[tokio::test]
    async fn reregistering_replaces_previous_entry() {
        let registry = LifecycleRegistry::new();
        let log = recorder();

        let first = log.clone();
        registry.register("engine", 1, move || async move {
            push(&first, "old");
            Ok(())
        });
        let second = log.clone();
        registry.register("engine", 1, move || async move {
            push(&second, "new");
            Ok(())
        });

        assert_eq!(registry.len(), 1);
        registry.run_all().await;
        assert_eq!(*lock(&log), vec!["new"]);
    }

    #[tokio::test]
    async fn failures_do_not_abort_remaining_cleanups() {
        let registry = LifecycleRegistry::new();
        let log = recorder();

        registry.register("broken", 1, || async { Err(CleanupError::new("socket gone")) });
        registry.register("panicky", 2, explode);
        let tail = log.clone();
        registry.register("tail", 3, move || async move {
            push(&tail, "tail");
            Ok(())
        });

        let report = registry.run_all().await;
        assert_eq!(report.completed, vec!["tail".to_string()]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, "broken");
        assert_eq!(report.failed[1].0, "panicky");
        assert_eq!(*lock(&log), vec!["tail"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_share_one_pass() {
        let registry = LifecycleRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        registry.register("slow", 1, move || async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (a, b) = tokio::join!(registry.run_all(), registry.run_all());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert_eq!(a.completed, vec!["slow".to_string()]);
    }

    #[test]
    fn unregister_removes_without_running() {
        let registry = LifecycleRegistry::new();
        registry.register("x", 0, || async { Ok(()) });
        assert!(registry.unregister("x"));
        assert!(!registry.unregister("x"));
        assert!(registry.is_empty());
    }
}
