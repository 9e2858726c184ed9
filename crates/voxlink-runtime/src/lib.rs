//! Runtime primitives shared by the voxlink session components.
//!
//! - [`RetryPolicy`]: capped exponential backoff with jitter.
//! - [`Scheduler`]: the single delayed-task primitive. Every timer in a
//!   session (credential refresh, send retry, delivery confirmation, typing
//!   timeout) is scheduled through one, so tearing a component down cancels
//!   all of its timers at once.
//! - [`Clock`]: injectable wall clock for expiry checks and timestamps.
//! - [`LifecycleRegistry`]: priority-ordered, run-once cleanup registry.

pub mod clock;
pub mod lifecycle;
pub mod retry;
pub mod scheduler;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use clock::{Clock, ManualClock, SystemClock};
pub use lifecycle::{CleanupError, CleanupReport, LifecycleRegistry};
pub use retry::RetryPolicy;
pub use scheduler::{Scheduler, TimerHandle};

/// Locks a mutex, recovering the guard if a previous holder panicked.
///
/// Component state is only mutated in short, non-async critical sections,
/// so a poisoned lock still holds consistent data.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
