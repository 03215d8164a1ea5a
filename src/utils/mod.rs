//! Shared helpers

pub mod logger;
pub mod timer;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use logger::{init_logger, LogLevel};
pub use timer::Timer;

/// Lock a std mutex, recovering the guard if a panicking holder poisoned it
///
/// Engine state guarded this way is only mutated in short critical sections
/// that never await, so a poisoned guard still holds consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
