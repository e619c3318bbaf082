//! Test doubles shared by the workspace's test suites.
//!
//! Nothing here talks to a network or a database: the worker client
//! follows a script, storage keeps objects in memory, and the ledger can
//! be told to start failing.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod ledger;
pub mod storage;
pub mod worker;

pub use ledger::FlakyLedger;
pub use storage::{FailingBackend, MemoryBackend};
pub use worker::{MockWorkerClient, Submission};

/// Lock a mutex, ignoring poisoning from a panicked test thread.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
