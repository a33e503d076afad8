//! Thread-affinity checks.
//!
//! Calling a sim-only API from the core thread (or the reverse) is a
//! programmer error. These checks panic in debug builds and compile to
//! nothing in release builds.

use std::thread::{self, ThreadId};

/// Panics (debug builds only) unless the caller runs on `expected`.
#[inline]
#[track_caller]
pub fn debug_assert_thread(expected: ThreadId, operation: &str) {
    if cfg!(debug_assertions) {
        let current = thread::current().id();
        assert!(
            current == expected,
            "{operation} called from thread {current:?}, but it belongs to thread {expected:?}"
        );
    }
}

/// Panics (debug builds only) if the caller runs on `forbidden`.
#[inline]
#[track_caller]
pub fn debug_assert_not_thread(forbidden: Option<ThreadId>, operation: &str) {
    if cfg!(debug_assertions) {
        let current = thread::current().id();
        assert!(
            forbidden != Some(current),
            "{operation} must not be called from thread {current:?}"
        );
    }
}
