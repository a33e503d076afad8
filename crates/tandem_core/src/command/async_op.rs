//! # Async Operations
//!
//! A promised result of a queued command. The core thread resolves it exactly
//! once; any number of threads may poll or wait on it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Where an operation is in its life.
enum OpState<T> {
    Pending,
    Complete(T),
    /// The producing command panicked; no value will ever arrive.
    Abandoned,
}

impl<T> OpState<T> {
    #[inline]
    fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Shared completion state.
struct AsyncOpShared<T> {
    /// Fast-path flag so polling never takes the lock. Set once the state
    /// leaves `Pending`.
    settled: AtomicBool,
    /// Result cell, written once by the core thread.
    state: Mutex<OpState<T>>,
    /// Signalled when the state leaves `Pending`.
    settled_changed: Condvar,
}

/// Handle to the result of a command queued for the core thread.
///
/// Cloning the handle is cheap; all clones observe the same result.
///
/// ## Usage
///
/// ```rust,ignore
/// let op = accessor.queue_return_command(|| 2 + 3);
/// accessor.submit_to_core_thread(false)?;
///
/// assert_eq!(op.block_until_complete(), Some(5));
/// ```
///
/// If the command panics during playback (and the panic policy lets the
/// core thread continue), the operation is abandoned: waiters wake up,
/// [`AsyncOp::block_until_complete`] returns `None` and
/// [`AsyncOp::is_abandoned`] reports it.
///
/// An operation whose record was discarded by `cancel_all()` never
/// settles. Waiting on it with [`AsyncOp::wait`] blocks forever;
/// use [`AsyncOp::wait_timeout`] when cancellation is possible.
pub struct AsyncOp<T> {
    shared: Arc<AsyncOpShared<T>>,
}

impl<T> AsyncOp<T> {
    /// Creates a pending operation.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(AsyncOpShared {
                settled: AtomicBool::new(false),
                state: Mutex::new(OpState::Pending),
                settled_changed: Condvar::new(),
            }),
        }
    }

    /// Creates an operation that is already complete.
    #[must_use]
    pub(crate) fn completed(value: T) -> Self {
        let op = Self::new();
        op.complete(value);
        op
    }

    /// Stores the result and wakes every waiter.
    ///
    /// Only the first settlement has an effect; later calls are reported and
    /// their value is dropped.
    pub(crate) fn complete(&self, value: T) {
        self.settle(OpState::Complete(value));
    }

    /// Marks the operation as never going to complete and wakes every waiter.
    pub(crate) fn abandon(&self) {
        self.settle(OpState::Abandoned);
    }

    fn settle(&self, next: OpState<T>) {
        let mut state = self.shared.state.lock();
        if !state.is_pending() {
            tracing::warn!("async operation settled twice; keeping the first outcome");
            return;
        }
        *state = next;
        self.shared.settled.store(true, Ordering::Release);
        self.shared.settled_changed.notify_all();
    }

    /// Returns true once the core thread has written the result.
    #[inline]
    #[must_use]
    pub fn has_completed(&self) -> bool {
        self.shared.settled.load(Ordering::Acquire)
            && matches!(*self.shared.state.lock(), OpState::Complete(_))
    }

    /// Returns true if the producing command panicked.
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.shared.settled.load(Ordering::Acquire)
            && matches!(*self.shared.state.lock(), OpState::Abandoned)
    }

    /// Blocks until the operation completes or is abandoned.
    ///
    /// Returns true if it completed.
    pub fn wait(&self) -> bool {
        let mut state = self.shared.state.lock();
        while state.is_pending() {
            self.shared.settled_changed.wait(&mut state);
        }
        matches!(*state, OpState::Complete(_))
    }

    /// Blocks until the operation settles or `timeout` elapses.
    ///
    /// Returns true if the operation completed; false on timeout or if it
    /// was abandoned.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.is_pending() {
            if self
                .shared
                .settled_changed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        matches!(*state, OpState::Complete(_))
    }

    /// Runs `f` against the result, or returns `None` while pending or
    /// after abandonment.
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        if !self.shared.settled.load(Ordering::Acquire) {
            return None;
        }
        match &*self.shared.state.lock() {
            OpState::Complete(value) => Some(f(value)),
            OpState::Pending | OpState::Abandoned => None,
        }
    }

    /// Number of live handles to this operation (including this one).
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }
}

impl<T: Clone> AsyncOp<T> {
    /// Returns a copy of the result, or `None` while pending or if abandoned.
    #[must_use]
    pub fn return_value(&self) -> Option<T> {
        self.with_value(T::clone)
    }

    /// Waits for the operation to settle and returns a copy of the result.
    ///
    /// Returns `None` if the producing command panicked.
    #[must_use]
    pub fn block_until_complete(&self) -> Option<T> {
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                OpState::Pending => self.shared.settled_changed.wait(&mut state),
                OpState::Complete(value) => return Some(value.clone()),
                OpState::Abandoned => return None,
            }
        }
    }
}

impl<T> Clone for AsyncOp<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for AsyncOp<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOp")
            .field("completed", &self.has_completed())
            .field("abandoned", &self.is_abandoned())
            .field("handles", &self.handle_count())
            .finish()
    }
}
