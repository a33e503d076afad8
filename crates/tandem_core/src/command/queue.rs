//! # Command Queue
//!
//! A per-thread ordered sequence of records. Only the owning thread appends;
//! `flush` hands the filled sequence off for playback and leaves an empty
//! one behind.

use std::thread::{self, ThreadId};

use crate::command::{AsyncOp, CommandBatch, CommandRecord};
use crate::thread::affinity;

/// Ordered queue of deferred commands owned by one thread.
///
/// ## Usage
///
/// ```rust,ignore
/// let mut queue = CommandQueue::new();
/// queue.queue(|| println!("first"));
/// let sum = queue.queue_return(|| 2 + 3);
///
/// let batch = queue.flush();
/// batch.playback(PanicPolicy::LogAndContinue, |_| {});
/// assert_eq!(sum.return_value(), Some(5));
/// ```
#[derive(Debug)]
pub struct CommandQueue {
    owner: ThreadId,
    pending: Vec<CommandRecord>,
}

impl CommandQueue {
    /// Creates an empty queue owned by the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self {
            owner: thread::current().id(),
            pending: Vec::new(),
        }
    }

    /// Thread allowed to append to this queue.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Number of records waiting for the next flush.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is waiting.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Appends a fire-and-forget command.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if called from a thread other than the owner.
    #[track_caller]
    pub fn queue<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(CommandRecord::new(f));
    }

    /// Appends a command whose return value resolves the returned operation.
    ///
    /// The operation stays pending until the record is played back. If `f`
    /// panics during playback the operation is abandoned.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if called from a thread other than the owner.
    #[track_caller]
    pub fn queue_return<T, F>(&mut self, f: F) -> AsyncOp<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let op = AsyncOp::new();
        self.push(CommandRecord::returning(f, op.clone()));
        op
    }

    /// Appends a prebuilt record.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if called from a thread other than the owner.
    #[track_caller]
    pub fn push(&mut self, record: CommandRecord) {
        affinity::debug_assert_thread(self.owner, "CommandQueue append");
        self.pending.push(record);
    }

    /// Swaps out the pending records for an empty sequence and returns them.
    pub fn flush(&mut self) -> CommandBatch {
        CommandBatch::from(std::mem::take(&mut self.pending))
    }

    /// Discards every pending record without running it.
    ///
    /// Async operations created for the discarded records never complete.
    /// Returns the number of records discarded.
    pub fn cancel_all(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        if discarded > 0 {
            tracing::debug!(discarded, "cancelled pending commands");
        }
        discarded
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
