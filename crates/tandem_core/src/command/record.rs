//! # Command Records
//!
//! A record is one deferred invocation: a boxed closure, plus an optional
//! notify id that the dispatcher signals once the closure has run.
//! Records are grouped into batches for playback.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::command::AsyncOp;
use crate::config::PanicPolicy;

/// Identifier signalled when a record finishes executing.
pub type NotifyId = u32;

/// Type-erased deferred call.
type Thunk = Box<dyn FnOnce() + Send + 'static>;

/// One deferred invocation owned by a command queue until played back.
pub struct CommandRecord {
    thunk: Thunk,
    notify_id: Option<NotifyId>,
    has_result: bool,
}

/// Abandons the wrapped operation if dropped during a panic.
struct AbandonOnUnwind<'a, T>(&'a AsyncOp<T>);

impl<T> Drop for AbandonOnUnwind<'_, T> {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

impl CommandRecord {
    /// Creates a fire-and-forget record.
    #[must_use]
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            thunk: Box::new(f),
            notify_id: None,
            has_result: false,
        }
    }

    /// Creates a record that resolves `op` with the closure's return value.
    ///
    /// If the closure panics, `op` is abandoned instead so its waiters wake.
    #[must_use]
    pub fn returning<T, F>(f: F, op: AsyncOp<T>) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        Self {
            thunk: Box::new(move || {
                let guard = AbandonOnUnwind(&op);
                let value = f();
                std::mem::forget(guard);
                op.complete(value);
            }),
            notify_id: None,
            has_result: true,
        }
    }

    /// Creates an empty record whose only purpose is to signal `id`.
    #[must_use]
    pub fn sentinel(id: NotifyId) -> Self {
        Self::new(|| {}).with_notify(id)
    }

    /// Attaches a notify id to this record.
    #[must_use]
    pub fn with_notify(mut self, id: NotifyId) -> Self {
        self.notify_id = Some(id);
        self
    }

    /// Notify id signalled after execution, if any.
    #[inline]
    #[must_use]
    pub fn notify_id(&self) -> Option<NotifyId> {
        self.notify_id
    }

    /// Whether executing this record resolves an async operation.
    #[inline]
    #[must_use]
    pub fn has_result(&self) -> bool {
        self.has_result
    }

    /// Runs the closure, catching any panic.
    ///
    /// Returns the notify id (if any) and whether the closure panicked.
    /// Under `PanicPolicy::Abort` a panic terminates the process instead.
    pub(crate) fn execute(self, policy: PanicPolicy) -> (Option<NotifyId>, bool) {
        let Self { thunk, notify_id, .. } = self;
        let panicked = match panic::catch_unwind(AssertUnwindSafe(thunk)) {
            Ok(()) => false,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(notify_id = ?notify_id, "queued command panicked: {message}");
                if policy == PanicPolicy::Abort {
                    std::process::abort();
                }
                true
            }
        };
        (notify_id, panicked)
    }
}

impl fmt::Debug for CommandRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRecord")
            .field("notify_id", &self.notify_id)
            .field("has_result", &self.has_result)
            .finish_non_exhaustive()
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Outcome of playing back one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PlaybackReport {
    /// Records executed (including ones that panicked).
    pub executed: usize,
    /// Records whose closure panicked.
    pub panicked: usize,
}

/// An ordered group of records handed off by a single flush.
#[derive(Debug, Default)]
pub struct CommandBatch {
    records: Vec<CommandRecord>,
}

impl CommandBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a batch containing exactly one record.
    #[must_use]
    pub fn single(record: CommandRecord) -> Self {
        Self {
            records: vec![record],
        }
    }

    /// Appends a record at the end of the batch.
    pub fn push(&mut self, record: CommandRecord) {
        self.records.push(record);
    }

    /// Number of records.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the batch holds no records.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Executes every record in order.
    ///
    /// `on_notify` is called with the notify id of each record that carries
    /// one, right after that record runs. A panicking record does not stop
    /// the batch under `PanicPolicy::LogAndContinue`: later records still
    /// run in order, and the panicking record's notify id is still signalled.
    pub fn playback(self, policy: PanicPolicy, mut on_notify: impl FnMut(NotifyId)) -> PlaybackReport {
        let mut report = PlaybackReport::default();
        for record in self.records {
            let (notify_id, panicked) = record.execute(policy);
            report.executed += 1;
            if panicked {
                report.panicked += 1;
            }
            if let Some(id) = notify_id {
                on_notify(id);
            }
        }
        report
    }
}

impl From<Vec<CommandRecord>> for CommandBatch {
    fn from(records: Vec<CommandRecord>) -> Self {
        Self { records }
    }
}
