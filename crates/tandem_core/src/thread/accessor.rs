//! # Core Thread Accessor
//!
//! Per-thread façade over one command queue. Commands queued through an
//! accessor are invisible to the core thread until the accessor (or
//! `CoreThread::submit_all`) submits them.

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use crate::command::AsyncOp;
use crate::error::CoreResult;
use crate::thread::dispatcher::SharedQueue;
use crate::thread::CoreThread;

/// Handle to the calling thread's command queue.
///
/// Obtained from [`CoreThread::accessor`]. Every accessor created on the same
/// thread for the same dispatcher shares one queue. Accessors are bound to
/// the thread that created them and cannot be sent elsewhere.
///
/// ## Usage
///
/// ```rust,ignore
/// let accessor = core.accessor();
///
/// accessor.queue_command(|| println!("A"));
/// accessor.queue_command(|| println!("B"));
/// let sum = accessor.queue_return_command(|| 2 + 3);
///
/// // Nothing has run yet; hand the batch over and wait for all of it.
/// accessor.submit_to_core_thread(true)?;
/// assert_eq!(sum.return_value(), Some(5));
/// ```
pub struct CoreThreadAccessor {
    core: Arc<CoreThread>,
    queue: SharedQueue,
    _thread_bound: PhantomData<Rc<()>>,
}

impl CoreThreadAccessor {
    pub(crate) fn new(core: Arc<CoreThread>, queue: SharedQueue) -> Self {
        Self {
            core,
            queue,
            _thread_bound: PhantomData,
        }
    }

    /// Queues a fire-and-forget command.
    #[track_caller]
    pub fn queue_command<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.lock().queue(f);
    }

    /// Queues a command whose return value resolves the returned operation.
    ///
    /// A panicking command abandons the operation instead of resolving it.
    #[track_caller]
    pub fn queue_return_command<T, F>(&self, f: F) -> AsyncOp<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.queue.lock().queue_return(f)
    }

    /// Flushes the queue and hands the batch to the core thread.
    ///
    /// With `block_until_complete`, returns only after every command in the
    /// batch has executed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotRunning` if the dispatcher is shutting down.
    pub fn submit_to_core_thread(&self, block_until_complete: bool) -> CoreResult<()> {
        self.core.submit_shared(&self.queue, block_until_complete)
    }

    /// Discards every command not yet submitted.
    ///
    /// Async operations already handed out for those commands never
    /// complete; do not wait on them. Returns the number discarded.
    pub fn cancel_all(&self) -> usize {
        self.queue.lock().cancel_all()
    }

    /// Commands waiting for the next submit.
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.queue.lock().len()
    }

    /// The dispatcher this accessor submits to.
    #[must_use]
    pub fn core(&self) -> &Arc<CoreThread> {
        &self.core
    }
}

impl std::fmt::Debug for CoreThreadAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreThreadAccessor")
            .field("core", &self.core)
            .field("pending", &self.pending_commands())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::CoreThreadConfig;
    use crate::thread::CoreThread;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_accessors_share_thread_queue() {
        let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
        core.start().unwrap();

        let a = core.accessor();
        let b = core.accessor();
        a.queue_command(|| {});
        b.queue_command(|| {});
        assert_eq!(a.pending_commands(), 2);

        b.submit_to_core_thread(true).unwrap();
        assert_eq!(a.pending_commands(), 0);
    }

    #[test]
    fn test_submit_blocks_for_whole_batch() {
        let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
        core.start().unwrap();
        let accessor = core.accessor();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            accessor.queue_command(move || {
                std::thread::sleep(Duration::from_millis(1));
                log.lock().push(i);
            });
        }
        accessor.submit_to_core_thread(true).unwrap();

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancel_all_leaks_ops() {
        let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
        core.start().unwrap();
        let accessor = core.accessor();
        let ran = Arc::new(AtomicUsize::new(0));

        {
            let ran = Arc::clone(&ran);
            accessor.queue_command(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        let op = accessor.queue_return_command(|| 1);
        assert_eq!(accessor.cancel_all(), 2);

        accessor.submit_to_core_thread(true).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!op.wait_timeout(Duration::from_millis(5)));
    }
}
