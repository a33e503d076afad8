//! # Core Thread Dispatcher
//!
//! Owns the core thread and the internal queue every caller thread submits
//! into.
//!
//! ## Architecture
//!
//! ```text
//!   Thread 1 ──[CommandQueue]──flush──┐
//!   Thread 2 ──[CommandQueue]──flush──┼──> [Internal Queue] ──> [Core Thread]
//!   Thread N ──queue_command(INTERNAL)┘    (mutex + condvar)    (single consumer)
//! ```
//!
//! Batches are appended whole, so records from one thread never interleave
//! with another thread's records mid-batch. The core thread takes every
//! queued batch under the lock, releases it, then plays them back in FIFO
//! order. Blocking callers append a sentinel record carrying a notify id and
//! wait on the completion condvar until that id is signalled.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{BitOr, BitOrAssign};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};

use crate::command::{AsyncOp, CommandBatch, CommandQueue, CommandRecord, NotifyId};
use crate::config::{CoreThreadConfig, CoreThreadMode};
use crate::error::{CoreError, CoreResult};
use crate::thread::CoreThreadAccessor;

/// Command queue shared between its owner thread and `submit_all`.
pub(crate) type SharedQueue = Arc<Mutex<CommandQueue>>;

thread_local! {
    /// Per-thread queues, keyed by dispatcher id.
    static THREAD_QUEUES: RefCell<HashMap<u64, ThreadQueueEntry>> = RefCell::new(HashMap::new());
}

/// One thread's queue for one dispatcher.
struct ThreadQueueEntry {
    dispatcher: Weak<Shared>,
    queue: SharedQueue,
}

impl ThreadQueueEntry {
    /// The dispatcher is gone or stopped; its queue will never be submitted.
    fn is_stale(&self) -> bool {
        self.dispatcher
            .upgrade()
            .map_or(true, |shared| shared.state() == DispatcherState::Stopped)
    }
}

/// The single FIFO every submission lands in, one entry per batch.
type InternalQueue = VecDeque<CommandBatch>;

/// Source of process-unique dispatcher ids.
static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DispatcherState {
    /// Created, core thread not yet running. Internal-queue pushes are kept.
    NotStarted = 0,
    /// `start()` is waiting for the worker handshake.
    Starting = 1,
    /// Accepting and executing work.
    Running = 2,
    /// No new work accepted; queued work is being drained.
    ShuttingDown = 3,
    /// Core thread has exited.
    Stopped = 4,
}

impl DispatcherState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::ShuttingDown,
            _ => Self::Stopped,
        }
    }

    /// Whether new work may still be pushed onto the internal queue.
    #[inline]
    #[must_use]
    pub const fn accepts_work(self) -> bool {
        matches!(self, Self::NotStarted | Self::Starting | Self::Running)
    }
}

/// How a direct `queue_command` call reaches the core thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CommandFlags(u8);

impl CommandFlags {
    /// Append to the calling thread's queue; runs after the next submit.
    pub const DEFAULT: Self = Self(0);
    /// Append straight to the internal queue; visible to the core thread
    /// without a submit, at the cost of taking the shared lock.
    pub const INTERNAL_QUEUE: Self = Self(1);
    /// Block until the command has executed. Requires `INTERNAL_QUEUE`.
    pub const BLOCK_UNTIL_COMPLETE: Self = Self(1 << 1);

    /// Returns true if every flag in `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CommandFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CommandFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Execution statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Batches played back on the core thread.
    pub batches_executed: u64,
    /// Records executed, including sentinels and ones that panicked.
    pub commands_executed: u64,
    /// Records whose closure panicked.
    pub panics_caught: u64,
    /// Largest batch seen.
    pub largest_batch: usize,
    /// Submissions refused because shutdown had begun.
    pub submissions_rejected: u64,
}

/// State shared between the dispatcher handle and the core thread.
struct Shared {
    id: u64,
    config: CoreThreadConfig,
    state: AtomicU8,
    /// Guards state transitions so waiters never miss one.
    lifecycle: Mutex<()>,
    lifecycle_changed: Condvar,
    internal: Mutex<InternalQueue>,
    work_ready: Condvar,
    /// Notify ids signalled but not yet collected by their waiter.
    completed: Mutex<HashSet<NotifyId>>,
    command_complete: Condvar,
    next_notify_id: AtomicU32,
    core_thread: OnceLock<ThreadId>,
    /// Every per-thread queue created for this dispatcher.
    thread_queues: Mutex<Vec<Weak<Mutex<CommandQueue>>>>,
    stats: Mutex<DispatcherStats>,
}

impl Shared {
    #[inline]
    fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from -> to`. Returns false if the state was not `from`.
    fn transition(&self, from: DispatcherState, to: DispatcherState) -> bool {
        let _guard = self.lifecycle.lock();
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            tracing::debug!(dispatcher = self.id, ?from, ?to, "core thread state change");
            self.lifecycle_changed.notify_all();
        }
        moved
    }

    /// Blocks while the state equals `state`.
    fn wait_while(&self, state: DispatcherState) {
        let mut guard = self.lifecycle.lock();
        while self.state() == state {
            self.lifecycle_changed.wait(&mut guard);
        }
    }

    /// Blocks until the core thread has stopped.
    fn wait_stopped(&self) {
        let mut guard = self.lifecycle.lock();
        while self.state() != DispatcherState::Stopped {
            self.lifecycle_changed.wait(&mut guard);
        }
    }

    fn is_core_thread(&self) -> bool {
        self.core_thread.get() == Some(&thread::current().id())
    }

    fn next_notify_id(&self) -> NotifyId {
        self.next_notify_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Appends a batch to the internal queue and wakes the core thread.
    fn push(&self, batch: CommandBatch) -> CoreResult<()> {
        let mut queue = self.internal.lock();
        let state = self.state();
        if !state.accepts_work() {
            drop(queue);
            self.stats.lock().submissions_rejected += 1;
            tracing::warn!(
                dispatcher = self.id,
                records = batch.len(),
                ?state,
                "submission rejected, core thread is shutting down"
            );
            return Err(CoreError::NotRunning(state));
        }
        queue.push_back(batch);
        self.work_ready.notify_one();
        Ok(())
    }

    fn mark_complete(&self, id: NotifyId) {
        let mut completed = self.completed.lock();
        completed.insert(id);
        self.command_complete.notify_all();
    }

    /// Blocks until `id` is signalled, or the core thread stops without it.
    fn wait_for(&self, id: NotifyId) -> CoreResult<()> {
        let mut completed = self.completed.lock();
        loop {
            if completed.remove(&id) {
                return Ok(());
            }
            let state = self.state();
            if state == DispatcherState::Stopped {
                return Err(CoreError::NotRunning(state));
            }
            self.command_complete.wait(&mut completed);
        }
    }

    /// Plays back one batch on the current (core) thread.
    fn execute(&self, batch: CommandBatch) {
        let len = batch.len();
        let report = batch.playback(self.config.panic_policy, |id| self.mark_complete(id));

        let mut stats = self.stats.lock();
        stats.batches_executed += 1;
        stats.commands_executed += report.executed as u64;
        stats.panics_caught += report.panicked as u64;
        stats.largest_batch = stats.largest_batch.max(len);
        drop(stats);

        tracing::trace!(dispatcher = self.id, records = len, panicked = report.panicked, "batch executed");
    }

    /// Takes every queued batch and executes it.
    ///
    /// With `block`, waits for work unless shutdown has begun.
    /// Returns the number of batches executed.
    fn drain_once(&self, block: bool) -> usize {
        let batches = {
            let mut queue = self.internal.lock();
            if block {
                while queue.is_empty() && self.state().accepts_work() {
                    self.work_ready.wait(&mut queue);
                }
            }
            std::mem::take(&mut *queue)
        };

        let count = batches.len();
        for batch in batches {
            self.execute(batch);
        }
        count
    }

    /// Executes work until shutdown is requested and the queue is empty.
    fn run_loop(&self) {
        loop {
            let executed = self.drain_once(true);
            if executed == 0 && !self.state().accepts_work() {
                break;
            }
        }
        self.finish_stop();
    }

    /// Marks the dispatcher stopped and releases every blocked waiter.
    fn finish_stop(&self) {
        {
            let _guard = self.lifecycle.lock();
            self.state.store(DispatcherState::Stopped as u8, Ordering::Release);
            self.lifecycle_changed.notify_all();
        }
        let _completed = self.completed.lock();
        self.command_complete.notify_all();
        tracing::debug!(dispatcher = self.id, "core thread stopped");
    }
}

/// Worker thread entry point.
fn worker_main(shared: Arc<Shared>) {
    let _ = shared.core_thread.set(thread::current().id());
    // Startup handshake: `start()` returns once we are polling.
    if shared.transition(DispatcherState::Starting, DispatcherState::Running) {
        tracing::debug!(dispatcher = shared.id, "core thread polling");
    }
    shared.run_loop();
}

/// The core thread dispatcher.
///
/// Construct once at startup and share the returned `Arc` with every
/// collaborator that needs to reach the core thread.
///
/// ## Usage
///
/// ```rust,ignore
/// let core = CoreThread::new(CoreThreadConfig::default())?;
/// core.start()?;
///
/// let accessor = core.accessor();
/// accessor.queue_command(|| upload_mesh());
/// let sum = accessor.queue_return_command(|| 2 + 3);
/// accessor.submit_to_core_thread(true)?;
/// assert_eq!(sum.return_value(), Some(5));
///
/// core.shutdown()?;
/// ```
pub struct CoreThread {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CoreThread {
    /// Creates a dispatcher in the `NotStarted` state.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` if the configuration is rejected.
    pub fn new(config: CoreThreadConfig) -> CoreResult<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                id: NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed),
                config,
                state: AtomicU8::new(DispatcherState::NotStarted as u8),
                lifecycle: Mutex::new(()),
                lifecycle_changed: Condvar::new(),
                internal: Mutex::new(InternalQueue::new()),
                work_ready: Condvar::new(),
                completed: Mutex::new(HashSet::new()),
                command_complete: Condvar::new(),
                next_notify_id: AtomicU32::new(1),
                core_thread: OnceLock::new(),
                thread_queues: Mutex::new(Vec::new()),
                stats: Mutex::new(DispatcherStats::default()),
            }),
            worker: Mutex::new(None),
        }))
    }

    /// Starts the core thread.
    ///
    /// In worker mode this spawns the thread and blocks until it is polling,
    /// so nothing submitted after `start()` returns can be missed. In
    /// main-thread mode the calling thread becomes the core thread.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::AlreadyStarted` if called twice, or
    /// `CoreError::SpawnFailed` if the OS refuses the thread.
    pub fn start(&self) -> CoreResult<()> {
        if !self
            .shared
            .transition(DispatcherState::NotStarted, DispatcherState::Starting)
        {
            return Err(CoreError::AlreadyStarted);
        }

        match self.shared.config.mode {
            CoreThreadMode::MainThread => {
                let _ = self.shared.core_thread.set(thread::current().id());
                self.shared
                    .transition(DispatcherState::Starting, DispatcherState::Running);
            }
            CoreThreadMode::Worker => {
                let shared = Arc::clone(&self.shared);
                let spawned = thread::Builder::new()
                    .name(self.shared.config.thread_name.clone())
                    .spawn(move || worker_main(shared));
                let handle = match spawned {
                    Ok(handle) => handle,
                    Err(e) => {
                        self.shared.finish_stop();
                        return Err(CoreError::SpawnFailed(e.to_string()));
                    }
                };
                *self.worker.lock() = Some(handle);
                self.shared.wait_while(DispatcherState::Starting);
            }
        }
        Ok(())
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.shared.state()
    }

    /// Configuration the dispatcher was created with.
    #[must_use]
    pub fn config(&self) -> &CoreThreadConfig {
        &self.shared.config
    }

    /// Returns true when called from the core thread.
    #[inline]
    #[must_use]
    pub fn is_core_thread(&self) -> bool {
        self.shared.is_core_thread()
    }

    /// Id of the core thread, once started.
    #[must_use]
    pub fn core_thread_id(&self) -> Option<ThreadId> {
        self.shared.core_thread.get().copied()
    }

    /// Returns the calling thread's accessor, creating its queue on first use.
    #[must_use]
    pub fn accessor(self: &Arc<Self>) -> CoreThreadAccessor {
        CoreThreadAccessor::new(Arc::clone(self), self.thread_queue())
    }

    /// The calling thread's queue for this dispatcher.
    ///
    /// Entries left behind by stopped or dropped dispatchers are pruned on
    /// the way.
    fn thread_queue(&self) -> SharedQueue {
        let (queue, stale) = THREAD_QUEUES.with(|queues| {
            let mut queues = queues.borrow_mut();
            let stale_ids: Vec<u64> = queues
                .iter()
                .filter(|&(&id, entry)| id != self.shared.id && entry.is_stale())
                .map(|(&id, _)| id)
                .collect();
            let stale: Vec<ThreadQueueEntry> =
                stale_ids.iter().filter_map(|id| queues.remove(id)).collect();

            let entry = queues.entry(self.shared.id).or_insert_with(|| {
                let queue = Arc::new(Mutex::new(CommandQueue::new()));
                self.shared.thread_queues.lock().push(Arc::downgrade(&queue));
                ThreadQueueEntry {
                    dispatcher: Arc::downgrade(&self.shared),
                    queue,
                }
            });
            (Arc::clone(&entry.queue), stale)
        });

        // Unsubmitted closures may own dispatchers; drop them outside the borrow.
        if !stale.is_empty() {
            tracing::debug!(pruned = stale.len(), "dropping queues of stopped dispatchers");
        }
        drop(stale);
        queue
    }

    /// Queues a command, routed according to `flags`.
    ///
    /// Called from the core thread itself, the command runs immediately.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotRunning` if the internal queue no longer
    /// accepts work, or if a blocking wait is cut short by shutdown.
    #[track_caller]
    pub fn queue_command<F>(&self, f: F, flags: CommandFlags) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch(CommandRecord::new(f), flags)
    }

    /// Queues a command whose return value resolves the returned operation.
    ///
    /// If `f` panics on the core thread, the operation is abandoned; see
    /// [`AsyncOp::is_abandoned`].
    ///
    /// # Errors
    ///
    /// Same as [`CoreThread::queue_command`].
    #[track_caller]
    pub fn queue_return_command<T, F>(&self, f: F, flags: CommandFlags) -> CoreResult<AsyncOp<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let op = AsyncOp::new();
        self.dispatch(CommandRecord::returning(f, op.clone()), flags)?;
        Ok(op)
    }

    #[track_caller]
    fn dispatch(&self, record: CommandRecord, flags: CommandFlags) -> CoreResult<()> {
        if self.is_core_thread() {
            self.shared.execute(CommandBatch::single(record));
            return Ok(());
        }

        if !flags.contains(CommandFlags::INTERNAL_QUEUE) {
            debug_assert!(
                !flags.contains(CommandFlags::BLOCK_UNTIL_COMPLETE),
                "BLOCK_UNTIL_COMPLETE requires INTERNAL_QUEUE"
            );
            self.thread_queue().lock().push(record);
            return Ok(());
        }

        if flags.contains(CommandFlags::BLOCK_UNTIL_COMPLETE) {
            let id = self.shared.next_notify_id();
            self.shared.push(CommandBatch::single(record.with_notify(id)))?;
            self.shared.wait_for(id)
        } else {
            self.shared.push(CommandBatch::single(record))
        }
    }

    /// Flushes the calling thread's queue and dispatches it.
    ///
    /// # Errors
    ///
    /// See [`CoreThread::submit_batch`].
    pub fn submit(&self, block_until_complete: bool) -> CoreResult<()> {
        self.submit_shared(&self.thread_queue(), block_until_complete)
    }

    /// Flushes every live per-thread queue and dispatches each batch.
    ///
    /// Batches are pushed one per thread, so each thread's ordering is kept.
    /// With `block_until_complete`, returns once all of them have executed.
    ///
    /// # Errors
    ///
    /// See [`CoreThread::submit_batch`].
    pub fn submit_all(&self, block_until_complete: bool) -> CoreResult<()> {
        let queues: Vec<SharedQueue> = {
            let mut registered = self.shared.thread_queues.lock();
            registered.retain(|queue| queue.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };

        for queue in &queues {
            let batch = queue.lock().flush();
            self.submit_batch(batch, false)?;
        }
        if block_until_complete {
            self.submit_batch(CommandBatch::new(), true)?;
        }
        Ok(())
    }

    /// Flushes `queue` (which may belong to another thread) and dispatches it.
    pub(crate) fn submit_shared(&self, queue: &Mutex<CommandQueue>, block_until_complete: bool) -> CoreResult<()> {
        let batch = queue.lock().flush();
        self.submit_batch(batch, block_until_complete)
    }

    /// Flushes a standalone queue and dispatches the batch.
    ///
    /// # Errors
    ///
    /// See [`CoreThread::submit_batch`].
    pub fn submit_queue(&self, queue: &mut CommandQueue, block_until_complete: bool) -> CoreResult<()> {
        self.submit_batch(queue.flush(), block_until_complete)
    }

    /// Pushes a batch onto the internal queue.
    ///
    /// With `block_until_complete`, a sentinel record is appended and the
    /// caller waits until it (and therefore the whole batch) has executed.
    /// Called from the core thread, the batch runs immediately.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotRunning` if shutdown has begun, or if the
    /// core thread stops before the sentinel executes.
    pub fn submit_batch(&self, mut batch: CommandBatch, block_until_complete: bool) -> CoreResult<()> {
        if self.is_core_thread() {
            if !batch.is_empty() {
                self.shared.execute(batch);
            }
            return Ok(());
        }

        if !block_until_complete {
            if batch.is_empty() {
                return Ok(());
            }
            return self.shared.push(batch);
        }

        let id = self.shared.next_notify_id();
        batch.push(CommandRecord::sentinel(id));
        self.shared.push(batch)?;
        self.shared.wait_for(id)
    }

    /// Executes everything currently queued, without waiting for more.
    ///
    /// Main-thread mode only. Returns the number of batches executed. If
    /// another thread has requested shutdown, the remaining work is drained
    /// and the dispatcher stops.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::WrongThread` outside main-thread mode or off the
    /// core thread.
    pub fn pump(&self) -> CoreResult<usize> {
        self.check_main_thread_driver()?;
        let mut executed = self.shared.drain_once(false);
        if self.state() == DispatcherState::ShuttingDown {
            // Shutdown requested from another thread: finish it here.
            executed += self.shared.drain_once(false);
            self.shared.finish_stop();
        }
        Ok(executed)
    }

    /// Executes work until shutdown is requested, then drains and stops.
    ///
    /// Main-thread mode only.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::WrongThread` outside main-thread mode or off the
    /// core thread.
    pub fn run(&self) -> CoreResult<()> {
        self.check_main_thread_driver()?;
        self.shared.run_loop();
        Ok(())
    }

    fn check_main_thread_driver(&self) -> CoreResult<()> {
        if self.shared.config.mode != CoreThreadMode::MainThread {
            return Err(CoreError::WrongThread("pump/run require main-thread mode"));
        }
        if !self.is_core_thread() {
            return Err(CoreError::WrongThread("pump/run must be called on the core thread"));
        }
        Ok(())
    }

    /// Stops accepting work, drains what is queued, and stops the core thread.
    ///
    /// Idempotent. Blocks until the core thread has exited.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::WrongThread` when called from the worker thread:
    /// shutdown is still initiated, but the worker cannot wait for itself.
    pub fn shutdown(&self) -> CoreResult<()> {
        self.shared.wait_while(DispatcherState::Starting);

        match self.state() {
            DispatcherState::Stopped => return Ok(()),
            DispatcherState::NotStarted => {
                let abandoned = self.shared.internal.lock().len();
                if abandoned > 0 {
                    tracing::warn!(abandoned, "core thread never started; dropping queued batches");
                }
                self.shared.finish_stop();
                return Ok(());
            }
            DispatcherState::Running => {
                let _queue = self.shared.internal.lock();
                if self
                    .shared
                    .transition(DispatcherState::Running, DispatcherState::ShuttingDown)
                {
                    self.shared.work_ready.notify_all();
                }
            }
            DispatcherState::Starting | DispatcherState::ShuttingDown => {}
        }

        match self.shared.config.mode {
            CoreThreadMode::Worker => {
                if self.is_core_thread() {
                    return Err(CoreError::WrongThread("the core thread cannot join itself"));
                }
                let handle = self.worker.lock().take();
                match handle {
                    Some(handle) => {
                        if handle.join().is_err() {
                            tracing::error!("core thread panicked outside command playback");
                            self.shared.finish_stop();
                        }
                    }
                    None => self.shared.wait_stopped(),
                }
            }
            CoreThreadMode::MainThread => {
                if self.is_core_thread() {
                    self.shared.run_loop();
                } else {
                    self.shared.wait_stopped();
                }
            }
        }
        Ok(())
    }

    /// Number of batches waiting on the internal queue.
    #[must_use]
    pub fn pending_batches(&self) -> usize {
        self.shared.internal.lock().len()
    }

    /// Snapshot of the execution statistics.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.shared.stats.lock().clone()
    }
}

impl Drop for CoreThread {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("core thread shutdown on drop: {e}");
        }

        // Other threads prune their entries on their next `thread_queue()`.
        let entry = THREAD_QUEUES
            .try_with(|queues| {
                queues
                    .try_borrow_mut()
                    .ok()
                    .and_then(|mut queues| queues.remove(&self.shared.id))
            })
            .ok()
            .flatten();
        drop(entry);
    }
}

impl std::fmt::Debug for CoreThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreThread")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("mode", &self.shared.config.mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn worker() -> Arc<CoreThread> {
        let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
        core.start().unwrap();
        core
    }

    #[test]
    fn test_lifecycle() {
        let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
        assert_eq!(core.state(), DispatcherState::NotStarted);
        assert!(core.core_thread_id().is_none());

        core.start().unwrap();
        assert_eq!(core.state(), DispatcherState::Running);
        assert!(core.core_thread_id().is_some());
        assert!(!core.is_core_thread());
        assert_eq!(core.start(), Err(CoreError::AlreadyStarted));

        core.shutdown().unwrap();
        assert_eq!(core.state(), DispatcherState::Stopped);
        // Idempotent
        core.shutdown().unwrap();
    }

    #[test]
    fn test_flags() {
        let flags = CommandFlags::INTERNAL_QUEUE | CommandFlags::BLOCK_UNTIL_COMPLETE;
        assert!(flags.contains(CommandFlags::INTERNAL_QUEUE));
        assert!(flags.contains(CommandFlags::BLOCK_UNTIL_COMPLETE));
        assert!(!CommandFlags::DEFAULT.contains(CommandFlags::INTERNAL_QUEUE));
        assert!(flags.contains(CommandFlags::DEFAULT));
    }

    #[test]
    fn test_blocking_internal_queue_round_trip() {
        let core = worker();
        let core_id = core.core_thread_id();

        let op = core
            .queue_return_command(
                move || thread::current().id(),
                CommandFlags::INTERNAL_QUEUE | CommandFlags::BLOCK_UNTIL_COMPLETE,
            )
            .unwrap();

        assert!(op.has_completed());
        assert_eq!(op.return_value(), core_id);
    }

    #[test]
    fn test_default_flag_waits_for_submit() {
        let core = worker();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            core.queue_command(
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                },
                CommandFlags::DEFAULT,
            )
            .unwrap();
        }

        assert_eq!(core.pending_batches(), 0);
        core.submit(true).unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_after_shutdown_rejected() {
        let core = worker();
        core.shutdown().unwrap();

        let err = core
            .queue_command(|| {}, CommandFlags::INTERNAL_QUEUE)
            .unwrap_err();
        assert_eq!(err, CoreError::NotRunning(DispatcherState::Stopped));
        assert_eq!(core.stats().submissions_rejected, 1);
    }

    #[test]
    fn test_shutdown_drains_queued_work() {
        let core = worker();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let ran = Arc::clone(&ran);
            core.queue_command(
                move || {
                    ran.fetch_add(1, Ordering::SeqCst);
                },
                CommandFlags::INTERNAL_QUEUE,
            )
            .unwrap();
        }

        core.shutdown().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 50);
        assert_eq!(core.stats().batches_executed, 50);
    }

    #[test]
    fn test_nested_command_runs_inline_on_core_thread() {
        let core = worker();
        let inner = Arc::clone(&core);

        let op = core
            .queue_return_command(
                move || {
                    // Would deadlock if it were queued behind ourselves.
                    inner
                        .queue_return_command(
                            || 10,
                            CommandFlags::INTERNAL_QUEUE | CommandFlags::BLOCK_UNTIL_COMPLETE,
                        )
                        .map(|op| op.return_value())
                },
                CommandFlags::INTERNAL_QUEUE | CommandFlags::BLOCK_UNTIL_COMPLETE,
            )
            .unwrap();

        assert_eq!(op.return_value(), Some(Ok(Some(10))));
        core.shutdown().unwrap();
    }

    #[test]
    fn test_main_thread_mode_pump() {
        let config = CoreThreadConfig {
            mode: CoreThreadMode::MainThread,
            ..CoreThreadConfig::default()
        };
        let core = CoreThread::new(config).unwrap();
        core.start().unwrap();
        assert!(core.is_core_thread());

        let producer = {
            let core = Arc::clone(&core);
            thread::spawn(move || {
                core.queue_return_command(|| 2 + 3, CommandFlags::INTERNAL_QUEUE)
                    .unwrap()
            })
        };
        let op = producer.join().unwrap();
        assert!(!op.has_completed());

        assert_eq!(core.pump().unwrap(), 1);
        assert_eq!(op.return_value(), Some(5));

        core.shutdown().unwrap();
        assert_eq!(core.state(), DispatcherState::Stopped);
    }

    #[test]
    fn test_main_thread_mode_run_until_shutdown() {
        let config = CoreThreadConfig {
            mode: CoreThreadMode::MainThread,
            ..CoreThreadConfig::default()
        };
        let core = CoreThread::new(config).unwrap();
        core.start().unwrap();

        let producer = {
            let core = Arc::clone(&core);
            thread::spawn(move || {
                let op = core
                    .queue_return_command(
                        || thread::current().id(),
                        CommandFlags::INTERNAL_QUEUE | CommandFlags::BLOCK_UNTIL_COMPLETE,
                    )
                    .unwrap();
                core.shutdown().unwrap();
                op.return_value()
            })
        };

        // Returns only once the producer's shutdown has been honoured.
        core.run().unwrap();

        assert_eq!(producer.join().unwrap(), Some(thread::current().id()));
        assert_eq!(core.state(), DispatcherState::Stopped);
        assert!(core.queue_command(|| {}, CommandFlags::INTERNAL_QUEUE).is_err());
    }

    #[test]
    fn test_pump_rejected_in_worker_mode() {
        let core = worker();
        assert!(matches!(core.pump(), Err(CoreError::WrongThread(_))));
        assert!(matches!(core.run(), Err(CoreError::WrongThread(_))));
    }

    fn thread_queue_ids() -> Vec<u64> {
        THREAD_QUEUES.with(|queues| queues.borrow().keys().copied().collect())
    }

    #[test]
    fn test_dropping_core_releases_thread_queue() {
        let marker = Arc::new(());
        let core = worker();
        let id = core.shared.id;
        let accessor = core.accessor();
        {
            let marker = Arc::clone(&marker);
            accessor.queue_command(move || drop(marker));
        }
        assert_eq!(Arc::strong_count(&marker), 2);
        assert!(thread_queue_ids().contains(&id));

        drop(accessor);
        drop(core);

        assert!(!thread_queue_ids().contains(&id));
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn test_stopped_dispatcher_queue_is_pruned() {
        let first = worker();
        let first_id = first.shared.id;
        let _ = first.accessor();
        first.shutdown().unwrap();
        assert!(thread_queue_ids().contains(&first_id));

        let second = worker();
        let _ = second.accessor();

        let ids = thread_queue_ids();
        assert!(!ids.contains(&first_id));
        assert!(ids.contains(&second.shared.id));
    }

    #[test]
    fn test_shutdown_before_start() {
        let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
        core.queue_command(|| {}, CommandFlags::INTERNAL_QUEUE).unwrap();
        core.shutdown().unwrap();
        assert_eq!(core.state(), DispatcherState::Stopped);
        assert_eq!(core.start(), Err(CoreError::AlreadyStarted));
    }
}
