//! # Core Object Sync Manager
//!
//! Keeps every core-thread object consistent with its sim-thread
//! counterpart, once per frame, without per-field locking.
//!
//! ## Frame Flow
//!
//! ```text
//!   sim thread                                    core thread
//!   ──────────                                    ───────────
//!   notify_dirty(a) ─┐
//!   notify_dirty(b) ─┼─> sync_to_core()
//!   unregister(c) ───┘     │ serialize a, b into slot N % buffers
//!                          │ queue sync_upload(snapshot N) ──submit──> destroy c
//!                          ▼                                           apply a, b
//!                     SyncReport                                       free slot
//! ```
//!
//! Core-side objects are only ever created, modified and destroyed by
//! commands running on the core thread.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::command::AsyncOp;
use crate::config::ObjectSyncConfig;
use crate::error::{CoreError, CoreResult};
use crate::sync::{
    CoreObjectId, DependencyGraph, DirtyFlags, FrameBuffers, SlotState, SlotTicket, SyncReader,
    SyncSource, SyncTarget, SyncWriter,
};
use crate::thread::{affinity, CoreThread, CoreThreadAccessor, DispatcherState};

/// One serialized object inside a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncEntry {
    /// Core object the data belongs to.
    pub id: CoreObjectId,
    /// Flags the object was dirty with.
    pub flags: DirtyFlags,
    /// Where the data sits in the slot's arena.
    pub range: Range<usize>,
}

/// Everything one `sync_to_core` call produced.
///
/// Consumed exactly once by [`sync_upload`] on the core thread.
#[derive(Debug)]
pub struct SyncSnapshot {
    ticket: SlotTicket,
    entries: Vec<SyncEntry>,
    destroyed: Vec<CoreObjectId>,
}

impl SyncSnapshot {
    /// Frame the snapshot was taken for.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.ticket.frame()
    }

    /// Serialized objects, in the order they were marked dirty.
    #[must_use]
    pub fn entries(&self) -> &[SyncEntry] {
        &self.entries
    }

    /// Objects unregistered since the previous snapshot.
    #[must_use]
    pub fn destroyed(&self) -> &[CoreObjectId] {
        &self.destroyed
    }
}

/// Sim-side result of [`CoreObjectManager::sync_to_core`].
#[derive(Debug)]
pub struct SyncReport {
    /// Frame number the snapshot was taken for.
    pub frame: u64,
    /// Objects serialized.
    pub objects_synced: usize,
    /// Bytes written into the frame arena.
    pub bytes_written: usize,
    /// Destruction entries included.
    pub destroyed: usize,
    /// Resolves once the core thread has applied the snapshot.
    pub upload: AsyncOp<SyncUploadReport>,
}

/// Core-side result of [`sync_upload`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncUploadReport {
    /// Frame number of the snapshot.
    pub frame: u64,
    /// Entries applied to a live core object.
    pub applied: usize,
    /// Entries whose core object no longer exists.
    pub skipped: usize,
    /// Core objects torn down.
    pub destroyed: usize,
}

/// Core-thread store of every installed [`SyncTarget`].
#[derive(Default)]
pub struct CoreObjectRegistry {
    targets: HashMap<CoreObjectId, Box<dyn SyncTarget>>,
}

impl CoreObjectRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a target and runs its `initialize` hook.
    pub fn insert(&mut self, id: CoreObjectId, mut target: Box<dyn SyncTarget>) {
        target.initialize();
        if let Some(mut previous) = self.targets.insert(id, target) {
            tracing::warn!(%id, "core object registered twice; destroying the old target");
            previous.destroy();
        }
    }

    /// Removes a target and runs its `destroy` hook.
    ///
    /// Returns false if no target was installed under `id`.
    pub fn destroy(&mut self, id: CoreObjectId) -> bool {
        match self.targets.remove(&id) {
            Some(mut target) => {
                target.destroy();
                true
            }
            None => false,
        }
    }

    /// Destroys every installed target. Returns how many there were.
    pub fn clear_all(&mut self) -> usize {
        let count = self.targets.len();
        for (_, mut target) in self.targets.drain() {
            target.destroy();
        }
        count
    }

    /// Runs `f` against the target installed under `id`.
    pub fn with_target<R>(&mut self, id: CoreObjectId, f: impl FnOnce(&mut dyn SyncTarget) -> R) -> Option<R> {
        self.targets.get_mut(&id).map(|target| f(target.as_mut()))
    }

    /// Returns true if a target is installed under `id`.
    #[must_use]
    pub fn contains(&self, id: CoreObjectId) -> bool {
        self.targets.contains_key(&id)
    }

    /// Number of installed targets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Returns true if no target is installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

impl fmt::Debug for CoreObjectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreObjectRegistry")
            .field("targets", &self.targets.len())
            .finish()
    }
}

/// Applies a snapshot to the core-side objects.
///
/// Destruction entries are processed first, so data for an object destroyed
/// in the same snapshot is skipped. Entries naming an object that no longer
/// exists are skipped, never treated as an error. The snapshot's slot is
/// released on return.
pub fn sync_upload(mut snapshot: SyncSnapshot, registry: &mut CoreObjectRegistry) -> SyncUploadReport {
    let mut report = SyncUploadReport {
        frame: snapshot.frame(),
        ..SyncUploadReport::default()
    };

    for &id in &snapshot.destroyed {
        if registry.destroy(id) {
            report.destroyed += 1;
        } else {
            tracing::trace!(%id, "destroyed object was never installed");
        }
    }

    if snapshot.entries.is_empty() {
        return report;
    }

    let Some(slot) = snapshot.ticket.open() else {
        report.skipped = snapshot.entries.len();
        return report;
    };

    for entry in &snapshot.entries {
        match registry.targets.get_mut(&entry.id) {
            Some(target) => {
                let mut reader = SyncReader::new(slot.arena().bytes(entry.range.clone()));
                target.apply_sync_data(entry.flags, &mut reader);
                report.applied += 1;
            }
            None => {
                tracing::trace!(id = %entry.id, "sync target gone; skipping entry");
                report.skipped += 1;
            }
        }
    }

    report
}

/// Sim-side bookkeeping for one registered object.
struct SimObject {
    source: Rc<dyn SyncSource>,
    flags: DirtyFlags,
    /// Already in the dirty list this frame.
    queued: bool,
}

/// Tracks every object with a sim-side and a core-side half.
///
/// Lives on the sim thread. Construct one per sim thread with the
/// dispatcher it should feed.
///
/// ## Usage
///
/// ```rust,ignore
/// let mut objects = CoreObjectManager::new(&core, ObjectSyncConfig::default())?;
///
/// let light = Rc::new(SimLight::default());
/// let id = objects.register_object(light.clone(), CoreLight::default());
///
/// // Each frame
/// light.set_intensity(2.0);
/// objects.notify_dirty(id, LIGHT_INTENSITY);
/// let report = objects.sync_to_core()?;
/// core.submit_all(false)?;
/// ```
pub struct CoreObjectManager {
    accessor: CoreThreadAccessor,
    sim_thread: ThreadId,
    registry: Arc<Mutex<CoreObjectRegistry>>,
    objects: HashMap<CoreObjectId, SimObject>,
    dirty: Vec<CoreObjectId>,
    destroyed: Vec<CoreObjectId>,
    graph: DependencyGraph,
    buffers: Arc<FrameBuffers>,
    frame: u64,
}

impl CoreObjectManager {
    /// Creates a manager bound to the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` if the configuration is rejected.
    pub fn new(core: &Arc<CoreThread>, config: ObjectSyncConfig) -> CoreResult<Self> {
        config.validate()?;
        Ok(Self {
            accessor: core.accessor(),
            sim_thread: thread::current().id(),
            registry: Arc::new(Mutex::new(CoreObjectRegistry::new())),
            objects: HashMap::new(),
            dirty: Vec::new(),
            destroyed: Vec::new(),
            graph: DependencyGraph::new(),
            buffers: FrameBuffers::new(&config),
            frame: 0,
        })
    }

    /// Registers a sim/core object pair and returns its id.
    ///
    /// The core-side half is installed by a queued command, so it appears on
    /// the core thread with the next submit. New objects start fully dirty.
    #[track_caller]
    pub fn register_object(
        &mut self,
        source: Rc<dyn SyncSource>,
        target: impl SyncTarget + 'static,
    ) -> CoreObjectId {
        affinity::debug_assert_thread(self.sim_thread, "register_object");

        let id = CoreObjectId::next();
        self.objects.insert(
            id,
            SimObject {
                source,
                flags: DirtyFlags::NONE,
                queued: false,
            },
        );
        self.mark(id, DirtyFlags::ALL);

        let registry = Arc::clone(&self.registry);
        let target: Box<dyn SyncTarget> = Box::new(target);
        self.accessor
            .queue_command(move || registry.lock().insert(id, target));

        tracing::trace!(%id, "core object registered");
        id
    }

    /// Unregisters an object.
    ///
    /// Its core-side half is torn down by the next snapshot's upload, after
    /// any work already queued against it. Returns false if `id` was not
    /// registered.
    #[track_caller]
    pub fn unregister_object(&mut self, id: CoreObjectId) -> bool {
        affinity::debug_assert_thread(self.sim_thread, "unregister_object");

        if self.objects.remove(&id).is_none() {
            return false;
        }
        self.graph.remove(id);
        self.destroyed.push(id);
        tracing::trace!(%id, "core object unregistered");
        true
    }

    /// Marks an object dirty. Marking an already-dirty object only merges
    /// the flags.
    ///
    /// Returns false if `id` is not registered.
    #[track_caller]
    pub fn notify_dirty(&mut self, id: CoreObjectId, flags: DirtyFlags) -> bool {
        affinity::debug_assert_thread(self.sim_thread, "notify_dirty");
        self.mark(id, flags)
    }

    /// Marks every object that depends on `id`, directly or not, with
    /// [`DirtyFlags::DEPENDENCY`]. Returns how many were marked.
    #[track_caller]
    pub fn notify_dependencies_dirty(&mut self, id: CoreObjectId) -> usize {
        affinity::debug_assert_thread(self.sim_thread, "notify_dependencies_dirty");

        let dependants = self.graph.transitive_dependants(id);
        dependants
            .into_iter()
            .filter(|&dependant| self.mark(dependant, DirtyFlags::DEPENDENCY))
            .count()
    }

    /// Replaces the set of objects `id` depends on.
    ///
    /// Unregistered ids in `dependencies` are ignored.
    #[track_caller]
    pub fn update_dependencies(&mut self, id: CoreObjectId, dependencies: &[CoreObjectId]) {
        affinity::debug_assert_thread(self.sim_thread, "update_dependencies");

        if !self.objects.contains_key(&id) {
            return;
        }
        let live: Vec<CoreObjectId> = dependencies
            .iter()
            .copied()
            .filter(|dependency| self.objects.contains_key(dependency))
            .collect();
        self.graph.update_dependencies(id, &live);
    }

    fn mark(&mut self, id: CoreObjectId, flags: DirtyFlags) -> bool {
        let Some(object) = self.objects.get_mut(&id) else {
            return false;
        };
        object.flags |= flags;
        if !object.queued {
            object.queued = true;
            self.dirty.push(id);
        }
        true
    }

    /// Serializes every dirty object and queues the upload.
    ///
    /// The snapshot goes into slot `frame % buffer_count`; if the core thread
    /// is still reading that slot from an earlier frame, this waits. The
    /// upload is queued on this thread's accessor, so it runs after
    /// everything queued earlier on this thread, including registrations.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotRunning` unless the dispatcher is running.
    /// Before `start()` nothing would drain the slots, so a later frame
    /// would wait on its slot forever. Dirty state is kept in that case.
    pub fn sync_to_core(&mut self) -> CoreResult<SyncReport> {
        affinity::debug_assert_thread(self.sim_thread, "sync_to_core");

        let state = self.accessor.core().state();
        if state != DispatcherState::Running {
            return Err(CoreError::NotRunning(state));
        }

        let frame = self.frame;
        self.frame += 1;

        if self.dirty.is_empty() && self.destroyed.is_empty() {
            return Ok(SyncReport {
                frame,
                objects_synced: 0,
                bytes_written: 0,
                destroyed: 0,
                upload: AsyncOp::completed(SyncUploadReport {
                    frame,
                    ..SyncUploadReport::default()
                }),
            });
        }

        if self.buffers.slot_state(frame) == SlotState::Pending {
            // The previous occupant's upload may still sit in our own queue.
            self.accessor.submit_to_core_thread(false)?;
        }

        let buffers = Arc::clone(&self.buffers);
        let mut slot = buffers.begin_write(frame);
        let mut entries = Vec::with_capacity(self.dirty.len());

        for id in std::mem::take(&mut self.dirty) {
            // Unregistered since it was marked: nothing to serialize.
            let Some(object) = self.objects.get_mut(&id) else {
                continue;
            };
            let flags = std::mem::take(&mut object.flags);
            object.queued = false;

            let mut writer = SyncWriter::new(slot.arena());
            object.source.write_sync_data(flags, &mut writer);
            entries.push(SyncEntry {
                id,
                flags,
                range: writer.finish(),
            });
        }

        let bytes_written = slot.arena().used();
        let snapshot = SyncSnapshot {
            ticket: slot.publish(),
            entries,
            destroyed: std::mem::take(&mut self.destroyed),
        };
        let objects_synced = snapshot.entries.len();
        let destroyed = snapshot.destroyed.len();

        let registry = Arc::clone(&self.registry);
        let core_thread = self.accessor.core().core_thread_id();
        let upload = self.accessor.queue_return_command(move || {
            if let Some(core_thread) = core_thread {
                affinity::debug_assert_thread(core_thread, "sync_upload");
            }
            sync_upload(snapshot, &mut registry.lock())
        });

        tracing::trace!(frame, objects_synced, bytes_written, destroyed, "sync snapshot queued");
        Ok(SyncReport {
            frame,
            objects_synced,
            bytes_written,
            destroyed,
            upload,
        })
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn is_registered(&self, id: CoreObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    /// Number of registered objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Objects waiting for the next sync, including ones since unregistered.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Current flags of a registered object.
    #[must_use]
    pub fn dirty_flags(&self, id: CoreObjectId) -> Option<DirtyFlags> {
        self.objects.get(&id).map(|object| object.flags)
    }

    /// Frame number the next `sync_to_core` will use.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Dependency graph between registered objects.
    #[must_use]
    pub fn dependencies(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Core-side registry. Lock it only from the core thread, or while the
    /// core thread is idle.
    #[must_use]
    pub fn registry(&self) -> Arc<Mutex<CoreObjectRegistry>> {
        Arc::clone(&self.registry)
    }

    /// The accessor uploads are queued on.
    #[must_use]
    pub fn accessor(&self) -> &CoreThreadAccessor {
        &self.accessor
    }
}

impl Drop for CoreObjectManager {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        self.accessor.queue_command(move || {
            let destroyed = registry.lock().clear_all();
            tracing::debug!(destroyed, "core objects torn down");
        });
        if let Err(e) = self.accessor.submit_to_core_thread(false) {
            tracing::debug!("core object teardown not submitted: {e}");
        }
    }
}

impl fmt::Debug for CoreObjectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreObjectManager")
            .field("objects", &self.objects.len())
            .field("dirty", &self.dirty.len())
            .field("destroyed", &self.destroyed.len())
            .field("frame", &self.frame)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreThreadConfig;
    use std::cell::Cell;

    const POSITION: DirtyFlags = DirtyFlags::from_bits(1);

    #[derive(Default)]
    struct SimValue {
        value: Cell<u32>,
        writes: Cell<usize>,
    }

    impl SyncSource for SimValue {
        fn write_sync_data(&self, _flags: DirtyFlags, writer: &mut SyncWriter<'_>) {
            self.writes.set(self.writes.get() + 1);
            writer.write_pod(&self.value.get());
        }
    }

    struct CoreValue(Arc<Mutex<Vec<(DirtyFlags, u32)>>>);

    impl SyncTarget for CoreValue {
        fn apply_sync_data(&mut self, flags: DirtyFlags, reader: &mut SyncReader<'_>) {
            let value = reader.read_pod::<u32>().unwrap_or_default();
            self.0.lock().push((flags, value));
        }
    }

    fn setup() -> (Arc<CoreThread>, CoreObjectManager) {
        let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
        core.start().unwrap();
        let manager = CoreObjectManager::new(&core, ObjectSyncConfig::default()).unwrap();
        (core, manager)
    }

    #[test]
    fn test_register_and_sync() {
        let (core, mut manager) = setup();
        let applied = Arc::new(Mutex::new(Vec::new()));
        let source = Rc::new(SimValue::default());
        source.value.set(11);

        let id = manager.register_object(source.clone(), CoreValue(Arc::clone(&applied)));
        assert!(manager.is_registered(id));
        assert_eq!(manager.dirty_flags(id), Some(DirtyFlags::ALL));

        let report = manager.sync_to_core().unwrap();
        assert_eq!(report.frame, 0);
        assert_eq!(report.objects_synced, 1);
        assert_eq!(report.bytes_written, 4);
        core.submit_all(true).unwrap();

        let upload = report.upload.return_value().unwrap();
        assert_eq!(upload.applied, 1);
        assert_eq!(*applied.lock(), vec![(DirtyFlags::ALL, 11)]);
        assert!(manager.registry().lock().contains(id));
        assert_eq!(manager.dirty_flags(id), Some(DirtyFlags::NONE));
    }

    #[test]
    fn test_notify_dirty_is_idempotent() {
        let (core, mut manager) = setup();
        let source = Rc::new(SimValue::default());
        let id = manager.register_object(source.clone(), CoreValue(Arc::default()));
        let _ = manager.sync_to_core().unwrap();
        core.submit_all(true).unwrap();

        assert!(manager.notify_dirty(id, POSITION));
        assert!(manager.notify_dirty(id, POSITION));
        assert_eq!(manager.dirty_count(), 1);

        let report = manager.sync_to_core().unwrap();
        assert_eq!(report.objects_synced, 1);
        assert_eq!(source.writes.get(), 2);
    }

    #[test]
    fn test_unknown_id_not_marked() {
        let (_core, mut manager) = setup();
        let id = manager.register_object(Rc::new(SimValue::default()), CoreValue(Arc::default()));
        assert!(manager.unregister_object(id));
        assert!(!manager.unregister_object(id));
        assert!(!manager.notify_dirty(id, POSITION));
    }

    #[test]
    fn test_empty_sync_completes_immediately() {
        let (_core, mut manager) = setup();
        let report = manager.sync_to_core().unwrap();
        assert_eq!(report.objects_synced, 0);
        assert!(report.upload.has_completed());
        assert_eq!(manager.frame(), 1);
    }

    #[test]
    fn test_sync_after_shutdown_keeps_dirty_state() {
        let (core, mut manager) = setup();
        let _ = manager.register_object(Rc::new(SimValue::default()), CoreValue(Arc::default()));
        core.shutdown().unwrap();

        assert!(matches!(manager.sync_to_core(), Err(CoreError::NotRunning(_))));
        assert_eq!(manager.dirty_count(), 1);
    }

    #[test]
    fn test_sync_before_start_is_rejected() {
        let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
        let mut manager = CoreObjectManager::new(&core, ObjectSyncConfig::default()).unwrap();
        let applied = Arc::new(Mutex::new(Vec::new()));
        let source = Rc::new(SimValue::default());
        let id = manager.register_object(source.clone(), CoreValue(Arc::clone(&applied)));

        // More frames than slots; none of them may claim a slot.
        for _ in 0..3 {
            manager.notify_dirty(id, POSITION);
            assert_eq!(
                manager.sync_to_core().unwrap_err(),
                CoreError::NotRunning(DispatcherState::NotStarted)
            );
        }
        assert_eq!(manager.dirty_count(), 1);
        assert_eq!(manager.frame(), 0);

        core.start().unwrap();
        source.value.set(4);
        let report = manager.sync_to_core().unwrap();
        core.submit_all(true).unwrap();

        assert_eq!(report.objects_synced, 1);
        assert_eq!(report.upload.return_value().map(|u| u.applied), Some(1));
        assert_eq!(*applied.lock(), vec![(DirtyFlags::ALL, 4)]);
    }

    #[test]
    fn test_drop_tears_down_core_objects() {
        struct Counted(Arc<Mutex<usize>>);
        impl SyncTarget for Counted {
            fn apply_sync_data(&mut self, _flags: DirtyFlags, _reader: &mut SyncReader<'_>) {}
            fn destroy(&mut self) {
                *self.0.lock() += 1;
            }
        }

        let (core, mut manager) = setup();
        let destroyed = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let _ = manager.register_object(
                Rc::new(SimValue::default()),
                Counted(Arc::clone(&destroyed)),
            );
        }
        core.submit_all(true).unwrap();
        drop(manager);
        core.submit_all(true).unwrap();

        assert_eq!(*destroyed.lock(), 3);
    }
}
