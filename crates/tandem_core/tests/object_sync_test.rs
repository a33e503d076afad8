//! Core object sync scenarios, including the double-buffer interleaving
//! property test.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tandem_core::{
    CommandFlags, CoreObjectManager, CoreThread, CoreThreadConfig, DirtyFlags, FrameBuffers,
    ObjectSyncConfig, SyncReader, SyncSource, SyncTarget, SyncWriter,
};

const COLOR: DirtyFlags = DirtyFlags::from_bits(1 << 0);
const INTENSITY: DirtyFlags = DirtyFlags::from_bits(1 << 1);

/// Sim-side light: counts how often it is serialized.
#[derive(Default)]
struct SimLight {
    intensity: Cell<f32>,
    serialized: Cell<usize>,
}

impl SyncSource for SimLight {
    fn write_sync_data(&self, _flags: DirtyFlags, writer: &mut SyncWriter<'_>) {
        self.serialized.set(self.serialized.get() + 1);
        writer.write_pod(&self.intensity.get());
    }
}

/// What the core side observed.
#[derive(Debug, Default)]
struct CoreLog {
    applied: Vec<(DirtyFlags, f32)>,
    initialized: usize,
    destroyed: usize,
}

struct CoreLight {
    log: Arc<Mutex<CoreLog>>,
}

impl SyncTarget for CoreLight {
    fn initialize(&mut self) {
        self.log.lock().initialized += 1;
    }

    fn apply_sync_data(&mut self, flags: DirtyFlags, reader: &mut SyncReader<'_>) {
        let intensity = reader.read_pod::<f32>().unwrap_or(f32::NAN);
        self.log.lock().applied.push((flags, intensity));
    }

    fn destroy(&mut self) {
        self.log.lock().destroyed += 1;
    }
}

fn setup() -> (Arc<CoreThread>, CoreObjectManager) {
    let core = CoreThread::new(CoreThreadConfig::default()).unwrap();
    core.start().unwrap();
    let manager = CoreObjectManager::new(&core, ObjectSyncConfig::default()).unwrap();
    (core, manager)
}

fn light(manager: &mut CoreObjectManager) -> (Rc<SimLight>, tandem_core::CoreObjectId, Arc<Mutex<CoreLog>>) {
    let sim = Rc::new(SimLight::default());
    let log = Arc::new(Mutex::new(CoreLog::default()));
    let id = manager.register_object(sim.clone(), CoreLight { log: Arc::clone(&log) });
    (sim, id, log)
}

#[test]
fn test_values_reach_core_in_lock_step() {
    let (core, mut manager) = setup();
    let (sim, id, log) = light(&mut manager);

    let mut previous = None;
    for frame in 1..=10 {
        sim.intensity.set(frame as f32);
        manager.notify_dirty(id, INTENSITY);
        let report = manager.sync_to_core().unwrap();
        core.submit_all(false).unwrap();

        // One frame in flight: wait for the previous upload only.
        if let Some(upload) = previous.replace(report.upload) {
            upload.wait();
        }
    }
    if let Some(upload) = previous {
        upload.wait();
    }

    let log = log.lock();
    assert_eq!(log.initialized, 1);
    assert_eq!(log.applied.len(), 10);
    assert_eq!(log.applied.last().map(|&(_, v)| v), Some(10.0));
    assert!(log.applied.windows(2).all(|w| w[0].1 < w[1].1));
}

#[test]
fn test_destroy_before_sync_is_safe() {
    let (core, mut manager) = setup();
    let (sim, id, log) = light(&mut manager);

    manager.notify_dirty(id, COLOR);
    assert!(manager.unregister_object(id));

    let report = manager.sync_to_core().unwrap();
    assert_eq!(report.objects_synced, 0);
    assert_eq!(report.destroyed, 1);
    core.submit_all(true).unwrap();

    let upload = report.upload.return_value().unwrap();
    assert_eq!(upload.destroyed, 1);
    assert_eq!(upload.applied, 0);
    assert_eq!(sim.serialized.get(), 0);

    let log = log.lock();
    assert_eq!(log.destroyed, 1);
    assert!(log.applied.is_empty());
    assert!(manager.registry().lock().is_empty());
}

#[test]
fn test_dependants_resync() {
    let (core, mut manager) = setup();
    let (_texture_sim, texture, _) = light(&mut manager);
    let (_material_sim, material, material_log) = light(&mut manager);
    let (_mesh_sim, mesh, mesh_log) = light(&mut manager);
    let (_other_sim, _other, other_log) = light(&mut manager);

    manager.update_dependencies(material, &[texture]);
    manager.update_dependencies(mesh, &[material]);

    // Initial sync clears the "new object" flags.
    let _ = manager.sync_to_core().unwrap();
    core.submit_all(true).unwrap();

    assert_eq!(manager.notify_dependencies_dirty(texture), 2);
    let report = manager.sync_to_core().unwrap();
    assert_eq!(report.objects_synced, 2);
    core.submit_all(true).unwrap();

    for log in [&material_log, &mesh_log] {
        let log = log.lock();
        assert_eq!(log.applied.len(), 2);
        assert!(log.applied[1].0.contains(DirtyFlags::DEPENDENCY));
    }
    assert_eq!(other_log.lock().applied.len(), 1);
}

#[test]
fn test_missing_target_is_skipped() {
    let (core, mut manager) = setup();
    let (_sim, id, log) = light(&mut manager);
    let _ = manager.sync_to_core().unwrap();
    core.submit_all(true).unwrap();

    manager.notify_dirty(id, INTENSITY);
    let report = manager.sync_to_core().unwrap();

    // The core side loses the object before the upload runs.
    let registry = manager.registry();
    core.queue_command(
        move || {
            registry.lock().destroy(id);
        },
        CommandFlags::INTERNAL_QUEUE | CommandFlags::BLOCK_UNTIL_COMPLETE,
    )
    .unwrap();
    core.submit_all(true).unwrap();

    let upload = report.upload.return_value().unwrap();
    assert_eq!(upload.applied, 0);
    assert_eq!(upload.skipped, 1);
    assert_eq!(log.lock().applied.len(), 1);
}

#[test]
fn test_unsubmitted_upload_does_not_stall_next_frames() {
    let (core, mut manager) = setup();
    let (sim, id, log) = light(&mut manager);

    // Three syncs in a row without submitting reuse slot 0 on the third.
    for frame in 0..3 {
        sim.intensity.set(frame as f32);
        manager.notify_dirty(id, INTENSITY);
        let _ = manager.sync_to_core().unwrap();
    }
    core.submit_all(true).unwrap();

    assert_eq!(log.lock().applied.len(), 3);
}

/// Writer/reader timestamps for one frame.
#[derive(Clone, Copy, Debug)]
struct Span {
    write_start: Instant,
    read_end: Instant,
}

#[test]
fn test_double_buffer_slots_never_overlap() {
    const FRAMES: u64 = 200;

    for seed in [7u64, 42, 1337] {
        let buffers = FrameBuffers::new(&ObjectSyncConfig {
            buffer_count: 2,
            arena_capacity: 256,
            slot_wait_warning_ms: 1000,
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let write_starts = Arc::new(Mutex::new(vec![None; FRAMES as usize]));

        let writer = {
            let buffers = Arc::clone(&buffers);
            let write_starts = Arc::clone(&write_starts);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for frame in 0..FRAMES {
                    let mut slot = buffers.begin_write(frame);
                    write_starts.lock()[frame as usize] = Some(Instant::now());

                    let chunks = rng.gen_range(1..8);
                    let mut ranges = Vec::with_capacity(chunks);
                    for _ in 0..chunks {
                        ranges.push(slot.arena().push_bytes(&frame.to_le_bytes()));
                        thread::sleep(Duration::from_micros(rng.gen_range(0..50)));
                    }
                    tx.send((slot.publish(), ranges)).unwrap();
                }
            })
        };

        let reader = thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed ^ 0xFFFF);
            let mut read_ends = Vec::with_capacity(FRAMES as usize);
            for (mut ticket, ranges) in rx {
                thread::sleep(Duration::from_micros(rng.gen_range(0..100)));
                let frame = ticket.frame();
                let slot = ticket.open().expect("fresh ticket opens");
                for range in ranges {
                    let bytes: [u8; 8] = slot.arena().bytes(range).try_into().unwrap();
                    assert_eq!(u64::from_le_bytes(bytes), frame, "torn read");
                }
                thread::sleep(Duration::from_micros(rng.gen_range(0..100)));
                read_ends.push(Instant::now());
                drop(slot);
            }
            read_ends
        });

        writer.join().unwrap();
        let read_ends = reader.join().unwrap();
        let write_starts = write_starts.lock();

        let spans: Vec<Span> = (0..FRAMES as usize)
            .map(|f| Span {
                write_start: write_starts[f].unwrap(),
                read_end: read_ends[f],
            })
            .collect();

        for slot in 0..2 {
            let same_slot: Vec<&Span> = spans.iter().skip(slot).step_by(2).collect();
            for pair in same_slot.windows(2) {
                assert!(
                    pair[1].write_start >= pair[0].read_end,
                    "seed {seed}: slot {slot} rewritten before it was consumed"
                );
            }
        }
    }
}
