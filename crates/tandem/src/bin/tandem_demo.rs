//! # TANDEM Demo
//!
//! Drives a small scene through the frame loop:
//!
//! - A light whose intensity pulses every frame
//! - A shadow map that depends on the light and resyncs when it changes color
//! - A flare that lives for a few frames, then is destroyed
//!
//! Prints the frame summary and what the core side observed.
//!
//! Usage: `tandem_demo [config.toml]`

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use tandem::core::{CoreResult, DirtyFlags, SyncReader, SyncSource, SyncTarget, SyncWriter};
use tandem::{FrameEvent, FrameLoop, FrameLoopConfig};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Frames to run.
const FRAMES: u64 = 120;

/// Flare lifetime, in frames.
const FLARE_FRAMES: std::ops::Range<u64> = 30..45;

const INTENSITY: DirtyFlags = DirtyFlags::from_bits(1 << 0);
const COLOR: DirtyFlags = DirtyFlags::from_bits(1 << 1);

// =============================================================================
// SIM SIDE
// =============================================================================

/// Light parameters as they cross the frame boundary.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
struct LightData {
    color: [f32; 3],
    intensity: f32,
}

#[derive(Default)]
struct SimLight {
    data: Cell<LightData>,
}

impl SyncSource for SimLight {
    fn write_sync_data(&self, _flags: DirtyFlags, writer: &mut SyncWriter<'_>) {
        writer.write_pod(&self.data.get());
    }
}

/// Stateless on the sim side; everything it needs comes from its dependency.
struct SimShadowMap;

impl SyncSource for SimShadowMap {
    fn write_sync_data(&self, flags: DirtyFlags, writer: &mut SyncWriter<'_>) {
        writer.write_pod(&u8::from(flags.contains(DirtyFlags::DEPENDENCY)));
    }
}

// =============================================================================
// CORE SIDE
// =============================================================================

/// Counters shared with the core-side objects.
#[derive(Default)]
struct CoreCounters {
    light_updates: AtomicU64,
    shadow_rebuilds: AtomicU64,
    created: AtomicU64,
    destroyed: AtomicU64,
}

struct CoreLight {
    counters: Arc<CoreCounters>,
}

impl SyncTarget for CoreLight {
    fn initialize(&mut self) {
        self.counters.created.fetch_add(1, Ordering::Relaxed);
    }

    fn apply_sync_data(&mut self, _flags: DirtyFlags, reader: &mut SyncReader<'_>) {
        if reader.read_pod::<LightData>().is_some() {
            self.counters.light_updates.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn destroy(&mut self) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

struct CoreShadowMap {
    counters: Arc<CoreCounters>,
}

impl SyncTarget for CoreShadowMap {
    fn apply_sync_data(&mut self, _flags: DirtyFlags, reader: &mut SyncReader<'_>) {
        if reader.read_pod::<u8>() == Some(1) {
            self.counters.shadow_rebuilds.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn main() -> CoreResult<()> {
    println!("╔══════════════════════════════════════════════════════════════════╗");
    println!("║                         TANDEM DEMO                              ║");
    println!("╚══════════════════════════════════════════════════════════════════╝");
    println!();

    let config = match std::env::args().nth(1) {
        Some(path) => FrameLoopConfig::load(path)?,
        None => FrameLoopConfig::default(),
    };
    let mut frames = FrameLoop::new(config)?;
    let events = frames.events();
    let counters = Arc::new(CoreCounters::default());

    let light = Rc::new(SimLight::default());
    let light_id = frames.objects_mut().register_object(
        light.clone(),
        CoreLight {
            counters: Arc::clone(&counters),
        },
    );
    let shadow_id = frames.objects_mut().register_object(
        Rc::new(SimShadowMap),
        CoreShadowMap {
            counters: Arc::clone(&counters),
        },
    );
    frames
        .objects_mut()
        .update_dependencies(shadow_id, &[light_id]);

    let flare = Rc::new(SimLight::default());
    let mut flare_id = None;

    frames.run_frames(FRAMES, |ctx| {
        let t = ctx.frame as f32 / FRAMES as f32;

        let mut data = light.data.get();
        data.intensity = 0.5 + 0.5 * (t * std::f32::consts::TAU).sin();
        let mut dirty = INTENSITY;
        if ctx.frame % 40 == 0 {
            data.color = [t, 1.0 - t, 0.5];
            dirty |= COLOR;
        }
        light.data.set(data);
        ctx.objects.notify_dirty(light_id, dirty);
        if dirty.contains(COLOR) {
            ctx.objects.notify_dependencies_dirty(light_id);
        }

        if ctx.frame == FLARE_FRAMES.start {
            flare_id = Some(ctx.objects.register_object(
                flare.clone(),
                CoreLight {
                    counters: Arc::clone(&counters),
                },
            ));
        } else if ctx.frame == FLARE_FRAMES.end {
            if let Some(id) = flare_id.take() {
                ctx.objects.unregister_object(id);
            }
        }
    })?;

    let core = Arc::clone(frames.core());
    let stats = frames.shutdown()?;
    let core_stats = core.stats();
    let completed = events
        .drain()
        .into_iter()
        .filter(|event| matches!(event, FrameEvent::CoreFrameCompleted { .. }))
        .count();

    stats.print_summary();
    println!();
    println!("┌─ CORE SIDE ──────────────────────────────────────────────────────┐");
    println!("│ Frames Completed:   {completed}");
    println!("│ Batches Executed:   {}", core_stats.batches_executed);
    println!("│ Commands Executed:  {}", core_stats.commands_executed);
    println!("│ Light Updates:      {}", counters.light_updates.load(Ordering::Relaxed));
    println!("│ Shadow Rebuilds:    {}", counters.shadow_rebuilds.load(Ordering::Relaxed));
    println!("│ Lights Created:     {}", counters.created.load(Ordering::Relaxed));
    println!("│ Lights Destroyed:   {}", counters.destroyed.load(Ordering::Relaxed));
    println!("└──────────────────────────────────────────────────────────────────┘");

    Ok(())
}
