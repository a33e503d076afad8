//! # TANDEM Frame Loop
//!
//! THE FRAME BOUNDARY:
//! ```text
//! Frame N:
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │ 1. LOGIC (sim thread)                                               │
//! │    └─ User code mutates sim objects, marks them dirty, queues       │
//! │       commands on the thread's accessor                             │
//! │                                                                     │
//! │ 2. SYNC                                                             │
//! │    └─ sync_to_core(): serialize dirty objects into slot N % 2,      │
//! │       queue the upload                                              │
//! │                                                                     │
//! │ 3. FENCE                                                            │
//! │    └─ Queue a command that reports frame N complete                 │
//! │                                                                     │
//! │ 4. SUBMIT                                                           │
//! │    └─ submit_all(): hand every thread's queue to the core thread    │
//! │                                                                     │
//! │ 5. WAIT                                                             │
//! │    └─ Block until frame N-1's fence has run (one frame in flight)   │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tandem_core::{
    AsyncOp, CoreConfig, CoreError, CoreObjectManager, CoreResult, CoreThread, CoreThreadAccessor,
};

use crate::events::{EventBus, EventReceiver, EventSender, FrameEvent};

/// Configuration for the frame loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLoopConfig {
    /// Core thread and object sync settings.
    pub core: CoreConfig,
    /// Target frames per second, used for pacing and budget warnings.
    pub target_fps: u32,
    /// Log frames that exceed the budget.
    pub enable_timing_logs: bool,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for FrameLoopConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            target_fps: 60,
            enable_timing_logs: false,
            event_capacity: 2048,
        }
    }
}

impl FrameLoopConfig {
    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` on a parse or validation failure.
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConfigIo` if the file cannot be read, or
    /// `CoreError::InvalidConfig` if its contents are rejected.
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::ConfigIo(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` for a zero frame rate or event
    /// capacity, or any error from the core sections.
    pub fn validate(&self) -> CoreResult<()> {
        if self.target_fps == 0 {
            return Err(CoreError::InvalidConfig("target_fps must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(CoreError::InvalidConfig("event_capacity must be positive".into()));
        }
        self.core.validate()
    }

    /// Time budget of one frame.
    #[must_use]
    pub fn target_frame_time(&self) -> Duration {
        Duration::from_secs(1) / self.target_fps.max(1)
    }
}

/// Frame timing statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Frame number.
    pub frame: u64,
    /// Total frame time in microseconds.
    pub total_us: u64,
    /// Sim logic time in microseconds.
    pub logic_us: u64,
    /// `sync_to_core` time in microseconds.
    pub sync_us: u64,
    /// `submit_all` time in microseconds.
    pub submit_us: u64,
    /// Time spent waiting for the previous frame, in microseconds.
    pub wait_us: u64,
    /// Objects serialized this frame.
    pub objects_synced: usize,
    /// Bytes written into the frame arena.
    pub bytes_written: usize,
}

/// Handles for one frame's sim logic.
pub struct FrameContext<'a> {
    /// Object sync manager; mark objects dirty here.
    pub objects: &'a mut CoreObjectManager,
    /// Event sender for custom notifications.
    pub events: &'a EventSender,
    /// Current frame number.
    pub frame: u64,
    /// Seconds since the previous frame, clamped to 0.1.
    pub delta_time: f32,
}

impl FrameContext<'_> {
    /// The sim thread's accessor. Commands queued here are submitted at the
    /// end of the frame.
    #[must_use]
    pub fn accessor(&self) -> &CoreThreadAccessor {
        self.objects.accessor()
    }
}

/// The frame orchestrator.
///
/// Owns the core thread and the sim thread's object manager, and enforces
/// the lock-step contract: at most one frame of core work in flight.
///
/// ## Usage
///
/// ```rust,ignore
/// let mut frames = FrameLoop::new(FrameLoopConfig::default())?;
/// let id = frames.objects_mut().register_object(sim.clone(), CoreMesh::default());
///
/// for _ in 0..600 {
///     frames.run_frame(|ctx| {
///         sim.advance(ctx.delta_time);
///         ctx.objects.notify_dirty(id, TRANSFORM);
///     })?;
/// }
/// frames.shutdown()?.print_summary();
/// ```
pub struct FrameLoop {
    // Dropped before `core` so teardown commands are queued while the
    // dispatcher is still running.
    objects: CoreObjectManager,
    core: Arc<CoreThread>,
    events: EventBus,
    event_sender: EventSender,
    config: FrameLoopConfig,
    frame_count: u64,
    last_frame_time: Instant,
    /// Fence of the frame the core thread may still be working on.
    in_flight: Option<AsyncOp<u64>>,
    stats: FrameStatsAccumulator,
}

impl FrameLoop {
    /// Creates the core thread, starts it and binds an object manager to the
    /// calling thread, which becomes the sim thread.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidConfig` for a rejected configuration, or
    /// any error from starting the core thread.
    pub fn new(config: FrameLoopConfig) -> CoreResult<Self> {
        config.validate()?;

        let core = CoreThread::new(config.core.thread.clone())?;
        core.start()?;
        let objects = CoreObjectManager::new(&core, config.core.sync.clone())?;
        let events = EventBus::new(config.event_capacity);
        let event_sender = events.sender();
        let budget_us = duration_us(config.target_frame_time());

        tracing::debug!(
            mode = ?config.core.thread.mode,
            target_fps = config.target_fps,
            buffers = config.core.sync.buffer_count,
            "frame loop started"
        );

        Ok(Self {
            objects,
            core,
            events,
            event_sender,
            config,
            frame_count: 0,
            last_frame_time: Instant::now(),
            in_flight: None,
            stats: FrameStatsAccumulator::new(budget_us),
        })
    }

    /// Runs one frame: `logic`, sync, fence, submit, wait for the previous
    /// frame.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotRunning` if the core thread has stopped.
    pub fn run_frame<F>(&mut self, logic: F) -> CoreResult<FrameStats>
    where
        F: FnOnce(&mut FrameContext<'_>),
    {
        let frame_start = Instant::now();
        let delta_time = frame_start
            .duration_since(self.last_frame_time)
            .as_secs_f32()
            .min(0.1);
        self.last_frame_time = frame_start;
        let frame = self.frame_count;

        self.event_sender.send(FrameEvent::FrameStarted { frame });

        // 1. Logic
        let logic_start = Instant::now();
        {
            let mut ctx = FrameContext {
                objects: &mut self.objects,
                events: &self.event_sender,
                frame,
                delta_time,
            };
            logic(&mut ctx);
        }
        let logic_us = duration_us(logic_start.elapsed());

        // 2. Sync
        let sync_start = Instant::now();
        let report = self.objects.sync_to_core()?;
        let sync_us = duration_us(sync_start.elapsed());
        self.event_sender.send(FrameEvent::SyncQueued {
            frame,
            objects: report.objects_synced,
            bytes: report.bytes_written,
            destroyed: report.destroyed,
        });

        // 3. Fence, queued behind the upload on the same accessor
        let fence = {
            let sender = self.event_sender.clone();
            let upload = report.upload.clone();
            self.objects.accessor().queue_return_command(move || {
                sender.send(FrameEvent::CoreFrameCompleted {
                    frame,
                    upload: upload.return_value().unwrap_or_default(),
                });
                frame
            })
        };

        // 4. Submit
        let submit_start = Instant::now();
        self.core.submit_all(false)?;
        let submit_us = duration_us(submit_start.elapsed());

        // 5. Wait for the previous frame
        let wait_start = Instant::now();
        if let Some(previous) = self.in_flight.replace(fence) {
            previous.wait();
        }
        let wait_us = duration_us(wait_start.elapsed());

        let stats = FrameStats {
            frame,
            total_us: duration_us(frame_start.elapsed()),
            logic_us,
            sync_us,
            submit_us,
            wait_us,
            objects_synced: report.objects_synced,
            bytes_written: report.bytes_written,
        };
        self.end_frame(stats);
        Ok(stats)
    }

    /// Runs `count` frames, sleeping off whatever is left of each frame's
    /// budget.
    ///
    /// # Errors
    ///
    /// Stops at the first frame that fails; see [`FrameLoop::run_frame`].
    pub fn run_frames<F>(&mut self, count: u64, mut logic: F) -> CoreResult<()>
    where
        F: FnMut(&mut FrameContext<'_>),
    {
        let budget = self.config.target_frame_time();
        for _ in 0..count {
            let start = Instant::now();
            self.run_frame(&mut logic)?;
            if let Some(remaining) = budget.checked_sub(start.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
        Ok(())
    }

    fn end_frame(&mut self, stats: FrameStats) {
        self.frame_count += 1;
        self.stats.record(stats);

        if stats.total_us > self.stats.budget_us {
            self.event_sender.send(FrameEvent::FrameOverBudget {
                frame: stats.frame,
                total_us: stats.total_us,
                budget_us: self.stats.budget_us,
            });
            if self.config.enable_timing_logs {
                tracing::warn!(
                    frame = stats.frame,
                    total_ms = stats.total_us as f64 / 1000.0,
                    budget_ms = self.stats.budget_us as f64 / 1000.0,
                    "frame exceeded budget"
                );
            }
        }
    }

    /// Blocks until every frame run so far has completed on the core thread.
    pub fn wait_idle(&mut self) {
        if let Some(fence) = self.in_flight.take() {
            fence.wait();
        }
    }

    /// Waits for outstanding work, tears down every core object and stops
    /// the core thread.
    ///
    /// Returns the accumulated statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the core thread cannot be shut down cleanly.
    pub fn shutdown(mut self) -> CoreResult<FrameStatsAccumulator> {
        self.wait_idle();
        let Self {
            objects,
            core,
            stats,
            ..
        } = self;

        // Queues and submits teardown of every core object.
        drop(objects);
        core.shutdown()?;
        tracing::debug!(frames = stats.frames_recorded, "frame loop stopped");
        Ok(stats)
    }

    /// Returns the number of frames run.
    #[inline]
    #[must_use]
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Returns the core thread dispatcher.
    #[must_use]
    pub fn core(&self) -> &Arc<CoreThread> {
        &self.core
    }

    /// Returns the object manager.
    #[must_use]
    pub fn objects(&self) -> &CoreObjectManager {
        &self.objects
    }

    /// Returns the object manager for registration outside a frame.
    #[must_use]
    pub fn objects_mut(&mut self) -> &mut CoreObjectManager {
        &mut self.objects
    }

    /// Returns a receiver for frame events.
    #[must_use]
    pub fn events(&self) -> EventReceiver {
        self.events.receiver()
    }

    /// Returns the accumulated statistics.
    #[must_use]
    pub fn stats(&self) -> &FrameStatsAccumulator {
        &self.stats
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &FrameLoopConfig {
        &self.config
    }
}

impl std::fmt::Debug for FrameLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameLoop")
            .field("core", &self.core)
            .field("objects", &self.objects)
            .field("frame_count", &self.frame_count)
            .field("in_flight", &self.in_flight.is_some())
            .finish_non_exhaustive()
    }
}

fn duration_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

/// Accumulator for frame statistics.
#[derive(Clone, Debug)]
pub struct FrameStatsAccumulator {
    /// Total frames recorded.
    pub frames_recorded: u64,
    /// Sum of total frame times.
    pub total_us_sum: u64,
    /// Sum of logic times.
    pub logic_us_sum: u64,
    /// Sum of sync times.
    pub sync_us_sum: u64,
    /// Sum of submit times.
    pub submit_us_sum: u64,
    /// Sum of waits on the previous frame.
    pub wait_us_sum: u64,
    /// Min frame time.
    pub min_frame_us: u64,
    /// Max frame time.
    pub max_frame_us: u64,
    /// Objects serialized over all frames.
    pub objects_synced: u64,
    /// Frame budget in microseconds.
    pub budget_us: u64,
    /// Frames that exceeded the budget.
    pub frames_over_budget: u64,
}

impl FrameStatsAccumulator {
    /// Creates an accumulator with a per-frame budget.
    #[must_use]
    pub fn new(budget_us: u64) -> Self {
        Self {
            frames_recorded: 0,
            total_us_sum: 0,
            logic_us_sum: 0,
            sync_us_sum: 0,
            submit_us_sum: 0,
            wait_us_sum: 0,
            min_frame_us: u64::MAX,
            max_frame_us: 0,
            objects_synced: 0,
            budget_us,
            frames_over_budget: 0,
        }
    }

    /// Records a frame's statistics.
    pub fn record(&mut self, stats: FrameStats) {
        self.frames_recorded += 1;
        self.total_us_sum += stats.total_us;
        self.logic_us_sum += stats.logic_us;
        self.sync_us_sum += stats.sync_us;
        self.submit_us_sum += stats.submit_us;
        self.wait_us_sum += stats.wait_us;
        self.min_frame_us = self.min_frame_us.min(stats.total_us);
        self.max_frame_us = self.max_frame_us.max(stats.total_us);
        self.objects_synced += stats.objects_synced as u64;

        if stats.total_us > self.budget_us {
            self.frames_over_budget += 1;
        }
    }

    /// Returns average frame time in milliseconds.
    #[must_use]
    pub fn avg_frame_ms(&self) -> f64 {
        self.avg_ms(self.total_us_sum)
    }

    /// Returns average FPS.
    #[must_use]
    pub fn avg_fps(&self) -> f64 {
        let avg_ms = self.avg_frame_ms();
        if avg_ms <= 0.0 {
            return 0.0;
        }
        1000.0 / avg_ms
    }

    /// Returns the fraction of frames over budget.
    #[must_use]
    pub fn over_budget_ratio(&self) -> f64 {
        if self.frames_recorded == 0 {
            return 0.0;
        }
        self.frames_over_budget as f64 / self.frames_recorded as f64
    }

    fn avg_ms(&self, sum_us: u64) -> f64 {
        if self.frames_recorded == 0 {
            return 0.0;
        }
        (sum_us as f64 / self.frames_recorded as f64) / 1000.0
    }

    /// Prints a summary of the statistics.
    pub fn print_summary(&self) {
        println!("╔══════════════════════════════════════════════════════════════════╗");
        println!("║                    FRAME STATISTICS SUMMARY                      ║");
        println!("╚══════════════════════════════════════════════════════════════════╝");
        println!();
        println!("┌─ TIMING ─────────────────────────────────────────────────────────┐");
        println!("│ Frames Recorded:    {}", self.frames_recorded);
        println!("│ Average Frame:      {:.3} ms ({:.1} FPS)", self.avg_frame_ms(), self.avg_fps());
        if self.frames_recorded > 0 {
            println!("│ Min Frame:          {:.3} ms", self.min_frame_us as f64 / 1000.0);
            println!("│ Max Frame:          {:.3} ms", self.max_frame_us as f64 / 1000.0);
        }
        println!("└──────────────────────────────────────────────────────────────────┘");
        println!();
        println!("┌─ BUDGET ─────────────────────────────────────────────────────────┐");
        println!("│ Target:             {:.3} ms", self.budget_us as f64 / 1000.0);
        println!(
            "│ Over Budget:        {} frames ({:.1}%)",
            self.frames_over_budget,
            self.over_budget_ratio() * 100.0
        );
        println!("└──────────────────────────────────────────────────────────────────┘");

        if self.frames_recorded > 0 {
            println!();
            println!("┌─ BREAKDOWN ──────────────────────────────────────────────────────┐");
            println!("│ Logic:              {:.3} ms", self.avg_ms(self.logic_us_sum));
            println!("│ Sync:               {:.3} ms", self.avg_ms(self.sync_us_sum));
            println!("│ Submit:             {:.3} ms", self.avg_ms(self.submit_us_sum));
            println!("│ Wait (prev frame):  {:.3} ms", self.avg_ms(self.wait_us_sum));
            println!("│ Objects Synced:     {}", self.objects_synced);
            println!("└──────────────────────────────────────────────────────────────────┘");
        }
    }
}

impl Default for FrameStatsAccumulator {
    fn default() -> Self {
        Self::new(duration_us(FrameLoopConfig::default().target_frame_time()))
    }
}
