//! # Double-Buffered Frame Slots
//!
//! The sim thread serializes frame `N` into slot `N % slot_count` while the
//! core thread may still be applying an earlier frame from another slot.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────────────────────────┐
//!                │           FrameBuffers           │
//!                │                                  │
//!                │  ┌──────────┐      ┌──────────┐  │
//!                │  │  Slot 0  │      │  Slot 1  │  │
//!                │  │ (arena)  │      │ (arena)  │  │
//!                │  └──────────┘      └──────────┘  │
//!                └──────────────────────────────────┘
//!                         │                  │
//!           ┌─────────────┘                  └─────────────┐
//!           ▼                                              ▼
//!   ┌──────────────┐    publish()    ┌────────────┐  open()  ┌────────────┐
//!   │  SlotWriter  │ ──────────────> │ SlotTicket │ ───────> │ SlotReader │
//!   │ (sim thread) │                 │ (in queue) │          │ (core)     │
//!   └──────────────┘                 └────────────┘          └────────────┘
//! ```
//!
//! ## Slot States
//!
//! `Free -> Writing -> Pending -> Reading -> Free`. A writer only starts on a
//! `Free` slot and waits otherwise, so frame `N + slot_count` never
//! overwrites data the core thread is still reading for frame `N`. A ticket
//! dropped without being opened returns its slot to `Free`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::ObjectSyncConfig;
use crate::memory::FrameArena;

/// Where a slot is in its write/read cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Available for the next write.
    Free,
    /// The sim thread is serializing into it.
    Writing,
    /// Published, waiting for the core thread.
    Pending,
    /// The core thread is applying it.
    Reading,
}

struct SlotInner {
    arena: FrameArena,
    state: SlotState,
    frame: u64,
}

struct Slot {
    inner: Mutex<SlotInner>,
    released: Condvar,
}

impl Slot {
    fn release(&self, inner: &mut SlotInner) {
        inner.state = SlotState::Free;
        self.released.notify_all();
    }
}

/// A ring of frame arenas shared by the sim and core threads.
///
/// ## Usage
///
/// ```rust,ignore
/// let buffers = FrameBuffers::new(&ObjectSyncConfig::default());
///
/// // Sim thread
/// let mut writer = buffers.begin_write(frame);
/// let range = writer.arena().push_bytes(&data);
/// let mut ticket = writer.publish();
///
/// // Core thread, later
/// if let Some(reader) = ticket.open() {
///     apply(reader.arena().bytes(range));
/// } // slot is free again
/// ```
pub struct FrameBuffers {
    slots: Box<[Slot]>,
    warning_interval: Duration,
}

impl FrameBuffers {
    /// Creates `config.buffer_count` slots of `config.arena_capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `buffer_count` is zero. Validated configs never are.
    #[must_use]
    pub fn new(config: &ObjectSyncConfig) -> Arc<Self> {
        assert!(config.buffer_count > 0, "FrameBuffers needs at least one slot");
        let slots = (0..config.buffer_count)
            .map(|_| Slot {
                inner: Mutex::new(SlotInner {
                    arena: FrameArena::new(config.arena_capacity),
                    state: SlotState::Free,
                    frame: 0,
                }),
                released: Condvar::new(),
            })
            .collect();

        Arc::new(Self {
            slots,
            warning_interval: Duration::from_millis(config.slot_wait_warning_ms.max(1)),
        })
    }

    /// Number of slots in the ring.
    #[inline]
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Slot used by `frame`.
    #[inline]
    #[must_use]
    pub fn slot_index(&self, frame: u64) -> usize {
        (frame % self.slots.len() as u64) as usize
    }

    /// Current state of the slot `frame` would use.
    #[must_use]
    pub fn slot_state(&self, frame: u64) -> SlotState {
        self.slots[self.slot_index(frame)].inner.lock().state
    }

    /// Claims the slot for `frame`, waiting until the core thread is done
    /// with its previous occupant.
    ///
    /// The arena is reset before it is handed out. While waiting, a warning
    /// is logged every `slot_wait_warning_ms`.
    pub fn begin_write(self: &Arc<Self>, frame: u64) -> SlotWriter<'_> {
        let index = self.slot_index(frame);
        let slot = &self.slots[index];
        let mut inner = slot.inner.lock();

        while inner.state != SlotState::Free {
            if slot.released.wait_for(&mut inner, self.warning_interval).timed_out()
                && inner.state != SlotState::Free
            {
                tracing::warn!(
                    slot = index,
                    frame,
                    occupant = inner.frame,
                    state = ?inner.state,
                    "sync slot still busy; is the core thread keeping up?"
                );
            }
        }

        inner.state = SlotState::Writing;
        inner.frame = frame;
        inner.arena.reset();

        SlotWriter {
            buffers: self,
            index,
            inner,
            published: false,
        }
    }

    fn release_if_pending(&self, index: usize, frame: u64) {
        let slot = &self.slots[index];
        let mut inner = slot.inner.lock();
        if inner.state == SlotState::Pending && inner.frame == frame {
            slot.release(&mut inner);
        }
    }
}

impl std::fmt::Debug for FrameBuffers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffers")
            .field("slots", &self.slots.len())
            .field("warning_interval", &self.warning_interval)
            .finish()
    }
}

/// Exclusive write access to one slot.
///
/// Dropping the writer without publishing frees the slot.
pub struct SlotWriter<'a> {
    buffers: &'a Arc<FrameBuffers>,
    index: usize,
    inner: MutexGuard<'a, SlotInner>,
    published: bool,
}

impl SlotWriter<'_> {
    /// The slot's arena.
    #[must_use]
    pub fn arena(&mut self) -> &mut FrameArena {
        &mut self.inner.arena
    }

    /// Slot index in the ring.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hands the slot over for reading.
    #[must_use]
    pub fn publish(mut self) -> SlotTicket {
        self.inner.state = SlotState::Pending;
        self.published = true;

        SlotTicket {
            buffers: Arc::clone(self.buffers),
            index: self.index,
            frame: self.inner.frame,
            opened: false,
        }
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.buffers.slots[self.index].release(&mut self.inner);
        }
    }
}

/// A published slot waiting to be read.
///
/// Travels inside the queued upload command. Dropping it unopened (for
/// example, because the command was rejected or cancelled) frees the slot.
pub struct SlotTicket {
    buffers: Arc<FrameBuffers>,
    index: usize,
    frame: u64,
    opened: bool,
}

impl SlotTicket {
    /// Frame the slot was written for.
    #[inline]
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Slot index in the ring.
    #[inline]
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Starts reading the slot. Returns `None` if it was already opened.
    pub fn open(&mut self) -> Option<SlotReader<'_>> {
        if self.opened {
            return None;
        }
        self.opened = true;

        let slot = &self.buffers.slots[self.index];
        let mut inner = slot.inner.lock();
        if inner.state != SlotState::Pending || inner.frame != self.frame {
            tracing::warn!(
                slot = self.index,
                frame = self.frame,
                state = ?inner.state,
                "sync ticket does not match its slot"
            );
            return None;
        }
        inner.state = SlotState::Reading;

        Some(SlotReader { slot, inner })
    }
}

impl Drop for SlotTicket {
    fn drop(&mut self) {
        if !self.opened {
            tracing::debug!(slot = self.index, frame = self.frame, "sync ticket dropped unread");
            self.buffers.release_if_pending(self.index, self.frame);
        }
    }
}

impl std::fmt::Debug for SlotTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotTicket")
            .field("index", &self.index)
            .field("frame", &self.frame)
            .field("opened", &self.opened)
            .finish()
    }
}

/// Read access to a published slot. Dropping it frees the slot.
pub struct SlotReader<'a> {
    slot: &'a Slot,
    inner: MutexGuard<'a, SlotInner>,
}

impl SlotReader<'_> {
    /// The slot's arena.
    #[inline]
    #[must_use]
    pub fn arena(&self) -> &FrameArena {
        &self.inner.arena
    }

    /// Frame the slot was written for.
    #[inline]
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.inner.frame
    }
}

impl Drop for SlotReader<'_> {
    fn drop(&mut self) {
        self.slot.release(&mut self.inner);
    }
}
