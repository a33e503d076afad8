//! # Frame Event System
//!
//! Notifications emitted by the frame driver, including ones sent from the
//! core thread when a frame's core-side work is done.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐                         ┌─────────────┐
//! │ Sim thread  │──FrameStarted──────────>│             │
//! │ (FrameLoop) │──SyncQueued────────────>│   Event     │────> observers
//! └─────────────┘                         │   Channel   │      (UI, tests,
//! ┌─────────────┐                         │             │       profilers)
//! │ Core thread │──CoreFrameCompleted────>│             │
//! │  (fence)    │                         └─────────────┘
//! └─────────────┘
//! ```
//!
//! Sends never block: a full channel drops the event.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tandem_core::SyncUploadReport;

/// Events emitted over a frame's lifetime.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameEvent {
    /// Sim logic is about to run.
    FrameStarted {
        /// Frame number.
        frame: u64,
    },

    /// The frame's snapshot was queued for the core thread.
    SyncQueued {
        /// Frame number.
        frame: u64,
        /// Objects serialized.
        objects: usize,
        /// Bytes written into the frame arena.
        bytes: usize,
        /// Destruction entries included.
        destroyed: usize,
    },

    /// The core thread finished everything queued for the frame.
    ///
    /// Emitted by: the frame fence, on the core thread.
    CoreFrameCompleted {
        /// Frame number.
        frame: u64,
        /// What the upload applied.
        upload: SyncUploadReport,
    },

    /// The frame took longer than the target frame time.
    FrameOverBudget {
        /// Frame number.
        frame: u64,
        /// Total frame time in microseconds.
        total_us: u64,
        /// Budget in microseconds.
        budget_us: u64,
    },
}

impl FrameEvent {
    /// Frame the event belongs to.
    #[must_use]
    pub fn frame(&self) -> u64 {
        match *self {
            Self::FrameStarted { frame }
            | Self::SyncQueued { frame, .. }
            | Self::CoreFrameCompleted { frame, .. }
            | Self::FrameOverBudget { frame, .. } => frame,
        }
    }
}

/// A bounded channel for frame events.
pub struct EventBus {
    sender: Sender<FrameEvent>,
    receiver: Receiver<FrameEvent>,
}

impl EventBus {
    /// Creates a bus holding at most `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self { sender, receiver }
    }

    /// Returns a sender handle.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        EventSender {
            sender: self.sender.clone(),
        }
    }

    /// Returns a receiver handle.
    #[must_use]
    pub fn receiver(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.receiver.clone(),
        }
    }
}

/// Sending half of the bus. Cheap to clone, safe to move to the core thread.
#[derive(Clone)]
pub struct EventSender {
    sender: Sender<FrameEvent>,
}

impl EventSender {
    /// Sends without blocking.
    ///
    /// Returns false if the event was dropped because the channel is full.
    #[inline]
    pub fn send(&self, event: FrameEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::trace!(frame = event.frame(), "frame event dropped, bus full");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Receiving half of the bus.
#[derive(Clone)]
pub struct EventReceiver {
    receiver: Receiver<FrameEvent>,
}

impl EventReceiver {
    /// Takes every event currently queued.
    #[must_use]
    pub fn drain(&self) -> Vec<FrameEvent> {
        self.receiver.try_iter().collect()
    }

    /// Takes one event, if any.
    #[inline]
    #[must_use]
    pub fn try_recv(&self) -> Option<FrameEvent> {
        self.receiver.try_recv().ok()
    }

    /// Number of undelivered events.
    #[inline]
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_and_drain() {
        let bus = EventBus::new(8);
        let sender = bus.sender();
        let receiver = bus.receiver();

        assert!(sender.send(FrameEvent::FrameStarted { frame: 0 }));
        assert!(sender.send(FrameEvent::FrameStarted { frame: 1 }));
        assert_eq!(receiver.pending_count(), 2);

        let frames: Vec<u64> = receiver.drain().iter().map(FrameEvent::frame).collect();
        assert_eq!(frames, vec![0, 1]);
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn test_full_bus_drops() {
        let bus = EventBus::new(1);
        let sender = bus.sender();
        assert!(sender.send(FrameEvent::FrameStarted { frame: 0 }));
        assert!(!sender.send(FrameEvent::FrameStarted { frame: 1 }));
        assert_eq!(bus.receiver().drain().len(), 1);
    }

    #[test]
    fn test_sender_crosses_threads() {
        let bus = EventBus::new(4);
        let sender = bus.sender();
        std::thread::spawn(move || {
            sender.send(FrameEvent::CoreFrameCompleted {
                frame: 3,
                upload: SyncUploadReport::default(),
            })
        })
        .join()
        .unwrap();

        assert_eq!(bus.receiver().try_recv().map(|e| e.frame()), Some(3));
    }
}
