//! # TANDEM
//!
//! The frame driver, running sim logic and core-side work in lock step.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               TANDEM                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐   snapshot N    ┌─────────────────┐               │
//! │  │   SIM THREAD    │────────────────>│   CORE THREAD   │               │
//! │  │                 │   + commands    │                 │               │
//! │  │  • Frame logic  │                 │  • Playback     │               │
//! │  │  • Dirty flags  │<────────────────│  • Sync upload  │               │
//! │  │  • Accessor     │   fence N-1     │  • Fence        │               │
//! │  └─────────────────┘                 └─────────────────┘               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `events`: Frame notifications, including from the core thread
//! - `frame_loop`: Frame orchestration and timing

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod events;
pub mod frame_loop;

pub use tandem_core as core;

// Re-export commonly used types
pub use events::{EventBus, EventReceiver, EventSender, FrameEvent};
pub use frame_loop::{FrameContext, FrameLoop, FrameLoopConfig, FrameStats, FrameStatsAccumulator};
