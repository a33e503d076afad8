//! # Core Object Synchronization
//!
//! ## The Problem
//!
//! ```text
//! Sim thread:   mutates objects every frame
//! Core thread:  renders from its own copy of those objects
//!
//! Shared state with per-field locks: contention on every access
//! Copy on every change:               unbounded allocations
//! ```
//!
//! ## The Solution: Dirty Tracking + Double-Buffered Snapshots
//!
//! ```text
//! Frame N:
//!   Sim serializes dirty objects into slot N % 2
//!   Core applies frame N-1 from the other slot
//!
//! Frame N+1:
//!   Sim reuses slot (N+1) % 2 once the core thread released it
//! ```
//!
//! The apply step is an ordinary queued command, so it always runs after the
//! snapshot it reads was published.

mod dependency;
mod double_buffer;
mod manager;
mod object;

pub use dependency::DependencyGraph;
pub use double_buffer::{FrameBuffers, SlotReader, SlotState, SlotTicket, SlotWriter};
pub use manager::{
    sync_upload, CoreObjectManager, CoreObjectRegistry, SyncEntry, SyncReport, SyncSnapshot,
    SyncUploadReport,
};
pub use object::{CoreObjectId, DirtyFlags, SyncReader, SyncSource, SyncTarget, SyncWriter};
