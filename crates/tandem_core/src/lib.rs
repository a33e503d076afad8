//! # TANDEM Core
//!
//! Sim/core thread command queues and object synchronization:
//! - Per-thread deferred command queues with async results
//! - A single core thread executing every submitted batch in order
//! - Once-per-frame, double-buffered sync of dirty objects to the core thread
//!
//! ## Architecture Rules
//!
//! 1. **Commands never run on the thread that queued them** - except when
//!    that thread is the core thread, which runs them inline
//! 2. **Batches are handed over whole** - records from one thread never
//!    interleave with another thread's batch
//! 3. **Core-side objects are touched only by the core thread** - the sim
//!    thread writes snapshots, never targets
//!
//! ## Example
//!
//! ```rust,ignore
//! use tandem_core::{CoreThread, CoreThreadConfig};
//!
//! let core = CoreThread::new(CoreThreadConfig::default())?;
//! core.start()?;
//!
//! let accessor = core.accessor();
//! accessor.queue_command(|| println!("A"));
//! accessor.queue_command(|| println!("B"));
//! let sum = accessor.queue_return_command(|| 2 + 3);
//! accessor.submit_to_core_thread(true)?;
//! assert_eq!(sum.return_value(), Some(5));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod command;
pub mod config;
pub mod error;
pub mod memory;
pub mod sync;
pub mod thread;

pub use command::{AsyncOp, CommandBatch, CommandQueue, CommandRecord, NotifyId, PlaybackReport};
pub use config::{CoreConfig, CoreThreadConfig, CoreThreadMode, ObjectSyncConfig, PanicPolicy};
pub use error::{CoreError, CoreResult};
pub use memory::FrameArena;
pub use sync::{
    sync_upload, CoreObjectId, CoreObjectManager, CoreObjectRegistry, DependencyGraph, DirtyFlags,
    FrameBuffers, SyncReader, SyncReport, SyncSnapshot, SyncSource, SyncTarget, SyncUploadReport,
    SyncWriter,
};
pub use thread::{
    CommandFlags, CoreThread, CoreThreadAccessor, DispatcherState, DispatcherStats,
};
