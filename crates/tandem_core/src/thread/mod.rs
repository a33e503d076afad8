//! # Core Thread
//!
//! The dispatcher that owns the core thread, the per-thread accessors that
//! feed it, and the thread-affinity checks guarding both sides.
//!
//! ## Ordering
//!
//! - Records from one thread run in the order that thread queued them.
//! - A submit happens-before every record of the submitted batch runs.
//! - Batches from different threads are ordered only by arrival at the
//!   internal queue.

pub mod affinity;
mod accessor;
mod dispatcher;

pub use accessor::CoreThreadAccessor;
pub use dispatcher::{CommandFlags, CoreThread, DispatcherState, DispatcherStats};
