//! # Deferred Commands
//!
//! ```text
//!   Owner thread                          Core thread
//!   ────────────                          ───────────
//!   queue(f) ──┐
//!   queue(g) ──┼──> [CommandQueue] ──flush──> [CommandBatch] ──playback──> f(), g(), h()
//!   queue(h) ──┘     (owner-only append)       (handed off whole)
//! ```
//!
//! Records keep the order their owner appended them in. `queue_return`
//! hands back an [`AsyncOp`] that the core thread resolves during playback.

mod async_op;
mod queue;
mod record;

pub use async_op::AsyncOp;
pub use queue::CommandQueue;
pub use record::{CommandBatch, CommandRecord, NotifyId, PlaybackReport};
