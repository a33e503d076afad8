//! # Memory Management
//!
//! Frame-scoped arenas for sync data.
//!
//! ## Design Philosophy
//!
//! Arena storage is reserved once and reused every frame:
//! - No per-object allocations during sync
//! - Everything a frame wrote is released in one reset

mod arena;

pub use arena::FrameArena;
