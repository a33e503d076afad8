//! # Frame Arena
//!
//! A bump allocator for one frame's serialized sync data. Everything written
//! during a frame is released at once when the arena is reset.

use std::ops::Range;

/// A bump-pointer byte arena.
///
/// Allocations only move the write offset forward; `reset` rewinds it without
/// releasing the backing storage, so steady-state frames do not allocate.
///
/// # Thread Safety
///
/// The arena itself is not synchronized. Frame slots wrap it in a mutex.
///
/// # Example
///
/// ```rust,ignore
/// let mut arena = FrameArena::new(1024);
///
/// let range = arena.push_bytes(&[1, 2, 3]);
/// assert_eq!(arena.bytes(range), &[1, 2, 3]);
///
/// arena.reset();
/// assert_eq!(arena.used(), 0);
/// ```
#[derive(Debug)]
pub struct FrameArena {
    /// Backing storage; `len()` is the current write offset.
    storage: Vec<u8>,
    /// Capacity reserved up front.
    initial_capacity: usize,
    /// Largest offset reached since creation.
    high_water: usize,
}

impl FrameArena {
    /// Creates an arena with `capacity` bytes reserved up front.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: Vec::with_capacity(capacity),
            initial_capacity: capacity,
            high_water: 0,
        }
    }

    /// Bytes reserved without reallocating.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Bytes written since the last reset.
    #[inline]
    #[must_use]
    pub fn used(&self) -> usize {
        self.storage.len()
    }

    /// Bytes left before the arena has to grow.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used()
    }

    /// Largest number of bytes ever held at once.
    #[inline]
    #[must_use]
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Copies `bytes` into the arena and returns where they landed.
    ///
    /// Grows the arena when the reserved capacity is exhausted; a frame's
    /// data is never dropped.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Range<usize> {
        let start = self.storage.len();
        if bytes.len() > self.remaining() {
            tracing::warn!(
                requested = bytes.len(),
                remaining = self.remaining(),
                initial_capacity = self.initial_capacity,
                "frame arena exhausted, growing"
            );
        }
        self.storage.extend_from_slice(bytes);
        self.high_water = self.high_water.max(self.storage.len());
        start..self.storage.len()
    }

    /// Returns the bytes at `range`, or an empty slice if it is out of bounds.
    #[must_use]
    pub fn bytes(&self, range: Range<usize>) -> &[u8] {
        self.storage.get(range).unwrap_or(&[])
    }

    /// Rewinds the arena, invalidating every range handed out.
    ///
    /// Storage is kept for the next frame.
    #[inline]
    pub fn reset(&mut self) {
        self.storage.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_push() {
        let mut arena = FrameArena::new(16);
        let a = arena.push_bytes(&[1, 2, 3]);
        let b = arena.push_bytes(&[4, 5]);

        assert_eq!(a, 0..3);
        assert_eq!(b, 3..5);
        assert_eq!(arena.bytes(a), &[1, 2, 3]);
        assert_eq!(arena.bytes(b), &[4, 5]);
        assert_eq!(arena.used(), 5);
    }

    #[test]
    fn test_arena_reset_keeps_capacity() {
        let mut arena = FrameArena::new(64);
        let _ = arena.push_bytes(&[0; 40]);
        let capacity = arena.capacity();

        arena.reset();
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.capacity(), capacity);
        assert_eq!(arena.high_water(), 40);
    }

    #[test]
    fn test_arena_grows_when_full() {
        let mut arena = FrameArena::new(4);
        let range = arena.push_bytes(&[7; 10]);
        assert_eq!(range, 0..10);
        assert_eq!(arena.bytes(range), &[7; 10]);
    }

    #[test]
    fn test_out_of_bounds_range_is_empty() {
        let arena = FrameArena::new(4);
        assert!(arena.bytes(2..8).is_empty());
    }
}
