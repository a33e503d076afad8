//! # Core Objects
//!
//! The two halves of a synchronized object and the byte codec between them.
//!
//! ```text
//!   sim thread                          core thread
//!   ──────────                          ───────────
//!   SyncSource::write_sync_data         SyncTarget::apply_sync_data
//!          │                                   ▲
//!          ▼                                   │
//!     [SyncWriter] ──bytes──> [FrameArena] ──> [SyncReader]
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign, Range};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::memory::FrameArena;

/// Source of process-unique object ids. Zero is never handed out.
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a registered core object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoreObjectId(u64);

impl CoreObjectId {
    /// Allocates a fresh id.
    pub(crate) fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CoreObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreObject({})", self.0)
    }
}

/// Which parts of an object changed since the last sync.
///
/// The low 31 bits are free for the object to define. The top bit is set by
/// the manager when a dependency changed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DirtyFlags(u32);

impl DirtyFlags {
    /// Nothing changed.
    pub const NONE: Self = Self(0);
    /// Every object-defined bit.
    pub const ALL: Self = Self(0x7FFF_FFFF);
    /// An object this one depends on changed.
    pub const DEPENDENCY: Self = Self(1 << 31);

    /// Creates flags from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if no flag is set.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every flag in `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets every flag in `other`.
    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl BitOr for DirtyFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DirtyFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Sim-thread half of a synchronized object.
///
/// Called once per frame for every dirty object, on the sim thread.
pub trait SyncSource {
    /// Serializes the parts of the object named by `flags`.
    fn write_sync_data(&self, flags: DirtyFlags, writer: &mut SyncWriter<'_>);
}

/// Core-thread half of a synchronized object.
///
/// Owned by the core thread from registration until teardown. Every method
/// runs on the core thread.
pub trait SyncTarget: Send {
    /// Called once when the object is installed on the core thread.
    fn initialize(&mut self) {}

    /// Applies the bytes written by the matching [`SyncSource`].
    fn apply_sync_data(&mut self, flags: DirtyFlags, reader: &mut SyncReader<'_>);

    /// Called once when the object is torn down.
    fn destroy(&mut self) {}
}

/// Appends one object's sync data to the frame arena.
pub struct SyncWriter<'a> {
    arena: &'a mut FrameArena,
    start: usize,
}

impl<'a> SyncWriter<'a> {
    pub(crate) fn new(arena: &'a mut FrameArena) -> Self {
        let start = arena.used();
        Self { arena, start }
    }

    /// Writes a plain-old-data value.
    pub fn write_pod<T: bytemuck::Pod>(&mut self, value: &T) {
        let _ = self.arena.push_bytes(bytemuck::bytes_of(value));
    }

    /// Writes a slice of plain-old-data values, without a length prefix.
    pub fn write_slice<T: bytemuck::Pod>(&mut self, values: &[T]) {
        let _ = self.arena.push_bytes(bytemuck::cast_slice(values));
    }

    /// Writes raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        let _ = self.arena.push_bytes(bytes);
    }

    /// Bytes written through this writer so far.
    #[inline]
    #[must_use]
    pub fn written(&self) -> usize {
        self.arena.used() - self.start
    }

    /// The arena range covering everything written.
    pub(crate) fn finish(self) -> Range<usize> {
        self.start..self.arena.used()
    }
}

/// Reads one object's sync data back.
///
/// Reads past the end return `None` rather than panicking.
#[derive(Debug)]
pub struct SyncReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> SyncReader<'a> {
    /// Wraps a byte slice.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    /// Reads a plain-old-data value. Unaligned data is fine.
    pub fn read_pod<T: bytemuck::Pod>(&mut self) -> Option<T> {
        let bytes = self.read_bytes(std::mem::size_of::<T>())?;
        Some(bytemuck::pod_read_unaligned(bytes))
    }

    /// Reads the next `len` bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let bytes = self.bytes.get(self.offset..end)?;
        self.offset = end;
        Some(bytes)
    }

    /// Bytes not yet read.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Returns true once everything has been read.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Transform {
        position: [f32; 3],
        scale: f32,
    }

    #[test]
    fn test_ids_are_unique() {
        let a = CoreObjectId::next();
        let b = CoreObjectId::next();
        assert_ne!(a, b);
        assert!(a.raw() > 0);
    }

    #[test]
    fn test_dirty_flags() {
        let mut flags = DirtyFlags::NONE;
        assert!(flags.is_empty());

        flags.insert(DirtyFlags::from_bits(0b10));
        flags |= DirtyFlags::DEPENDENCY;
        assert!(flags.contains(DirtyFlags::DEPENDENCY));
        assert!(flags.contains(DirtyFlags::from_bits(0b10)));
        assert!(!DirtyFlags::ALL.contains(DirtyFlags::DEPENDENCY));
    }

    #[test]
    fn test_writer_reader() {
        let mut arena = FrameArena::new(64);
        let _ = arena.push_bytes(&[0xAA]); // misalign the next write

        let transform = Transform { position: [1.0, 2.0, 3.0], scale: 0.5 };
        let mut writer = SyncWriter::new(&mut arena);
        writer.write_pod(&transform);
        writer.write_pod(&7u32);
        writer.write_bytes(b"tag");
        assert_eq!(writer.written(), 16 + 4 + 3);
        let range = writer.finish();

        let mut reader = SyncReader::new(arena.bytes(range));
        assert_eq!(reader.read_pod::<Transform>(), Some(transform));
        assert_eq!(reader.read_pod::<u32>(), Some(7));
        assert_eq!(reader.read_bytes(3), Some(&b"tag"[..]));
        assert!(reader.is_empty());
        assert_eq!(reader.read_pod::<u8>(), None);
    }
}
