//! Chunks handed to readers.
//!
//! A [`Chunk`] is an immutable view of one payload plus the marker recorded
//! when it was written. The bytes are never copied out of the region they
//! were read into: a chunk holds either a shared [`Arena`] (a whole segment
//! read into memory, or a memory map) together with an offset range, or a
//! single buffer of its own (pooled or not).
//!
//! Ownership replaces manual "already released" bookkeeping: the arena
//! stays alive exactly as long as some chunk still points into it, and a
//! pooled buffer goes back to its pool when the chunk that owns it drops.


use std::fmt;
use std::ops::{Deref, Range};
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;

use crate::pool::PooledBuffer;

/// A range that does not fit inside the buffer it should index.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("range {start}..{end} outside buffer of {len} bytes")]
pub struct BoundsError {
    /// Requested start.
    pub start: usize,
    /// Requested end.
    pub end: usize,
    /// Length of the buffer.
    pub len: usize,
}

/// Checks `range` against a buffer of `len` bytes.
///
/// Out-of-range access is a contract violation: it trips a debug assertion
/// and is reported as an error in release builds.
pub(crate) fn check_bounds(range: &Range<usize>, len: usize) -> Result<(), BoundsError> {
    let ok = range.start <= range.end && range.end <= len;
    debug_assert!(ok, "range {range:?} outside buffer of {len} bytes");
    if ok {
        Ok(())
    } else {
        Err(BoundsError {
            start: range.start,
            end: range.end,
            len,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Arena
// ------------------------------------------------------------------------------------------------

/// One contiguous, read-only region holding (part of) a segment.
pub(crate) enum Arena {
    /// Segment bytes read into a single heap allocation.
    Heap(Box<[u8]>),

    /// Segment bytes viewed through a read-only memory map.
    Mapped(Mmap),
}

impl Deref for Arena {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Arena::Heap(bytes) => bytes,
            Arena::Mapped(map) => map,
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arena::Heap(bytes) => write!(f, "Arena::Heap({} bytes)", bytes.len()),
            Arena::Mapped(map) => write!(f, "Arena::Mapped({} bytes)", map.len()),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Chunk
// ------------------------------------------------------------------------------------------------

enum Backing {
    Arena(Arc<Arena>),
    Pooled(PooledBuffer),
    Owned(Vec<u8>),
}

/// One payload read back from the log, tagged with its marker.
pub struct Chunk {
    marker: u64,
    backing: Backing,
    range: Range<usize>,
}

impl Chunk {
    /// Chunk viewing `range` of a shared arena.
    pub(crate) fn from_arena(
        arena: &Arc<Arena>,
        range: Range<usize>,
        marker: u64,
    ) -> Result<Self, BoundsError> {
        check_bounds(&range, arena.len())?;
        Ok(Self {
            marker,
            backing: Backing::Arena(Arc::clone(arena)),
            range,
        })
    }

    /// Chunk viewing `range` of a pooled buffer it now owns.
    pub(crate) fn from_pooled(
        buf: PooledBuffer,
        range: Range<usize>,
        marker: u64,
    ) -> Result<Self, BoundsError> {
        check_bounds(&range, buf.len())?;
        Ok(Self {
            marker,
            backing: Backing::Pooled(buf),
            range,
        })
    }

    /// Chunk viewing `range` of a plain allocation it now owns.
    pub(crate) fn from_vec(buf: Vec<u8>, range: Range<usize>, marker: u64) -> Result<Self, BoundsError> {
        check_bounds(&range, buf.len())?;
        Ok(Self {
            marker,
            backing: Backing::Owned(buf),
            range,
        })
    }

    /// Marker recorded when the chunk was appended.
    pub fn marker(&self) -> u64 {
        self.marker
    }

    /// Payload bytes.
    pub fn bytes(&self) -> &[u8] {
        let all: &[u8] = match &self.backing {
            Backing::Arena(arena) => arena,
            Backing::Pooled(buf) => buf,
            Backing::Owned(buf) => buf,
        };
        &all[self.range.clone()]
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.range.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Whether the payload sits in a buffer borrowed from a pool.
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Pooled(_))
    }

    /// Copies the payload into a fresh `Vec`, releasing any pooled buffer.
    pub fn into_vec(self) -> Vec<u8> {
        let Chunk { backing, range, .. } = self;
        match backing {
            Backing::Owned(mut buf) if range.start == 0 => {
                buf.truncate(range.end);
                buf
            }
            Backing::Owned(buf) => buf[range].to_vec(),
            Backing::Pooled(buf) => buf[range].to_vec(),
            Backing::Arena(arena) => arena[range].to_vec(),
        }
    }
}

impl Deref for Chunk {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes()
    }
}

impl AsRef<[u8]> for Chunk {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("marker", &self.marker)
            .field("len", &self.len())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
