//! Marker index.
//!
//! A [`MarkerIndex`] is the sorted `(marker, offset)` table of one segment,
//! one entry per chunk, monotonically increasing in both fields. It answers
//! `floor` and `ceiling` queries by binary search.
//!
//! # Lazy markers
//!
//! A sealed segment's trailer lists chunk offsets but not markers. An index
//! built from the trailer therefore starts with every marker unresolved; the
//! first query touching an entry reads the 8-byte marker out of that chunk's
//! frame foot and memoizes it. A binary search over `n` chunks resolves at
//! most `log2(n)` markers, so opening a large sealed segment costs one trailer
//! read rather than a full scan.
//!
//! Markers are cached in [`OnceLock`]s, so an index can be queried from many
//! threads through a shared reference.
//!
//! # Growth
//!
//! While a segment is still being written, readers extend its index with
//! [`MarkerIndex::append`]. Appends must continue exactly where the previous
//! chunk ended and carry a strictly larger marker.


use std::io;
use std::sync::OnceLock;

use thiserror::Error;

use crate::frame::{CHUNK_END_MAGIC, FRAME_FOOT_SIZE, SEGMENT_HEADER_SIZE};
use crate::source::ByteSource;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by marker index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Underlying I/O error while resolving a marker.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Appended marker does not exceed the previous one.
    #[error("marker {marker} does not exceed previous marker {last}")]
    NonMonotonic {
        /// Previous marker.
        last: u64,
        /// Rejected marker.
        marker: u64,
    },

    /// Appended chunk does not start where the previous one ended.
    #[error("chunk at offset {offset} does not follow previous end {expected}")]
    NonContiguous {
        /// Where the next chunk had to start.
        expected: u64,
        /// Where it claimed to start.
        offset: u64,
    },

    /// Append after an entry whose marker was never resolved.
    #[error("previous marker not resolved")]
    Unresolved,

    /// Frame foot read while resolving a marker failed validation.
    #[error("corrupt frame foot ending at offset {0}")]
    CorruptFoot(u64),

    /// Position past the last entry.
    #[error("index position {0} out of range")]
    OutOfRange(usize),
}

// ------------------------------------------------------------------------------------------------
// Entries
// ------------------------------------------------------------------------------------------------

/// One chunk of the index.
#[derive(Debug)]
pub struct IndexEntry {
    /// Offset of the chunk's frame head.
    offset: u64,

    /// Marker, once known.
    marker: OnceLock<u64>,
}

impl IndexEntry {
    fn resolved(offset: u64, marker: u64) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(marker);
        Self {
            offset,
            marker: cell,
        }
    }

    fn deferred(offset: u64) -> Self {
        Self {
            offset,
            marker: OnceLock::new(),
        }
    }

    /// Offset of the chunk's frame head.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Marker if it has already been read.
    pub fn cached_marker(&self) -> Option<u64> {
        self.marker.get().copied()
    }
}

// ------------------------------------------------------------------------------------------------
// MarkerIndex
// ------------------------------------------------------------------------------------------------

/// Sorted marker → offset table of one segment.
#[derive(Debug)]
pub struct MarkerIndex {
    entries: Vec<IndexEntry>,

    /// Offset one past the last indexed frame.
    end: u64,
}

impl Default for MarkerIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkerIndex {
    /// Empty index for a segment whose first chunk starts after the header.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            end: SEGMENT_HEADER_SIZE as u64,
        }
    }

    /// Index over trailer-supplied chunk offsets with deferred markers.
    ///
    /// `end` is the offset one past the last frame (the trailer offset).
    pub fn from_offsets(offsets: &[u64], end: u64) -> Self {
        Self {
            entries: offsets.iter().map(|&o| IndexEntry::deferred(o)).collect(),
            end,
        }
    }

    /// Index over fully known `(marker, offset)` pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u64, u64)>, end: u64) -> Self {
        Self {
            entries: pairs
                .into_iter()
                .map(|(marker, offset)| IndexEntry::resolved(offset, marker))
                .collect(),
            end,
        }
    }

    /// Appends a chunk of `frame_len` bytes at `offset` carrying `marker`.
    pub fn append(&mut self, marker: u64, offset: u64, frame_len: u64) -> Result<(), IndexError> {
        if offset != self.end {
            return Err(IndexError::NonContiguous {
                expected: self.end,
                offset,
            });
        }
        if let Some(last) = self.entries.last() {
            let last = last.cached_marker().ok_or(IndexError::Unresolved)?;
            if marker <= last {
                return Err(IndexError::NonMonotonic { last, marker });
            }
        }
        self.entries.push(IndexEntry::resolved(offset, marker));
        self.end = offset + frame_len;
        Ok(())
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no chunk is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset one past the last indexed frame.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// First entry, O(1).
    pub fn first(&self) -> Option<&IndexEntry> {
        self.entries.first()
    }

    /// Last entry, O(1).
    pub fn last(&self) -> Option<&IndexEntry> {
        self.entries.last()
    }

    /// Entry at `pos`.
    pub fn get(&self, pos: usize) -> Option<&IndexEntry> {
        self.entries.get(pos)
    }

    /// Byte range `[start, end)` of the frame at `pos`.
    pub fn frame_range(&self, pos: usize) -> Result<(u64, u64), IndexError> {
        let entry = self.entries.get(pos).ok_or(IndexError::OutOfRange(pos))?;
        let end = self
            .entries
            .get(pos + 1)
            .map(IndexEntry::offset)
            .unwrap_or(self.end);
        Ok((entry.offset, end))
    }

    /// Marker of the chunk at `pos`, reading it from `source` on first use.
    pub fn marker<S: ByteSource + ?Sized>(&self, pos: usize, source: &S) -> Result<u64, IndexError> {
        let entry = self.entries.get(pos).ok_or(IndexError::OutOfRange(pos))?;
        if let Some(marker) = entry.cached_marker() {
            return Ok(marker);
        }

        let (_, frame_end) = self.frame_range(pos)?;
        // Foot layout: [len u64][marker u64][end magic]; read marker + magic.
        let marker_at = frame_end
            .checked_sub((FRAME_FOOT_SIZE - 8) as u64)
            .ok_or(IndexError::CorruptFoot(frame_end))?;
        let mut tail = [0u8; 12];
        source.read_exact_at(&mut tail, marker_at)?;
        if tail[8..] != CHUNK_END_MAGIC {
            return Err(IndexError::CorruptFoot(frame_end));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&tail[..8]);
        let marker = u64::from_le_bytes(raw);

        Ok(*entry.marker.get_or_init(|| marker))
    }

    /// Position of the greatest marker `<= key`.
    pub fn floor<S: ByteSource + ?Sized>(&self, key: u64, source: &S) -> Result<Option<usize>, IndexError> {
        // First position whose marker is > key; the floor sits just before it.
        let upper = self.partition_point(source, |m| m <= key)?;
        Ok(upper.checked_sub(1))
    }

    /// Position of the least marker `>= key`.
    pub fn ceiling<S: ByteSource + ?Sized>(
        &self,
        key: u64,
        source: &S,
    ) -> Result<Option<usize>, IndexError> {
        let pos = self.partition_point(source, |m| m < key)?;
        Ok((pos < self.entries.len()).then_some(pos))
    }

    /// Number of leading entries whose marker satisfies `pred`.
    ///
    /// `pred` must be true for a prefix of the index and false afterwards.
    fn partition_point<S: ByteSource + ?Sized>(
        &self,
        source: &S,
        pred: impl Fn(u64) -> bool,
    ) -> Result<usize, IndexError> {
        let (mut lo, mut hi) = (0usize, self.entries.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.marker(mid, source)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}
