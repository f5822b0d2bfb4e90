//! Readback strategies.
//!
//! A readback strategy turns one segment's bytes into a sequence of
//! [`Chunk`]s that can be walked forward or backward, or searched by marker.
//! All strategies implement the same [`Readback`] contract; they differ only
//! in how they materialize the segment:
//!
//! | Strategy                 | Bytes                         | Index                          |
//! |--------------------------|-------------------------------|--------------------------------|
//! | [`WholeFileReadback`]    | one heap read of the file     | every frame split eagerly      |
//! | [`WindowReadback`]       | one frame at a time (pooled)  | trailer, or incremental scan   |
//! | [`MappedReadback`]       | read-only memory map          | trailer, or incremental scan   |
//! | [`IntegrityReadback`]    | one frame at a time           | none (forward only)            |
//!
//! # Cursor
//!
//! Every strategy keeps a cursor between chunks. Forward iteration returns
//! the chunk after the cursor and moves past it; reverse iteration returns
//! the chunk before it. [`Readback::seek`] moves the cursor to either end,
//! [`Readback::seek_marker`] places it right before the chunk covering a
//! marker, and [`Readback::scan`] returns that chunk and leaves the cursor
//! right after it.
//!
//! # Live segments
//!
//! A segment that has no trailer yet may still be growing. Window and Mapped
//! strategies over such a segment extend their index by scanning newly
//! appended bytes whenever forward iteration or a marker lookup runs past
//! what is known, and notice when the trailer appears. Frames that are not
//! yet completely on disk are simply not visible yet.
//!
//! # Selection
//!
//! [`ReadbackStrategy::open`] picks a strategy once per segment: a sealed
//! segment no larger than [`ReadbackOptions::whole_file_limit`] is read
//! whole; anything else, including every unsealed segment, uses the
//! configured [`AccessMethod`].

mod integrity;
mod mapped;
mod whole_file;
mod window;

#[cfg(test)]
mod tests;

pub use integrity::IntegrityReadback;
pub use mapped::{MappedReadback, MappedSegment};
pub use whole_file::WholeFileReadback;
pub use window::WindowReadback;

use std::fs::File;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, trace};

use crate::chunk::{BoundsError, Chunk};
use crate::frame::{
    CHUNK_END_MAGIC, CHUNK_START_MAGIC, CLOSE_MAGIC, FRAME_FOOT_SIZE, FRAME_HEAD_SIZE, FrameError,
    HeaderError, SEGMENT_HEADER_SIZE, SegmentHeader, StreamId,
};
use crate::index::{IndexError, MarkerIndex};
use crate::pool::BufferPool;
use crate::scan::ScanError;
use crate::segment::{SealedLayout, SegmentError, locate_trailer};
use crate::source::ByteSource;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by readback strategies.
#[derive(Debug, Error)]
pub enum ReadbackError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment header failed validation.
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// A frame failed validation.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Integrity scan failure.
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Marker index failure.
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Segment inspection failure.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Access outside the bytes of a chunk or segment.
    #[error("out of bounds: {0}")]
    OutOfBounds(#[from] BoundsError),

    /// Operation this strategy does not offer.
    #[error("unsupported by this strategy: {0}")]
    Unsupported(&'static str),

    /// Internal error (lock poisoning).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Contract
// ------------------------------------------------------------------------------------------------

/// Iteration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Increasing markers.
    Forward,

    /// Decreasing markers.
    Reverse,
}

/// Cursor targets for [`Readback::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPosition {
    /// Before the first chunk.
    Start,

    /// After the last chunk currently known.
    End,
}

/// How segments that are not read whole are accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMethod {
    /// Read-only memory map plus marker index.
    #[default]
    Mapped,

    /// One frame at a time through positional reads.
    Window,
}

/// Chunk sequence over one segment.
pub trait Readback {
    /// Returns the next chunk in `direction`, or `None` at that end.
    fn iterate(&mut self, direction: Direction) -> Result<Option<Chunk>, ReadbackError>;

    /// Whether [`iterate`](Readback::iterate) in `direction` would return a
    /// chunk. May extend the index of a live segment.
    fn has_more(&mut self, direction: Direction) -> Result<bool, ReadbackError>;

    /// Whether the segment is sealed with a trailer that matches its frames.
    fn is_consistent(&self) -> bool;

    /// Segment size in bytes, as currently observed.
    fn size(&self) -> u64;

    /// Chunk with the least marker `>= marker`; the cursor ends up after it.
    fn scan(&mut self, marker: u64) -> Result<Option<Chunk>, ReadbackError>;

    /// Moves the cursor to either end.
    fn seek(&mut self, position: SeekPosition) -> Result<(), ReadbackError>;

    /// Moves the cursor right before the chunk with the least marker
    /// `>= marker`. Returns `false` (cursor at the end) if there is none.
    fn seek_marker(&mut self, marker: u64) -> Result<bool, ReadbackError>;
}

/// Position between chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Cursor(usize);

impl Cursor {
    /// Chunk position `iterate(direction)` would return, given `len` chunks.
    pub(crate) fn peek(self, direction: Direction, len: usize) -> Option<usize> {
        match direction {
            Direction::Forward => (self.0 < len).then_some(self.0),
            Direction::Reverse => self.0.checked_sub(1).filter(|p| *p < len),
        }
    }

    /// Moves past the chunk just returned in `direction`.
    pub(crate) fn step(&mut self, direction: Direction) {
        match direction {
            Direction::Forward => self.0 += 1,
            Direction::Reverse => self.0 = self.0.saturating_sub(1),
        }
    }

    pub(crate) fn set(&mut self, pos: usize) {
        self.0 = pos;
    }
}

// ------------------------------------------------------------------------------------------------
// Shared helpers
// ------------------------------------------------------------------------------------------------

/// Result of extending an index over newly appended bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Growth {
    /// Frames added.
    pub added: usize,

    /// Whether a trailer matching the index was found.
    pub sealed: bool,
}

/// Appends to `index` every complete frame found past its end, within the
/// first `file_len` bytes of `source`.
///
/// Stops quietly at anything incomplete: a frame still being written, a
/// trailer still being written, or bytes that do not validate yet.
pub(crate) fn extend_index<S: ByteSource + ?Sized>(
    source: &S,
    header: &SegmentHeader,
    index: &mut MarkerIndex,
    file_len: u64,
) -> Result<Growth, ReadbackError> {
    let mut growth = Growth::default();
    loop {
        let pos = index.end();
        let remaining = file_len.saturating_sub(pos);
        if remaining < 4 {
            return Ok(growth);
        }

        let mut head = [0u8; FRAME_HEAD_SIZE];
        let head_len = remaining.min(FRAME_HEAD_SIZE as u64) as usize;
        source.read_exact_at(&mut head[..head_len], pos)?;

        if head[..4] == CLOSE_MAGIC {
            if let Some(layout) = locate_trailer(source, header.trailer_format(), file_len)? {
                if layout.trailer_offset == pos && layout.jump_list.len() == index.len() {
                    growth.sealed = true;
                }
            }
            return Ok(growth);
        }
        if head[..4] != CHUNK_START_MAGIC || head_len < FRAME_HEAD_SIZE {
            return Ok(growth);
        }

        let mut word = [0u8; 8];
        word.copy_from_slice(&head[4..12]);
        let len = u64::from_le_bytes(word);
        let total = match len.checked_add((FRAME_HEAD_SIZE + FRAME_FOOT_SIZE) as u64) {
            Some(total) if total <= remaining => total,
            _ => return Ok(growth),
        };

        let mut foot = [0u8; FRAME_FOOT_SIZE];
        source.read_exact_at(&mut foot, pos + FRAME_HEAD_SIZE as u64 + len)?;
        word.copy_from_slice(&foot[..8]);
        if foot[16..] != CHUNK_END_MAGIC || u64::from_le_bytes(word) != len {
            trace!(offset = pos, "frame foot not confirmed yet");
            return Ok(growth);
        }
        word.copy_from_slice(&foot[8..16]);
        let marker = u64::from_le_bytes(word);

        index.append(marker, pos, total)?;
        growth.added += 1;
    }
}

/// Index of a segment: from its trailer when sealed, otherwise by scanning
/// whatever complete frames are already present.
pub(crate) fn build_index<S: ByteSource + ?Sized>(
    source: &S,
    header: &SegmentHeader,
    file_len: u64,
) -> Result<(MarkerIndex, bool), ReadbackError> {
    match locate_trailer(source, header.trailer_format(), file_len)? {
        Some(SealedLayout {
            jump_list,
            trailer_offset,
        }) => Ok((MarkerIndex::from_offsets(jump_list.offsets(), trailer_offset), true)),
        None => {
            let mut index = MarkerIndex::new();
            let growth = extend_index(source, header, &mut index, file_len)?;
            Ok((index, growth.sealed))
        }
    }
}

/// Reads and validates the header of an open segment.
pub(crate) fn read_header<S: ByteSource + ?Sized>(
    source: &S,
    expected_stream: Option<&StreamId>,
) -> Result<SegmentHeader, ReadbackError> {
    let len = source.byte_len()?;
    if len < SEGMENT_HEADER_SIZE as u64 {
        return Err(HeaderError::TooShort(len).into());
    }
    let mut raw = [0u8; SEGMENT_HEADER_SIZE];
    source.read_exact_at(&mut raw, 0)?;
    Ok(SegmentHeader::parse(&raw, None, expected_stream)?)
}

// ------------------------------------------------------------------------------------------------
// Strategy selection
// ------------------------------------------------------------------------------------------------

/// Inputs of the selection policy.
#[derive(Debug, Clone, Default)]
pub struct ReadbackOptions {
    /// Strategy for segments that are not read whole.
    pub access_method: AccessMethod,

    /// Sealed segments up to this many bytes are read whole; `0` disables.
    pub whole_file_limit: u64,

    /// Stream identity the segment must carry.
    pub expected_stream: Option<StreamId>,

    /// Pool lending frame buffers to the window strategy.
    pub pool: Option<BufferPool>,
}

/// One of the four readback strategies, resolved once per segment.
#[derive(Debug)]
pub enum ReadbackStrategy {
    /// Entire segment in memory.
    WholeFile(WholeFileReadback),

    /// One frame materialized at a time.
    Window(WindowReadback),

    /// Memory-mapped segment.
    Mapped(MappedReadback),

    /// Forward-only integrity scan.
    Integrity(IntegrityReadback),
}

impl ReadbackStrategy {
    /// Opens `path` with the strategy the selection policy picks.
    pub fn open(path: &Path, options: &ReadbackOptions) -> Result<Self, ReadbackError> {
        let file = File::open(path)?;
        let header = read_header(&file, options.expected_stream.as_ref())?;
        let file_len = file.byte_len()?;
        let sealed = locate_trailer(&file, header.trailer_format(), file_len)?.is_some();

        if sealed && file_len <= options.whole_file_limit {
            debug!("Reading {} whole ({} bytes)", path.display(), file_len);
            return Ok(Self::WholeFile(WholeFileReadback::from_file(file, header)?));
        }

        match options.access_method {
            AccessMethod::Mapped => {
                let segment = MappedSegment::from_file(path, file, header)?;
                Ok(Self::Mapped(MappedReadback::new(segment.into())))
            }
            AccessMethod::Window => Ok(Self::Window(WindowReadback::from_file(
                file,
                header,
                options.pool.clone(),
            )?)),
        }
    }

    /// Opens `path` for forward-only integrity verification.
    pub fn integrity(path: &Path, expected_stream: Option<&StreamId>) -> Result<Self, ReadbackError> {
        Ok(Self::Integrity(IntegrityReadback::open(path, expected_stream)?))
    }

    /// Short name of the active strategy.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WholeFile(_) => "whole-file",
            Self::Window(_) => "window",
            Self::Mapped(_) => "mapped",
            Self::Integrity(_) => "integrity",
        }
    }
}

impl Readback for ReadbackStrategy {
    fn iterate(&mut self, direction: Direction) -> Result<Option<Chunk>, ReadbackError> {
        match self {
            Self::WholeFile(r) => r.iterate(direction),
            Self::Window(r) => r.iterate(direction),
            Self::Mapped(r) => r.iterate(direction),
            Self::Integrity(r) => r.iterate(direction),
        }
    }

    fn has_more(&mut self, direction: Direction) -> Result<bool, ReadbackError> {
        match self {
            Self::WholeFile(r) => r.has_more(direction),
            Self::Window(r) => r.has_more(direction),
            Self::Mapped(r) => r.has_more(direction),
            Self::Integrity(r) => r.has_more(direction),
        }
    }

    fn is_consistent(&self) -> bool {
        match self {
            Self::WholeFile(r) => r.is_consistent(),
            Self::Window(r) => r.is_consistent(),
            Self::Mapped(r) => r.is_consistent(),
            Self::Integrity(r) => r.is_consistent(),
        }
    }

    fn size(&self) -> u64 {
        match self {
            Self::WholeFile(r) => r.size(),
            Self::Window(r) => r.size(),
            Self::Mapped(r) => r.size(),
            Self::Integrity(r) => r.size(),
        }
    }

    fn scan(&mut self, marker: u64) -> Result<Option<Chunk>, ReadbackError> {
        match self {
            Self::WholeFile(r) => r.scan(marker),
            Self::Window(r) => r.scan(marker),
            Self::Mapped(r) => r.scan(marker),
            Self::Integrity(r) => r.scan(marker),
        }
    }

    fn seek(&mut self, position: SeekPosition) -> Result<(), ReadbackError> {
        match self {
            Self::WholeFile(r) => r.seek(position),
            Self::Window(r) => r.seek(position),
            Self::Mapped(r) => r.seek(position),
            Self::Integrity(r) => r.seek(position),
        }
    }

    fn seek_marker(&mut self, marker: u64) -> Result<bool, ReadbackError> {
        match self {
            Self::WholeFile(r) => r.seek_marker(marker),
            Self::Window(r) => r.seek_marker(marker),
            Self::Mapped(r) => r.seek_marker(marker),
            Self::Integrity(r) => r.seek_marker(marker),
        }
    }
}
