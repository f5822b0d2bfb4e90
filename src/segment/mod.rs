//! Segment files.
//!
//! A segment is one file of the log:
//!
//! ```text
//! [HEADER][FRAME]...[FRAME][TRAILER, once sealed]
//! ```
//!
//! This module owns the write side of a segment's lifecycle and the
//! read-only inspection of segments found on disk.
//!
//! - [`SegmentWriter`] creates a segment (`open_for_writing`), appends framed
//!   chunks with strictly increasing markers, and seals the file by writing
//!   the trailer ([`SegmentWriter::prepare_for_close`]) before releasing it.
//! - [`open_for_header`] reads only the fixed header, for identity checks
//!   while enumerating a directory.
//! - [`SegmentInfo::probe`] reports a segment's extent and marker range,
//!   trusting the trailer when one is present and scanning otherwise.
//! - [`recover_and_seal`] turns an improperly closed segment into a sealed
//!   one: the integrity scan finds the last good boundary, the file is cut
//!   there and a fresh trailer is written.
//!
//! # Concurrency
//!
//! A writer holds an exclusive advisory lock on its file for as long as it
//! is open. Readers never take that lock; all writes are positional and
//! a frame becomes visible to readers only once it is complete on disk.
//! The trailer is written without closing the descriptor, so readers racing
//! the writer observe a sealed file before the writer lets go of it.

mod probe;

#[cfg(test)]
mod tests;

pub use probe::{
    Recovery, SealedLayout, SegmentInfo, locate_trailer, open_for_header, recover_and_seal,
};

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use fs2::FileExt as LockExt;
use thiserror::Error;
use tracing::{error, info, trace};

use crate::encoding::{self, EncodingError};
use crate::frame::{
    ChunkBuffer, FRAME_HEAD_SIZE, FrameError, FrameFoot, FrameHead, HeaderError, JumpList,
    SEGMENT_HEADER_SIZE, SegmentHeader, StreamId, TrailerFormat, frame_len,
};
use crate::scan::ScanError;

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "flf";

/// Width of the zero-padded segment number in file names.
const NUMBER_WIDTH: usize = 12;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by segment operations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Fixed-width field encoding failure.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Frame or trailer codec failure.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Header validation failure; fatal for this segment.
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// Integrity scan failure.
    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    /// Marker does not exceed the last one written.
    #[error("marker {marker} does not exceed last marker {last}")]
    NonMonotonicMarker {
        /// Highest marker written so far (or the base marker minus one).
        last: u64,
        /// Rejected marker.
        marker: u64,
    },

    /// Payload exceeds the configured maximum.
    #[error("chunk of {len} bytes exceeds maximum of {max}")]
    ChunkTooLarge {
        /// Payload length.
        len: u64,
        /// Configured maximum.
        max: u64,
    },

    /// Another writer holds the segment's file lock.
    #[error("segment {0} is locked by another writer")]
    Locked(PathBuf),

    /// Append after the trailer was written.
    #[error("segment is sealed")]
    Sealed,

    /// Operation on a closed segment.
    #[error("segment is closed")]
    Closed,
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// File name of segment `number`: zero-padded decimal plus extension.
pub fn segment_file_name(number: u32) -> String {
    format!("{number:0width$}.{SEGMENT_EXTENSION}", width = NUMBER_WIDTH)
}

/// Segment number encoded in a file name, if it names a segment.
pub fn parse_segment_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    if stem.len() != NUMBER_WIDTH || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Path of segment `number` inside `dir`.
pub fn segment_path(dir: &Path, number: u32) -> PathBuf {
    dir.join(segment_file_name(number))
}

/// Flushes directory metadata so created, renamed and deleted files persist.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Parameters of a new segment.
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    /// Identity of the owning stream.
    pub stream_id: StreamId,

    /// Lowest marker the stream still retains.
    pub lowest_marker: u64,

    /// Smallest marker this segment accepts.
    pub base_marker: u64,

    /// Trailer layout written at seal time.
    pub trailer_format: TrailerFormat,

    /// Largest accepted payload.
    pub max_chunk_size: u64,

    /// `fsync` after every append.
    pub sync_writes: bool,
}

/// The single writer of one segment file.
#[derive(Debug)]
pub struct SegmentWriter {
    path: PathBuf,

    /// `None` once closed.
    file: Option<File>,

    header: SegmentHeader,

    /// Offset the next frame is written at.
    position: u64,

    jump_list: JumpList,
    max_marker: Option<u64>,
    max_chunk_size: u64,
    sync_writes: bool,
    sealed: bool,
}

impl SegmentWriter {
    /// Creates segment `number` in `dir` and writes its header.
    ///
    /// Fails if the file already exists.
    pub fn open_for_writing(
        dir: &Path,
        number: u32,
        options: &SegmentOptions,
    ) -> Result<Self, SegmentError> {
        let path = segment_path(dir, number);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| SegmentError::Locked(path.clone()))?;

        let header = SegmentHeader::new(
            options.trailer_format,
            number,
            options.stream_id,
            options.lowest_marker,
            options.base_marker,
        );
        let bytes = encoding::encode_to_vec(&header)?;
        debug_assert_eq!(bytes.len(), SEGMENT_HEADER_SIZE);
        file.write_all_at(&bytes, 0)?;
        file.sync_all()?;
        fsync_dir(dir)?;

        info!(
            "Created segment {} (base marker {}, {:?} trailer)",
            path.display(),
            options.base_marker,
            options.trailer_format
        );

        Ok(Self {
            path,
            file: Some(file),
            header,
            position: SEGMENT_HEADER_SIZE as u64,
            jump_list: JumpList::new(),
            max_marker: None,
            max_chunk_size: options.max_chunk_size,
            sync_writes: options.sync_writes,
            sealed: false,
        })
    }

    /// Appends `payload` tagged with `marker`; returns the bytes written.
    ///
    /// Head, payload and foot are written with one positional write each.
    pub fn append(&mut self, payload: &[u8], marker: u64) -> Result<u64, SegmentError> {
        self.check_append(payload.len() as u64, marker)?;

        let len = payload.len() as u64;
        let mut head = [0u8; FRAME_HEAD_SIZE];
        FrameHead::new(len).write_into(&mut head);
        let foot = encoding::encode_to_vec(&FrameFoot::new(len, marker))?;

        let at = self.position;
        let file = self.file()?;
        file.write_all_at(&head, at)?;
        file.write_all_at(payload, at + FRAME_HEAD_SIZE as u64)?;
        file.write_all_at(&foot, at + FRAME_HEAD_SIZE as u64 + len)?;

        self.commit(at, len, marker)
    }

    /// Appends the payload held in `buf`, framing it in place and writing
    /// the whole frame with a single call.
    pub fn append_buffer(&mut self, buf: &mut ChunkBuffer, marker: u64) -> Result<u64, SegmentError> {
        let len = buf.len() as u64;
        self.check_append(len, marker)?;

        let at = self.position;
        let frame = buf.frame(marker);
        self.file()?.write_all_at(frame, at)?;

        self.commit(at, len, marker)
    }

    /// Writes the trailer without releasing the descriptor.
    ///
    /// Calling it again on a sealed segment is a no-op.
    pub fn prepare_for_close(&mut self) -> Result<(), SegmentError> {
        if self.sealed {
            return Ok(());
        }

        let format = self.header.trailer_format();
        let mut trailer = Vec::with_capacity(JumpList::trailer_len(self.jump_list.len(), format));
        self.jump_list.encode_trailer(format, &mut trailer)?;

        let at = self.position;
        let file = self.file()?;
        file.write_all_at(&trailer, at)?;
        file.sync_all()?;
        self.sealed = true;

        info!(
            "Sealed segment {} ({} chunks, max marker {:?})",
            self.path.display(),
            self.jump_list.len(),
            self.max_marker
        );
        Ok(())
    }

    /// Seals the segment if needed, flushes and releases the descriptor.
    ///
    /// Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), SegmentError> {
        if self.file.is_none() {
            return Ok(());
        }
        self.prepare_for_close()?;
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            LockExt::unlock(&file)?;
        }
        Ok(())
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header written at creation.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Segment number.
    pub fn number(&self) -> u32 {
        self.header.segment_number
    }

    /// Base marker from the header.
    pub fn base_marker(&self) -> u64 {
        self.header.base_marker
    }

    /// Highest marker written so far.
    pub fn max_marker(&self) -> Option<u64> {
        self.max_marker
    }

    /// Bytes of header and frames written so far (trailer excluded).
    pub fn len(&self) -> u64 {
        self.position
    }

    /// Whether no chunk has been written.
    pub fn is_empty(&self) -> bool {
        self.jump_list.is_empty()
    }

    /// Number of chunks written.
    pub fn chunks(&self) -> usize {
        self.jump_list.len()
    }

    /// Chunk start offsets written so far.
    pub fn jump_list(&self) -> &JumpList {
        &self.jump_list
    }

    /// Whether the trailer has been written.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether the descriptor has been released.
    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    fn file(&self) -> Result<&File, SegmentError> {
        self.file.as_ref().ok_or(SegmentError::Closed)
    }

    fn check_append(&self, len: u64, marker: u64) -> Result<(), SegmentError> {
        if self.file.is_none() {
            return Err(SegmentError::Closed);
        }
        if self.sealed {
            return Err(SegmentError::Sealed);
        }
        if len > self.max_chunk_size {
            return Err(SegmentError::ChunkTooLarge {
                len,
                max: self.max_chunk_size,
            });
        }
        match self.max_marker {
            Some(last) if marker <= last => Err(SegmentError::NonMonotonicMarker { last, marker }),
            None if marker < self.header.base_marker => Err(SegmentError::NonMonotonicMarker {
                last: self.header.base_marker.saturating_sub(1),
                marker,
            }),
            _ => Ok(()),
        }
    }

    fn commit(&mut self, at: u64, len: u64, marker: u64) -> Result<u64, SegmentError> {
        if self.sync_writes {
            self.file()?.sync_data()?;
        }
        let written = frame_len(len);
        self.jump_list.push(at);
        self.position = at + written;
        self.max_marker = Some(marker);
        trace!(segment = self.header.segment_number, offset = at, marker, len, "chunk appended");
        Ok(written)
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                error!("Failed to sync segment {} on drop: {}", self.path.display(), e);
            }
        }
    }
}
