//! Integrity scanner.
//!
//! Forward scan over a segment's frames that tolerates an unsealed or torn
//! tail. The scanner is the sole authority on whether a segment was cleanly
//! sealed and on its true maximum marker after a crash.
//!
//! # Algorithm
//!
//! Starting right after the header, at each position:
//!
//! 1. Read the 12-byte frame head. If it carries `"!ctl"` instead of
//!    `"-st-"`, the rest of the file must be a trailer whose jump list equals
//!    the boundaries scanned so far; the segment is then [`Termination::Sealed`].
//! 2. Otherwise read the 20-byte foot `len` bytes further on. A repeated
//!    length or end magic that does not validate, a marker that does not
//!    exceed its predecessor, or a frame running past the end of the file
//!    stops the scan at the last confirmed boundary ([`Termination::Torn`]).
//! 3. Each confirmed frame pushes its start offset onto the jump list being
//!    rebuilt.
//!
//! Reaching the end of the file exactly on a boundary yields
//! [`Termination::EndOfData`]: nothing is lost, but the trailer is missing.
//!
//! In [`ScanMode::Payloads`] the scanner also reads every payload, keeps the
//! most recent one for the caller and folds all of them into a CRC32 content
//! checksum, so that two copies of a segment can be compared cheaply.


use std::io;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::frame::{
    CHUNK_END_MAGIC, CHUNK_START_MAGIC, CLOSE_MAGIC, FRAME_FOOT_SIZE, FRAME_HEAD_SIZE, HeaderError,
    JumpList, SEGMENT_HEADER_SIZE, SegmentHeader, StreamId, frame_len,
};
use crate::source::ByteSource;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that stop a scan outright.
///
/// Frame corruption is not among them: it ends the scan with
/// [`Termination::Torn`] instead.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment header failed validation.
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),
}

// ------------------------------------------------------------------------------------------------
// Report types
// ------------------------------------------------------------------------------------------------

/// Whether payload bytes are read during the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    /// Only frame heads and feet are read.
    #[default]
    Boundaries,

    /// Payloads are read and checksummed too.
    Payloads,
}

/// How a scan ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// A trailer matching the scanned boundaries starts at `trailer_offset`.
    Sealed {
        /// Offset of `"!ctl"`.
        trailer_offset: u64,
    },

    /// The file ends exactly after the last valid frame; no trailer.
    EndOfData {
        /// Length of the file.
        offset: u64,
    },

    /// Bytes at `offset` are neither a valid frame nor a valid trailer.
    Torn {
        /// Last confirmed boundary; the file must be cut here.
        offset: u64,

        /// What failed to validate.
        reason: String,
    },
}

impl Termination {
    /// Offset one past the last valid frame.
    pub fn valid_end(&self) -> u64 {
        match self {
            Termination::Sealed { trailer_offset } => *trailer_offset,
            Termination::EndOfData { offset } | Termination::Torn { offset, .. } => *offset,
        }
    }
}

/// One frame confirmed by the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedFrame {
    /// Offset of the frame head.
    pub offset: u64,

    /// Marker from the frame foot.
    pub marker: u64,

    /// Payload length.
    pub payload_len: u64,
}

impl ScannedFrame {
    /// Offset one past the frame foot.
    pub fn end(&self) -> u64 {
        self.offset + frame_len(self.payload_len)
    }
}

/// Summary of a completed scan.
#[derive(Debug, Clone)]
pub struct ScanReport {
    /// Header of the scanned segment.
    pub header: SegmentHeader,

    /// Number of valid chunks.
    pub chunks: usize,

    /// Marker of the first valid chunk.
    pub first_marker: Option<u64>,

    /// Marker of the last valid chunk.
    pub max_marker: Option<u64>,

    /// How the scan ended.
    pub termination: Termination,

    /// Rebuilt chunk start offsets.
    pub jump_list: JumpList,

    /// CRC32 over all payload bytes, in [`ScanMode::Payloads`] only.
    pub checksum: Option<u32>,

    /// Length of the file when the scan started.
    pub file_len: u64,
}

impl ScanReport {
    /// Whether the segment carries a trailer that matches its frames.
    pub fn is_sealed(&self) -> bool {
        matches!(self.termination, Termination::Sealed { .. })
    }

    /// Offset the file must be cut at before it can be sealed, if any bytes
    /// past the last valid frame have to go.
    pub fn truncation_point(&self) -> Option<u64> {
        match &self.termination {
            Termination::Torn { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Scanner
// ------------------------------------------------------------------------------------------------

/// Forward, corruption-tolerant frame scanner over one segment.
pub struct IntegrityScanner<S> {
    source: S,
    header: SegmentHeader,

    /// Length of the source when the scan started.
    file_len: u64,

    /// Next expected frame position.
    position: u64,

    jump_list: JumpList,
    first_marker: Option<u64>,
    last_marker: Option<u64>,
    hasher: Option<crc32fast::Hasher>,

    /// Payload of the most recent frame, in [`ScanMode::Payloads`].
    payload: Vec<u8>,

    termination: Option<Termination>,
}

impl<S: ByteSource> IntegrityScanner<S> {
    /// Reads and validates the header, then positions at the first frame.
    pub fn open(
        source: S,
        expected_number: Option<u32>,
        expected_stream: Option<&StreamId>,
        mode: ScanMode,
    ) -> Result<Self, ScanError> {
        let file_len = source.byte_len()?;
        if file_len < SEGMENT_HEADER_SIZE as u64 {
            return Err(HeaderError::TooShort(file_len).into());
        }
        let mut raw = [0u8; SEGMENT_HEADER_SIZE];
        source.read_exact_at(&mut raw, 0)?;
        let header = SegmentHeader::parse(&raw, expected_number, expected_stream)?;
        Ok(Self::with_header(source, header, file_len, mode))
    }

    /// Scanner over a source whose header was already validated.
    pub fn with_header(source: S, header: SegmentHeader, file_len: u64, mode: ScanMode) -> Self {
        Self {
            source,
            header,
            file_len,
            position: SEGMENT_HEADER_SIZE as u64,
            jump_list: JumpList::new(),
            first_marker: None,
            last_marker: None,
            hasher: (mode == ScanMode::Payloads).then(crc32fast::Hasher::new),
            payload: Vec::new(),
            termination: None,
        }
    }

    /// Header of the segment being scanned.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Offset of the next frame to validate.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// How the scan ended, once it has.
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    /// Number of frames confirmed so far.
    pub fn chunks(&self) -> usize {
        self.jump_list.len()
    }

    /// Marker of the last confirmed frame.
    pub fn last_marker(&self) -> Option<u64> {
        self.last_marker
    }

    /// Payload of the frame most recently returned by [`next_frame`],
    /// leaving an empty buffer behind. Empty in [`ScanMode::Boundaries`].
    ///
    /// [`next_frame`]: IntegrityScanner::next_frame
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }

    /// Validates the next frame.
    ///
    /// Returns `Ok(None)` once the scan has terminated; see
    /// [`termination`](IntegrityScanner::termination) for how.
    pub fn next_frame(&mut self) -> Result<Option<ScannedFrame>, ScanError> {
        if self.termination.is_some() {
            return Ok(None);
        }

        let pos = self.position;
        let remaining = self.file_len.saturating_sub(pos);
        if remaining == 0 {
            self.finish(Termination::EndOfData { offset: pos });
            return Ok(None);
        }
        if remaining < 4 {
            self.tear(pos, format!("{remaining} stray bytes"));
            return Ok(None);
        }

        let mut head = [0u8; FRAME_HEAD_SIZE];
        let head_len = remaining.min(FRAME_HEAD_SIZE as u64) as usize;
        self.source.read_exact_at(&mut head[..head_len], pos)?;

        if head[..4] == CLOSE_MAGIC {
            self.check_trailer(pos)?;
            return Ok(None);
        }
        if head[..4] != CHUNK_START_MAGIC {
            self.tear(pos, "bad chunk start magic".into());
            return Ok(None);
        }
        if head_len < FRAME_HEAD_SIZE {
            self.tear(pos, "partial frame head".into());
            return Ok(None);
        }

        let mut raw_len = [0u8; 8];
        raw_len.copy_from_slice(&head[4..12]);
        let len = u64::from_le_bytes(raw_len);
        let total = match len.checked_add((FRAME_HEAD_SIZE + FRAME_FOOT_SIZE) as u64) {
            Some(total) if total <= remaining => total,
            _ => {
                self.tear(pos, format!("frame of {len} bytes runs past end of file"));
                return Ok(None);
            }
        };

        let mut foot = [0u8; FRAME_FOOT_SIZE];
        self.source
            .read_exact_at(&mut foot, pos + FRAME_HEAD_SIZE as u64 + len)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&foot[..8]);
        let foot_len = u64::from_le_bytes(word);
        word.copy_from_slice(&foot[8..16]);
        let marker = u64::from_le_bytes(word);

        if foot[16..] != CHUNK_END_MAGIC {
            self.tear(pos, "bad chunk end magic".into());
            return Ok(None);
        }
        if foot_len != len {
            self.tear(pos, format!("length mismatch (head {len}, foot {foot_len})"));
            return Ok(None);
        }
        let monotonic = match self.last_marker {
            Some(last) => marker > last,
            None => marker >= self.header.base_marker,
        };
        if !monotonic {
            self.tear(pos, format!("marker {marker} out of order"));
            return Ok(None);
        }

        if let Some(hasher) = self.hasher.as_mut() {
            let payload_len = usize::try_from(len)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "payload too large"))?;
            self.payload.clear();
            self.payload.resize(payload_len, 0);
            self.source
                .read_exact_at(&mut self.payload, pos + FRAME_HEAD_SIZE as u64)?;
            hasher.update(&self.payload);
        }

        self.jump_list.push(pos);
        self.first_marker.get_or_insert(marker);
        self.last_marker = Some(marker);
        self.position = pos + total;
        trace!(offset = pos, marker, len, "frame confirmed");

        Ok(Some(ScannedFrame {
            offset: pos,
            marker,
            payload_len: len,
        }))
    }

    /// Scans to the end and returns the report.
    pub fn run(mut self) -> Result<ScanReport, ScanError> {
        while self.next_frame()?.is_some() {}
        Ok(self.into_report())
    }

    /// Report over the frames confirmed so far.
    ///
    /// Before the scan has terminated the report claims `EndOfData` at the
    /// current position.
    pub fn into_report(self) -> ScanReport {
        let termination = self.termination.unwrap_or(Termination::EndOfData {
            offset: self.position,
        });
        ScanReport {
            header: self.header,
            chunks: self.jump_list.len(),
            first_marker: self.first_marker,
            max_marker: self.last_marker,
            termination,
            jump_list: self.jump_list,
            checksum: self.hasher.map(crc32fast::Hasher::finalize),
            file_len: self.file_len,
        }
    }

    /// Accepts the bytes from `pos` to end of file as the trailer only if
    /// they decode and agree with the scanned boundaries.
    fn check_trailer(&mut self, pos: u64) -> Result<(), ScanError> {
        let len = self.file_len - pos;
        let expected = JumpList::trailer_len(self.jump_list.len(), self.header.trailer_format());
        if len != expected as u64 {
            self.tear(pos, format!("trailer is {len} bytes, expected {expected}"));
            return Ok(());
        }

        let mut bytes = vec![0u8; expected];
        self.source.read_exact_at(&mut bytes, pos)?;
        match JumpList::decode_trailer(&bytes, self.header.trailer_format()) {
            Ok(list) if list == self.jump_list => {
                debug!(
                    segment = self.header.segment_number,
                    chunks = list.len(),
                    "segment sealed"
                );
                self.finish(Termination::Sealed {
                    trailer_offset: pos,
                });
            }
            Ok(_) => self.tear(pos, "trailer disagrees with scanned frames".into()),
            Err(e) => self.tear(pos, format!("trailer: {e}")),
        }
        Ok(())
    }

    fn tear(&mut self, offset: u64, reason: String) {
        warn!(
            segment = self.header.segment_number,
            offset,
            chunks = self.jump_list.len(),
            %reason,
            "segment torn; stopping at last good boundary"
        );
        self.finish(Termination::Torn { offset, reason });
    }

    fn finish(&mut self, termination: Termination) {
        self.payload.clear();
        self.termination = Some(termination);
    }
}
