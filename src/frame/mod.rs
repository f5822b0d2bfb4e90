//! Segment, chunk and trailer byte layouts.
//!
//! This module owns every fixed on-disk structure of a segment file. It is
//! stateless: encoders append to a caller-supplied buffer and decoders work
//! on borrowed slices, leaving all I/O to [`segment`](crate::segment),
//! [`scan`](crate::scan) and [`readback`](crate::readback).
//!
//! # On-disk layout
//!
//! ```text
//! [SEGMENT HEADER (42 bytes)]
//! ["-st-"][LEN u64][PAYLOAD (LEN bytes)][LEN u64][MARKER u64]["~fc~"]
//! ["-st-"][LEN u64][PAYLOAD (LEN bytes)][LEN u64][MARKER u64]["~fc~"]
//! ...
//! ["!ctl"][JUMP LIST ENTRIES][COUNT]["+jmp"]          <- only once sealed
//! ```
//!
//! - **Segment header**: `"%flf"`, format version (u16), segment number
//!   (u32), stream id (16 bytes), lowest retained marker (u64), base marker
//!   (u64).
//! - **Chunk frame**: 12-byte head and 20-byte foot around the payload. The
//!   repeated length is a self-consistency check.
//! - **Trailer**: the jump list of chunk start offsets. The header version
//!   selects its layout:
//!   - version 1 ([`TrailerFormat::Legacy`]): absolute `u64` offsets,
//!   - version 2 ([`TrailerFormat::Compact`]): `u32` deltas, the first one
//!     measured from the end of the header.
//!
//!   The count is a `u16` when it is at most [`MAX_SHORT_COUNT`]; larger
//!   counts are written as a `u32` followed by the `u16` sentinel
//!   [`COUNT_SENTINEL`]. The count sits right before `"+jmp"` so the trailer
//!   can be found by reading backwards from the end of the file.
//!
//! All integers are little-endian.


use std::ops::Range;

use thiserror::Error;

use crate::encoding::{self, EncodingError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Magic at the start of every segment file.
pub const SEGMENT_MAGIC: [u8; 4] = *b"%flf";

/// Magic opening every chunk frame.
pub const CHUNK_START_MAGIC: [u8; 4] = *b"-st-";

/// Magic closing every chunk frame.
pub const CHUNK_END_MAGIC: [u8; 4] = *b"~fc~";

/// Magic opening the trailer of a sealed segment.
pub const CLOSE_MAGIC: [u8; 4] = *b"!ctl";

/// Magic closing the trailer of a sealed segment.
pub const JUMP_MAGIC: [u8; 4] = *b"+jmp";

/// Size of the fixed segment header.
pub const SEGMENT_HEADER_SIZE: usize = 42;

/// Size of the frame head (start magic + length).
pub const FRAME_HEAD_SIZE: usize = 12;

/// Size of the frame foot (repeated length + marker + end magic).
pub const FRAME_FOOT_SIZE: usize = 20;

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = FRAME_HEAD_SIZE + FRAME_FOOT_SIZE;

/// Largest count stored in the short (`u16`) count field.
pub const MAX_SHORT_COUNT: usize = 32767;

/// Sentinel marking a widened (`u32`) count field.
pub const COUNT_SENTINEL: u16 = 0xFFFF;

/// Longest possible count field plus closing magic: `[u32][u16]["+jmp"]`.
pub const TRAILER_TAIL_MAX: usize = 4 + 2 + 4;

/// Smallest possible trailer: `"!ctl"`, a zero `u16` count and `"+jmp"`.
pub const TRAILER_MIN_SIZE: usize = 4 + 2 + 4;

/// 16-byte identity shared by every segment of one stream.
pub type StreamId = [u8; 16];

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Reasons a segment header is rejected.
///
/// All of them are fatal for the segment carrying the header; the stream
/// decides whether that is fatal for itself.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeaderError {
    /// File is shorter than [`SEGMENT_HEADER_SIZE`].
    #[error("segment shorter than header ({0} bytes)")]
    TooShort(u64),

    /// Header magic is not `"%flf"`.
    #[error("bad segment magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// Format version is not one this build reads.
    #[error("unsupported segment format version {0}")]
    UnsupportedVersion(u16),

    /// Embedded segment number disagrees with the file name.
    #[error("segment number mismatch (file name {expected}, header {found})")]
    SegmentNumberMismatch {
        /// Number derived from the file name.
        expected: u32,
        /// Number stored in the header.
        found: u32,
    },

    /// Segment belongs to another stream.
    #[error("stream id mismatch")]
    StreamIdMismatch {
        /// Identity the caller expected.
        expected: StreamId,
        /// Identity stored in the header.
        found: StreamId,
    },
}

/// Errors returned by frame and trailer codecs.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Fixed-width field encoding failure.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Segment header validation failure.
    #[error("Header error: {0}")]
    Header(#[from] HeaderError),

    /// Frame does not start with `"-st-"`.
    #[error("bad chunk start magic at offset {0}")]
    BadStartMagic(u64),

    /// Frame does not end with `"~fc~"`.
    #[error("bad chunk end magic at offset {0}")]
    BadEndMagic(u64),

    /// Repeated length disagrees with the leading length.
    #[error("chunk length mismatch (head {head}, foot {foot})")]
    LengthMismatch {
        /// Length from the frame head.
        head: u64,
        /// Length repeated in the frame foot.
        foot: u64,
    },

    /// Buffer ends before the frame or trailer does.
    #[error("truncated frame (need {needed} bytes, have {available})")]
    Truncated {
        /// Bytes required.
        needed: u64,
        /// Bytes available.
        available: u64,
    },

    /// Trailer bytes do not form a valid jump list.
    #[error("malformed trailer: {0}")]
    BadTrailer(String),

    /// A compact jump-list delta does not fit in `u32`.
    #[error("jump list delta {0} does not fit the compact trailer")]
    DeltaOverflow(u64),

    /// Read outside the bounds of a buffer.
    #[error("out of bounds access: {0}")]
    OutOfBounds(String),
}

// ------------------------------------------------------------------------------------------------
// Trailer format
// ------------------------------------------------------------------------------------------------

/// Jump-list layout written at seal time; selected by the header version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrailerFormat {
    /// Absolute `u64` offsets (format version 1).
    Legacy,

    /// `u32` deltas from the previous boundary (format version 2).
    #[default]
    Compact,
}

impl TrailerFormat {
    /// Header version that announces this trailer layout.
    pub fn version(self) -> u16 {
        match self {
            TrailerFormat::Legacy => 1,
            TrailerFormat::Compact => 2,
        }
    }

    /// Trailer layout announced by a header version.
    pub fn from_version(version: u16) -> Option<Self> {
        match version {
            1 => Some(TrailerFormat::Legacy),
            2 => Some(TrailerFormat::Compact),
            _ => None,
        }
    }

    /// Width in bytes of one jump-list entry.
    pub fn entry_width(self) -> usize {
        match self {
            TrailerFormat::Legacy => 8,
            TrailerFormat::Compact => 4,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Segment header
// ------------------------------------------------------------------------------------------------

/// Fixed-size header at offset 0 of every segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Magic bytes (`b"%flf"`).
    pub magic: [u8; 4],

    /// Format version; selects the trailer layout.
    pub version: u16,

    /// Segment number, also embedded in the file name.
    pub segment_number: u32,

    /// Identity of the owning stream.
    pub stream_id: StreamId,

    /// Lowest marker the stream retained when this segment was created.
    pub lowest_marker: u64,

    /// First marker this segment may contain.
    pub base_marker: u64,
}

impl SegmentHeader {
    /// Creates a header for a new segment.
    pub fn new(
        format: TrailerFormat,
        segment_number: u32,
        stream_id: StreamId,
        lowest_marker: u64,
        base_marker: u64,
    ) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: format.version(),
            segment_number,
            stream_id,
            lowest_marker,
            base_marker,
        }
    }

    /// Trailer layout announced by this header.
    ///
    /// Only valid for headers that passed [`SegmentHeader::parse`].
    pub fn trailer_format(&self) -> TrailerFormat {
        TrailerFormat::from_version(self.version).unwrap_or_default()
    }

    /// Decodes and validates a header from the first bytes of a segment.
    ///
    /// `expected_number` and `expected_stream` are checked when present.
    pub fn parse(
        buf: &[u8],
        expected_number: Option<u32>,
        expected_stream: Option<&StreamId>,
    ) -> Result<Self, HeaderError> {
        if buf.len() < SEGMENT_HEADER_SIZE {
            return Err(HeaderError::TooShort(buf.len() as u64));
        }

        let (header, _) = encoding::decode_from_slice::<SegmentHeader>(&buf[..SEGMENT_HEADER_SIZE])
            .map_err(|_| HeaderError::TooShort(buf.len() as u64))?;

        if header.magic != SEGMENT_MAGIC {
            return Err(HeaderError::BadMagic(header.magic));
        }
        if TrailerFormat::from_version(header.version).is_none() {
            return Err(HeaderError::UnsupportedVersion(header.version));
        }
        if let Some(expected) = expected_number {
            if header.segment_number != expected {
                return Err(HeaderError::SegmentNumberMismatch {
                    expected,
                    found: header.segment_number,
                });
            }
        }
        if let Some(expected) = expected_stream {
            if &header.stream_id != expected {
                return Err(HeaderError::StreamIdMismatch {
                    expected: *expected,
                    found: header.stream_id,
                });
            }
        }

        Ok(header)
    }
}

impl encoding::Encode for SegmentHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.magic, buf)?;
        encoding::Encode::encode_to(&self.version, buf)?;
        encoding::Encode::encode_to(&self.segment_number, buf)?;
        encoding::Encode::encode_to(&self.stream_id, buf)?;
        encoding::Encode::encode_to(&self.lowest_marker, buf)?;
        encoding::Encode::encode_to(&self.base_marker, buf)?;
        Ok(())
    }
}

impl encoding::Decode for SegmentHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u16::decode_from(&buf[off..])?;
        off += n;
        let (segment_number, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (stream_id, n) = <[u8; 16]>::decode_from(&buf[off..])?;
        off += n;
        let (lowest_marker, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (base_marker, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                segment_number,
                stream_id,
                lowest_marker,
                base_marker,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Chunk frame
// ------------------------------------------------------------------------------------------------

/// Leading 12 bytes of a chunk frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHead {
    /// Start magic (`b"-st-"`).
    pub magic: [u8; 4],

    /// Payload length.
    pub len: u64,
}

/// Trailing 20 bytes of a chunk frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFoot {
    /// Payload length, repeated.
    pub len: u64,

    /// Marker recorded at write time.
    pub marker: u64,

    /// End magic (`b"~fc~"`).
    pub magic: [u8; 4],
}

impl FrameHead {
    /// Head for a payload of `len` bytes.
    pub fn new(len: u64) -> Self {
        Self {
            magic: CHUNK_START_MAGIC,
            len,
        }
    }

    /// Whether the start magic validates.
    pub fn is_valid(&self) -> bool {
        self.magic == CHUNK_START_MAGIC
    }

    /// Writes the head into exactly [`FRAME_HEAD_SIZE`] bytes.
    pub fn write_into(&self, out: &mut [u8]) {
        debug_assert_eq!(out.len(), FRAME_HEAD_SIZE);
        out[..4].copy_from_slice(&self.magic);
        out[4..12].copy_from_slice(&self.len.to_le_bytes());
    }
}

impl FrameFoot {
    /// Foot for a payload of `len` bytes tagged with `marker`.
    pub fn new(len: u64, marker: u64) -> Self {
        Self {
            magic: CHUNK_END_MAGIC,
            len,
            marker,
        }
    }

    /// Whether the end magic validates and the repeated length matches.
    pub fn confirms(&self, head: &FrameHead) -> bool {
        self.magic == CHUNK_END_MAGIC && self.len == head.len
    }
}

impl encoding::Encode for FrameHead {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.magic, buf)?;
        encoding::Encode::encode_to(&self.len, buf)?;
        Ok(())
    }
}

impl encoding::Decode for FrameHead {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (len, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { magic, len }, off))
    }
}

impl encoding::Encode for FrameFoot {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::Encode::encode_to(&self.len, buf)?;
        encoding::Encode::encode_to(&self.marker, buf)?;
        encoding::Encode::encode_to(&self.magic, buf)?;
        Ok(())
    }
}

impl encoding::Decode for FrameFoot {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (len, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (marker, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        Ok((Self { len, marker, magic }, off))
    }
}

/// Total on-disk size of a frame carrying `payload_len` bytes.
///
/// Saturates at `u64::MAX` for lengths read from damaged frames.
#[inline]
pub fn frame_len(payload_len: u64) -> u64 {
    payload_len.saturating_add(FRAME_OVERHEAD as u64)
}

/// Appends a complete frame for `payload` tagged with `marker` to `buf`.
pub fn encode_frame(payload: &[u8], marker: u64, buf: &mut Vec<u8>) -> Result<(), FrameError> {
    let len = payload.len() as u64;
    buf.reserve(payload.len() + FRAME_OVERHEAD);
    encoding::Encode::encode_to(&FrameHead::new(len), buf)?;
    buf.extend_from_slice(payload);
    encoding::Encode::encode_to(&FrameFoot::new(len, marker), buf)?;
    Ok(())
}

/// A frame located inside a larger buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Marker recorded in the foot.
    pub marker: u64,

    /// Payload range, relative to the start of the decoded slice.
    pub payload: Range<usize>,

    /// Total frame length.
    pub frame_len: usize,
}

/// Decodes and validates the frame at the start of `buf`.
///
/// `base_offset` is only used to report positions in errors.
pub fn decode_frame(buf: &[u8], base_offset: u64) -> Result<DecodedFrame, FrameError> {
    if buf.len() < FRAME_HEAD_SIZE {
        return Err(FrameError::Truncated {
            needed: FRAME_HEAD_SIZE as u64,
            available: buf.len() as u64,
        });
    }

    let (head, _) = encoding::decode_from_slice::<FrameHead>(buf)?;
    if !head.is_valid() {
        return Err(FrameError::BadStartMagic(base_offset));
    }

    let available = buf.len() as u64;
    let total = match head.len.checked_add(FRAME_OVERHEAD as u64) {
        Some(total) if total <= available => total,
        needed => {
            return Err(FrameError::Truncated {
                needed: needed.unwrap_or(u64::MAX),
                available,
            });
        }
    };

    let payload_end = FRAME_HEAD_SIZE + head.len as usize;
    let (foot, _) = encoding::decode_from_slice::<FrameFoot>(&buf[payload_end..])?;
    if foot.magic != CHUNK_END_MAGIC {
        return Err(FrameError::BadEndMagic(base_offset + payload_end as u64));
    }
    if foot.len != head.len {
        return Err(FrameError::LengthMismatch {
            head: head.len,
            foot: foot.len,
        });
    }

    Ok(DecodedFrame {
        marker: foot.marker,
        payload: FRAME_HEAD_SIZE..payload_end,
        frame_len: total as usize,
    })
}

// ------------------------------------------------------------------------------------------------
// ChunkBuffer: padded write buffer
// ------------------------------------------------------------------------------------------------

/// Payload buffer with reserved room for the frame head and foot.
///
/// A payload built directly inside a `ChunkBuffer` can be framed in place
/// and written with a single I/O call. The framed bytes are identical to
/// what [`encode_frame`] produces for the same payload and marker.
#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    /// `[head room][payload][foot, once framed]`.
    buf: Vec<u8>,

    /// Length of the payload currently held.
    payload_len: usize,
}

impl ChunkBuffer {
    /// Creates an empty buffer able to hold `payload_capacity` bytes
    /// without reallocating, frame included.
    pub fn with_capacity(payload_capacity: usize) -> Self {
        let mut buf = Vec::with_capacity(payload_capacity + FRAME_OVERHEAD);
        buf.resize(FRAME_HEAD_SIZE, 0);
        Self {
            buf,
            payload_len: 0,
        }
    }

    /// Creates a buffer holding a copy of `payload`.
    pub fn from_payload(payload: &[u8]) -> Self {
        let mut chunk = Self::with_capacity(payload.len());
        chunk.extend_from_slice(payload);
        chunk
    }

    /// Appends bytes to the payload.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.unframe();
        self.buf.extend_from_slice(data);
        self.payload_len += data.len();
    }

    /// Current payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.buf[FRAME_HEAD_SIZE..FRAME_HEAD_SIZE + self.payload_len]
    }

    /// Mutable view of the current payload bytes.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.unframe();
        &mut self.buf[FRAME_HEAD_SIZE..FRAME_HEAD_SIZE + self.payload_len]
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload_len
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload_len == 0
    }

    /// Drops the payload, keeping the allocation.
    pub fn clear(&mut self) {
        self.buf.truncate(FRAME_HEAD_SIZE);
        self.payload_len = 0;
    }

    /// Fills head and foot around the payload and returns the whole frame.
    pub(crate) fn frame(&mut self, marker: u64) -> &[u8] {
        self.unframe();
        let len = self.payload_len as u64;
        FrameHead::new(len).write_into(&mut self.buf[..FRAME_HEAD_SIZE]);
        let foot = FrameFoot::new(len, marker);
        self.buf.extend_from_slice(&foot.len.to_le_bytes());
        self.buf.extend_from_slice(&foot.marker.to_le_bytes());
        self.buf.extend_from_slice(&foot.magic);
        &self.buf
    }

    /// Removes a previously written foot so the payload can grow again.
    fn unframe(&mut self) {
        self.buf.truncate(FRAME_HEAD_SIZE + self.payload_len);
    }
}

// ------------------------------------------------------------------------------------------------
// Jump list / trailer
// ------------------------------------------------------------------------------------------------

/// Ordered chunk start offsets of one segment.
///
/// Built incrementally while writing (or while scanning during recovery)
/// and persisted once, in the trailer, when the segment is sealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JumpList {
    offsets: Vec<u64>,
}

/// Size information recovered from the last bytes of a sealed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerLayout {
    /// Number of jump-list entries.
    pub count: usize,

    /// Total trailer length, from `"!ctl"` to `"+jmp"` inclusive.
    pub len: usize,
}

impl JumpList {
    /// Creates an empty jump list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a jump list from known offsets.
    pub fn from_offsets(offsets: Vec<u64>) -> Self {
        Self { offsets }
    }

    /// Records the start offset of the next chunk.
    pub fn push(&mut self, offset: u64) {
        debug_assert!(self.offsets.last().is_none_or(|last| *last < offset));
        self.offsets.push(offset);
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// Whether no chunk has been recorded.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Chunk start offsets in write order.
    pub fn offsets(&self) -> &[u64] {
        &self.offsets
    }

    /// Consumes the list, returning the offsets.
    pub fn into_offsets(self) -> Vec<u64> {
        self.offsets
    }

    /// Encoded trailer size for `count` entries.
    pub fn trailer_len(count: usize, format: TrailerFormat) -> usize {
        let count_width = if count <= MAX_SHORT_COUNT { 2 } else { 6 };
        4 + count * format.entry_width() + count_width + 4
    }

    /// Appends the trailer (`"!ctl"` .. `"+jmp"`) to `buf`.
    pub fn encode_trailer(&self, format: TrailerFormat, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        buf.reserve(Self::trailer_len(self.offsets.len(), format));
        encoding::Encode::encode_to(&CLOSE_MAGIC, buf)?;

        match format {
            TrailerFormat::Legacy => {
                for offset in &self.offsets {
                    encoding::Encode::encode_to(offset, buf)?;
                }
            }
            TrailerFormat::Compact => {
                let mut prev = SEGMENT_HEADER_SIZE as u64;
                for offset in &self.offsets {
                    let delta = offset
                        .checked_sub(prev)
                        .ok_or_else(|| FrameError::BadTrailer("offsets not increasing".into()))?;
                    let delta = u32::try_from(delta).map_err(|_| FrameError::DeltaOverflow(delta))?;
                    encoding::Encode::encode_to(&delta, buf)?;
                    prev = *offset;
                }
            }
        }

        let count = self.offsets.len();
        if count <= MAX_SHORT_COUNT {
            encoding::Encode::encode_to(&(count as u16), buf)?;
        } else {
            let wide = u32::try_from(count)
                .map_err(|_| FrameError::BadTrailer(format!("{count} entries exceed u32")))?;
            encoding::Encode::encode_to(&wide, buf)?;
            encoding::Encode::encode_to(&COUNT_SENTINEL, buf)?;
        }

        encoding::Encode::encode_to(&JUMP_MAGIC, buf)?;
        Ok(())
    }

    /// Reads the trailer size from the final bytes of a segment.
    ///
    /// `tail` must end where the file ends and hold at least the count
    /// field and closing magic (up to [`TRAILER_TAIL_MAX`] bytes).
    pub fn layout_from_tail(tail: &[u8], format: TrailerFormat) -> Result<TrailerLayout, FrameError> {
        if tail.len() < 6 {
            return Err(FrameError::Truncated {
                needed: 6,
                available: tail.len() as u64,
            });
        }
        let end = tail.len();
        if tail[end - 4..] != JUMP_MAGIC {
            return Err(FrameError::BadTrailer("missing closing jump magic".into()));
        }

        let (short, _) = encoding::decode_from_slice::<u16>(&tail[end - 6..end - 4])?;
        let count = if short == COUNT_SENTINEL {
            if tail.len() < TRAILER_TAIL_MAX {
                return Err(FrameError::Truncated {
                    needed: TRAILER_TAIL_MAX as u64,
                    available: tail.len() as u64,
                });
            }
            let (wide, _) = encoding::decode_from_slice::<u32>(&tail[end - 10..end - 6])?;
            if (wide as usize) <= MAX_SHORT_COUNT {
                return Err(FrameError::BadTrailer(format!(
                    "widened count {wide} fits the short field"
                )));
            }
            wide as usize
        } else if short as usize > MAX_SHORT_COUNT {
            return Err(FrameError::BadTrailer(format!("invalid short count {short}")));
        } else {
            short as usize
        };

        Ok(TrailerLayout {
            count,
            len: Self::trailer_len(count, format),
        })
    }

    /// Decodes a complete trailer (`"!ctl"` .. `"+jmp"`, nothing more).
    pub fn decode_trailer(bytes: &[u8], format: TrailerFormat) -> Result<Self, FrameError> {
        if bytes.len() < TRAILER_MIN_SIZE {
            return Err(FrameError::Truncated {
                needed: TRAILER_MIN_SIZE as u64,
                available: bytes.len() as u64,
            });
        }
        if bytes[..4] != CLOSE_MAGIC {
            return Err(FrameError::BadTrailer("missing close magic".into()));
        }

        let layout = Self::layout_from_tail(bytes, format)?;
        if layout.len != bytes.len() {
            return Err(FrameError::BadTrailer(format!(
                "trailer is {} bytes, count {} implies {}",
                bytes.len(),
                layout.count,
                layout.len
            )));
        }

        let width = format.entry_width();
        let mut offsets = Vec::with_capacity(layout.count);
        let mut off = 4;
        let mut prev = SEGMENT_HEADER_SIZE as u64;
        for i in 0..layout.count {
            let offset = match format {
                TrailerFormat::Legacy => {
                    let (offset, _) = encoding::decode_from_slice::<u64>(&bytes[off..])?;
                    offset
                }
                TrailerFormat::Compact => {
                    let (delta, _) = encoding::decode_from_slice::<u32>(&bytes[off..])?;
                    prev + delta as u64
                }
            };
            if i == 0 && offset != SEGMENT_HEADER_SIZE as u64 {
                return Err(FrameError::BadTrailer(format!(
                    "first chunk offset {offset} is not the end of the header"
                )));
            }
            if i > 0 && offset <= prev {
                return Err(FrameError::BadTrailer("offsets not increasing".into()));
            }
            offsets.push(offset);
            prev = offset;
            off += width;
        }

        Ok(Self { offsets })
    }
}
