//! Whole-file strategy: one read, eager split.

use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use super::{Cursor, Direction, Readback, ReadbackError, SeekPosition, read_header};
use crate::chunk::{Arena, Chunk};
use crate::frame::{FrameError, SegmentHeader, StreamId, decode_frame};
use crate::scan::{IntegrityScanner, ScanMode};
use crate::segment::locate_trailer;
use crate::source::ByteSource;

#[derive(Debug, Clone)]
struct Slot {
    marker: u64,
    payload: Range<usize>,
}

/// Segment read into memory in one go and split into chunks up front.
///
/// Every chunk handed out shares the single allocation holding the file.
#[derive(Debug)]
pub struct WholeFileReadback {
    header: SegmentHeader,
    arena: Arc<Arena>,
    slots: Vec<Slot>,
    sealed: bool,
    cursor: Cursor,
}

impl WholeFileReadback {
    /// Reads the segment at `path`.
    pub fn open(path: &Path, expected_stream: Option<&StreamId>) -> Result<Self, ReadbackError> {
        let file = File::open(path)?;
        let header = read_header(&file, expected_stream)?;
        Self::from_file(file, header)
    }

    pub(crate) fn from_file(file: File, header: SegmentHeader) -> Result<Self, ReadbackError> {
        let len = usize::try_from(file.byte_len()?)
            .map_err(|_| ReadbackError::Unsupported("segment larger than address space"))?;
        let mut bytes = vec![0u8; len];
        file.read_exact_at(&mut bytes, 0)?;
        Self::from_bytes(bytes.into_boxed_slice(), header)
    }

    fn from_bytes(bytes: Box<[u8]>, header: SegmentHeader) -> Result<Self, ReadbackError> {
        let len = bytes.len() as u64;
        let (offsets, data_end, sealed) =
            match locate_trailer(&bytes[..], header.trailer_format(), len)? {
                Some(layout) => (layout.jump_list.into_offsets(), layout.trailer_offset, true),
                None => {
                    let report =
                        IntegrityScanner::with_header(&bytes[..], header.clone(), len, ScanMode::Boundaries)
                            .run()?;
                    let sealed = report.is_sealed();
                    let end = report.termination.valid_end();
                    (report.jump_list.into_offsets(), end, sealed)
                }
            };

        let mut slots = Vec::with_capacity(offsets.len());
        for (i, &start) in offsets.iter().enumerate() {
            let end = offsets.get(i + 1).copied().unwrap_or(data_end);
            let (start, end) = (start as usize, end as usize);
            if end > bytes.len() || start >= end {
                return Err(FrameError::OutOfBounds(format!(
                    "frame {start}..{end} outside segment of {} bytes",
                    bytes.len()
                ))
                .into());
            }
            let frame = decode_frame(&bytes[start..end], start as u64)?;
            if frame.frame_len != end - start {
                return Err(FrameError::BadTrailer(format!(
                    "frame at {start} is {} bytes, jump list implies {}",
                    frame.frame_len,
                    end - start
                ))
                .into());
            }
            slots.push(Slot {
                marker: frame.marker,
                payload: start + frame.payload.start..start + frame.payload.end,
            });
        }

        Ok(Self {
            header,
            arena: Arc::new(Arena::Heap(bytes)),
            slots,
            sealed,
            cursor: Cursor::default(),
        })
    }

    /// Header of the segment.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the segment holds no chunk.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn chunk(&self, pos: usize) -> Result<Chunk, ReadbackError> {
        let slot = &self.slots[pos];
        Ok(Chunk::from_arena(&self.arena, slot.payload.clone(), slot.marker)?)
    }

    fn ceiling(&self, marker: u64) -> usize {
        self.slots.partition_point(|s| s.marker < marker)
    }
}

impl Readback for WholeFileReadback {
    fn iterate(&mut self, direction: Direction) -> Result<Option<Chunk>, ReadbackError> {
        let Some(pos) = self.cursor.peek(direction, self.slots.len()) else {
            return Ok(None);
        };
        let chunk = self.chunk(pos)?;
        self.cursor.step(direction);
        Ok(Some(chunk))
    }

    fn has_more(&mut self, direction: Direction) -> Result<bool, ReadbackError> {
        Ok(self.cursor.peek(direction, self.slots.len()).is_some())
    }

    fn is_consistent(&self) -> bool {
        self.sealed
    }

    fn size(&self) -> u64 {
        self.arena.len() as u64
    }

    fn scan(&mut self, marker: u64) -> Result<Option<Chunk>, ReadbackError> {
        let pos = self.ceiling(marker);
        if pos == self.slots.len() {
            self.cursor.set(pos);
            return Ok(None);
        }
        let chunk = self.chunk(pos)?;
        self.cursor.set(pos + 1);
        Ok(Some(chunk))
    }

    fn seek(&mut self, position: SeekPosition) -> Result<(), ReadbackError> {
        match position {
            SeekPosition::Start => self.cursor.set(0),
            SeekPosition::End => self.cursor.set(self.slots.len()),
        }
        Ok(())
    }

    fn seek_marker(&mut self, marker: u64) -> Result<bool, ReadbackError> {
        let pos = self.ceiling(marker);
        self.cursor.set(pos);
        Ok(pos < self.slots.len())
    }
}
