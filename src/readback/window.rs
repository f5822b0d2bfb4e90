//! Window strategy: one frame materialized at a time.

use std::fs::File;
use std::path::Path;

use tracing::debug;

use super::{
    Cursor, Direction, Growth, Readback, ReadbackError, SeekPosition, build_index, extend_index,
    read_header,
};
use crate::chunk::Chunk;
use crate::frame::{DecodedFrame, FrameError, SegmentHeader, StreamId, decode_frame};
use crate::index::MarkerIndex;
use crate::pool::BufferPool;
use crate::source::ByteSource;

/// Streaming reader for segments too large to hold in memory.
///
/// Only the frame being returned is read. Its buffer is borrowed from the
/// pool when one is configured and has room, and allocated directly
/// otherwise.
#[derive(Debug)]
pub struct WindowReadback {
    file: File,
    header: SegmentHeader,
    index: MarkerIndex,
    sealed: bool,
    file_len: u64,
    cursor: Cursor,
    pool: Option<BufferPool>,
}

impl WindowReadback {
    /// Opens the segment at `path`.
    pub fn open(
        path: &Path,
        expected_stream: Option<&StreamId>,
        pool: Option<BufferPool>,
    ) -> Result<Self, ReadbackError> {
        let file = File::open(path)?;
        let header = read_header(&file, expected_stream)?;
        Self::from_file(file, header, pool)
    }

    pub(crate) fn from_file(
        file: File,
        header: SegmentHeader,
        pool: Option<BufferPool>,
    ) -> Result<Self, ReadbackError> {
        let file_len = file.byte_len()?;
        let (index, sealed) = build_index(&file, &header, file_len)?;
        Ok(Self {
            file,
            header,
            index,
            sealed,
            file_len,
            cursor: Cursor::default(),
            pool,
        })
    }

    /// Header of the segment.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Number of chunks currently known.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no chunk is known yet.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Picks up frames appended since the last look.
    pub fn refresh(&mut self) -> Result<Growth, ReadbackError> {
        if self.sealed {
            return Ok(Growth::default());
        }
        self.file_len = self.file.byte_len()?;
        let growth = extend_index(&self.file, &self.header, &mut self.index, self.file_len)?;
        if growth.sealed {
            debug!(
                "Segment {} sealed while being read",
                self.header.segment_number
            );
            self.sealed = true;
        }
        Ok(growth)
    }

    fn chunk(&self, pos: usize) -> Result<Chunk, ReadbackError> {
        let (start, end) = self.index.frame_range(pos)?;
        let len = usize::try_from(end - start)
            .map_err(|_| ReadbackError::Unsupported("frame larger than address space"))?;

        let pooled = self.pool.as_ref().and_then(|pool| pool.acquire(len));
        match pooled {
            Some(mut buf) => {
                buf.resize(len, 0);
                self.file.read_exact_at(&mut buf, start)?;
                let frame = Self::check(&buf, start, len)?;
                Ok(Chunk::from_pooled(buf, frame.payload, frame.marker)?)
            }
            None => {
                if self.pool.is_some() {
                    debug!("Buffer pool unavailable for {} bytes; allocating", len);
                }
                let mut buf = vec![0u8; len];
                self.file.read_exact_at(&mut buf, start)?;
                let frame = Self::check(&buf, start, len)?;
                Ok(Chunk::from_vec(buf, frame.payload, frame.marker)?)
            }
        }
    }

    fn check(buf: &[u8], start: u64, len: usize) -> Result<DecodedFrame, ReadbackError> {
        let frame = decode_frame(buf, start)?;
        if frame.frame_len != len {
            return Err(FrameError::BadTrailer(format!(
                "frame at {start} is {} bytes, index implies {len}",
                frame.frame_len
            ))
            .into());
        }
        Ok(frame)
    }

    fn ceiling(&mut self, marker: u64) -> Result<Option<usize>, ReadbackError> {
        if let Some(pos) = self.index.ceiling(marker, &self.file)? {
            return Ok(Some(pos));
        }
        if self.sealed || self.refresh()?.added == 0 {
            return Ok(None);
        }
        Ok(self.index.ceiling(marker, &self.file)?)
    }
}

impl Readback for WindowReadback {
    fn iterate(&mut self, direction: Direction) -> Result<Option<Chunk>, ReadbackError> {
        if !self.has_more(direction)? {
            return Ok(None);
        }
        let Some(pos) = self.cursor.peek(direction, self.index.len()) else {
            return Ok(None);
        };
        let chunk = self.chunk(pos)?;
        self.cursor.step(direction);
        Ok(Some(chunk))
    }

    fn has_more(&mut self, direction: Direction) -> Result<bool, ReadbackError> {
        if self.cursor.peek(direction, self.index.len()).is_some() {
            return Ok(true);
        }
        if direction == Direction::Forward && !self.sealed {
            self.refresh()?;
            return Ok(self.cursor.peek(direction, self.index.len()).is_some());
        }
        Ok(false)
    }

    fn is_consistent(&self) -> bool {
        self.sealed
    }

    fn size(&self) -> u64 {
        self.file_len
    }

    fn scan(&mut self, marker: u64) -> Result<Option<Chunk>, ReadbackError> {
        match self.ceiling(marker)? {
            Some(pos) => {
                let chunk = self.chunk(pos)?;
                self.cursor.set(pos + 1);
                Ok(Some(chunk))
            }
            None => {
                self.cursor.set(self.index.len());
                Ok(None)
            }
        }
    }

    fn seek(&mut self, position: SeekPosition) -> Result<(), ReadbackError> {
        match position {
            SeekPosition::Start => self.cursor.set(0),
            SeekPosition::End => {
                self.refresh()?;
                self.cursor.set(self.index.len());
            }
        }
        Ok(())
    }

    fn seek_marker(&mut self, marker: u64) -> Result<bool, ReadbackError> {
        match self.ceiling(marker)? {
            Some(pos) => {
                self.cursor.set(pos);
                Ok(true)
            }
            None => {
                self.cursor.set(self.index.len());
                Ok(false)
            }
        }
    }
}
