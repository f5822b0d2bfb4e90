//! Mapped strategy: the segment as one addressable region.
//!
//! A [`MappedSegment`] is shareable: every method takes `&self`, so one
//! instance can serve random-access lookups from many threads while a
//! [`MappedReadback`] walks it with its own cursor.
//!
//! A segment that was sealed when mapped is immutable and is read without
//! any synchronization. A segment that was still being written keeps its map
//! and index behind a `ShardedLock`; lookups that run past the known end
//! take the write side, remap the grown file and extend the index.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::sync::ShardedLock;
use memmap2::Mmap;
use tracing::{debug, trace};

use super::{
    Cursor, Direction, Growth, Readback, ReadbackError, SeekPosition, build_index, extend_index,
    read_header,
};
use crate::chunk::{Arena, Chunk, check_bounds};
use crate::frame::{FrameError, SegmentHeader, StreamId, decode_frame};
use crate::index::MarkerIndex;
use crate::source::ByteSource;

/// Longest pause between polls in [`MappedSegment::scan_wait`].
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// Views
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct View {
    arena: Arc<Arena>,
    index: MarkerIndex,
}

impl View {
    fn chunk(&self, pos: usize) -> Result<Chunk, ReadbackError> {
        let (start, end) = self.index.frame_range(pos)?;
        let range = start as usize..end as usize;
        check_bounds(&range, self.arena.len())?;

        let frame = decode_frame(&self.arena[range.clone()], start)?;
        if frame.frame_len != range.len() {
            return Err(FrameError::BadTrailer(format!(
                "frame at {start} is {} bytes, index implies {}",
                frame.frame_len,
                range.len()
            ))
            .into());
        }
        let payload = range.start + frame.payload.start..range.start + frame.payload.end;
        Ok(Chunk::from_arena(&self.arena, payload, frame.marker)?)
    }

    fn ceiling(&self, marker: u64) -> Result<Option<usize>, ReadbackError> {
        Ok(self.index.ceiling(marker, &**self.arena)?)
    }

    fn marker(&self, pos: usize) -> Result<u64, ReadbackError> {
        Ok(self.index.marker(pos, &**self.arena)?)
    }
}

#[derive(Debug)]
struct LiveView {
    view: View,
    sealed: bool,
}

#[derive(Debug)]
enum MappedState {
    /// Sealed when mapped; never changes.
    Sealed(View),

    /// Still growing when mapped.
    Live(ShardedLock<LiveView>),
}

// ------------------------------------------------------------------------------------------------
// MappedSegment
// ------------------------------------------------------------------------------------------------

/// Memory-mapped segment plus marker index, shareable across threads.
#[derive(Debug)]
pub struct MappedSegment {
    path: PathBuf,
    file: File,
    header: SegmentHeader,
    state: MappedState,
}

impl MappedSegment {
    /// Maps the segment at `path`.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }`. This is sound because bytes already
    /// written to a segment are never modified while it is in use: the
    /// single writer only appends past the mapped length, and truncation
    /// happens during recovery, before any reader exists.
    pub fn open(path: &Path, expected_stream: Option<&StreamId>) -> Result<Self, ReadbackError> {
        let file = File::open(path)?;
        let header = read_header(&file, expected_stream)?;
        Self::from_file(path, file, header)
    }

    pub(crate) fn from_file(
        path: &Path,
        file: File,
        header: SegmentHeader,
    ) -> Result<Self, ReadbackError> {
        let map = unsafe { Mmap::map(&file)? };
        let len = map.len() as u64;
        let arena = Arc::new(Arena::Mapped(map));
        let (index, sealed) = build_index(&**arena, &header, len)?;

        debug!(
            "Mapped segment {} ({} bytes, {} chunks, sealed={})",
            path.display(),
            len,
            index.len(),
            sealed
        );

        let view = View { arena, index };
        let state = if sealed {
            MappedState::Sealed(view)
        } else {
            MappedState::Live(ShardedLock::new(LiveView { view, sealed }))
        };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            state,
        })
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header of the segment.
    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Segment number.
    pub fn number(&self) -> u32 {
        self.header.segment_number
    }

    /// Whether a trailer matching the frames has been observed.
    pub fn is_sealed(&self) -> Result<bool, ReadbackError> {
        self.with_view(|_, sealed| Ok(sealed))
    }

    /// Whether the segment was still growing when it was mapped.
    pub fn is_live(&self) -> bool {
        matches!(self.state, MappedState::Live(_))
    }

    /// Number of chunks currently indexed.
    pub fn len(&self) -> Result<usize, ReadbackError> {
        self.with_view(|view, _| Ok(view.index.len()))
    }

    /// Whether no chunk is indexed yet.
    pub fn is_empty(&self) -> Result<bool, ReadbackError> {
        Ok(self.len()? == 0)
    }

    /// Mapped length in bytes.
    pub fn size(&self) -> u64 {
        self.with_view(|view, _| Ok(view.arena.len() as u64))
            .unwrap_or_default()
    }

    /// Marker of the first indexed chunk.
    pub fn first_marker(&self) -> Result<Option<u64>, ReadbackError> {
        self.with_view(|view, _| match view.index.len() {
            0 => Ok(None),
            _ => view.marker(0).map(Some),
        })
    }

    /// Marker of the last indexed chunk.
    pub fn last_marker(&self) -> Result<Option<u64>, ReadbackError> {
        self.with_view(|view, _| match view.index.len() {
            0 => Ok(None),
            n => view.marker(n - 1).map(Some),
        })
    }

    /// Chunk at index position `pos`.
    pub fn chunk_at(&self, pos: usize) -> Result<Option<Chunk>, ReadbackError> {
        self.with_view(|view, _| {
            if pos < view.index.len() {
                view.chunk(pos).map(Some)
            } else {
                Ok(None)
            }
        })
    }

    /// Picks up frames appended since the file was last mapped.
    pub fn refresh(&self) -> Result<Growth, ReadbackError> {
        let MappedState::Live(lock) = &self.state else {
            return Ok(Growth::default());
        };
        let mut live = lock
            .write()
            .map_err(|_| ReadbackError::Internal("mapped segment lock poisoned".into()))?;
        if live.sealed {
            return Ok(Growth::default());
        }

        let file_len = self.file.byte_len()?;
        if file_len > live.view.arena.len() as u64 {
            let map = unsafe { Mmap::map(&self.file)? };
            live.view.arena = Arc::new(Arena::Mapped(map));
            trace!(segment = self.header.segment_number, file_len, "remapped");
        }

        let LiveView { view, sealed } = &mut *live;
        let len = view.arena.len() as u64;
        let growth = extend_index(&**view.arena, &self.header, &mut view.index, len)?;
        if growth.sealed {
            debug!("Segment {} sealed while mapped", self.path.display());
            *sealed = true;
        }
        Ok(growth)
    }

    /// Position of the least marker `>= marker`, refreshing a live segment
    /// once before giving up.
    pub fn position_of(&self, marker: u64) -> Result<Option<usize>, ReadbackError> {
        let (found, sealed) = self.with_view(|view, sealed| Ok((view.ceiling(marker)?, sealed)))?;
        if found.is_some() || sealed {
            return Ok(found);
        }
        if self.refresh()?.added == 0 {
            return Ok(None);
        }
        self.with_view(|view, _| view.ceiling(marker))
    }

    /// Chunk with the least marker `>= marker`.
    pub fn lookup(&self, marker: u64) -> Result<Option<Chunk>, ReadbackError> {
        match self.position_of(marker)? {
            Some(pos) => self.chunk_at(pos),
            None => Ok(None),
        }
    }

    /// Like [`lookup`](MappedSegment::lookup), but on a growing segment
    /// polls until the marker arrives, the segment is sealed, or `timeout`
    /// elapses.
    pub fn scan_wait(&self, marker: u64, timeout: Duration) -> Result<Option<Chunk>, ReadbackError> {
        let deadline = Instant::now() + timeout;
        let mut pause = Duration::from_micros(100);
        loop {
            if let Some(chunk) = self.lookup(marker)? {
                return Ok(Some(chunk));
            }
            if self.is_sealed()? {
                return Ok(None);
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(marker, "scan_wait timed out");
                return Ok(None);
            }
            std::thread::sleep(pause.min(deadline - now));
            pause = (pause * 2).min(MAX_POLL_INTERVAL);
        }
    }

    fn with_view<R>(
        &self,
        f: impl FnOnce(&View, bool) -> Result<R, ReadbackError>,
    ) -> Result<R, ReadbackError> {
        match &self.state {
            MappedState::Sealed(view) => f(view, true),
            MappedState::Live(lock) => {
                let live = lock
                    .read()
                    .map_err(|_| ReadbackError::Internal("mapped segment lock poisoned".into()))?;
                f(&live.view, live.sealed)
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MappedReadback
// ------------------------------------------------------------------------------------------------

/// Cursor over a shared [`MappedSegment`].
#[derive(Debug)]
pub struct MappedReadback {
    segment: Arc<MappedSegment>,
    cursor: Cursor,
}

impl MappedReadback {
    /// Cursor at the start of `segment`.
    pub fn new(segment: Arc<MappedSegment>) -> Self {
        Self {
            segment,
            cursor: Cursor::default(),
        }
    }

    /// Maps the segment at `path`.
    pub fn open(path: &Path, expected_stream: Option<&StreamId>) -> Result<Self, ReadbackError> {
        Ok(Self::new(Arc::new(MappedSegment::open(path, expected_stream)?)))
    }

    /// The shared segment behind this cursor.
    pub fn segment(&self) -> &Arc<MappedSegment> {
        &self.segment
    }
}

impl Readback for MappedReadback {
    fn iterate(&mut self, direction: Direction) -> Result<Option<Chunk>, ReadbackError> {
        if !self.has_more(direction)? {
            return Ok(None);
        }
        let len = self.segment.len()?;
        let Some(pos) = self.cursor.peek(direction, len) else {
            return Ok(None);
        };
        let chunk = self.segment.chunk_at(pos)?;
        if chunk.is_some() {
            self.cursor.step(direction);
        }
        Ok(chunk)
    }

    fn has_more(&mut self, direction: Direction) -> Result<bool, ReadbackError> {
        if self.cursor.peek(direction, self.segment.len()?).is_some() {
            return Ok(true);
        }
        if direction == Direction::Forward && !self.segment.is_sealed()? {
            self.segment.refresh()?;
            return Ok(self.cursor.peek(direction, self.segment.len()?).is_some());
        }
        Ok(false)
    }

    fn is_consistent(&self) -> bool {
        self.segment.is_sealed().unwrap_or(false)
    }

    fn size(&self) -> u64 {
        self.segment.size()
    }

    fn scan(&mut self, marker: u64) -> Result<Option<Chunk>, ReadbackError> {
        match self.segment.position_of(marker)? {
            Some(pos) => {
                let chunk = self.segment.chunk_at(pos)?;
                self.cursor.set(pos + 1);
                Ok(chunk)
            }
            None => {
                self.cursor.set(self.segment.len()?);
                Ok(None)
            }
        }
    }

    fn seek(&mut self, position: SeekPosition) -> Result<(), ReadbackError> {
        match position {
            SeekPosition::Start => self.cursor.set(0),
            SeekPosition::End => {
                self.segment.refresh()?;
                self.cursor.set(self.segment.len()?);
            }
        }
        Ok(())
    }

    fn seek_marker(&mut self, marker: u64) -> Result<bool, ReadbackError> {
        match self.segment.position_of(marker)? {
            Some(pos) => {
                self.cursor.set(pos);
                Ok(true)
            }
            None => {
                self.cursor.set(self.segment.len()?);
                Ok(false)
            }
        }
    }
}
