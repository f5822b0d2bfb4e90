//! # Stream
//!
//! A stream is a directory of segments holding one contiguous, strictly
//! increasing range of markers:
//!
//! ```text
//! <dir>/
//!   LOCK                 single-writer lock, held while a Stream is open
//!   BACKUP.lock          held by backup tooling; trimming defers to it
//!   000000000001.flf     oldest retained segment
//!   000000000002.flf
//!   000000000003.flf     write head (unsealed while the stream is open)
//! ```
//!
//! ## Heads
//!
//! - The **write head** appends to the newest segment and rotates once the
//!   segment reaches [`StreamConfig::segment_size`]: the outgoing segment is
//!   sealed, and the next append creates a new one whose base marker is the
//!   previous maximum plus one.
//! - The **read head** walks chunks in either direction across segment
//!   boundaries. It opens one segment at a time with the strategy chosen by
//!   [`ReadbackStrategy::open`] and sees the write head's segment grow.
//! - A [`MarkerReader`] answers ceiling lookups by marker, independently of
//!   both heads and concurrently with the writer.
//!
//! ## Concurrency Model
//!
//! The catalog of segments sits behind an `Arc<RwLock<_>>` shared with
//! marker readers. Each head has its own `Mutex`, so reading never waits
//! for an append beyond the short catalog update that follows it.
//!
//! ## Recovery
//!
//! [`Stream::open`] rebuilds the catalog from the directory. Segments left
//! unsealed by a crash are integrity-scanned, cut at the last good frame and
//! sealed, so the stream reports the true maximum marker as if the trailer
//! had been written.

mod catalog;
mod reader;

#[cfg(test)]
mod tests;

pub use catalog::QUARANTINE_SUFFIX;
pub use reader::MarkerReader;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::StreamConfig;
use crate::chunk::Chunk;
use crate::frame::{ChunkBuffer, StreamId};
use crate::pool::BufferPool;
use crate::readback::{
    Direction, Readback, ReadbackError, ReadbackOptions, ReadbackStrategy, SeekPosition,
};
use crate::segment::{SegmentError, SegmentInfo, SegmentOptions, SegmentWriter, fsync_dir};
use catalog::{Catalog, SegmentEntry};

/// Name of the single-writer lock file.
pub const LOCK_FILE: &str = "LOCK";

/// Name of the lock file held while a backup is in progress.
pub const BACKUP_LOCK_FILE: &str = "BACKUP.lock";

/// Longest pause between attempts to take the backup lock in
/// [`Stream::clean`].
const MAX_BACKUP_POLL: Duration = Duration::from_millis(10);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by [`Stream`] operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from a segment writer or probe.
    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    /// Error from a readback strategy.
    #[error("Readback error: {0}")]
    Readback(#[from] ReadbackError),

    /// A segment belongs to another stream.
    #[error("segment {path} belongs to another stream")]
    StreamIdentityMismatch {
        /// Offending segment.
        path: PathBuf,
        /// Identity of this stream.
        expected: StreamId,
        /// Identity found in the segment header.
        found: StreamId,
    },

    /// Segment numbers have a gap.
    #[error("segment numbers not contiguous: expected {expected}, found {found}")]
    NonContiguous {
        /// Number that should have come next.
        expected: u32,
        /// Number actually found.
        found: u32,
    },

    /// Another writer holds the stream directory or the backup lock.
    #[error("{0} is locked")]
    Locked(PathBuf),

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Marker does not exceed the last one written.
    #[error("marker {marker} does not exceed last marker {last}")]
    NonMonotonicMarker {
        /// Highest marker in the stream.
        last: u64,
        /// Rejected marker.
        marker: u64,
    },

    /// The stream has been closed.
    #[error("stream is closed")]
    Closed,

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Public result types
// ------------------------------------------------------------------------------------------------

/// Result of [`Stream::clean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanOutcome {
    /// This many segments were deleted (possibly none).
    Trimmed(usize),

    /// A backup holds the backup lock, or a candidate failed the on-disk
    /// re-check; try again later.
    Deferred,
}

/// Snapshot of stream statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamStats {
    /// Identity shared by all segments.
    pub stream_id: StreamId,

    /// Number of segment files.
    pub segments: usize,

    /// Oldest segment number.
    pub first_segment: Option<u32>,

    /// Newest segment number.
    pub last_segment: Option<u32>,

    /// Smallest marker retained.
    pub min_marker: Option<u64>,

    /// Largest marker written.
    pub max_marker: Option<u64>,

    /// Bytes across all segment files.
    pub total_bytes: u64,

    /// Current retention floor.
    pub retention_floor: u64,
}

/// Holds `BACKUP.lock`; trimming is deferred until it is dropped.
///
/// Returned by [`Stream::begin_backup`] together with the sealed segments
/// that existed when the backup started.
#[derive(Debug)]
pub struct BackupGuard {
    file: File,
    path: PathBuf,
    segments: Vec<PathBuf>,
}

impl BackupGuard {
    /// Sealed segment files to copy.
    pub fn segments(&self) -> &[PathBuf] {
        &self.segments
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            error!("Failed to release {}: {}", self.path.display(), e);
        }
        debug!("Backup lock released");
    }
}

// ------------------------------------------------------------------------------------------------
// Heads
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct WriteHead {
    /// `None` between a rotation and the next append.
    writer: Option<SegmentWriter>,
    next_number: u32,
    last_marker: Option<u64>,
}

#[derive(Debug)]
struct OpenSegment {
    number: u32,
    reader: ReadbackStrategy,
}

#[derive(Debug, Default)]
struct ReadHead {
    /// `None` before the first read: positioned before the oldest chunk.
    current: Option<OpenSegment>,
}

// ------------------------------------------------------------------------------------------------
// Stream
// ------------------------------------------------------------------------------------------------

/// A segmented, append-only chunk log.
///
/// # Thread safety
///
/// `Stream` is `Send + Sync`. Appends are serialized by the write head;
/// sequential reads by the read head. Use [`Stream::random_reader`] for
/// lookups that should not move the read head.
///
/// # Shutdown
///
/// Call [`Stream::close`] to seal the write head and release the directory
/// lock. If the handle is dropped without calling `close`, the destructor
/// closes it and logs any error.
pub struct Stream {
    dir: PathBuf,
    config: StreamConfig,
    stream_id: StreamId,
    pool: Option<BufferPool>,
    catalog: Arc<RwLock<Catalog>>,
    write: Mutex<WriteHead>,
    read: Mutex<ReadHead>,
    retention_floor: AtomicU64,
    dir_lock: Mutex<Option<File>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("dir", &self.dir)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Stream {
    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Opens (or creates) the stream stored in `dir`.
    ///
    /// On an existing directory the segments are enumerated, validated and
    /// recovered; see the module documentation.
    ///
    /// # Errors
    ///
    /// - [`StreamError::InvalidConfig`] if a configuration value is out of
    ///   range.
    /// - [`StreamError::Locked`] if another `Stream` holds the directory.
    /// - [`StreamError::StreamIdentityMismatch`] if segments of different
    ///   streams are mixed, or the directory does not carry
    ///   [`StreamConfig::expected_stream_id`].
    /// - [`StreamError::NonContiguous`] if segment numbers have a gap.
    pub fn open(dir: impl AsRef<Path>, config: StreamConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        lock.try_lock_exclusive()
            .map_err(|_| StreamError::Locked(lock_path.clone()))?;

        let discovered = catalog::discover(&dir, config.expected_stream_id)?;
        let stream_id = match discovered.stream_id {
            Some(id) => id,
            None => *Uuid::new_v4().as_bytes(),
        };

        let catalog = discovered.catalog;
        let next_number = catalog.last().map_or(1, |e| e.number + 1);
        let last_marker = catalog.max_marker();
        let retention_floor = config.retention_floor.max(discovered.lowest_marker);

        let pool = (config.pool_capacity > 0).then(|| {
            BufferPool::new(config.pool_block_size, config.pool_capacity, config.pool_wait)
        });

        info!(
            "Opened stream {} ({} segments, {} recovered, {} quarantined, max marker {:?})",
            dir.display(),
            catalog.len(),
            discovered.recovered,
            discovered.quarantined.len(),
            last_marker
        );

        Ok(Self {
            dir,
            config,
            stream_id,
            pool,
            catalog: Arc::new(RwLock::new(catalog)),
            write: Mutex::new(WriteHead {
                writer: None,
                next_number,
                last_marker,
            }),
            read: Mutex::new(ReadHead::default()),
            retention_floor: AtomicU64::new(retention_floor),
            dir_lock: Mutex::new(Some(lock)),
            closed: AtomicBool::new(false),
        })
    }

    /// Seals the write head and releases the directory lock.
    ///
    /// Subsequent operations return [`StreamError::Closed`]. Calling
    /// `close` more than once is harmless.
    pub fn close(&self) -> Result<(), StreamError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut head = self.write_head()?;
            if let Some(mut writer) = head.writer.take() {
                writer.close()?;
                self.mark_sealed(&writer)?;
            }
        }
        self.read_head()?.current = None;

        let lock = self
            .dir_lock
            .lock()
            .map_err(|_| StreamError::Internal("directory lock poisoned".into()))?
            .take();
        if let Some(lock) = lock {
            FileExt::unlock(&lock)?;
        }
        fsync_dir(&self.dir)?;

        info!("Closed stream {}", self.dir.display());
        Ok(())
    }

    /// Directory of the stream.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Identity shared by all segments of the stream.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    // --------------------------------------------------------------------------------------------
    // Write head
    // --------------------------------------------------------------------------------------------

    /// Appends `payload` tagged with `marker`; returns the bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::NonMonotonicMarker`] unless `marker` exceeds
    /// every marker already in the stream.
    pub fn append(&self, payload: &[u8], marker: u64) -> Result<u64, StreamError> {
        self.append_with(payload.len() as u64, marker, |writer| {
            writer.append(payload, marker)
        })
    }

    /// Appends the payload held in `buf` with a single write.
    ///
    /// Produces the same bytes on disk as [`append`](Stream::append).
    pub fn append_buffer(&self, buf: &mut ChunkBuffer, marker: u64) -> Result<u64, StreamError> {
        self.append_with(buf.len() as u64, marker, |writer| {
            writer.append_buffer(buf, marker)
        })
    }

    /// Largest marker written so far.
    pub fn last_marker(&self) -> Result<Option<u64>, StreamError> {
        Ok(self.write_head()?.last_marker)
    }

    fn append_with(
        &self,
        len: u64,
        marker: u64,
        write: impl FnOnce(&mut SegmentWriter) -> Result<u64, SegmentError>,
    ) -> Result<u64, StreamError> {
        self.check_open()?;
        if len > self.config.max_chunk_size {
            return Err(SegmentError::ChunkTooLarge {
                len,
                max: self.config.max_chunk_size,
            }
            .into());
        }

        let mut head = self.write_head()?;
        // close() may have sealed the write head while we waited for it.
        self.check_open()?;
        if let Some(last) = head.last_marker {
            if marker <= last {
                return Err(StreamError::NonMonotonicMarker { last, marker });
            }
        }

        if head.writer.is_none() {
            let base_marker = head.last_marker.map_or(marker, |last| last + 1);
            let writer = self.start_segment(head.next_number, base_marker)?;
            head.next_number += 1;
            head.writer = Some(writer);
        }
        let Some(writer) = head.writer.as_mut() else {
            return Err(StreamError::Internal("write head has no segment".into()));
        };

        let written = write(writer)?;
        let (number, position) = (writer.number(), writer.len());
        head.last_marker = Some(marker);

        self.update_entry(number, |entry| {
            entry.first_marker.get_or_insert(marker);
            entry.max_marker = Some(marker);
            entry.file_len = position;
        })?;

        if position >= self.config.segment_size {
            self.rotate(&mut head)?;
        }
        Ok(written)
    }

    fn start_segment(&self, number: u32, base_marker: u64) -> Result<SegmentWriter, StreamError> {
        let options = SegmentOptions {
            stream_id: self.stream_id,
            lowest_marker: self.retention_floor(),
            base_marker,
            trailer_format: self.config.trailer_format,
            max_chunk_size: self.config.max_chunk_size,
            sync_writes: self.config.sync_writes,
        };
        let writer = SegmentWriter::open_for_writing(&self.dir, number, &options)?;

        self.catalog_mut()?.push(SegmentEntry {
            number,
            path: writer.path().to_path_buf(),
            base_marker,
            lowest_marker: options.lowest_marker,
            first_marker: None,
            max_marker: None,
            file_len: writer.len(),
            sealed: false,
        })?;
        Ok(writer)
    }

    fn rotate(&self, head: &mut WriteHead) -> Result<(), StreamError> {
        if let Some(mut writer) = head.writer.take() {
            writer.close()?;
            self.mark_sealed(&writer)?;
            info!(
                "Rotated out segment {} at {} bytes",
                writer.path().display(),
                writer.len()
            );
        }
        Ok(())
    }

    fn mark_sealed(&self, writer: &SegmentWriter) -> Result<(), StreamError> {
        let file_len = fs::metadata(writer.path())?.len();
        self.update_entry(writer.number(), |entry| {
            entry.sealed = true;
            entry.file_len = file_len;
        })
    }

    fn update_entry(
        &self,
        number: u32,
        update: impl FnOnce(&mut SegmentEntry),
    ) -> Result<(), StreamError> {
        let mut catalog = self.catalog_mut()?;
        let entry = catalog
            .get_mut(number)
            .ok_or_else(|| StreamError::Internal(format!("segment {number} missing from catalog")))?;
        update(entry);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Read head
    // --------------------------------------------------------------------------------------------

    /// Returns the next chunk in `direction` and moves the read head past
    /// it, crossing into neighbouring segments as needed.
    ///
    /// Returns `None` at either end. Reading forward at the end of the
    /// stream picks up chunks appended since.
    pub fn read(&self, direction: Direction) -> Result<Option<Chunk>, StreamError> {
        self.check_open()?;
        let mut head = self.read_head()?;

        loop {
            let number = match head.current.as_mut() {
                Some(open) => {
                    if let Some(chunk) = open.reader.iterate(direction)? {
                        return Ok(Some(chunk));
                    }
                    open.number
                }
                None => {
                    if direction == Direction::Reverse {
                        return Ok(None);
                    }
                    let Some(first) = self.catalog()?.first().map(|e| e.number) else {
                        return Ok(None);
                    };
                    head.current = Some(self.open_segment(first, SeekPosition::Start)?);
                    continue;
                }
            };

            let neighbour = {
                let catalog = self.catalog()?;
                match direction {
                    Direction::Forward => catalog.next_after(number)?.map(|e| e.number),
                    Direction::Reverse => catalog.prev_before(number)?.map(|e| e.number),
                }
            };
            let Some(next) = neighbour else {
                return Ok(None);
            };

            trace!(from = number, to = next, "read head crossing segments");
            let start = match direction {
                Direction::Forward => SeekPosition::Start,
                Direction::Reverse => SeekPosition::End,
            };
            head.current = Some(self.open_segment(next, start)?);
        }
    }

    /// Moves the read head before the oldest chunk.
    pub fn seek_start(&self) -> Result<(), StreamError> {
        self.check_open()?;
        let first = self.catalog()?.first().map(|e| e.number);
        let mut head = self.read_head()?;
        head.current = match first {
            Some(number) => Some(self.open_segment(number, SeekPosition::Start)?),
            None => None,
        };
        Ok(())
    }

    /// Moves the read head after the newest chunk.
    pub fn seek_end(&self) -> Result<(), StreamError> {
        self.check_open()?;
        let last = self.catalog()?.last().map(|e| e.number);
        let mut head = self.read_head()?;
        head.current = match last {
            Some(number) => Some(self.open_segment(number, SeekPosition::End)?),
            None => None,
        };
        Ok(())
    }

    /// Moves the read head right before the chunk with the least marker
    /// `>= marker`.
    ///
    /// Returns `false`, leaving the head at the end, if no such chunk
    /// exists yet.
    pub fn seek(&self, marker: u64) -> Result<bool, StreamError> {
        self.check_open()?;
        let covering = self.catalog()?.covering(marker).map(|e| e.number);
        let Some(number) = covering else {
            self.seek_end()?;
            return Ok(false);
        };

        let mut open = self.open_segment(number, SeekPosition::Start)?;
        let found = open.reader.seek_marker(marker)?;
        self.read_head()?.current = Some(open);
        Ok(found)
    }

    /// Chunk with the least marker `>= marker`; the read head ends up right
    /// after it.
    pub fn scan(&self, marker: u64) -> Result<Option<Chunk>, StreamError> {
        if !self.seek(marker)? {
            return Ok(None);
        }
        self.read(Direction::Forward)
    }

    fn open_segment(&self, number: u32, position: SeekPosition) -> Result<OpenSegment, StreamError> {
        let path = self
            .catalog()?
            .get(number)
            .map(|e| e.path.clone())
            .ok_or_else(|| StreamError::Internal(format!("segment {number} missing from catalog")))?;

        let options = ReadbackOptions {
            access_method: self.config.access_method,
            whole_file_limit: self.config.whole_file_limit,
            expected_stream: Some(self.stream_id),
            pool: self.pool.clone(),
        };
        let mut reader = ReadbackStrategy::open(&path, &options)?;
        reader.seek(position)?;
        debug!("Read head on segment {} ({})", number, reader.kind());
        Ok(OpenSegment { number, reader })
    }

    // --------------------------------------------------------------------------------------------
    // Random access
    // --------------------------------------------------------------------------------------------

    /// A reader for marker lookups that leaves the read head alone.
    ///
    /// The reader may be shared across threads and keeps working while
    /// this stream appends.
    pub fn random_reader(&self) -> Result<MarkerReader, StreamError> {
        self.check_open()?;
        Ok(MarkerReader::new(self.stream_id, Arc::clone(&self.catalog)))
    }

    // --------------------------------------------------------------------------------------------
    // Retention
    // --------------------------------------------------------------------------------------------

    /// Current retention floor: markers below it may be trimmed.
    pub fn retention_floor(&self) -> u64 {
        self.retention_floor.load(Ordering::Acquire)
    }

    /// Raises the retention floor to `marker`. Lowering it has no effect.
    pub fn set_retention_floor(&self, marker: u64) {
        let previous = self.retention_floor.fetch_max(marker, Ordering::AcqRel);
        if marker > previous {
            debug!(from = previous, to = marker, "retention floor raised");
        }
    }

    /// Deletes the oldest segments holding only markers below the retention
    /// floor.
    ///
    /// Waits up to `timeout` for a running backup to release
    /// `BACKUP.lock`, and defers otherwise. Each candidate is re-probed on
    /// disk before deletion; the newest segment is never deleted.
    pub fn clean(&self, timeout: Duration) -> Result<CleanOutcome, StreamError> {
        self.check_open()?;
        let Some(_backup) = self.acquire_backup_lock(timeout)? else {
            debug!("Backup in progress; deferring trim of {}", self.dir.display());
            return Ok(CleanOutcome::Deferred);
        };

        let floor = self.retention_floor();
        let mut trimmed = 0;
        loop {
            let Some(candidate) = self.catalog()?.trim_candidate(floor).cloned() else {
                break;
            };

            let info = SegmentInfo::probe(&candidate.path, Some(&self.stream_id))?;
            if !info.sealed || info.max_marker.is_some_and(|m| m >= floor) {
                debug!(
                    "Segment {} failed trim re-check (sealed={}, max marker {:?}, floor {})",
                    candidate.path.display(),
                    info.sealed,
                    info.max_marker,
                    floor
                );
                if trimmed == 0 {
                    return Ok(CleanOutcome::Deferred);
                }
                break;
            }

            let mut catalog = self.catalog_mut()?;
            if catalog.first().map(|e| e.number) != Some(candidate.number) {
                break;
            }
            fs::remove_file(&candidate.path)?;
            catalog.pop_front();
            trimmed += 1;
            info!(
                "Trimmed segment {} (max marker {:?}, floor {})",
                candidate.path.display(),
                candidate.max_marker,
                floor
            );
        }

        if trimmed > 0 {
            fsync_dir(&self.dir)?;
        }
        Ok(CleanOutcome::Trimmed(trimmed))
    }

    /// Takes `BACKUP.lock` so that trimming defers until the guard drops.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Locked`] if a backup is already running.
    pub fn begin_backup(&self) -> Result<BackupGuard, StreamError> {
        self.check_open()?;
        let path = self.dir.join(BACKUP_LOCK_FILE);
        let file = Self::open_backup_lock(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| StreamError::Locked(path.clone()))?;

        let segments = self
            .catalog()?
            .iter()
            .filter(|e| e.sealed)
            .map(|e| e.path.clone())
            .collect();
        info!("Backup of {} started", self.dir.display());
        Ok(BackupGuard {
            file,
            path,
            segments,
        })
    }

    fn open_backup_lock(path: &Path) -> Result<File, StreamError> {
        Ok(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?)
    }

    fn acquire_backup_lock(&self, timeout: Duration) -> Result<Option<File>, StreamError> {
        let file = Self::open_backup_lock(&self.dir.join(BACKUP_LOCK_FILE))?;
        let deadline = Instant::now() + timeout;
        let mut pause = Duration::from_micros(100);
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(Some(file));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(pause.min(deadline - now));
            pause = (pause * 2).min(MAX_BACKUP_POLL);
        }
    }

    // --------------------------------------------------------------------------------------------
    // Statistics
    // --------------------------------------------------------------------------------------------

    /// Returns a snapshot of stream statistics.
    pub fn stats(&self) -> Result<StreamStats, StreamError> {
        let catalog = self.catalog()?;
        Ok(StreamStats {
            stream_id: self.stream_id,
            segments: catalog.len(),
            first_segment: catalog.first().map(|e| e.number),
            last_segment: catalog.last().map(|e| e.number),
            min_marker: catalog.min_marker(),
            max_marker: catalog.max_marker(),
            total_bytes: catalog.total_bytes(),
            retention_floor: self.retention_floor(),
        })
    }

    /// Paths of all segment files, oldest first.
    pub fn segment_paths(&self) -> Result<Vec<PathBuf>, StreamError> {
        Ok(self.catalog()?.iter().map(|e| e.path.clone()).collect())
    }

    // --------------------------------------------------------------------------------------------
    // Internal helpers
    // --------------------------------------------------------------------------------------------

    /// Returns `Err(StreamError::Closed)` if the stream has been closed.
    fn check_open(&self) -> Result<(), StreamError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    fn catalog(&self) -> Result<RwLockReadGuard<'_, Catalog>, StreamError> {
        self.catalog
            .read()
            .map_err(|_| StreamError::Internal("catalog lock poisoned".into()))
    }

    fn catalog_mut(&self) -> Result<RwLockWriteGuard<'_, Catalog>, StreamError> {
        self.catalog
            .write()
            .map_err(|_| StreamError::Internal("catalog lock poisoned".into()))
    }

    fn write_head(&self) -> Result<MutexGuard<'_, WriteHead>, StreamError> {
        self.write
            .lock()
            .map_err(|_| StreamError::Internal("write head lock poisoned".into()))
    }

    fn read_head(&self) -> Result<MutexGuard<'_, ReadHead>, StreamError> {
        self.read
            .lock()
            .map_err(|_| StreamError::Internal("read head lock poisoned".into()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                error!("Failed to close stream {}: {}", self.dir.display(), e);
            }
        }
    }
}
