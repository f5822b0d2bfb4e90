//! Random-access reads independent of the stream's read head.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::trace;

use super::StreamError;
use super::catalog::{Catalog, SegmentEntry};
use crate::chunk::Chunk;
use crate::frame::StreamId;
use crate::readback::MappedSegment;

/// Longest pause between catalog polls in [`MarkerReader::scan_wait`].
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ceiling lookups by marker across all segments of a stream.
///
/// Every segment touched is memory-mapped once and kept for later lookups.
/// Lookups run concurrently with the writer and with each other; segments
/// that were sealed when mapped need no locking at all.
///
/// Obtained from [`Stream::random_reader`](super::Stream::random_reader).
pub struct MarkerReader {
    stream_id: StreamId,
    catalog: Arc<RwLock<Catalog>>,
    segments: Mutex<BTreeMap<u32, Arc<MappedSegment>>>,
}

impl std::fmt::Debug for MarkerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkerReader")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl MarkerReader {
    pub(crate) fn new(stream_id: StreamId, catalog: Arc<RwLock<Catalog>>) -> Self {
        Self {
            stream_id,
            catalog,
            segments: Mutex::new(BTreeMap::new()),
        }
    }

    /// Chunk with the least marker `>= marker` in the whole stream.
    pub fn lookup(&self, marker: u64) -> Result<Option<Chunk>, StreamError> {
        let Some((entry, oldest)) = self.locate(|c| c.covering(marker).cloned())? else {
            return Ok(None);
        };
        let segment = self.segment(&entry, oldest)?;
        Ok(segment.lookup(marker)?)
    }

    /// Like [`lookup`](MarkerReader::lookup), but waits up to `timeout` for
    /// the marker to be written.
    pub fn scan_wait(&self, marker: u64, timeout: Duration) -> Result<Option<Chunk>, StreamError> {
        let deadline = Instant::now() + timeout;
        let mut pause = Duration::from_micros(100);
        loop {
            if let Some(chunk) = self.lookup(marker)? {
                return Ok(Some(chunk));
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(marker, "marker reader wait timed out");
                return Ok(None);
            }

            let live = self.locate(|c| c.last().filter(|e| !e.sealed).cloned())?;
            match live {
                Some((entry, oldest)) => {
                    let segment = self.segment(&entry, oldest)?;
                    if let Some(chunk) = segment.scan_wait(marker, deadline - now)? {
                        return Ok(Some(chunk));
                    }
                }
                None => {
                    std::thread::sleep(pause.min(deadline - now));
                    pause = (pause * 2).min(MAX_POLL_INTERVAL);
                }
            }
        }
    }

    /// Number of segments currently mapped.
    pub fn mapped_segments(&self) -> usize {
        self.segments.lock().map(|s| s.len()).unwrap_or_default()
    }

    /// Runs `pick` against the catalog; returns its result plus the oldest
    /// segment number still present.
    fn locate(
        &self,
        pick: impl FnOnce(&Catalog) -> Option<SegmentEntry>,
    ) -> Result<Option<(SegmentEntry, u32)>, StreamError> {
        let catalog = self
            .catalog
            .read()
            .map_err(|_| StreamError::Internal("catalog lock poisoned".into()))?;
        let oldest = catalog.first().map_or(0, |e| e.number);
        Ok(pick(&catalog).map(|entry| (entry, oldest)))
    }

    fn segment(&self, entry: &SegmentEntry, oldest: u32) -> Result<Arc<MappedSegment>, StreamError> {
        let mut segments = self
            .segments
            .lock()
            .map_err(|_| StreamError::Internal("segment cache lock poisoned".into()))?;
        // Forget segments trimmed since they were mapped.
        segments.retain(|number, _| *number >= oldest);

        if let Some(segment) = segments.get(&entry.number) {
            return Ok(Arc::clone(segment));
        }
        let segment = Arc::new(MappedSegment::open(&entry.path, Some(&self.stream_id))?);
        trace!(segment = entry.number, live = segment.is_live(), "mapped for random access");
        segments.insert(entry.number, Arc::clone(&segment));
        Ok(segment)
    }
}
