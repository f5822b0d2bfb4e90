//! Ordered list of a stream's segments and its reconstruction on open.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::StreamError;
use crate::frame::StreamId;
use crate::segment::{
    SEGMENT_EXTENSION, SegmentError, SegmentInfo, fsync_dir, open_for_header,
    parse_segment_file_name, recover_and_seal,
};

/// Suffix appended to segment files whose header does not validate.
pub const QUARANTINE_SUFFIX: &str = "corrupt";

/// What the stream knows about one segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentEntry {
    pub(crate) number: u32,
    pub(crate) path: PathBuf,
    pub(crate) base_marker: u64,
    pub(crate) lowest_marker: u64,
    pub(crate) first_marker: Option<u64>,
    pub(crate) max_marker: Option<u64>,
    pub(crate) file_len: u64,
    pub(crate) sealed: bool,
}

impl SegmentEntry {
    pub(crate) fn from_info(info: &SegmentInfo) -> Self {
        Self {
            number: info.number(),
            path: info.path.clone(),
            base_marker: info.header.base_marker,
            lowest_marker: info.header.lowest_marker,
            first_marker: info.first_marker,
            max_marker: info.max_marker,
            file_len: info.file_len,
            sealed: info.sealed,
        }
    }
}

/// Segments ordered by number, numbers contiguous.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    entries: VecDeque<SegmentEntry>,
}

impl Catalog {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.entries.iter()
    }

    pub(crate) fn first(&self) -> Option<&SegmentEntry> {
        self.entries.front()
    }

    pub(crate) fn last(&self) -> Option<&SegmentEntry> {
        self.entries.back()
    }

    pub(crate) fn get(&self, number: u32) -> Option<&SegmentEntry> {
        let first = self.first()?.number;
        let idx = number.checked_sub(first)? as usize;
        self.entries.get(idx).filter(|e| e.number == number)
    }

    pub(crate) fn get_mut(&mut self, number: u32) -> Option<&mut SegmentEntry> {
        let first = self.first()?.number;
        let idx = number.checked_sub(first)? as usize;
        self.entries.get_mut(idx).filter(|e| e.number == number)
    }

    /// Appends `entry`, which must carry the next segment number.
    pub(crate) fn push(&mut self, entry: SegmentEntry) -> Result<(), StreamError> {
        if let Some(last) = self.last() {
            let expected = last.number + 1;
            if entry.number != expected {
                return Err(StreamError::NonContiguous {
                    expected,
                    found: entry.number,
                });
            }
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub(crate) fn pop_front(&mut self) -> Option<SegmentEntry> {
        self.entries.pop_front()
    }

    /// Segment following `number`.
    ///
    /// A `number` that has already been trimmed continues at the oldest
    /// segment still present.
    pub(crate) fn next_after(&self, number: u32) -> Result<Option<&SegmentEntry>, StreamError> {
        let Some(next) = self.entries.iter().find(|e| e.number > number) else {
            return Ok(None);
        };
        let expected = number + 1;
        if next.number != expected && self.first().is_some_and(|f| f.number <= number) {
            return Err(StreamError::NonContiguous {
                expected,
                found: next.number,
            });
        }
        Ok(Some(next))
    }

    /// Segment preceding `number`, if it is still present.
    pub(crate) fn prev_before(&self, number: u32) -> Result<Option<&SegmentEntry>, StreamError> {
        let Some(prev) = self.entries.iter().rev().find(|e| e.number < number) else {
            return Ok(None);
        };
        let expected = number - 1;
        if prev.number != expected {
            return Err(StreamError::NonContiguous {
                expected,
                found: prev.number,
            });
        }
        Ok(Some(prev))
    }

    /// Oldest segment holding a marker `>= marker`.
    pub(crate) fn covering(&self, marker: u64) -> Option<&SegmentEntry> {
        self.entries
            .iter()
            .find(|e| e.max_marker.is_some_and(|m| m >= marker))
    }

    /// Oldest segment if retention allows deleting it: sealed, not the
    /// newest, and holding nothing at or above `floor`.
    pub(crate) fn trim_candidate(&self, floor: u64) -> Option<&SegmentEntry> {
        if self.entries.len() < 2 {
            return None;
        }
        self.first()
            .filter(|e| e.sealed && e.max_marker.is_none_or(|m| m < floor))
    }

    pub(crate) fn min_marker(&self) -> Option<u64> {
        self.entries.iter().find_map(|e| e.first_marker)
    }

    pub(crate) fn max_marker(&self) -> Option<u64> {
        self.entries.iter().rev().find_map(|e| e.max_marker)
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.file_len).sum()
    }
}

// ------------------------------------------------------------------------------------------------
// Discovery
// ------------------------------------------------------------------------------------------------

/// Result of reconstructing the catalog from a stream directory.
#[derive(Debug)]
pub(crate) struct Discovered {
    pub(crate) catalog: Catalog,

    /// Identity carried by the segments, if any survived.
    pub(crate) stream_id: Option<StreamId>,

    /// Highest lowest-retained marker recorded in a header.
    pub(crate) lowest_marker: u64,

    /// Segment files renamed aside.
    pub(crate) quarantined: Vec<PathBuf>,

    /// Segments sealed by recovery.
    pub(crate) recovered: usize,
}

/// Segment files in `dir`, sorted by number.
fn list_segments(dir: &Path) -> Result<Vec<(u32, PathBuf)>, StreamError> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        let Some(number) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_file_name)
        else {
            debug!("Ignoring {}", path.display());
            continue;
        };
        found.push((number, path));
    }
    found.sort_by_key(|(number, _)| *number);
    Ok(found)
}

fn quarantine(path: &Path) -> Result<PathBuf, StreamError> {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(QUARANTINE_SUFFIX);
    let target = PathBuf::from(name);
    fs::rename(path, &target)?;
    Ok(target)
}

/// Rebuilds the catalog of the stream stored in `dir`.
///
/// 1. Segments whose header does not validate are renamed aside.
/// 2. Every remaining segment must carry the same stream id, and
///    `expected` when given; a mismatch aborts.
/// 3. Numbers must be contiguous.
/// 4. Unsealed segments are recovered and sealed; an unsealed newest
///    segment without any chunk is deleted.
pub(crate) fn discover(dir: &Path, expected: Option<StreamId>) -> Result<Discovered, StreamError> {
    let mut stream_id = expected;
    let mut quarantined = Vec::new();
    let mut valid = Vec::new();

    for (number, path) in list_segments(dir)? {
        let header = match open_for_header(&path, None) {
            Ok(header) => header,
            Err(SegmentError::Header(e)) => {
                let target = quarantine(&path)?;
                warn!(
                    "Segment {} has an invalid header ({}); moved to {}",
                    path.display(),
                    e,
                    target.display()
                );
                quarantined.push(target);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let id = *stream_id.get_or_insert(header.stream_id);
        if header.stream_id != id {
            return Err(StreamError::StreamIdentityMismatch {
                path,
                expected: id,
                found: header.stream_id,
            });
        }
        valid.push((number, path));
    }

    for pair in valid.windows(2) {
        let expected = pair[0].0 + 1;
        if pair[1].0 != expected {
            return Err(StreamError::NonContiguous {
                expected,
                found: pair[1].0,
            });
        }
    }

    let mut catalog = Catalog::default();
    let mut recovered = 0;
    let mut removed = false;
    let newest = valid.len().saturating_sub(1);

    for (i, (_, path)) in valid.iter().enumerate() {
        let mut info = SegmentInfo::probe(path, stream_id.as_ref())?;
        if !info.sealed {
            if i == newest && info.is_empty() {
                fs::remove_file(path)?;
                removed = true;
                info!("Removed empty unsealed segment {}", path.display());
                continue;
            }
            info = recover_and_seal(path, stream_id.as_ref())?.info;
            recovered += 1;
        }

        if let (Some(last), Some(first)) = (catalog.max_marker(), info.first_marker) {
            if first <= last {
                return Err(StreamError::NonMonotonicMarker {
                    last,
                    marker: first,
                });
            }
        }
        catalog.push(SegmentEntry::from_info(&info))?;
    }

    if removed || !quarantined.is_empty() {
        fsync_dir(dir)?;
    }

    let lowest_marker = catalog.iter().map(|e| e.lowest_marker).max().unwrap_or(0);
    Ok(Discovered {
        catalog,
        stream_id,
        lowest_marker,
        quarantined,
        recovered,
    })
}
