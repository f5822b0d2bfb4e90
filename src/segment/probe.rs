//! Read-only inspection and crash recovery of segment files.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use fs2::FileExt as LockExt;
use tracing::{debug, info, warn};

use super::{SegmentError, parse_segment_file_name};
use crate::frame::{
    HeaderError, JumpList, SEGMENT_HEADER_SIZE, SegmentHeader, StreamId, TRAILER_MIN_SIZE,
    TRAILER_TAIL_MAX, TrailerFormat,
};
use crate::index::MarkerIndex;
use crate::scan::{IntegrityScanner, ScanMode, ScanReport, Termination};
use crate::source::ByteSource;

/// Reads and validates only the fixed header of the segment at `path`.
///
/// The embedded segment number is checked against the file name when the
/// name follows the segment naming scheme, and the stream id against
/// `expected_stream` when given.
pub fn open_for_header(
    path: &Path,
    expected_stream: Option<&StreamId>,
) -> Result<SegmentHeader, SegmentError> {
    let file = File::open(path)?;
    read_header(&file, path, expected_stream)
}

fn read_header<S: ByteSource>(
    source: &S,
    path: &Path,
    expected_stream: Option<&StreamId>,
) -> Result<SegmentHeader, SegmentError> {
    let len = source.byte_len()?;
    if len < SEGMENT_HEADER_SIZE as u64 {
        return Err(HeaderError::TooShort(len).into());
    }
    let mut raw = [0u8; SEGMENT_HEADER_SIZE];
    source.read_exact_at(&mut raw, 0)?;
    let expected_number = path
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(parse_segment_file_name);
    Ok(SegmentHeader::parse(&raw, expected_number, expected_stream)?)
}

/// A trailer found at the end of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedLayout {
    /// Chunk start offsets from the trailer.
    pub jump_list: JumpList,

    /// Offset of `"!ctl"`, one past the last frame.
    pub trailer_offset: u64,
}

/// Looks for a well-formed trailer at the end of a segment of `file_len`
/// bytes.
///
/// Only the trailer itself is checked; frames are not read. Returns
/// `Ok(None)` when the bytes at the end do not form a trailer consistent
/// with the file length.
pub fn locate_trailer<S: ByteSource + ?Sized>(
    source: &S,
    format: TrailerFormat,
    file_len: u64,
) -> io::Result<Option<SealedLayout>> {
    let header_end = SEGMENT_HEADER_SIZE as u64;
    if file_len < header_end + TRAILER_MIN_SIZE as u64 {
        return Ok(None);
    }

    let tail_len = (file_len - header_end).min(TRAILER_TAIL_MAX as u64) as usize;
    let mut tail = vec![0u8; tail_len];
    source.read_exact_at(&mut tail, file_len - tail_len as u64)?;
    let layout = match JumpList::layout_from_tail(&tail, format) {
        Ok(layout) => layout,
        Err(_) => return Ok(None),
    };
    if layout.len as u64 > file_len - header_end {
        return Ok(None);
    }

    let trailer_offset = file_len - layout.len as u64;
    let mut bytes = vec![0u8; layout.len];
    source.read_exact_at(&mut bytes, trailer_offset)?;
    let jump_list = match JumpList::decode_trailer(&bytes, format) {
        Ok(list) => list,
        Err(e) => {
            debug!("Trailer candidate rejected: {}", e);
            return Ok(None);
        }
    };

    let fits = match jump_list.offsets().last() {
        Some(last) => *last < trailer_offset,
        None => trailer_offset == header_end,
    };
    if !fits {
        return Ok(None);
    }

    Ok(Some(SealedLayout {
        jump_list,
        trailer_offset,
    }))
}

// ------------------------------------------------------------------------------------------------
// SegmentInfo
// ------------------------------------------------------------------------------------------------

/// Extent and marker range of one segment on disk.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// Path of the segment file.
    pub path: PathBuf,

    /// Validated header.
    pub header: SegmentHeader,

    /// File length.
    pub file_len: u64,

    /// Whether a valid trailer is present.
    pub sealed: bool,

    /// Number of chunks.
    pub chunks: usize,

    /// Marker of the first chunk.
    pub first_marker: Option<u64>,

    /// Marker of the last chunk.
    pub max_marker: Option<u64>,

    /// Offset one past the last valid frame.
    pub data_end: u64,
}

impl SegmentInfo {
    /// Inspects the segment at `path`.
    ///
    /// A sealed segment is described from its trailer plus the two frame
    /// feet holding its first and last markers. Anything else is scanned.
    pub fn probe(path: &Path, expected_stream: Option<&StreamId>) -> Result<Self, SegmentError> {
        let file = File::open(path)?;
        let header = read_header(&file, path, expected_stream)?;
        let file_len = file.byte_len()?;

        if let Some(layout) = locate_trailer(&file, header.trailer_format(), file_len)? {
            let count = layout.jump_list.len();
            let index = MarkerIndex::from_offsets(layout.jump_list.offsets(), layout.trailer_offset);
            let bounds = if count == 0 {
                Ok((None, None))
            } else {
                index
                    .marker(0, &file)
                    .and_then(|first| Ok((Some(first), Some(index.marker(count - 1, &file)?))))
            };
            match bounds {
                Ok((first_marker, max_marker)) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                        header,
                        file_len,
                        sealed: true,
                        chunks: count,
                        first_marker,
                        max_marker,
                        data_end: layout.trailer_offset,
                    });
                }
                Err(e) => warn!("Trailer of {} unusable ({}), scanning", path.display(), e),
            }
        }

        let report = IntegrityScanner::with_header(&file, header, file_len, ScanMode::Boundaries).run()?;
        Ok(Self::from_report(path, &report))
    }

    /// Describes a segment from a completed integrity scan.
    pub fn from_report(path: &Path, report: &ScanReport) -> Self {
        Self {
            path: path.to_path_buf(),
            header: report.header.clone(),
            file_len: report.file_len,
            sealed: report.is_sealed(),
            chunks: report.chunks,
            first_marker: report.first_marker,
            max_marker: report.max_marker,
            data_end: report.termination.valid_end(),
        }
    }

    /// Segment number from the header.
    pub fn number(&self) -> u32 {
        self.header.segment_number
    }

    /// Whether the segment holds no chunk.
    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }
}

// ------------------------------------------------------------------------------------------------
// Recovery
// ------------------------------------------------------------------------------------------------

/// Outcome of [`recover_and_seal`].
#[derive(Debug, Clone)]
pub struct Recovery {
    /// The segment as it is on disk afterwards.
    pub info: SegmentInfo,

    /// How the integrity scan ended before any repair.
    pub termination: Termination,

    /// Bytes cut from the end of the file.
    pub discarded: u64,
}

/// Makes the segment at `path` sealed.
///
/// The integrity scan decides. A segment that is already sealed is left
/// untouched. Otherwise the file is cut at the last confirmed boundary and
/// a trailer listing the recovered frames is written.
pub fn recover_and_seal(
    path: &Path,
    expected_stream: Option<&StreamId>,
) -> Result<Recovery, SegmentError> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    file.try_lock_exclusive()
        .map_err(|_| SegmentError::Locked(path.to_path_buf()))?;

    let header = read_header(&file, path, expected_stream)?;
    let file_len = file.byte_len()?;
    let format = header.trailer_format();
    let report = IntegrityScanner::with_header(&file, header, file_len, ScanMode::Boundaries).run()?;

    if report.is_sealed() {
        let info = SegmentInfo::from_report(path, &report);
        return Ok(Recovery {
            info,
            termination: report.termination,
            discarded: 0,
        });
    }

    let valid_end = report.termination.valid_end();
    let discarded = file_len - valid_end;
    if let Termination::Torn { reason, .. } = &report.termination {
        warn!(
            "Segment {} torn at offset {} ({}); discarding {} bytes",
            path.display(),
            valid_end,
            reason,
            discarded
        );
    }

    file.set_len(valid_end)?;
    let mut trailer = Vec::with_capacity(JumpList::trailer_len(report.chunks, format));
    report.jump_list.encode_trailer(format, &mut trailer)?;
    file.write_all_at(&trailer, valid_end)?;
    file.sync_all()?;
    LockExt::unlock(&file)?;

    info!(
        "Recovered segment {}: {} chunks, max marker {:?}",
        path.display(),
        report.chunks,
        report.max_marker
    );

    let info = SegmentInfo {
        path: path.to_path_buf(),
        header: report.header.clone(),
        file_len: valid_end + trailer.len() as u64,
        sealed: true,
        chunks: report.chunks,
        first_marker: report.first_marker,
        max_marker: report.max_marker,
        data_end: valid_end,
    };
    Ok(Recovery {
        info,
        termination: report.termination,
        discarded,
    })
}
