//! Integrity-only strategy for recovery and verification tooling.

use std::fs::File;
use std::path::{Path, PathBuf};

use super::{Direction, Readback, ReadbackError, SeekPosition};
use crate::chunk::Chunk;
use crate::frame::StreamId;
use crate::scan::{IntegrityScanner, ScanMode, ScanReport, Termination};
use crate::segment::parse_segment_file_name;

/// The integrity scanner exposed as a forward-only chunk sequence.
///
/// Every payload is read, validated and folded into the content checksum
/// reported by [`finish`](IntegrityReadback::finish). Reverse iteration is
/// not offered; [`Readback::scan`] and [`Readback::seek_marker`] only move
/// forward from the current position.
pub struct IntegrityReadback {
    path: PathBuf,
    expected_stream: Option<StreamId>,
    scanner: IntegrityScanner<File>,
    peeked: Option<Chunk>,
    size: u64,
}

impl std::fmt::Debug for IntegrityReadback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityReadback")
            .field("path", &self.path)
            .field("position", &self.scanner.position())
            .field("chunks", &self.scanner.chunks())
            .finish()
    }
}

impl IntegrityReadback {
    /// Opens the segment at `path` and positions before its first frame.
    pub fn open(path: &Path, expected_stream: Option<&StreamId>) -> Result<Self, ReadbackError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let number = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_segment_file_name);
        let scanner = IntegrityScanner::open(file, number, expected_stream, ScanMode::Payloads)?;
        Ok(Self {
            path: path.to_path_buf(),
            expected_stream: expected_stream.copied(),
            scanner,
            peeked: None,
            size,
        })
    }

    /// Scans the rest of the segment and returns the full report.
    pub fn finish(self) -> Result<ScanReport, ReadbackError> {
        Ok(self.scanner.run()?)
    }

    /// Scans the whole segment at `path`.
    pub fn verify(path: &Path, expected_stream: Option<&StreamId>) -> Result<ScanReport, ReadbackError> {
        Self::open(path, expected_stream)?.finish()
    }

    fn fill(&mut self) -> Result<(), ReadbackError> {
        if self.peeked.is_none() {
            if let Some(frame) = self.scanner.next_frame()? {
                let payload = self.scanner.take_payload();
                let len = payload.len();
                self.peeked = Some(Chunk::from_vec(payload, 0..len, frame.marker)?);
            }
        }
        Ok(())
    }
}

impl Readback for IntegrityReadback {
    fn iterate(&mut self, direction: Direction) -> Result<Option<Chunk>, ReadbackError> {
        if direction == Direction::Reverse {
            return Err(ReadbackError::Unsupported("reverse iteration"));
        }
        self.fill()?;
        Ok(self.peeked.take())
    }

    fn has_more(&mut self, direction: Direction) -> Result<bool, ReadbackError> {
        if direction == Direction::Reverse {
            return Ok(false);
        }
        self.fill()?;
        Ok(self.peeked.is_some())
    }

    fn is_consistent(&self) -> bool {
        matches!(self.scanner.termination(), Some(Termination::Sealed { .. }))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn scan(&mut self, marker: u64) -> Result<Option<Chunk>, ReadbackError> {
        while let Some(chunk) = self.iterate(Direction::Forward)? {
            if chunk.marker() >= marker {
                return Ok(Some(chunk));
            }
        }
        Ok(None)
    }

    fn seek(&mut self, position: SeekPosition) -> Result<(), ReadbackError> {
        match position {
            SeekPosition::Start => {
                let path = self.path.clone();
                let expected = self.expected_stream;
                *self = Self::open(&path, expected.as_ref())?;
            }
            SeekPosition::End => while self.iterate(Direction::Forward)?.is_some() {},
        }
        Ok(())
    }

    fn seek_marker(&mut self, marker: u64) -> Result<bool, ReadbackError> {
        loop {
            self.fill()?;
            match self.peeked.as_ref().map(Chunk::marker) {
                Some(m) if m >= marker => return Ok(true),
                Some(_) => self.peeked = None,
                None => return Ok(false),
            }
        }
    }
}
