use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::Chunk;
use crate::frame::TrailerFormat;
use crate::pool::BufferPool;
use crate::readback::*;
use crate::segment::{SegmentOptions, SegmentWriter};
use crate::test_utils::*;

pub fn options(format: TrailerFormat) -> SegmentOptions {
    SegmentOptions {
        stream_id: TEST_STREAM,
        lowest_marker: 0,
        base_marker: 0,
        trailer_format: format,
        max_chunk_size: 1 << 20,
        sync_writes: false,
    }
}

/// Writes and seals segment 1 in `dir` with the given markers.
pub fn sealed_segment(dir: &Path, format: TrailerFormat, markers: &[u64]) -> PathBuf {
    let mut writer = SegmentWriter::open_for_writing(dir, 1, &options(format)).unwrap();
    for (marker, payload) in chunks_for(markers) {
        writer.append(&payload, marker).unwrap();
    }
    writer.close().unwrap();
    writer.path().to_path_buf()
}

/// Every strategy able to serve application reads, opened over `path`.
pub fn strategies(path: &Path) -> Vec<(&'static str, Box<dyn Readback>)> {
    let pool = BufferPool::new(4096, 2, Duration::ZERO);
    vec![
        (
            "whole-file",
            Box::new(WholeFileReadback::open(path, Some(&TEST_STREAM)).unwrap()),
        ),
        (
            "window",
            Box::new(WindowReadback::open(path, Some(&TEST_STREAM), None).unwrap()),
        ),
        (
            "window-pooled",
            Box::new(WindowReadback::open(path, Some(&TEST_STREAM), Some(pool)).unwrap()),
        ),
        (
            "mapped",
            Box::new(MappedReadback::open(path, Some(&TEST_STREAM)).unwrap()),
        ),
    ]
}

/// Drains `reader` in `direction`, returning `(marker, payload)` pairs.
pub fn drain(reader: &mut dyn Readback, direction: Direction) -> Vec<(u64, Vec<u8>)> {
    let mut out = Vec::new();
    while let Some(chunk) = reader.iterate(direction).unwrap() {
        out.push(pair(chunk));
    }
    out
}

pub fn pair(chunk: Chunk) -> (u64, Vec<u8>) {
    (chunk.marker(), chunk.into_vec())
}
