use std::fs;
use std::path::Path;

use crate::readback::Direction;
use crate::segment::SEGMENT_EXTENSION;
use crate::stream::Stream;
use crate::test_utils::{init_tracing, payload_for};
use crate::StreamConfig;

/// 4 KiB segments, no fsync: a few dozen small chunks span several segments.
pub fn small_segments() -> StreamConfig {
    init_tracing();
    StreamConfig {
        segment_size: 4096,
        sync_writes: false,
        ..StreamConfig::default()
    }
}

/// Payload written for `marker` by [`fill`].
pub fn payload(marker: u64) -> Vec<u8> {
    payload_for(marker, 150 + (marker % 101) as usize)
}

/// Appends one chunk per marker.
pub fn fill(stream: &Stream, markers: impl IntoIterator<Item = u64>) {
    for marker in markers {
        stream.append(&payload(marker), marker).expect("append");
    }
}

/// Reads in `direction` until the read head reports the end.
pub fn drain(stream: &Stream, direction: Direction) -> Vec<u64> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.read(direction).expect("read") {
        assert_eq!(chunk.bytes(), payload(chunk.marker()).as_slice());
        out.push(chunk.marker());
    }
    out
}

/// Copies every segment file from `src` to `dst`, as a crash would leave
/// them: the write head unsealed, no lock files.
pub fn crash_copy(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).unwrap();
    for entry in fs::read_dir(src).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION) {
            fs::copy(&path, dst.join(path.file_name().unwrap())).unwrap();
        }
    }
}
