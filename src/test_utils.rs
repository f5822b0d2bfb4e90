//! Helpers shared by unit tests across modules.

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

use crate::encoding;
use crate::frame::{JumpList, SEGMENT_HEADER_SIZE, SegmentHeader, StreamId, TrailerFormat, encode_frame};

/// Stream id used by hand-built segments.
pub const TEST_STREAM: StreamId = *b"chunklog-testing";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic payload for `marker`, `len` bytes long.
pub fn payload_for(marker: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (marker as usize).wrapping_add(i) as u8).collect()
}

/// In-memory image of an unsealed segment.
///
/// Returns the bytes and the chunk start offsets.
pub fn unsealed_image(
    format: TrailerFormat,
    number: u32,
    chunks: &[(u64, Vec<u8>)],
) -> (Vec<u8>, Vec<u64>) {
    let base = chunks.first().map(|(m, _)| *m).unwrap_or(0);
    let header = SegmentHeader::new(format, number, TEST_STREAM, 0, base);
    let mut buf = encoding::encode_to_vec(&header).unwrap();
    assert_eq!(buf.len(), SEGMENT_HEADER_SIZE);

    let mut offsets = Vec::with_capacity(chunks.len());
    for (marker, payload) in chunks {
        offsets.push(buf.len() as u64);
        encode_frame(payload, *marker, &mut buf).unwrap();
    }
    (buf, offsets)
}

/// In-memory image of a sealed segment.
pub fn sealed_image(format: TrailerFormat, number: u32, chunks: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let (mut buf, offsets) = unsealed_image(format, number, chunks);
    JumpList::from_offsets(offsets)
        .encode_trailer(format, &mut buf)
        .unwrap();
    buf
}

/// `(marker, payload)` pairs for the given markers with varied sizes.
pub fn chunks_for(markers: &[u64]) -> Vec<(u64, Vec<u8>)> {
    markers
        .iter()
        .map(|&m| (m, payload_for(m, (m % 97) as usize + 1)))
        .collect()
}

/// Writes `bytes` to `dir/name` and returns the path.
pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, bytes).unwrap();
    path
}
