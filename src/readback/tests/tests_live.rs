//! Readers following a segment that is still being written.
//!
//! Coverage:
//! - Forward iteration picks up frames appended after open
//! - Sealing is observed by readers opened before the trailer existed
//! - `scan_wait` blocks until a marker arrives or the timeout elapses
//! - Chunks handed out before a remap stay valid
//! - Partial frames at the tail of a crashed segment stay invisible

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use crate::frame::TrailerFormat;
    use crate::readback::tests::helpers::*;
    use crate::readback::*;
    use crate::segment::SegmentWriter;
    use crate::test_utils::*;

    fn live_readers(path: &std::path::Path) -> Vec<(&'static str, Box<dyn Readback>)> {
        vec![
            (
                "window",
                Box::new(WindowReadback::open(path, Some(&TEST_STREAM), None).unwrap()),
            ),
            (
                "mapped",
                Box::new(MappedReadback::open(path, Some(&TEST_STREAM)).unwrap()),
            ),
        ]
    }

    /// # Scenario
    /// A reader tails a segment while the writer keeps appending and
    /// finally seals it.
    ///
    /// # Starting environment
    /// Open writer with 3 chunks.
    ///
    /// # Actions
    /// 1. Open readers and drain them.
    /// 2. Append 2 more chunks; drain again.
    /// 3. Close the writer; ask for more.
    ///
    /// # Expected behavior
    /// Readers see 3, then the 2 new chunks, and report the segment
    /// consistent only after the trailer was written.
    #[test]
    fn readers_follow_appends_until_sealed() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut writer =
            SegmentWriter::open_for_writing(tmp.path(), 1, &options(TrailerFormat::Compact)).unwrap();
        for (m, p) in chunks_for(&[1, 2, 3]) {
            writer.append(&p, m).unwrap();
        }

        let mut readers = live_readers(writer.path());
        for (name, reader) in readers.iter_mut() {
            assert!(!reader.is_consistent(), "{name}");
            assert_eq!(drain(reader.as_mut(), Direction::Forward), chunks_for(&[1, 2, 3]), "{name}");
        }

        for (m, p) in chunks_for(&[4, 5]) {
            writer.append(&p, m).unwrap();
        }
        for (name, reader) in readers.iter_mut() {
            assert!(reader.has_more(Direction::Forward).unwrap(), "{name}");
            assert_eq!(drain(reader.as_mut(), Direction::Forward), chunks_for(&[4, 5]), "{name}");
            assert!(!reader.is_consistent(), "{name}");
        }

        writer.close().unwrap();
        for (name, reader) in readers.iter_mut() {
            assert!(!reader.has_more(Direction::Forward).unwrap(), "{name}");
            assert!(reader.is_consistent(), "{name}");
            let all: Vec<u64> = {
                reader.seek(SeekPosition::End).unwrap();
                drain(reader.as_mut(), Direction::Reverse)
                    .into_iter()
                    .map(|(m, _)| m)
                    .collect()
            };
            assert_eq!(all, vec![5, 4, 3, 2, 1], "{name}");
        }
    }

    #[test]
    fn scan_past_known_end_refreshes() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut writer =
            SegmentWriter::open_for_writing(tmp.path(), 1, &options(TrailerFormat::Compact)).unwrap();
        writer.append(b"first", 10).unwrap();

        let mut readers = live_readers(writer.path());
        writer.append(b"second", 20).unwrap();

        for (name, reader) in readers.iter_mut() {
            let chunk = reader.scan(15).unwrap().unwrap();
            assert_eq!(chunk.marker(), 20, "{name}");
            assert_eq!(chunk.bytes(), b"second", "{name}");
            assert!(reader.scan(21).unwrap().is_none(), "{name}");
        }
    }

    #[test]
    fn seek_end_sees_latest_frames() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            SegmentWriter::open_for_writing(tmp.path(), 1, &options(TrailerFormat::Compact)).unwrap();
        let mut readers = live_readers(writer.path());
        writer.append(b"a", 1).unwrap();
        writer.append(b"b", 2).unwrap();

        for (name, reader) in readers.iter_mut() {
            reader.seek(SeekPosition::End).unwrap();
            assert_eq!(reader.iterate(Direction::Reverse).unwrap().unwrap().marker(), 2, "{name}");
        }
    }

    /// # Scenario
    /// A random-access reader waits for a marker that a writer thread
    /// appends shortly afterwards.
    ///
    /// # Starting environment
    /// Live segment with markers {1, 2}, shared `MappedSegment`.
    ///
    /// # Actions
    /// 1. A writer thread sleeps, appends marker 50, then seals.
    /// 2. The main thread calls `scan_wait(50, 5s)`.
    /// 3. After sealing, `scan_wait(1000, 5s)`.
    ///
    /// # Expected behavior
    /// The first wait returns marker 50; the second returns `None` right
    /// after the seal is noticed instead of waiting out the timeout.
    #[test]
    fn scan_wait_sees_concurrent_append() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut writer =
            SegmentWriter::open_for_writing(tmp.path(), 1, &options(TrailerFormat::Compact)).unwrap();
        writer.append(b"one", 1).unwrap();
        writer.append(b"two", 2).unwrap();

        let segment = Arc::new(MappedSegment::open(writer.path(), Some(&TEST_STREAM)).unwrap());
        assert!(segment.is_live());
        assert_eq!(segment.last_marker().unwrap(), Some(2));

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.append(b"fifty", 50).unwrap();
            writer.close().unwrap();
        });

        let chunk = segment.scan_wait(50, Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(chunk.marker(), 50);
        assert_eq!(chunk.bytes(), b"fifty");
        handle.join().unwrap();

        let started = Instant::now();
        assert!(segment.scan_wait(1000, Duration::from_secs(5)).unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(segment.is_sealed().unwrap());
    }

    #[test]
    fn scan_wait_times_out() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            SegmentWriter::open_for_writing(tmp.path(), 1, &options(TrailerFormat::Compact)).unwrap();
        writer.append(b"x", 1).unwrap();
        let segment = MappedSegment::open(writer.path(), None).unwrap();

        let started = Instant::now();
        assert!(segment.scan_wait(2, Duration::from_millis(30)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(segment.lookup(1).unwrap().unwrap().bytes(), b"x");
    }

    #[test]
    fn chunks_survive_remap() {
        let tmp = TempDir::new().unwrap();
        let mut writer =
            SegmentWriter::open_for_writing(tmp.path(), 1, &options(TrailerFormat::Compact)).unwrap();
        writer.append(b"early", 1).unwrap();

        let segment = MappedSegment::open(writer.path(), None).unwrap();
        let early = segment.chunk_at(0).unwrap().unwrap();
        let size_before = segment.size();

        for m in 2..100 {
            writer.append(&payload_for(m, 512), m).unwrap();
        }
        let growth = segment.refresh().unwrap();
        assert_eq!(growth.added, 98);
        assert!(!growth.sealed);
        assert!(segment.size() > size_before);

        assert_eq!(early.bytes(), b"early");
        assert_eq!(segment.len().unwrap(), 99);
        assert_eq!(segment.first_marker().unwrap(), Some(1));
        assert_eq!(segment.last_marker().unwrap(), Some(99));
    }

    /// # Scenario
    /// A crashed segment ends in the middle of a frame.
    ///
    /// # Starting environment
    /// Unsealed image with 4 frames; the last one cut in half.
    ///
    /// # Actions
    /// Open Window and Mapped readers, replay forward.
    ///
    /// # Expected behavior
    /// Only the 3 complete frames are returned and the segment is not
    /// consistent.
    #[test]
    fn partial_tail_is_invisible() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let chunks = chunks_for(&[7, 8, 9, 10]);
        let (bytes, offsets) = unsealed_image(TrailerFormat::Compact, 1, &chunks);
        let cut = (offsets[3] as usize + bytes.len()) / 2;
        let path = write_file(tmp.path(), "000000000001.flf", &bytes[..cut]);

        for (name, mut reader) in live_readers(&path) {
            assert!(!reader.is_consistent(), "{name}");
            assert_eq!(drain(reader.as_mut(), Direction::Forward), chunks[..3].to_vec(), "{name}");
            assert!(reader.scan(10).unwrap().is_none(), "{name}");
        }

        let whole = WholeFileReadback::open(&path, None).unwrap();
        assert!(!whole.is_consistent());
        assert_eq!(whole.len(), 3);
    }
}
