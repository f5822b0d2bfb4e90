//! Open, append, rotate, close, reopen.

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use tempfile::TempDir;

    use crate::frame::{ChunkBuffer, FRAME_OVERHEAD, SEGMENT_HEADER_SIZE};
    use crate::readback::Direction;
    use crate::segment::{SEGMENT_EXTENSION, SegmentError, SegmentInfo, open_for_header};
    use crate::stream::tests::helpers::*;
    use crate::stream::{Stream, StreamError};
    use crate::StreamConfig;

    #[test]
    fn fresh_stream_is_empty() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();

        let stats = stream.stats().unwrap();
        assert_eq!(stats.segments, 0);
        assert_eq!(stats.max_marker, None);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stream.last_marker().unwrap(), None);
        assert!(stream.read(Direction::Forward).unwrap().is_none());
        assert!(tmp.path().join("LOCK").exists());
    }

    #[test]
    fn append_then_read_back() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, [3, 5, 8]);

        assert_eq!(drain(&stream, Direction::Forward), vec![3, 5, 8]);
        assert_eq!(stream.last_marker().unwrap(), Some(8));
    }

    #[test]
    fn markers_must_increase() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, [10]);

        for marker in [10, 9, 0] {
            match stream.append(b"x", marker) {
                Err(StreamError::NonMonotonicMarker { last, marker: m }) => {
                    assert_eq!(last, 10);
                    assert_eq!(m, marker);
                }
                other => panic!("expected NonMonotonicMarker, got {other:?}"),
            }
        }
        stream.append(b"x", 11).unwrap();
    }

    #[test]
    fn oversized_chunk_is_rejected_before_a_segment_exists() {
        let tmp = TempDir::new().unwrap();
        let config = StreamConfig {
            max_chunk_size: 16,
            ..small_segments()
        };
        let stream = Stream::open(tmp.path(), config).unwrap();

        assert!(matches!(
            stream.append(&[0u8; 17], 1),
            Err(StreamError::Segment(SegmentError::ChunkTooLarge { len: 17, max: 16 }))
        ));
        assert_eq!(stream.stats().unwrap().segments, 0);
        stream.append(&[0u8; 16], 1).unwrap();
    }

    /// # Scenario
    /// The write head rotates once a segment reaches `segment_size`.
    ///
    /// # Starting environment
    /// Empty stream with 4 KiB segments.
    ///
    /// # Actions
    /// Append 100 chunks of 150..250 bytes, markers 10 apart.
    ///
    /// # Expected behavior
    /// Several segments with contiguous numbers starting at 1; every
    /// rotated-out segment is sealed; each segment's base marker is the
    /// previous segment's max marker plus one.
    #[test]
    fn rotation_seals_and_chains_base_markers() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, (1..=100).map(|i| i * 10));

        let stats = stream.stats().unwrap();
        assert!(stats.segments >= 3, "only {} segments", stats.segments);
        assert_eq!(stats.first_segment, Some(1));
        assert_eq!(stats.last_segment, Some(stats.segments as u32));
        assert_eq!(stats.min_marker, Some(10));
        assert_eq!(stats.max_marker, Some(1000));

        let paths = stream.segment_paths().unwrap();
        let mut prev_max = None;
        for (i, path) in paths.iter().enumerate() {
            let header = open_for_header(path, Some(&stream.stream_id())).unwrap();
            assert_eq!(header.segment_number, i as u32 + 1);
            if let Some(prev) = prev_max {
                assert_eq!(header.base_marker, prev + 1);
            }
            let info = crate::segment::SegmentInfo::probe(path, None).unwrap();
            if i + 1 < paths.len() {
                assert!(info.sealed, "segment {} not sealed", i + 1);
                assert!(info.file_len >= 4096);
            }
            prev_max = info.max_marker;
        }
    }

    /// # Scenario
    /// A chunk that brings the segment to exactly `segment_size` bytes.
    ///
    /// # Starting environment
    /// Two empty streams with 4 KiB segments.
    ///
    /// # Actions
    /// In one stream append a chunk filling the segment to 4096 bytes, in
    /// the other a chunk one byte shorter. Append a second chunk to each.
    ///
    /// # Expected behavior
    /// The full segment is sealed right away and the second chunk opens
    /// segment 2. The shorter one stays the write head and takes the
    /// second chunk too.
    #[test]
    fn rotation_bound_is_inclusive() {
        let exact = (4096 - SEGMENT_HEADER_SIZE - FRAME_OVERHEAD) as usize;

        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        stream.append(&vec![1u8; exact], 1).unwrap();
        let first = stream.segment_paths().unwrap().remove(0);
        let info = SegmentInfo::probe(&first, None).unwrap();
        assert!(info.sealed);
        assert_eq!(info.max_marker, Some(1));
        stream.append(b"next", 2).unwrap();
        assert_eq!(stream.stats().unwrap().segments, 2);

        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        stream.append(&vec![1u8; exact - 1], 1).unwrap();
        let first = stream.segment_paths().unwrap().remove(0);
        assert!(!SegmentInfo::probe(&first, None).unwrap().sealed);
        stream.append(b"next", 2).unwrap();
        assert_eq!(stream.stats().unwrap().segments, 1);
    }

    #[test]
    fn close_is_idempotent_and_final() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, [1, 2]);

        stream.close().unwrap();
        stream.close().unwrap();

        assert!(matches!(stream.append(b"x", 3), Err(StreamError::Closed)));
        assert!(matches!(stream.read(Direction::Forward), Err(StreamError::Closed)));
        assert!(matches!(stream.random_reader(), Err(StreamError::Closed)));

        let last = stream.segment_paths().unwrap().pop().unwrap();
        assert!(SegmentInfo::probe(&last, None).unwrap().sealed);
    }

    /// # Scenario
    /// Appenders race `close()` from other threads.
    ///
    /// # Starting environment
    /// Fresh stream with 4 KiB segments, many rounds.
    ///
    /// # Actions
    /// Eight threads append with markers drawn from a shared counter while
    /// the main thread closes the stream.
    ///
    /// # Expected behavior
    /// Appends either succeed or fail with `Closed` (or lose the marker
    /// race). Every segment file left in the directory is sealed, so no
    /// append opened a new write head after close.
    #[test]
    fn appends_racing_close_leave_every_segment_sealed() {
        const APPENDERS: usize = 8;
        const ROUNDS: usize = 200;

        for round in 0..ROUNDS {
            let tmp = TempDir::new().unwrap();
            let stream = Stream::open(tmp.path(), small_segments()).unwrap();
            let next = AtomicU64::new(1);
            let start = Barrier::new(APPENDERS + 1);

            thread::scope(|s| {
                for _ in 0..APPENDERS {
                    s.spawn(|| {
                        start.wait();
                        loop {
                            let marker = next.fetch_add(1, Ordering::Relaxed);
                            match stream.append(&payload(marker), marker) {
                                Ok(_) | Err(StreamError::NonMonotonicMarker { .. }) => {}
                                Err(StreamError::Closed) => break,
                                Err(e) => panic!("round {round}: append failed: {e}"),
                            }
                        }
                    });
                }
                start.wait();
                thread::yield_now();
                stream.close().unwrap();
            });

            assert!(matches!(stream.append(b"x", u64::MAX), Err(StreamError::Closed)));
            for entry in fs::read_dir(tmp.path()).unwrap() {
                let path = entry.unwrap().path();
                if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
                    continue;
                }
                let info = SegmentInfo::probe(&path, None).unwrap();
                assert!(info.sealed, "round {round}: {} left unsealed", path.display());
            }
        }
    }

    /// # Scenario
    /// Content and identity survive a clean close and reopen.
    ///
    /// # Starting environment
    /// Stream with 60 chunks over several segments, closed.
    ///
    /// # Actions
    /// Reopen, read everything, append more.
    ///
    /// # Expected behavior
    /// Same stream id and markers; new appends continue in a new segment
    /// numbered after the last one.
    #[test]
    fn reopen_after_close() {
        let tmp = TempDir::new().unwrap();
        let (id, segments) = {
            let stream = Stream::open(tmp.path(), small_segments()).unwrap();
            fill(&stream, 1..=60);
            stream.close().unwrap();
            let stats = stream.stats().unwrap();
            (stats.stream_id, stats.segments)
        };

        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        assert_eq!(stream.stream_id(), id);
        assert_eq!(stream.last_marker().unwrap(), Some(60));
        assert_eq!(drain(&stream, Direction::Forward), (1..=60u64).collect::<Vec<_>>());

        assert!(matches!(
            stream.append(b"x", 60),
            Err(StreamError::NonMonotonicMarker { last: 60, .. })
        ));
        fill(&stream, [61]);
        let stats = stream.stats().unwrap();
        assert_eq!(stats.segments, segments + 1);
        assert_eq!(stats.max_marker, Some(61));
    }

    #[test]
    fn drop_closes() {
        let tmp = TempDir::new().unwrap();
        {
            let stream = Stream::open(tmp.path(), small_segments()).unwrap();
            fill(&stream, [1, 2, 3]);
        }
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        assert_eq!(drain(&stream, Direction::Forward), vec![1, 2, 3]);
    }

    #[test]
    fn second_writer_is_locked_out() {
        let tmp = TempDir::new().unwrap();
        let first = Stream::open(tmp.path(), small_segments()).unwrap();
        assert!(matches!(
            Stream::open(tmp.path(), small_segments()),
            Err(StreamError::Locked(_))
        ));

        first.close().unwrap();
        Stream::open(tmp.path(), small_segments()).unwrap();
    }

    #[test]
    fn expected_stream_id_is_enforced() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let stream = Stream::open(tmp.path(), small_segments()).unwrap();
            fill(&stream, [1]);
            stream.stream_id()
        };

        let matching = StreamConfig {
            expected_stream_id: Some(id),
            ..small_segments()
        };
        Stream::open(tmp.path(), matching).unwrap().close().unwrap();

        let other = StreamConfig {
            expected_stream_id: Some(*b"some-other-strm!"),
            ..small_segments()
        };
        assert!(matches!(
            Stream::open(tmp.path(), other),
            Err(StreamError::StreamIdentityMismatch { .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let config = StreamConfig {
            segment_size: 10,
            ..StreamConfig::default()
        };
        assert!(matches!(
            Stream::open(tmp.path(), config),
            Err(StreamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn buffered_appends_read_back_like_plain_ones() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();

        let mut buf = ChunkBuffer::with_capacity(256);
        for marker in 1..=40u64 {
            buf.clear();
            buf.extend_from_slice(&payload(marker));
            let written = stream.append_buffer(&mut buf, marker).unwrap();
            assert_eq!(written, payload(marker).len() as u64 + 32);
        }
        assert!(stream.stats().unwrap().segments >= 2);
        assert_eq!(drain(&stream, Direction::Forward), (1..=40u64).collect::<Vec<_>>());
    }
}
