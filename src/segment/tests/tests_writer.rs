//! Segment writer lifecycle tests.
//!
//! Coverage:
//! - Header written at creation; file naming
//! - Strict marker monotonicity, base marker and size limits
//! - Seal idempotence and close semantics
//! - The single-write `ChunkBuffer` path produces identical bytes

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use crate::frame::{
        ChunkBuffer, SEGMENT_HEADER_SIZE, SegmentHeader, TrailerFormat, encode_frame, frame_len,
    };
    use crate::scan::{IntegrityScanner, ScanMode};
    use crate::segment::*;
    use crate::test_utils::*;

    fn options(base_marker: u64) -> SegmentOptions {
        SegmentOptions {
            stream_id: TEST_STREAM,
            lowest_marker: 0,
            base_marker,
            trailer_format: TrailerFormat::Compact,
            max_chunk_size: 1024,
            sync_writes: false,
        }
    }

    fn create(dir: &Path, number: u32, base: u64) -> SegmentWriter {
        SegmentWriter::open_for_writing(dir, number, &options(base)).unwrap()
    }

    #[test]
    fn file_names_round_trip() {
        assert_eq!(segment_file_name(7), "000000000007.flf");
        assert_eq!(parse_segment_file_name("000000000007.flf"), Some(7));
        assert_eq!(
            parse_segment_file_name(&segment_file_name(u32::MAX)),
            Some(u32::MAX)
        );
        assert_eq!(parse_segment_file_name("7.flf"), None);
        assert_eq!(parse_segment_file_name("000000000007.log"), None);
        assert_eq!(parse_segment_file_name("00000000000x.flf"), None);
        assert_eq!(parse_segment_file_name("000000000007.flf.corrupt"), None);
        assert_eq!(parse_segment_file_name("LOCK"), None);
    }

    #[test]
    fn creation_writes_only_the_header() {
        init_tracing();
        let tmp = TempDir::new().unwrap();

        let writer = create(tmp.path(), 3, 500);
        assert_eq!(writer.len(), SEGMENT_HEADER_SIZE as u64);
        assert!(writer.is_empty());
        assert_eq!(writer.number(), 3);
        assert_eq!(writer.base_marker(), 500);

        let bytes = fs::read(writer.path()).unwrap();
        assert_eq!(bytes.len(), SEGMENT_HEADER_SIZE);
        let header = SegmentHeader::parse(&bytes, Some(3), Some(&TEST_STREAM)).unwrap();
        assert_eq!(header.base_marker, 500);
        assert_eq!(header.version, 2);
    }

    #[test]
    fn creating_an_existing_segment_fails() {
        let tmp = TempDir::new().unwrap();
        let _first = create(tmp.path(), 1, 0);
        let err = SegmentWriter::open_for_writing(tmp.path(), 1, &options(0)).unwrap_err();
        assert!(matches!(err, SegmentError::Io(_)));
    }

    #[test]
    fn append_reports_frame_length_and_grows_segment() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut writer = create(tmp.path(), 1, 0);

        assert_eq!(writer.append(b"hello", 10).unwrap(), frame_len(5));
        assert_eq!(writer.append(b"", 11).unwrap(), frame_len(0));
        assert_eq!(writer.chunks(), 2);
        assert_eq!(writer.max_marker(), Some(11));
        assert_eq!(
            writer.len(),
            SEGMENT_HEADER_SIZE as u64 + frame_len(5) + frame_len(0)
        );
        assert_eq!(fs::metadata(writer.path()).unwrap().len(), writer.len());
    }

    /// # Scenario
    /// Markers must strictly increase within a segment.
    ///
    /// # Starting environment
    /// Fresh segment with base marker 100.
    ///
    /// # Actions
    /// 1. Append below the base marker.
    /// 2. Append 100, then 100 again, then 99.
    /// 3. Append 101.
    ///
    /// # Expected behavior
    /// Step 1 and the repeats fail with `NonMonotonicMarker` and write
    /// nothing; 100 and 101 succeed.
    #[test]
    fn markers_must_strictly_increase() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut writer = create(tmp.path(), 1, 100);

        let err = writer.append(b"x", 99).unwrap_err();
        assert!(matches!(err, SegmentError::NonMonotonicMarker { last: 99, marker: 99 }));

        writer.append(b"a", 100).unwrap();
        let len = writer.len();
        for bad in [100, 99, 0] {
            let err = writer.append(b"b", bad).unwrap_err();
            assert!(matches!(err, SegmentError::NonMonotonicMarker { last: 100, .. }));
        }
        assert_eq!(writer.len(), len);
        assert_eq!(fs::metadata(writer.path()).unwrap().len(), len);

        writer.append(b"c", 101).unwrap();
        assert_eq!(writer.chunks(), 2);
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut writer = create(tmp.path(), 1, 0);
        let err = writer.append(&vec![0u8; 1025], 1).unwrap_err();
        assert!(matches!(err, SegmentError::ChunkTooLarge { len: 1025, max: 1024 }));
        writer.append(&vec![0u8; 1024], 1).unwrap();
    }

    /// # Scenario
    /// Sealing twice is a no-op and a sealed segment refuses appends.
    ///
    /// # Starting environment
    /// Segment with three chunks.
    ///
    /// # Actions
    /// 1. `prepare_for_close` twice.
    /// 2. Append.
    /// 3. `close` twice, then append again.
    ///
    /// # Expected behavior
    /// The file length does not change on the second seal; the scanner sees
    /// a sealed segment; appends fail with `Sealed`, then `Closed`.
    #[test]
    fn sealing_is_idempotent() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let mut writer = create(tmp.path(), 1, 0);
        for m in 1..=3 {
            writer.append(&payload_for(m, 20), m).unwrap();
        }

        writer.prepare_for_close().unwrap();
        let sealed_len = fs::metadata(writer.path()).unwrap().len();
        writer.prepare_for_close().unwrap();
        assert_eq!(fs::metadata(writer.path()).unwrap().len(), sealed_len);
        assert!(writer.is_sealed());
        assert!(!writer.is_closed());

        assert!(matches!(writer.append(b"late", 4), Err(SegmentError::Sealed)));

        writer.close().unwrap();
        writer.close().unwrap();
        assert!(writer.is_closed());
        assert!(matches!(writer.append(b"late", 4), Err(SegmentError::Closed)));

        let bytes = fs::read(writer.path()).unwrap();
        let report = IntegrityScanner::open(bytes.as_slice(), Some(1), None, ScanMode::Boundaries)
            .unwrap()
            .run()
            .unwrap();
        assert!(report.is_sealed());
        assert_eq!(report.chunks, 3);
        assert_eq!(report.max_marker, Some(3));
    }

    #[test]
    fn close_without_explicit_seal_seals() {
        let tmp = TempDir::new().unwrap();
        let mut writer = create(tmp.path(), 1, 0);
        writer.append(b"only", 1).unwrap();
        writer.close().unwrap();

        let info = SegmentInfo::probe(writer.path(), Some(&TEST_STREAM)).unwrap();
        assert!(info.sealed);
        assert_eq!(info.chunks, 1);
    }

    #[test]
    fn buffer_path_is_byte_identical() {
        init_tracing();
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir(&a).unwrap();
        fs::create_dir(&b).unwrap();

        let mut plain = create(&a, 1, 0);
        let mut framed = create(&b, 1, 0);
        let mut buf = ChunkBuffer::with_capacity(64);
        for m in 1..=5u64 {
            let payload = payload_for(m, (m * 7) as usize);
            plain.append(&payload, m).unwrap();

            buf.clear();
            buf.extend_from_slice(&payload);
            framed.append_buffer(&mut buf, m).unwrap();
        }
        plain.close().unwrap();
        framed.close().unwrap();

        assert_eq!(fs::read(plain.path()).unwrap(), fs::read(framed.path()).unwrap());
    }

    #[test]
    fn frames_on_disk_match_the_codec() {
        let tmp = TempDir::new().unwrap();
        let mut writer = create(tmp.path(), 1, 0);
        writer.append(b"abc", 42).unwrap();

        let bytes = fs::read(writer.path()).unwrap();
        let mut expected = Vec::new();
        encode_frame(b"abc", 42, &mut expected).unwrap();
        assert_eq!(&bytes[SEGMENT_HEADER_SIZE..], expected.as_slice());
    }

    #[test]
    fn legacy_writer_seals_with_legacy_trailer() {
        let tmp = TempDir::new().unwrap();
        let opts = SegmentOptions {
            trailer_format: TrailerFormat::Legacy,
            ..options(0)
        };
        let mut writer = SegmentWriter::open_for_writing(tmp.path(), 1, &opts).unwrap();
        writer.append(b"one", 1).unwrap();
        writer.append(b"two", 2).unwrap();
        writer.close().unwrap();

        let info = SegmentInfo::probe(writer.path(), None).unwrap();
        assert_eq!(info.header.version, 1);
        assert!(info.sealed);
        assert_eq!(info.first_marker, Some(1));
        assert_eq!(info.max_marker, Some(2));
    }
}
