//! Random access by marker alongside the writer.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;

    use crate::readback::Direction;
    use crate::stream::Stream;
    use crate::stream::tests::helpers::*;

    #[test]
    fn lookup_is_ceiling_across_segments() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, (1..=80u64).map(|i| i * 10));
        let reader = stream.random_reader().unwrap();

        for i in 1..=80u64 {
            let marker = i * 10;
            let chunk = reader.lookup(marker - 5).unwrap().unwrap();
            assert_eq!(chunk.marker(), marker);
            assert_eq!(chunk.bytes(), payload(marker).as_slice());
        }
        assert!(reader.lookup(801).unwrap().is_none());
        assert_eq!(reader.mapped_segments(), stream.stats().unwrap().segments);
    }

    #[test]
    fn lookup_leaves_read_head_alone() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, 1..=30);
        let reader = stream.random_reader().unwrap();

        assert_eq!(stream.read(Direction::Forward).unwrap().unwrap().marker(), 1);
        assert_eq!(reader.lookup(25).unwrap().unwrap().marker(), 25);
        assert_eq!(stream.read(Direction::Forward).unwrap().unwrap().marker(), 2);
    }

    #[test]
    fn lookup_sees_later_appends() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, [1]);
        let reader = stream.random_reader().unwrap();
        assert!(reader.lookup(2).unwrap().is_none());

        fill(&stream, 2..=50);
        assert_eq!(reader.lookup(2).unwrap().unwrap().marker(), 2);
        assert_eq!(reader.lookup(50).unwrap().unwrap().marker(), 50);
    }

    /// # Scenario
    /// Readers on several threads wait for markers a writer thread has not
    /// produced yet.
    ///
    /// # Starting environment
    /// Shared stream with markers 1..=5.
    ///
    /// # Actions
    /// 1. Four threads `scan_wait` for markers 20, 40, 60 and 80.
    /// 2. The writer appends 6..=80 with short pauses, rotating segments.
    ///
    /// # Expected behavior
    /// Every waiter gets exactly its marker well before the timeout.
    #[test]
    fn scan_wait_across_rotation() {
        let tmp = TempDir::new().unwrap();
        let stream = Arc::new(Stream::open(tmp.path(), small_segments()).unwrap());
        fill(&stream, 1..=5);
        let reader = Arc::new(stream.random_reader().unwrap());

        let waiters: Vec<_> = [20u64, 40, 60, 80]
            .into_iter()
            .map(|marker| {
                let reader = Arc::clone(&reader);
                thread::spawn(move || {
                    let chunk = reader
                        .scan_wait(marker, Duration::from_secs(10))
                        .unwrap()
                        .expect("marker arrives");
                    (marker, chunk.marker(), chunk.into_vec())
                })
            })
            .collect();

        let writer = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                for marker in 6..=80u64 {
                    stream.append(&payload(marker), marker).unwrap();
                    if marker % 10 == 0 {
                        thread::sleep(Duration::from_millis(2));
                    }
                }
            })
        };

        writer.join().unwrap();
        for waiter in waiters {
            let (wanted, got, bytes) = waiter.join().unwrap();
            assert_eq!(wanted, got);
            assert_eq!(bytes, payload(got));
        }
        assert!(stream.stats().unwrap().segments >= 2);
    }

    #[test]
    fn scan_wait_times_out() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, [1]);
        let reader = stream.random_reader().unwrap();

        let started = Instant::now();
        assert!(reader.scan_wait(2, Duration::from_millis(30)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn trimmed_segments_are_unmapped() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, 1..=100);
        let reader = stream.random_reader().unwrap();
        reader.lookup(1).unwrap().unwrap();
        reader.lookup(100).unwrap().unwrap();
        assert_eq!(reader.mapped_segments(), 2);

        stream.set_retention_floor(u64::MAX);
        stream.clean(Duration::ZERO).unwrap();

        // Old chunks are gone; lookups land in what is left.
        let chunk = reader.lookup(1).unwrap().unwrap();
        assert!(chunk.marker() > 1);
        assert_eq!(reader.mapped_segments(), 1);
    }

    #[test]
    fn reader_outlives_close() {
        let tmp = TempDir::new().unwrap();
        let stream = Stream::open(tmp.path(), small_segments()).unwrap();
        fill(&stream, 1..=20);
        let reader = stream.random_reader().unwrap();
        stream.close().unwrap();

        assert_eq!(reader.lookup(7).unwrap().unwrap().marker(), 7);
    }
}
