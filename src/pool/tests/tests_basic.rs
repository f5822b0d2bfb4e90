//! Buffer pool contract tests.
//!
//! Coverage:
//! - Buffers are allocated lazily and reused after release
//! - Oversized requests and exhaustion return `None` instead of failing
//! - A bounded wait is satisfied by a buffer released on another thread

#[cfg(test)]
mod tests {
    use crate::pool::BufferPool;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn buffers_are_reused_after_drop() {
        let pool = BufferPool::new(1024, 2, Duration::ZERO);
        assert_eq!(pool.allocated(), 0);

        let mut a = pool.acquire(100).expect("first buffer");
        a.extend_from_slice(b"payload");
        assert_eq!(pool.allocated(), 1);
        drop(a);
        assert_eq!(pool.idle(), 1);

        let b = pool.acquire(10).expect("reused buffer");
        assert!(b.is_empty(), "released buffers come back cleared");
        assert!(b.capacity() >= 1024);
        assert_eq!(pool.allocated(), 1);
    }

    #[test]
    fn oversized_request_is_refused() {
        let pool = BufferPool::new(64, 4, Duration::ZERO);
        assert!(pool.acquire(65).is_none());
        assert_eq!(pool.allocated(), 0);
        assert!(pool.acquire(64).is_some());
    }

    #[test]
    fn exhausted_pool_returns_none_without_wait() {
        let pool = BufferPool::new(64, 2, Duration::ZERO);
        let a = pool.acquire(1).unwrap();
        let b = pool.acquire(1).unwrap();
        assert!(pool.acquire(1).is_none());
        drop(a);
        assert!(pool.acquire(1).is_some());
        drop(b);
    }

    #[test]
    fn zero_capacity_pool_never_lends() {
        let pool = BufferPool::new(64, 0, Duration::ZERO);
        assert!(pool.acquire(1).is_none());
    }

    #[test]
    fn bounded_wait_times_out() {
        let pool = BufferPool::new(64, 1, Duration::from_millis(50));
        let _held = pool.acquire(1).unwrap();

        let start = Instant::now();
        assert!(pool.acquire(1).is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn bounded_wait_is_woken_by_release() {
        let pool = BufferPool::new(64, 1, Duration::from_secs(5));
        let held = pool.acquire(1).unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(held);
        });

        let start = Instant::now();
        let buf = pool.acquire(1);
        assert!(buf.is_some());
        assert!(start.elapsed() < Duration::from_secs(5));
        releaser.join().unwrap();
    }
}
