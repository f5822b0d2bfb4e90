//! # chunklog
//!
//! An embeddable, segmented, append-only **chunk log** addressed by
//! monotonically increasing **markers** (log sequence numbers). Designed as
//! the persistent log beneath a restartable key/value store: fast appends,
//! bidirectional replay, random access by marker, and recovery from
//! unclean shutdowns.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chunklog::{Direction, Stream, StreamConfig};
//!
//! let stream = Stream::open("/tmp/my_log", StreamConfig::default()).unwrap();
//!
//! // Append chunks with strictly increasing markers.
//! stream.append(b"first", 100).unwrap();
//! stream.append(b"second", 110).unwrap();
//!
//! // Replay backwards from the end.
//! stream.seek_end().unwrap();
//! while let Some(chunk) = stream.read(Direction::Reverse).unwrap() {
//!     println!("{} => {:?}", chunk.marker(), chunk.bytes());
//! }
//!
//! // Ceiling lookup: least marker >= 105.
//! let reader = stream.random_reader().unwrap();
//! assert_eq!(reader.lookup(105).unwrap().unwrap().marker(), 110);
//!
//! // Graceful shutdown seals the write head.
//! stream.close().unwrap();
//! ```
//!
//! ## Features
//!
//! - **Self-checking frames**: every chunk is delimited by magics and a
//!   repeated length, so a torn tail is detected and cut on recovery.
//! - **Sealed segments**: a trailer with a jump list of chunk offsets gives
//!   indexed access without scanning.
//! - **Four readback strategies**: whole-file, streaming window, memory
//!   mapped, and a forward-only integrity scan for tooling.
//! - **Live tailing**: readers follow a segment while it is being written.
//! - **Retention**: trimming of old segments that defers to running backups.

pub mod chunk;
pub mod encoding;
pub mod frame;
pub mod index;
pub mod pool;
pub mod readback;
pub mod scan;
pub mod segment;
pub mod source;
pub mod stream;

#[cfg(test)]
pub(crate) mod test_utils;

use std::time::Duration;

pub use chunk::Chunk;
pub use frame::{ChunkBuffer, StreamId, TrailerFormat};
pub use pool::{BufferPool, PooledBuffer};
pub use readback::{
    AccessMethod, Direction, Readback, ReadbackError, ReadbackOptions, ReadbackStrategy,
    SeekPosition,
};
pub use scan::{ScanReport, Termination};
pub use stream::{
    BackupGuard, CleanOutcome, MarkerReader, Stream, StreamError, StreamStats,
};

use frame::FRAME_OVERHEAD;

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`Stream`].
///
/// All fields have sensible defaults via [`StreamConfig::default()`].
/// The configuration is validated when passed to [`Stream::open`].
///
/// # Example
///
/// ```rust
/// use chunklog::{AccessMethod, StreamConfig};
///
/// // Use defaults (64 MiB segments, mapped access)
/// let config = StreamConfig::default();
///
/// // Or customize
/// let config = StreamConfig {
///     segment_size: 1024 * 1024,
///     access_method: AccessMethod::Window,
///     sync_writes: false,
///     ..StreamConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Segment length in bytes at which the write head rotates.
    ///
    /// The bound is inclusive: an append that leaves the segment exactly
    /// this long seals it, and the next append starts a new segment. A
    /// single large chunk may carry a segment past the bound.
    ///
    /// Default: 64 MiB. Must be ≥ 1024.
    pub segment_size: u64,

    /// Largest accepted payload in bytes.
    ///
    /// Default: 16 MiB. Must be ≥ 1 and small enough for a whole frame to
    /// fit a `u32`.
    pub max_chunk_size: u64,

    /// Strategy for segments that are not read whole.
    ///
    /// Default: [`AccessMethod::Mapped`].
    pub access_method: AccessMethod,

    /// Sealed segments up to this many bytes are read into memory whole.
    ///
    /// Default: 8 MiB. `0` disables whole-file reads.
    pub whole_file_limit: u64,

    /// Trailer layout of new segments.
    ///
    /// Default: [`TrailerFormat::Compact`]. Both layouts are always readable.
    pub trailer_format: TrailerFormat,

    /// `fsync` after every append.
    ///
    /// Default: `true`.
    pub sync_writes: bool,

    /// Initial retention floor; the floor recorded in existing segments
    /// wins if it is higher.
    ///
    /// Default: 0.
    pub retention_floor: u64,

    /// Size of each pooled read buffer in bytes.
    ///
    /// Default: 64 KiB. Must exceed the 32-byte frame overhead when pooling
    /// is enabled.
    pub pool_block_size: usize,

    /// Number of pooled read buffers.
    ///
    /// Default: 16. `0` disables pooling.
    pub pool_capacity: usize,

    /// How long a read waits for a pooled buffer before allocating one.
    ///
    /// Default: zero (never wait).
    pub pool_wait: Duration,

    /// Identity the stream directory must carry.
    ///
    /// Default: `None` (adopt whatever the segments carry, or generate a
    /// new identity for an empty directory).
    pub expected_stream_id: Option<StreamId>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024,
            max_chunk_size: 16 * 1024 * 1024,
            access_method: AccessMethod::Mapped,
            whole_file_limit: 8 * 1024 * 1024,
            trailer_format: TrailerFormat::Compact,
            sync_writes: true,
            retention_floor: 0,
            pool_block_size: 64 * 1024,
            pool_capacity: 16,
            pool_wait: Duration::ZERO,
            expected_stream_id: None,
        }
    }
}

impl StreamConfig {
    /// Validates all configuration parameters.
    pub(crate) fn validate(&self) -> Result<(), StreamError> {
        if self.segment_size < 1024 {
            return Err(StreamError::InvalidConfig(
                "segment_size must be >= 1024".into(),
            ));
        }
        if self.max_chunk_size < 1 {
            return Err(StreamError::InvalidConfig(
                "max_chunk_size must be >= 1".into(),
            ));
        }
        if self.max_chunk_size > u64::from(u32::MAX) - FRAME_OVERHEAD as u64 {
            return Err(StreamError::InvalidConfig(
                "max_chunk_size must leave room for the frame within u32".into(),
            ));
        }
        if self.pool_capacity > 0 && self.pool_block_size <= FRAME_OVERHEAD {
            return Err(StreamError::InvalidConfig(
                "pool_block_size must exceed the frame overhead".into(),
            ));
        }
        Ok(())
    }
}
