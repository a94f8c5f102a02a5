//! Pooled message buffers.
//!
//! # Data Flow
//! ```text
//! Connection read
//!     → pool.rs (take a fixed-size block from the current generation)
//!     → block.rs (freeze into a shared MessageBlock, stamp receive times)
//!     → tunnel listeners and the peer connection's write queue
//!       (duplicate() shares the payload, no copy)
//!     → last owner dropped → block returns to its generation
//!
//! Latency:
//!     block timestamps → latency.rs (current / previous / lifetime periods)
//! ```
//!
//! # Design Decisions
//! - Reference counting is the `Arc` strong count, metadata is a plain field
//! - A generation that grew stays alive until its last block is released
//! - Free lists sit behind a spin mutex; critical sections are a push or a pop

pub mod block;
pub mod latency;
pub mod pool;
pub mod spin;

pub use block::MessageBlock;
pub use latency::{LatencyStat, MessageBlocksLatencyStat};
pub use pool::{MessagePool, PoolConfig, PooledBytes};

/// Default data block size, the minimum IPv4 MTU every host must accept.
pub const DEFAULT_DATA_BLOCK_SIZE: usize = 576;

/// Default per-connection pool budget in bytes.
pub const DEFAULT_CONNECTION_BUFFER_SIZE: usize = 150 * 1024;

/// Bytes that may sit in a peer's write queue before reading is suspended.
pub const MESSAGE_QUEUE_BUFFER_SIZE: usize = 256 * 1024;
