//! A general-purpose resource allocator arena in the Bonwick-Adams "VMem"
//! style: partitions an integer-addressed resource range into boundary-
//! tagged segments and services aligned allocation requests under either
//! an instant-fit or a best-fit policy while keeping fragmentation bounded
//! through coalescing on free.

mod arena;
mod error;
mod fit;
mod flags;
mod os;
mod pool;
mod segment;
mod stats;

pub use arena::{Arena, ImportSource};
pub use error::Error;
pub use fit::Constraints;
pub use flags::Flags;
pub use os::{HeapPageSource, PageSource};
pub use pool::bootstrap;
pub use stats::{ArenaStats, PoolStats};

#[cfg(unix)]
pub use os::UnixMmapPageSource;
