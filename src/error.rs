//! Error kinds returned at the public boundary (spec §7).

use thiserror::Error;

/// Failure modes of the public arena operations.
///
/// `xfree` never returns this type: a corrupt free is a programming-contract
/// violation and is handled with a `debug_assert!`/`panic!` instead (spec §7:
/// "a corrupt call is undefined behavior and may abort").
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// No free segment satisfies the constraint tuple after a full traversal
    /// of the free-size index.
    #[error("no free segment satisfies the allocation constraints")]
    NoSpace,

    /// Zero size, non-quantum-aligned size/align, conflicting policy flags,
    /// or unsupported `nocross`.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The segment pool could not be refilled from the page supplier.
    #[error("segment pool exhausted and could not be refilled")]
    PoolExhausted,

    /// A tiling or hash invariant was found broken. Debug builds should
    /// prefer aborting via `debug_assert!` at the point of detection over
    /// returning this; it exists for callers that want to surface the
    /// violation instead of crashing in release builds.
    #[error("arena corruption detected: {0}")]
    Corruption(&'static str),
}
