//! The error surface of the core.
//!
//! The core never swallows a corruption error and never retries a logic
//! error. Transient allocation failures of in-memory bookkeeping do not
//! exist with std collections, so every error here reaches the caller.

use std::fmt;

/// Errors surfaced by the filesystem core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// The allocator failed after GC failed to free at least one segment.
    NoSpace,
    /// Checksum mismatch, impossible SIT delta, or a summary that
    /// disagrees with the NAT shape. Fatal at mount; forces read-only in
    /// steady state.
    Invalid,
    /// The requested object does not exist (unknown nid, unknown version).
    NoData,
    /// Media I/O failure. Unused on PM; kept for interface parity with
    /// block-device embedders.
    Io,
    /// The mount is read-only (snapshot mount or an earlier corruption).
    ReadOnly,
    /// The operation is not permitted on this mount.
    Permission,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NoSpace => write!(f, "no space left in the region"),
            FsError::Invalid => write!(f, "corrupt on-media structure"),
            FsError::NoData => write!(f, "no such object"),
            FsError::Io => write!(f, "media i/o failure"),
            FsError::ReadOnly => write!(f, "read-only filesystem"),
            FsError::Permission => write!(f, "operation not permitted"),
        }
    }
}

impl std::error::Error for FsError {}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, FsError>;
