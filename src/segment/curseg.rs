//! The two current segments: the node stream and the data stream. Each
//! stream keeps its own preallocated next segment so that the transition
//! to a new segment never fails during a write under lock.

use enum_map::Enum;

use crate::util::constants::NULL_SEGNO;

/// The two bump-pointer allocation streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum CursegType {
    Node,
    Data,
}

/// The state of one stream. Guarded by its own mutex in the segment
/// manager; the two stream locks are never held simultaneously.
#[derive(Debug, Clone, Copy)]
pub struct CursegInfo {
    /// Current segment number.
    pub segno: u32,
    /// Next block offset to write.
    pub next_blkoff: u16,
    /// Preallocated segment, `NULL_SEGNO` if the refill failed.
    pub next_segno: u32,
}

impl CursegInfo {
    pub fn new(segno: u32, next_blkoff: u16, next_segno: u32) -> Self {
        CursegInfo {
            segno,
            next_blkoff,
            next_segno,
        }
    }

    pub fn unset() -> Self {
        CursegInfo {
            segno: NULL_SEGNO,
            next_blkoff: 0,
            next_segno: NULL_SEGNO,
        }
    }
}
