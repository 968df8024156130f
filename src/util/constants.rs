//! Constants that define the shape of the on-media layout.

/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: u8 = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a block. A block is the unit of allocation.
pub const LOG_BYTES_IN_BLOCK: usize = 12;
/// The number of bytes in a block
pub const BYTES_IN_BLOCK: usize = 1 << LOG_BYTES_IN_BLOCK;

/// log2 of the number of blocks in a segment. A segment is the unit of
/// space reclamation and the granularity of the free/prefree maps.
pub const LOG_BLOCKS_IN_SEGMENT: usize = 6;
/// The number of blocks in a segment
pub const BLOCKS_IN_SEGMENT: usize = 1 << LOG_BLOCKS_IN_SEGMENT;
/// log2 of the number of bytes in a segment
pub const LOG_BYTES_IN_SEGMENT: usize = LOG_BYTES_IN_BLOCK + LOG_BLOCKS_IN_SEGMENT;
/// The number of bytes in a segment
pub const BYTES_IN_SEGMENT: usize = 1 << LOG_BYTES_IN_SEGMENT;

/// log2 of the number of 8-byte address slots in a block. Node blocks and
/// NAT tree blocks are arrays of this many slots.
pub const LOG_SLOTS_IN_BLOCK: usize = LOG_BYTES_IN_BLOCK - 3;
/// The number of 8-byte address slots in a block
pub const SLOTS_IN_BLOCK: usize = 1 << LOG_SLOTS_IN_BLOCK;

/// Sentinel segment number.
pub const NULL_SEGNO: u32 = u32::MAX;

/// The number of bytes in a cache line. The recovery state of a checkpoint
/// record must fit in the first one so it can be persisted with one flush.
pub const BYTES_IN_CACHELINE: usize = 64;

/// How many orphan blocks a single checkpoint may reference.
pub const NUM_ORPHAN_BLOCKS: usize = 2;

/// Upper bound of victim candidates examined per selection pass.
pub const MAX_SEG_SEARCH: usize = 16;
/// Upper bound of extra victim candidates examined under severe pressure.
pub const NR_MAX_FG_SEGS: usize = 200;

/// Percentage of invalid blocks over user space above which GC is worthwhile.
pub const LIMIT_INVALID_BLOCKS: usize = 50;
/// Percentage of free blocks over user space below which allocation is
/// considered under pressure.
pub const LIMIT_FREE_BLOCKS: usize = 50;
/// Percentage of free blocks over user space below which victim scans go deep.
pub const SEVERE_FREE_BLOCKS: usize = 75;

/// The magic number in the superblock.
pub const SUPER_MAGIC: u32 = 0x504d_4c46;

/// Default height of the node address table. Capacity is
/// `SLOTS_IN_BLOCK ^ height` node ids.
pub const DEFAULT_NAT_HEIGHT: u8 = 2;
/// Maximum representable NAT height: the top 5 bits of a summary `nid`
/// carry the height of interior NAT blocks.
pub const MAX_NAT_HEIGHT: u8 = 31;
