//! The on-media checkpoint record.
//!
//! A record is one block. Its recovery state and the two ring pointers
//! live in front of the sealed area: they are the only fields that change
//! after the record is written, and the state machine requires the state
//! words to sit in the first cache line so one flush persists them. The
//! checksum covers the sealed area only.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::layout::RegionLayout;
use crate::util::checksum::crc32;
use crate::util::constants::*;
use crate::util::persist;
use crate::util::{BlockAddr, FsError, Result};

/// In-progress work encoded in the head checkpoint so a crash anywhere is
/// recoverable. The argument pair carries the source/destination of the
/// operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsState {
    None,
    /// GC is relocating a data block: `{ src, dst }`.
    GcData { src: BlockAddr, dst: BlockAddr },
    /// GC is relocating a node or NAT block: `{ src, dst }`.
    GcNode { src: BlockAddr, dst: BlockAddr },
    /// GC is relocating a checkpoint block: `{ src, dst }`.
    CpGc { src: BlockAddr, dst: BlockAddr },
    /// A commit is in flight; the new record is at `new_cp`.
    AddCp { new_cp: BlockAddr },
}

const STATE_NONE: u32 = 0;
const STATE_GC_DATA: u32 = 1;
const STATE_GC_NODE: u32 = 2;
const STATE_CP_GC: u32 = 3;
const STATE_ADD_CP: u32 = 4;

/// Checkpoint record type.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::FromRepr)]
pub enum CpType {
    Normal = 0,
    Gc = 1,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct RawCheckpoint {
    // --- mutable head (excluded from the checksum) ---
    pub state: u32,
    _pad0: u32,
    pub state_arg_1: u64,
    pub state_arg_2: u64,
    pub prev_cp_addr: u64,
    pub next_cp_addr: u64,
    /// Written after the record is sealed, together with the journal
    /// entries themselves.
    pub sit_journal_len: u16,
    _pad1: u16,
    _pad2: u32,
    // --- sealed area ---
    pub checkpoint_ver: u32,
    pub checksum: u32,
    pub nat_addr: u64,
    pub valid_block_count: u64,
    pub alloc_block_count: u64,
    pub elapsed_time: u64,
    pub valid_inode_count: u32,
    pub valid_node_count: u32,
    pub free_segment_count: u32,
    pub cur_node_segno: u32,
    pub cur_data_segno: u32,
    pub next_scan_nid: u32,
    pub cur_node_blkoff: u16,
    pub cur_data_blkoff: u16,
    pub cp_type: u8,
    _pad3: [u8; 3],
    pub orphan_addrs: [u64; NUM_ORPHAN_BLOCKS],
}

static_assertions::assert_eq_size!(RawCheckpoint, [u8; 136]);
// One cache-line flush must cover the whole recovery state.
const _: () = assert!(std::mem::offset_of!(RawCheckpoint, state_arg_2) + 8 <= BYTES_IN_CACHELINE);
const _: () = assert!(std::mem::offset_of!(RawCheckpoint, prev_cp_addr) % 8 == 0);

const SEALED_START: usize = std::mem::offset_of!(RawCheckpoint, checkpoint_ver);

/// The inlined SIT journal entry. Entries fill the rest of the record's
/// block, after the fixed header.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct RawSitJournalEntry {
    pub segno: u32,
    pub vblocks: u16,
    _pad: u16,
    pub mtime: u32,
}

static_assertions::assert_eq_size!(RawSitJournalEntry, [u8; 12]);

/// Where the inlined SIT journal starts inside the checkpoint block.
pub const SIT_JOURNAL_OFFSET: usize = size_of::<RawCheckpoint>();
/// How many journal entries fit in one checkpoint block.
pub const SIT_JOURNAL_CAPACITY: usize =
    (BYTES_IN_BLOCK - SIT_JOURNAL_OFFSET) / size_of::<RawSitJournalEntry>();

impl RawSitJournalEntry {
    pub fn new(segno: u32, vblocks: u16, mtime: u32) -> Self {
        RawSitJournalEntry {
            segno: segno.to_le(),
            vblocks: vblocks.to_le(),
            _pad: 0,
            mtime: mtime.to_le(),
        }
    }
}

/// Reference a checkpoint record on media.
///
/// # Safety
/// `addr` must be a block inside the mapped region holding a record.
pub unsafe fn raw_cp(layout: &RegionLayout, addr: BlockAddr) -> &'static RawCheckpoint {
    layout.addr(addr).as_ref::<RawCheckpoint>()
}

impl RawCheckpoint {
    pub fn version(&self) -> u32 {
        u32::from_le(self.checkpoint_ver)
    }

    pub fn prev_addr(&self) -> BlockAddr {
        BlockAddr::from_raw(u64::from_le(self.prev_cp_addr))
    }

    pub fn next_addr(&self) -> BlockAddr {
        BlockAddr::from_raw(u64::from_le(self.next_cp_addr))
    }

    pub fn nat_root(&self) -> BlockAddr {
        BlockAddr::from_raw(u64::from_le(self.nat_addr))
    }

    pub fn orphan_addr(&self, i: usize) -> BlockAddr {
        BlockAddr::from_raw(u64::from_le(self.orphan_addrs[i]))
    }

    pub fn cp_type(&self) -> Result<CpType> {
        CpType::from_repr(self.cp_type).ok_or(FsError::Invalid)
    }

    fn sealed_bytes(&self) -> [u8; size_of::<RawCheckpoint>() - SEALED_START] {
        let mut copy = *self;
        copy.checksum = 0;
        let bytes = bytemuck::bytes_of(&copy);
        bytes[SEALED_START..].try_into().unwrap()
    }

    pub fn compute_checksum(&self) -> u32 {
        crc32(&self.sealed_bytes())
    }

    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = self.compute_checksum().to_le();
    }

    pub fn is_sealed(&self) -> bool {
        u32::from_le(self.checksum) == self.compute_checksum()
    }

    /// Decode the recovery state. An unknown tag is corruption.
    pub fn fs_state(&self) -> Result<FsState> {
        let a1 = BlockAddr::from_raw(u64::from_le(self.state_arg_1));
        let a2 = BlockAddr::from_raw(u64::from_le(self.state_arg_2));
        match u32::from_le(self.state) {
            STATE_NONE => Ok(FsState::None),
            STATE_GC_DATA => Ok(FsState::GcData { src: a1, dst: a2 }),
            STATE_GC_NODE => Ok(FsState::GcNode { src: a1, dst: a2 }),
            STATE_CP_GC => Ok(FsState::CpGc { src: a1, dst: a2 }),
            STATE_ADD_CP => Ok(FsState::AddCp { new_cp: a2 }),
            _ => Err(FsError::Invalid),
        }
    }
}

/// Encode a recovery state into the head record: arguments first, then
/// the tag, then one cache-line flush.
pub fn set_fs_state(layout: &RegionLayout, cp: BlockAddr, state: FsState) {
    let (tag, a1, a2) = match state {
        FsState::None => (STATE_NONE, BlockAddr::NULL, BlockAddr::NULL),
        FsState::GcData { src, dst } => (STATE_GC_DATA, src, dst),
        FsState::GcNode { src, dst } => (STATE_GC_NODE, src, dst),
        FsState::CpGc { src, dst } => (STATE_CP_GC, src, dst),
        FsState::AddCp { new_cp } => (STATE_ADD_CP, BlockAddr::NULL, new_cp),
    };
    // The tag makes the arguments observable; order the stores.
    unsafe {
        let base = layout.addr(cp);
        (base + std::mem::offset_of!(RawCheckpoint, state_arg_1)).store(a1.as_raw().to_le());
        (base + std::mem::offset_of!(RawCheckpoint, state_arg_2)).store(a2.as_raw().to_le());
        persist::fence();
        (base + std::mem::offset_of!(RawCheckpoint, state)).store(tag.to_le());
    }
    persist::persist_range(layout.addr(cp), BYTES_IN_CACHELINE);
}

/// The atomic cell backing a ring pointer, for the commit pointer swing.
///
/// # Safety
/// Only the checkpoint writer and mount-time recovery may store through
/// these cells, under `cp_mutex`.
pub unsafe fn ring_pointer_cell(
    layout: &RegionLayout,
    cp: BlockAddr,
    next: bool,
) -> &'static AtomicU64 {
    let offset = if next {
        std::mem::offset_of!(RawCheckpoint, next_cp_addr)
    } else {
        std::mem::offset_of!(RawCheckpoint, prev_cp_addr)
    };
    (layout.addr(cp) + offset).as_ref::<AtomicU64>()
}

/// Store one ring pointer (an individually-atomic 8-byte store) and
/// persist the cell.
pub fn store_ring_pointer(layout: &RegionLayout, cp: BlockAddr, next: bool, val: BlockAddr) {
    let cell = unsafe { ring_pointer_cell(layout, cp, next) };
    cell.store(val.as_raw().to_le(), Ordering::Release);
    let offset = if next {
        std::mem::offset_of!(RawCheckpoint, next_cp_addr)
    } else {
        std::mem::offset_of!(RawCheckpoint, prev_cp_addr)
    };
    persist::persist_u64(layout.addr(cp) + offset);
}

/// Read the inlined SIT journal of a record.
pub fn read_sit_journal(layout: &RegionLayout, cp: BlockAddr) -> Vec<(u32, u16, u32)> {
    let raw = unsafe { raw_cp(layout, cp) };
    // Clamp: the length word sits outside the sealed area.
    let len = (u16::from_le(raw.sit_journal_len) as usize).min(SIT_JOURNAL_CAPACITY);
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let entry: RawSitJournalEntry = unsafe {
            (layout.addr(cp) + SIT_JOURNAL_OFFSET + i * size_of::<RawSitJournalEntry>()).load()
        };
        out.push((
            u32::from_le(entry.segno),
            u16::from_le(entry.vblocks),
            u32::from_le(entry.mtime),
        ));
    }
    out
}

/// Write one inlined SIT journal entry.
pub fn write_sit_journal_entry(
    layout: &RegionLayout,
    cp: BlockAddr,
    i: usize,
    entry: RawSitJournalEntry,
) {
    debug_assert!(i < SIT_JOURNAL_CAPACITY);
    let addr = layout.addr(cp) + SIT_JOURNAL_OFFSET + i * size_of::<RawSitJournalEntry>();
    unsafe { addr.store(entry) };
    persist::persist_range(addr, size_of::<RawSitJournalEntry>());
}
