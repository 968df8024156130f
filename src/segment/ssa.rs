//! Segment Summary Area: one reverse pointer per main-area block.
//!
//! A summary is written when its block is allocated (valid bit clear) and
//! the valid bit is set when the checkpoint that publishes the block
//! commits. Clearing the valid bit is part of invalidation and happens
//! exactly once, together with the SIT valid-count decrement.

use bytemuck::{Pod, Zeroable};
use std::mem::size_of;
use std::sync::atomic::{AtomicU8, Ordering};
use strum_macros::{EnumIter, FromRepr};

use crate::util::constants::*;
use crate::util::persist;
use crate::util::{Address, FsError, Result};

/// What a block holds. The tag decides which stream the block came from
/// and how GC resolves its owner.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, EnumIter)]
pub enum SumType {
    Inode = 0,
    Data = 1,
    Indirect = 2,
    NatNode = 3,
    NatData = 4,
    Checkpoint = 5,
    Orphan = 6,
    XData = 7,
}

impl SumType {
    /// Blocks that count towards `valid_block_count` (user data, not
    /// filesystem metadata).
    pub fn is_user(self) -> bool {
        matches!(self, SumType::Inode | SumType::Data | SumType::Indirect | SumType::XData)
    }

    /// Data-stream blocks; everything else allocates from the node stream.
    pub fn is_data_stream(self) -> bool {
        matches!(self, SumType::Data | SumType::XData)
    }
}

/// For interior NAT blocks the summary `nid` encodes the tree height in
/// the top 5 bits and the subtree index in the low 27.
pub fn nat_nid(height: u8, index: u32) -> u32 {
    debug_assert!(height <= MAX_NAT_HEIGHT);
    debug_assert!(index < 1 << 27);
    ((height as u32) << 27) | index
}

pub fn nat_nid_height(nid: u32) -> u8 {
    (nid >> 27) as u8
}

pub fn nat_nid_index(nid: u32) -> u32 {
    nid & ((1 << 27) - 1)
}

/// The on-media summary entry. Fixed-width little-endian.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct RawSummary {
    pub nid: u32,
    pub start_version: u32,
    pub ofs_in_node: u16,
    pub sum_type: u8,
    pub valid: u8,
    _pad: u32,
}

static_assertions::assert_eq_size!(RawSummary, [u8; 16]);

/// A decoded summary.
#[derive(Debug, Clone, Copy)]
pub struct Summary {
    pub nid: u32,
    pub start_version: u32,
    pub ofs_in_node: u16,
    pub ty: SumType,
    pub valid: bool,
}

/// The summary array. Indexed directly by global block index.
pub struct Ssa {
    base: Address,
    entries: usize,
}

impl Ssa {
    pub fn new(base: Address, entries: usize) -> Self {
        Ssa { base, entries }
    }

    fn entry_addr(&self, index: usize) -> Address {
        debug_assert!(index < self.entries);
        self.base + index * size_of::<RawSummary>()
    }

    fn valid_cell(&self, index: usize) -> &AtomicU8 {
        let addr = self.entry_addr(index) + std::mem::offset_of!(RawSummary, valid);
        unsafe { addr.as_ref::<AtomicU8>() }
    }

    /// Write a whole summary for a freshly allocated block. The block is
    /// exclusively owned by the allocating writer at this point.
    pub fn make_entry(&self, index: usize, nid: u32, version: u32, ofs_in_node: u16, ty: SumType) {
        let raw = RawSummary {
            nid: nid.to_le(),
            start_version: version.to_le(),
            ofs_in_node: ofs_in_node.to_le(),
            sum_type: ty as u8,
            valid: 0,
            _pad: 0,
        };
        let addr = self.entry_addr(index);
        unsafe { addr.store(raw) };
        persist::persist_range(addr, size_of::<RawSummary>());
    }

    /// Decode a summary. A type tag outside the enum is corruption.
    pub fn read(&self, index: usize) -> Result<Summary> {
        let raw: RawSummary = unsafe { self.entry_addr(index).load() };
        let ty = SumType::from_repr(raw.sum_type).ok_or(FsError::Invalid)?;
        Ok(Summary {
            nid: u32::from_le(raw.nid),
            start_version: u32::from_le(raw.start_version),
            ofs_in_node: u16::from_le(raw.ofs_in_node),
            ty,
            valid: raw.valid & 1 != 0,
        })
    }

    pub fn is_valid(&self, index: usize) -> bool {
        self.valid_cell(index).load(Ordering::Acquire) & 1 != 0
    }

    /// Publish a block: set its valid bit.
    pub fn set_valid(&self, index: usize) {
        self.valid_cell(index).store(1, Ordering::Release);
        persist::persist_range(
            self.entry_addr(index) + std::mem::offset_of!(RawSummary, valid),
            1,
        );
    }

    /// Clear the valid bit. Returns whether it was set.
    pub fn clear_valid(&self, index: usize) -> bool {
        let old = self.valid_cell(index).swap(0, Ordering::AcqRel);
        persist::persist_range(
            self.entry_addr(index) + std::mem::offset_of!(RawSummary, valid),
            1,
        );
        old & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_round_trip() {
        use strum::IntoEnumIterator;
        for ty in SumType::iter() {
            assert_eq!(SumType::from_repr(ty as u8), Some(ty));
        }
    }

    #[test]
    fn nid_encoding_round_trips() {
        let nid = nat_nid(5, 0x123);
        assert_eq!(nat_nid_height(nid), 5);
        assert_eq!(nat_nid_index(nid), 0x123);
    }

    #[test]
    fn entry_round_trip() {
        let backing = vec![0u8; 4 * size_of::<RawSummary>()];
        let ssa = Ssa::new(Address::from_ptr(backing.as_ptr()), 4);
        ssa.make_entry(2, 42, 7, 3, SumType::Data);
        let sum = ssa.read(2).unwrap();
        assert_eq!(sum.nid, 42);
        assert_eq!(sum.start_version, 7);
        assert_eq!(sum.ofs_in_node, 3);
        assert_eq!(sum.ty, SumType::Data);
        assert!(!sum.valid);
        ssa.set_valid(2);
        assert!(ssa.is_valid(2));
        assert!(ssa.clear_valid(2));
        assert!(!ssa.clear_valid(2));
    }

    #[test]
    fn bad_type_tag_is_corruption() {
        let backing = vec![0xffu8; size_of::<RawSummary>()];
        let ssa = Ssa::new(Address::from_ptr(backing.as_ptr()), 1);
        assert!(ssa.read(0).is_err());
    }
}
