//! Garbage collection scenarios: victim selection, relocation, the GC
//! checkpoint, and the relocation crash window.

use super::*;
use crate::checkpoint::record::{set_fs_state, FsState};
use crate::gc::GcMode;
use crate::segment::curseg::CursegType;
use crate::segment::ssa::SumType;
use crate::util::constants::*;
use crate::util::memory;

/// Fill one data segment through a file, then strand a single live block
/// (slot `keep`) in it. Returns the inode and the victim segment.
fn strand_one_live_block(fs: &Pmlfs, keep: u16) -> (u32, u32) {
    let ino = fs.create_inode().unwrap();
    for i in 0..BLOCKS_IN_SEGMENT as u16 {
        fs.write_data_block(ino, i, &pattern(i as u8)).unwrap();
    }
    let first_data_addr = {
        let node = fs.nat.lookup_current(&fs.layout, ino);
        crate::nat::read_slot(&fs.layout, node, keep as usize)
    };
    let victim = fs.layout.seg_coord(first_data_addr).segno;
    let v = fs.write_checkpoint(false).unwrap();
    for i in 0..BLOCKS_IN_SEGMENT as u16 {
        if i != keep {
            fs.write_data_block(ino, i, &pattern(i as u8 ^ 0xa5)).unwrap();
        }
    }
    fs.write_checkpoint(false).unwrap();
    // Drop the old version so the overwritten copies become dead.
    fs.delete_checkpoint(v).unwrap();
    assert_eq!(fs.sm.sit.get_valid_blocks(victim), 1);
    (ino, victim)
}

#[test]
fn gc_relocates_the_last_live_block() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let keep = 13u16;
    let (ino, victim) = strand_one_live_block(&fs, keep);

    let selected = fs.select_victim(GcMode::Greedy).unwrap();
    assert_eq!(selected, victim);

    let alloc_before = fs.stats().alloc_block_count;
    let moved = fs.do_garbage_collect(victim).unwrap();
    assert_eq!(moved, 1);
    assert_eq!(fs.stats().alloc_block_count, alloc_before + 1);
    assert!(fs.sm.free.is_prefree(victim));

    // The survivor is reachable at its new address with the same payload.
    assert_eq!(read_block(&fs, ino, keep), pattern(keep as u8));
    let node = fs.nat.lookup_current(&fs.layout, ino);
    let new_addr = crate::nat::read_slot(&fs.layout, node, keep as usize);
    assert_ne!(fs.layout.seg_coord(new_addr).segno, victim);

    // The GC checkpoint turns the victim free.
    fs.write_checkpoint(true).unwrap();
    assert!(!fs.sm.free.is_prefree(victim));
    assert!(!fs.sm.free.is_inuse(victim));
}

#[test]
fn foreground_gc_runs_end_to_end() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let (ino, victim) = strand_one_live_block(&fs, 7);
    let reclaimed = fs.garbage_collect(true).unwrap();
    assert!(reclaimed >= 1);
    assert!(!fs.sm.free.is_inuse(victim));
    assert_eq!(read_block(&fs, ino, 7), pattern(7));
    drop(fs);
    // Everything survives a remount.
    let fs = mount_fs(&backing);
    assert_eq!(read_block(&fs, ino, 7), pattern(7));
}

#[test]
fn background_policy_prefers_cold_sparse_segments() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let (_ino, victim) = strand_one_live_block(&fs, 3);
    // Cost-benefit must also land on the nearly-empty segment here.
    let selected = fs.select_victim(GcMode::CostBenefit).unwrap();
    assert_eq!(selected, victim);
}

/// Crash between the relocation state write and the owner update: the
/// redo finishes the move at mount.
#[test]
fn interrupted_relocation_is_redone_at_mount() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(21)).unwrap();
    fs.write_checkpoint(false).unwrap();

    let node = fs.nat.lookup_current(&fs.layout, ino);
    let src = crate::nat::read_slot(&fs.layout, node, 0);
    let sum = fs.sm.summary_of(src).unwrap();
    let dst = fs
        .sm
        .allocate_block(CursegType::Data, sum.nid, sum.ofs_in_node, sum.ty, sum.start_version)
        .unwrap();
    memory::copy(fs.layout.addr(dst), fs.layout.addr(src), BYTES_IN_BLOCK);
    let head = fs.cm.head_info();
    set_fs_state(&fs.layout, head.cp_addr, FsState::GcData { src, dst });
    // Crash before any owner pointer was rewritten.
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(read_block(&fs, ino, 0), pattern(21));
    let node = fs.nat.lookup_current(&fs.layout, ino);
    assert_eq!(crate::nat::read_slot(&fs.layout, node, 0), dst);
    assert!(!fs.sm.summary_of(src).unwrap().valid);
    assert!(fs.sm.summary_of(dst).unwrap().valid);
    // Accounting healed: counts match summary bits everywhere.
    for segno in [fs.layout.seg_coord(src).segno, fs.layout.seg_coord(dst).segno] {
        let base = (segno as usize) << LOG_BLOCKS_IN_SEGMENT;
        let bits = (0..BLOCKS_IN_SEGMENT)
            .filter(|off| fs.sm.ssa.is_valid(base + off))
            .count() as u16;
        assert_eq!(fs.sm.sit.get_valid_blocks(segno), bits);
    }
}

/// A GC state pointing at a never-copied destination is abandoned.
#[test]
fn interrupted_relocation_with_torn_copy_is_abandoned() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(22)).unwrap();
    fs.write_checkpoint(false).unwrap();

    let node = fs.nat.lookup_current(&fs.layout, ino);
    let src = crate::nat::read_slot(&fs.layout, node, 0);
    // A destination whose summary does not mirror the source.
    let dst = fs
        .sm
        .allocate_block(CursegType::Data, 9999, 0, SumType::Data, 1)
        .unwrap();
    let head = fs.cm.head_info();
    set_fs_state(&fs.layout, head.cp_addr, FsState::GcData { src, dst });
    drop(fs);

    let fs = mount_fs(&backing);
    // The original mapping is untouched.
    assert_eq!(read_block(&fs, ino, 0), pattern(22));
    let node = fs.nat.lookup_current(&fs.layout, ino);
    assert_eq!(crate::nat::read_slot(&fs.layout, node, 0), src);
    assert!(fs.sm.summary_of(src).unwrap().valid);
}
