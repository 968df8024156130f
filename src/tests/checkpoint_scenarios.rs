//! Commit-protocol scenarios, including the crash windows of the
//! pointer-swing sequence.

use super::*;
use crate::checkpoint::record::{raw_cp, set_fs_state, FsState, RawCheckpoint};
use crate::util::{BlockAddr, FsError};

#[test]
fn fresh_format_write_unmount_remount() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    let payload = pattern(0);
    fs.write_data_block(ino, 0, &payload).unwrap();
    fs.write_checkpoint(false).unwrap();
    assert_eq!(fs.stats().valid_block_count, 2, "one inode, one data block");
    fs.unmount().unwrap();
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(read_block(&fs, ino, 0), payload);
    assert_eq!(fs.stats().valid_block_count, 2);
    assert_eq!(fs.stats().valid_inode_count, 1);
}

#[test]
fn commit_survives_remount_per_version() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(1)).unwrap();
    let v2 = fs.write_checkpoint(false).unwrap();
    fs.write_data_block(ino, 0, &pattern(2)).unwrap();
    let v3 = fs.write_checkpoint(false).unwrap();
    assert_eq!(v3, v2 + 1);
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(fs.stats().head_version, v3);
    assert_eq!(read_block(&fs, ino, 0), pattern(2));
}

/// Crash after the new record's body was written but before the commit
/// was announced on the old head: the record is unreachable garbage and
/// the old head stays.
#[test]
fn crash_before_commit_announcement_keeps_old_head() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(3)).unwrap();
    let head_before = fs.write_checkpoint(false).unwrap();
    let inodes_before = fs.stats().valid_inode_count;

    // Start another commit by hand and stop before set_fs_state: the
    // gc_cp flavour of the prepare stage writes the body without
    // announcing, which is exactly the crash window.
    fs.write_data_block(ino, 1, &pattern(4)).unwrap();
    let prev = fs.cm.head_info();
    let version = fs.cm.new_version();
    let nat_root = fs.nat.flush(&fs.layout, &fs.sm, version).unwrap();
    fs.prepare_cp_block(&prev, version, nat_root, &[], true)
        .unwrap();
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(fs.stats().head_version, head_before);
    assert_eq!(fs.stats().valid_inode_count, inodes_before);
    // The interrupted write never reached a checkpoint.
    assert_eq!(
        fs.read_data_block(ino, 1, &mut [0u8; 16]),
        Err(FsError::NoData)
    );
    assert_eq!(read_block(&fs, ino, 0), pattern(3));
    // The filesystem keeps working.
    fs.write_data_block(ino, 1, &pattern(5)).unwrap();
    fs.write_checkpoint(false).unwrap();
    assert_eq!(read_block(&fs, ino, 1), pattern(5));
}

/// Crash in ADD_CP with a fully formed record: recovery completes the
/// pointer swings and advances the head.
#[test]
fn crash_after_sealed_record_completes_commit() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(6)).unwrap();
    let head_before = fs.write_checkpoint(false).unwrap();

    fs.write_data_block(ino, 1, &pattern(7)).unwrap();
    let prev = fs.cm.head_info();
    let version = fs.cm.new_version();
    let nat_root = fs.nat.flush(&fs.layout, &fs.sm, version).unwrap();
    let orphan_addrs = fs.flush_orphan_inodes(version).unwrap();
    let cp_addr = fs
        .prepare_cp_block(&prev, version, nat_root, &orphan_addrs, false)
        .unwrap();
    fs.flush_sit_entries(cp_addr, nat_root, false);
    fs.publish_new_blocks(cp_addr, nat_root, version, &orphan_addrs)
        .unwrap();
    // Crash before the pointer swing.
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(fs.stats().head_version, head_before + 1);
    assert_eq!(read_block(&fs, ino, 1), pattern(7));
    assert_eq!(read_block(&fs, ino, 0), pattern(6));
}

/// Crash in ADD_CP with a torn record: the commit is abandoned and the
/// old head stays valid.
#[test]
fn crash_with_torn_record_abandons_commit() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(8)).unwrap();
    let head_before = fs.write_checkpoint(false).unwrap();

    fs.write_data_block(ino, 1, &pattern(9)).unwrap();
    let prev = fs.cm.head_info();
    let version = fs.cm.new_version();
    let nat_root = fs.nat.flush(&fs.layout, &fs.sm, version).unwrap();
    let cp_addr = fs
        .prepare_cp_block(&prev, version, nat_root, &[], false)
        .unwrap();
    // Tear the record: flip a sealed byte so the checksum fails.
    let addr = fs.layout.addr(cp_addr) + std::mem::offset_of!(RawCheckpoint, valid_block_count);
    unsafe { addr.store(u64::MAX) };
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(fs.stats().head_version, head_before);
    let head = fs.cm.head_info();
    let state = unsafe { raw_cp(&fs.layout, head.cp_addr) }.fs_state().unwrap();
    assert_eq!(state, FsState::None);
    assert_eq!(read_block(&fs, ino, 0), pattern(8));
    fs.write_checkpoint(false).unwrap();
}

#[test]
fn deleting_the_head_is_refused() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let head = fs.stats().head_version;
    assert_eq!(fs.delete_checkpoint(head), Err(FsError::Permission));
    assert_eq!(fs.delete_checkpoint(head + 10), Err(FsError::NoData));
}

#[test]
fn version_index_walks_the_ring() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(10)).unwrap();
    let v2 = fs.write_checkpoint(false).unwrap();
    fs.write_data_block(ino, 0, &pattern(11)).unwrap();
    let v3 = fs.write_checkpoint(false).unwrap();

    let info = fs.cm.get_checkpoint_info(&fs.layout, v2, false).unwrap();
    assert_eq!(info.version, v2);
    assert!(fs
        .cm
        .get_checkpoint_info(&fs.layout, v3 + 1, false)
        .is_none());

    fs.delete_checkpoint(v2).unwrap();
    // Exact lookup now misses; no_fail resolves to the next version up.
    assert!(fs.cm.get_checkpoint_info(&fs.layout, v2, false).is_none());
    let next = fs.cm.get_checkpoint_info(&fs.layout, v2, true).unwrap();
    assert_eq!(next.version, v3);
}

#[test]
fn deleting_a_checkpoint_frees_only_its_blocks() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(12)).unwrap();
    fs.write_data_block(ino, 1, &pattern(13)).unwrap();
    let v2 = fs.write_checkpoint(false).unwrap();
    // Overwrite one of the two blocks; the other stays shared with v2.
    fs.write_data_block(ino, 0, &pattern(14)).unwrap();
    fs.write_checkpoint(false).unwrap();

    let shared = {
        let node = fs.nat.lookup_current(&fs.layout, ino);
        crate::nat::read_slot(&fs.layout, node, 1)
    };
    let valid_before = fs.stats().valid_block_count;
    fs.delete_checkpoint(v2).unwrap();
    // The shared data block survives; both file blocks still read back.
    assert!(fs.sm.summary_of(shared).unwrap().valid);
    assert_eq!(read_block(&fs, ino, 0), pattern(14));
    assert_eq!(read_block(&fs, ino, 1), pattern(13));
    assert!(fs.stats().valid_block_count < valid_before);
}

#[test]
fn orphan_list_serializes_sorted() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let a = fs.create_inode().unwrap();
    let b = fs.create_inode().unwrap();
    fs.add_orphan_inode(b).unwrap();
    fs.add_orphan_inode(a).unwrap();
    fs.write_checkpoint(false).unwrap();

    let head = fs.cm.head_info();
    let raw = unsafe { raw_cp(&fs.layout, head.cp_addr) };
    let block = raw.orphan_addr(0);
    assert!(!block.is_null());
    assert_eq!(
        crate::checkpoint::orphan::read_orphan_block(&fs.layout, block),
        vec![a, b]
    );
    // The back-pointer names the owning record.
    let backptr: u64 = unsafe { fs.layout.addr(block).load() };
    assert_eq!(BlockAddr::from_raw(u64::from_le(backptr)), head.cp_addr);
}

/// An interrupted GC state write must never survive a clean commit: the
/// state returns to NONE when the commit finishes.
#[test]
fn commit_clears_previous_head_state() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(15)).unwrap();
    fs.write_checkpoint(false).unwrap();
    let old_head = fs.cm.head_info().cp_addr;
    set_fs_state(
        &fs.layout,
        old_head,
        FsState::AddCp {
            new_cp: BlockAddr::NULL,
        },
    );
    set_fs_state(&fs.layout, old_head, FsState::None);
    fs.write_data_block(ino, 0, &pattern(16)).unwrap();
    fs.write_checkpoint(false).unwrap();
    let state = unsafe { raw_cp(&fs.layout, old_head) }.fs_state().unwrap();
    assert_eq!(state, FsState::None);
}
