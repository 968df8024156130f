//! Mount paths: superblock healing, snapshot mounts, orphan replay.

use super::*;
use crate::layout::superblock::raw_super;
use crate::util::constants::*;
use crate::util::FsError;

#[test]
fn shadow_behind_is_healed_at_mount() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(30)).unwrap();

    // Snapshot the shadow, commit, then roll the shadow back: the crash
    // happened after the primary was updated but before the shadow copy.
    let shadow_addr = backing.base() + BYTES_IN_BLOCK;
    let stale: [u8; 64] = unsafe { shadow_addr.load() };
    let v = fs.write_checkpoint(false).unwrap();
    unsafe { shadow_addr.store(stale) };
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(fs.stats().head_version, v);
    assert_eq!(read_block(&fs, ino, 0), pattern(30));
    // Healed: the two copies agree again.
    let primary: [u8; 64] = unsafe { backing.base().load() };
    let shadow: [u8; 64] = unsafe { shadow_addr.load() };
    assert_eq!(primary, shadow);
}

#[test]
fn corrupt_primary_is_restored_from_shadow() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(31)).unwrap();
    let v = fs.write_checkpoint(false).unwrap();
    drop(fs);

    // Flip a byte in the primary.
    unsafe {
        let addr = backing.base() + 20usize;
        let byte: u8 = addr.load();
        addr.store(byte ^ 0xff);
    }
    let fs = mount_fs(&backing);
    assert_eq!(fs.stats().head_version, v);
    assert!(unsafe { raw_super(backing.base(), 0) }.is_valid());
}

#[test]
fn both_superblocks_corrupt_is_fatal() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    fs.unmount().unwrap();
    drop(fs);
    for which in 0..2 {
        unsafe {
            let addr = backing.base() + which * BYTES_IN_BLOCK + 20usize;
            let byte: u8 = addr.load();
            addr.store(byte ^ 0xff);
        }
    }
    let err = match crate::Pmlfs::mount(view(&backing), test_options("")) {
        Err(e) => e,
        Ok(_) => panic!("mount of a doubly-corrupt region must fail"),
    };
    assert_eq!(err, FsError::Invalid);
}

#[test]
fn orphan_replay_frees_the_inode() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(32)).unwrap();
    fs.write_data_block(ino, 1, &pattern(33)).unwrap();
    // The last link went away while the file was still open.
    fs.add_orphan_inode(ino).unwrap();
    fs.write_checkpoint(false).unwrap();
    let valid_before = fs.stats().valid_block_count;
    assert_eq!(valid_before, 3, "inode and two data blocks");
    // Crash before the handle is closed.
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(fs.stats().valid_inode_count, 0);
    assert_eq!(fs.stats().valid_block_count, valid_before - 3);
    assert_eq!(
        fs.read_data_block(ino, 0, &mut [0u8; 16]),
        Err(FsError::NoData)
    );
}

#[test]
fn clean_close_does_not_replay_the_orphan() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(34)).unwrap();
    fs.add_orphan_inode(ino).unwrap();
    fs.write_checkpoint(false).unwrap();
    // The handle closes normally: the inode is freed and forgotten.
    fs.free_inode(ino).unwrap();
    fs.remove_orphan_inode(ino);
    fs.write_checkpoint(false).unwrap();
    drop(fs);

    let fs = mount_fs(&backing);
    assert_eq!(fs.stats().valid_inode_count, 0);
    assert_eq!(fs.stats().valid_block_count, 0);
}

#[test]
fn snapshot_mount_reads_history_and_refuses_writes() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(40)).unwrap();
    let v1 = fs.write_checkpoint(false).unwrap();
    fs.write_data_block(ino, 0, &pattern(41)).unwrap();
    fs.write_checkpoint(false).unwrap();
    fs.unmount().unwrap();
    drop(fs);

    let ro = crate::Pmlfs::mount(
        view(&backing),
        test_options(&format!("mnt_cp_version={}", v1)),
    )
    .unwrap();
    assert!(ro.is_read_only());
    assert_eq!(read_block(&ro, ino, 0), pattern(40));
    assert_eq!(
        ro.write_data_block(ino, 0, &pattern(42)),
        Err(FsError::ReadOnly)
    );
    assert_eq!(ro.write_checkpoint(false), Err(FsError::ReadOnly));
    assert_eq!(ro.create_inode(), Err(FsError::ReadOnly));
    drop(ro);

    // A fresh head mount still sees the newest contents.
    let fs = mount_fs(&backing);
    assert_eq!(read_block(&fs, ino, 0), pattern(41));
}

#[test]
fn snapshot_mount_of_unknown_version_fails() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    fs.unmount().unwrap();
    drop(fs);
    let err = match crate::Pmlfs::mount(view(&backing), test_options("mnt_cp_version=77")) {
        Err(e) => e,
        Ok(_) => panic!("mounting an unknown version must fail"),
    };
    assert_eq!(err, FsError::Invalid);
}

#[test]
fn historical_reads_work_on_a_live_mount() {
    let backing = fresh_backing();
    let fs = format_fs(&backing);
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &pattern(50)).unwrap();
    let v1 = fs.write_checkpoint(false).unwrap();
    fs.write_data_block(ino, 0, &pattern(51)).unwrap();
    fs.write_checkpoint(false).unwrap();

    let mut out = vec![0u8; BYTES_IN_BLOCK];
    fs.read_data_block_at(v1, ino, 0, &mut out).unwrap();
    assert_eq!(out, pattern(50));
    assert_eq!(read_block(&fs, ino, 0), pattern(51));
}
