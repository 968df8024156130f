//! Public-API smoke tests: format, write, remount, snapshot-mount.

use pmlfs::{FsError, Options, PmRegion, Pmlfs};

const BLOCK: usize = 4096;

fn options(extra: &str) -> Options {
    let mut options = Options::default();
    assert!(options.set_bulk_from_str("bg_gc=false"));
    if !extra.is_empty() {
        assert!(options.set_bulk_from_str(extra));
    }
    options
}

fn view(backing: &PmRegion) -> PmRegion {
    unsafe { PmRegion::from_raw(backing.base(), backing.size()) }.unwrap()
}

#[test]
fn format_write_remount_read() {
    let backing = PmRegion::map_anonymous(32 << 20).unwrap();
    let payload: Vec<u8> = (0..BLOCK).map(|i| i as u8).collect();

    let fs = Pmlfs::format(view(&backing), options("")).unwrap();
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &payload).unwrap();
    fs.unmount().unwrap();
    drop(fs);

    let fs = Pmlfs::mount(view(&backing), options("")).unwrap();
    let mut out = vec![0u8; BLOCK];
    fs.read_data_block(ino, 0, &mut out).unwrap();
    assert_eq!(out, payload);
    let stats = fs.stats();
    assert_eq!(stats.valid_block_count, 2);
    assert_eq!(stats.valid_inode_count, 1);
}

#[test]
fn snapshot_mount_is_read_only() {
    let backing = PmRegion::map_anonymous(32 << 20).unwrap();
    let fs = Pmlfs::format(view(&backing), options("")).unwrap();
    let ino = fs.create_inode().unwrap();
    fs.write_data_block(ino, 0, &[1u8; BLOCK]).unwrap();
    let v = fs.write_checkpoint(false).unwrap();
    fs.write_data_block(ino, 0, &[2u8; BLOCK]).unwrap();
    fs.unmount().unwrap();
    drop(fs);

    let ro = Pmlfs::mount(view(&backing), options(&format!("mnt_cp_version={v}"))).unwrap();
    let mut out = vec![0u8; BLOCK];
    ro.read_data_block(ino, 0, &mut out).unwrap();
    assert!(out.iter().all(|b| *b == 1));
    assert_eq!(
        ro.write_data_block(ino, 0, &[3u8; BLOCK]),
        Err(FsError::ReadOnly)
    );
}

#[test]
fn out_of_space_surfaces_cleanly() {
    // A small region, filled with live data GC cannot reclaim.
    let fs = Pmlfs::format(PmRegion::map_anonymous(4 << 20).unwrap(), options("")).unwrap();
    let mut ino = fs.create_inode().unwrap();
    let mut wrote = 0u32;
    let err = loop {
        match fs.write_data_block(ino, (wrote % 512) as u16, &[7u8; BLOCK]) {
            Ok(()) => {
                wrote += 1;
                if wrote % 512 == 0 {
                    match fs.create_inode() {
                        Ok(next) => ino = next,
                        Err(e) => break e,
                    }
                }
            }
            Err(e) => break e,
        }
        if wrote > 1 << 13 {
            panic!("never ran out of space");
        }
    };
    assert_eq!(err, FsError::NoSpace);
}
