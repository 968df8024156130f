//! Scenario and property tests: full-stack exercises over a small mapped
//! region, including the crash windows of the commit protocol and GC.

mod checkpoint_scenarios;
mod gc_scenarios;
mod mount_scenarios;

use std::sync::Arc;

use crate::util::constants::BYTES_IN_BLOCK;
use crate::util::memory::PmRegion;
use crate::util::options::Options;
use crate::util::test_util::small_region;
pub(crate) use crate::Pmlfs;

/// Deterministic tests run without the background worker.
pub(crate) fn test_options(extra: &str) -> Options {
    let mut options = Options::default();
    assert!(options.set_bulk_from_str("bg_gc=false"));
    if !extra.is_empty() {
        assert!(options.set_bulk_from_str(extra));
    }
    options
}

/// A non-owning view of a backing region, so tests can unmount and
/// remount the same media.
pub(crate) fn view(backing: &PmRegion) -> PmRegion {
    unsafe { PmRegion::from_raw(backing.base(), backing.size()) }.unwrap()
}

pub(crate) fn fresh_backing() -> PmRegion {
    small_region()
}

pub(crate) fn format_fs(backing: &PmRegion) -> Arc<Pmlfs> {
    Pmlfs::format(view(backing), test_options("")).unwrap()
}

pub(crate) fn mount_fs(backing: &PmRegion) -> Arc<Pmlfs> {
    Pmlfs::mount(view(backing), test_options("")).unwrap()
}

/// One block of a repeating byte pattern.
pub(crate) fn pattern(seed: u8) -> Vec<u8> {
    (0..BYTES_IN_BLOCK)
        .map(|i| (i as u8).wrapping_add(seed))
        .collect()
}

pub(crate) fn read_block(fs: &Pmlfs, ino: u32, index: u16) -> Vec<u8> {
    let mut out = vec![0u8; BYTES_IN_BLOCK];
    fs.read_data_block(ino, index, &mut out).unwrap();
    out
}
