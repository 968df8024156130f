//! Helpers shared by unit, scenario and property tests.

use crate::util::constants::*;
use crate::util::memory::PmRegion;
use std::panic;
use std::sync::Mutex;

/// A small region: 64 main segments of 64 blocks plus metadata, mapped
/// anonymously. Dropping it unmaps.
pub fn small_region() -> PmRegion {
    // Metadata (superblocks, SSA, SIT) fits comfortably in 16 blocks for
    // this shape; round the total up to a segment boundary.
    let main = 64 * BYTES_IN_SEGMENT;
    let meta = 16 * BYTES_IN_BLOCK;
    PmRegion::map_anonymous(main + meta + BYTES_IN_SEGMENT).unwrap()
}

lazy_static! {
    // A global lock to serialize tests that read process-wide state
    // (environment-driven options, the logger).
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

/// Force some tests to be executed serially.
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test fails, the lock will become poisoned. We would want to
    // continue for other tests anyway.
    let _guard = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
}

/// Always execute a cleanup closure no matter the test panics or not.
pub fn with_cleanup<T, C>(test: T, cleanup: C)
where
    T: FnOnce() + panic::UnwindSafe,
    C: FnOnce(),
{
    let res = panic::catch_unwind(test);
    cleanup();
    if let Err(e) = res {
        panic::resume_unwind(e);
    }
}
