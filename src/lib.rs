//! PMLFS is the core of a log-structured filesystem for byte-addressable
//! persistent memory (PM). A contiguous PM region is mapped into the
//! address space and used as both the medium and the runtime data
//! structure: reads are pointer dereferences, writes never overwrite live
//! blocks, and consistency comes from copy-on-write plus one small atomic
//! pointer swing in the superblock.
//!
//! Logically, this crate includes these major parts:
//! * [Segment manager](segment/index.html): the space allocator with its
//!   two bump-pointer streams, the per-segment accounting (SIT), the
//!   per-block summary area (SSA) and the free/prefree segment maps.
//! * [Checkpoint manager](checkpoint/index.html): creation, linking and
//!   crash-consistent replay of immutable checkpoint records, orphan
//!   inode tracking, and the atomic advancement of the superblock. Old
//!   checkpoints remain readable until deleted, giving snapshot
//!   semantics for free.
//! * [Garbage collector](gc/index.html): greedy and cost-benefit victim
//!   selection, live-block relocation guided by the SSA, and a
//!   background worker driven by free-space pressure.
//! * [NAT](nat/index.html): the copy-on-write radix tree from node id to
//!   block address that every checkpoint roots.
//!
//! The POSIX surface (directories, the VFS adapter, xattrs/ACLs) lives
//! outside this crate and drives the node/data operations on
//! [`Pmlfs`].

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod util;
pub mod checkpoint;
pub mod gc;
mod global_state;
pub mod layout;
pub mod nat;
mod pmlfs;
pub mod segment;

#[cfg(test)]
mod tests;

pub use crate::pmlfs::{Pmlfs, Stats};
pub use crate::util::memory::PmRegion;
pub use crate::util::options::Options;
pub use crate::util::{Address, BlockAddr, FsError, Result};
