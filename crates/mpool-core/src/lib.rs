//! mpool core - logs and metadata containers over a media pool
//!
//! This crate implements the user-space control surface of an object
//! storage media pool:
//! - mlogs: crash-safe append-only record logs with compaction markers
//!   and generation numbers
//! - MDCs: pairs of mlogs providing atomic metadata rewrite
//! - a bounded per-pool handle cache with reference counting
//! - mcache views: read-only mappings of committed mblocks with guard
//!   pages around every mblock
//!
//! # Lock order
//!
//! ```text
//! MDC mutex -> mlog handle lock -> pool lock -> media pool internals
//! ```
//!
//! Every core lock carries its rank; acquiring out of order is counted
//! and logged (see [`lock::lock_inversions`]).

pub mod cache;
pub mod lock;
pub mod mcache;
pub mod mdc;
pub mod mlog;
pub mod pool;

// Re-exports
pub use cache::CacheStats;
pub use lock::{LockRank, lock_inversions};
pub use mcache::{MadviseHint, McacheMap};
pub use mdc::{Mdc, MdcReader};
pub use mlog::{MlogHandle, MlogOpenFlags, MlogState, RecordKind};
pub use mpool_common::{Errno, Error, McacheAdvice, MpoolConfig, ObjectId, Result};
pub use pool::Mpool;

#[cfg(test)]
mod test_util;
