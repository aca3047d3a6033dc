//! mpool media layer
//!
//! This crate defines the narrow interface the mpool core consumes from a
//! media pool, and provides a directory-backed implementation:
//! - mblock primitives (alloc/write/commit/abort/delete/read/map)
//! - raw mlog I/O and erase
//! - persistent superblock and per-mlog headers

pub mod dir_pool;
pub mod layout;
pub mod media;

pub use dir_pool::{DirPool, DirPoolParams};
pub use layout::{MlogHeader, PoolSuperblock, ALIGNMENT, POOL_MAGIC};
pub use media::{MapSource, MediaPool};
