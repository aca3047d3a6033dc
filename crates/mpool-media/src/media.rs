//! Media pool interface
//!
//! The mpool core never touches devices directly. Everything it needs from
//! the underlying pool goes through [`MediaPool`]: mblock data path
//! primitives, raw mlog reads and writes at byte offsets, and mlog erase.

use mpool_common::{MblockProps, MediaClass, MlogProps, ObjectId, Result};
use std::fs::File;
use std::io::IoSlice;

/// Backing store of a committed mblock, suitable for `mmap(2)`
#[derive(Debug)]
pub struct MapSource {
    /// Read-only file holding the mblock data at offset 0
    pub file: File,
    /// Committed length in bytes
    pub len: u64,
}

/// Operations the mpool core consumes from a media pool
///
/// Implementations must be safe to call from many threads at once. The
/// core serializes access per object; there is no ordering across objects.
pub trait MediaPool: Send + Sync {
    /// Pool name
    fn name(&self) -> &str;

    /// Allocate an uncommitted mblock
    fn mblock_alloc(&self, class: MediaClass, spare: bool) -> Result<(ObjectId, MblockProps)>;

    /// Append data to an uncommitted mblock; each segment must be a
    /// multiple of [`crate::ALIGNMENT`]
    fn mblock_write(&self, id: ObjectId, iov: &[IoSlice<'_>]) -> Result<()>;

    /// Make an mblock durable and immutable
    fn mblock_commit(&self, id: ObjectId) -> Result<()>;

    /// Discard an uncommitted mblock
    fn mblock_abort(&self, id: ObjectId) -> Result<()>;

    /// Delete a committed mblock
    fn mblock_delete(&self, id: ObjectId) -> Result<()>;

    /// Read committed data at `offset`; returns the number of bytes read
    fn mblock_read(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Properties of an mblock
    fn mblock_props(&self, id: ObjectId) -> Result<MblockProps>;

    /// Backing file of a committed mblock, for memory mapping
    fn mblock_map_source(&self, id: ObjectId) -> Result<MapSource>;

    /// Allocate an uncommitted mlog of `capacity` bytes
    fn mlog_alloc(&self, class: MediaClass, capacity: u64) -> Result<(ObjectId, MlogProps)>;

    /// Commit an allocated mlog
    fn mlog_commit(&self, id: ObjectId) -> Result<()>;

    /// Discard an uncommitted mlog
    fn mlog_abort(&self, id: ObjectId) -> Result<()>;

    /// Delete a committed mlog
    fn mlog_delete(&self, id: ObjectId) -> Result<()>;

    /// Properties of an mlog
    fn mlog_props(&self, id: ObjectId) -> Result<MlogProps>;

    /// Read raw log bytes at `offset`; short reads happen only at the end
    /// of the written stream
    fn mlog_read(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Write raw log bytes at `offset`; bounded by the mlog capacity
    fn mlog_write(&self, id: ObjectId, offset: u64, iov: &[IoSlice<'_>]) -> Result<()>;

    /// Make all written log bytes durable
    fn mlog_sync(&self, id: ObjectId) -> Result<()>;

    /// Truncate the log stream and persist `generation`
    fn mlog_erase(&self, id: ObjectId, generation: u64) -> Result<()>;
}
