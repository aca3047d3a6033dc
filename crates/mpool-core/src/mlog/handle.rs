//! Mlog handles and their state machine
//!
//! ```text
//!            open                read_data_init
//!  Closed ---------> OpenAppend ---------------> OpenRead
//!    ^                 |    ^                       |
//!    |     close       |    +------- append --------+
//!    +-----------------+----------------------------+
//!
//!  any state --erase--> Erasing --> previous state
//! ```
//!
//! Appends are buffered in the handle and written to the media pool on
//! flush, on `sync` appends, on compaction markers, before reading and at
//! close. A handle is shared by every holder of the same object id; the
//! per-handle lock serializes all operations on it.

use super::record::{self, RecordHeader, RecordKind, RECORD_HEADER_SIZE};
use crate::lock::{LockRank, OrderedGuard, OrderedMutex};
use crate::pool::PoolInner;
use bytes::{Bytes, BytesMut};
use mpool_common::{Errno, Error, ObjectId, Result};
use mpool_media::MediaPool;
use std::fmt;
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

/// Framed size of a CSTART or CEND record
const MARKER_FRAMED: u64 = record::framed_len(8);

/// Lifecycle state of an mlog handle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MlogState {
    #[default]
    Closed = 0,
    OpenAppend = 1,
    OpenRead = 2,
    /// An erase is in progress; other operations fail with `EBUSY`
    Erasing = 3,
}

impl MlogState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::OpenAppend,
            2 => Self::OpenRead,
            3 => Self::Erasing,
            _ => Self::Closed,
        }
    }

    /// Whether the log is open for reading or appending
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::OpenAppend | Self::OpenRead)
    }
}

/// Flags for [`MlogHandle::open`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MlogOpenFlags {
    /// Fail with `EMSGSIZE` when the log ends inside a compaction bracket
    pub csem: bool,
    /// Open for reading only; appends fail with `EPERM`
    pub rdonly: bool,
}

impl MlogOpenFlags {
    pub const NONE: Self = Self {
        csem: false,
        rdonly: false,
    };

    pub const CSEM: Self = Self {
        csem: true,
        rdonly: false,
    };

    pub const RDONLY: Self = Self {
        csem: false,
        rdonly: true,
    };

    #[must_use]
    pub const fn with_csem(mut self) -> Self {
        self.csem = true;
        self
    }

    #[must_use]
    pub const fn with_rdonly(mut self) -> Self {
        self.rdonly = true;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Cursor {
    /// Byte offset of the next record to examine
    offset: u64,
    /// Index of the next data record
    index: u64,
}

#[derive(Debug, Default)]
struct MlogInner {
    state: MlogState,
    flags: MlogOpenFlags,
    /// Generation, known once the log has been opened or erased
    generation: Option<u64>,
    /// Generation carried by the last CEND in the log
    cend_gen: Option<u64>,
    capacity: u64,
    /// Bytes persisted on media
    durable: u64,
    /// Framed records not yet written
    pending: BytesMut,
    /// First record readers see
    read_start: u64,
    /// Offset just past the CSTART of an open compaction bracket
    bracket: Option<u64>,
    /// Data records in the log, pending ones included
    data_records: u64,
    cursor: Option<Cursor>,
}

impl MlogInner {
    fn logical_len(&self) -> u64 {
        self.durable + self.pending.len() as u64
    }
}

/// State shared by every clone of a handle
#[derive(Debug)]
pub(crate) struct MlogShared {
    objid: ObjectId,
    /// Cleared when the cache releases the handle
    live: AtomicBool,
    /// Mirror of the state, readable without the handle lock
    state_hint: AtomicU8,
    inner: OrderedMutex<MlogInner>,
}

impl MlogShared {
    pub(crate) fn new(objid: ObjectId) -> Arc<Self> {
        Arc::new(Self {
            objid,
            live: AtomicBool::new(true),
            state_hint: AtomicU8::new(MlogState::Closed as u8),
            inner: OrderedMutex::new(LockRank::Mlog, MlogInner::default()),
        })
    }

    pub(crate) fn objid(&self) -> ObjectId {
        self.objid
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Mark the handle dead; stale clones fail with `EINVAL` from now on
    pub(crate) fn kill(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub(crate) fn state_hint(&self) -> MlogState {
        MlogState::from_u8(self.state_hint.load(Ordering::Acquire))
    }

    fn set_state(&self, inner: &mut MlogInner, state: MlogState) {
        inner.state = state;
        self.state_hint.store(state as u8, Ordering::Release);
    }

    /// Close the log if open and mark the handle dead
    pub(crate) fn shutdown(&self, media: &dyn MediaPool) -> Result<()> {
        let mut inner = self.inner.lock();
        let res = if inner.state.is_open() {
            flush_locked(media, self.objid, &mut inner)
        } else {
            Ok(())
        };
        if let Err(err) = res {
            error!("Flush of mlog {} failed at shutdown: {}", self.objid, err);
        }
        inner.cursor = None;
        inner.bracket = None;
        self.set_state(&mut inner, MlogState::Closed);
        self.kill();
        res
    }
}

/// Handle to an mlog
///
/// Handles come from [`crate::Mpool::mlog_get`] and go back through
/// [`crate::Mpool::mlog_put`]. Cloning a handle does not take a
/// reference; a clone used after the final put fails with `EINVAL`.
#[derive(Clone)]
pub struct MlogHandle {
    shared: Arc<MlogShared>,
    pool: Weak<PoolInner>,
}

impl fmt::Debug for MlogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlogHandle")
            .field("objid", &self.shared.objid)
            .field("state", &self.shared.state_hint())
            .field("live", &self.shared.is_live())
            .finish()
    }
}

impl MlogHandle {
    pub(crate) fn new(shared: Arc<MlogShared>, pool: Weak<PoolInner>) -> Self {
        Self { shared, pool }
    }

    pub(crate) fn shared(&self) -> &Arc<MlogShared> {
        &self.shared
    }

    /// Object id of the log
    #[must_use]
    pub fn objid(&self) -> ObjectId {
        self.shared.objid
    }

    /// Current state, without taking the handle lock
    #[must_use]
    pub fn state(&self) -> MlogState {
        self.shared.state_hint()
    }

    /// Whether the handle is still registered in the cache
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    #[track_caller]
    fn pool(&self) -> Result<Arc<PoolInner>> {
        self.pool.upgrade().ok_or_else(|| Error::new(Errno::EINVAL))
    }

    #[track_caller]
    fn lock_live(&self) -> Result<OrderedGuard<'_, MlogInner>> {
        let inner = self.shared.inner.lock();
        if !self.shared.is_live() {
            return Err(Error::new(Errno::EINVAL));
        }
        Ok(inner)
    }

    /// Open the log, validating its contents; returns the generation
    ///
    /// With `csem` (or the pool's `csem_on_open`), a log ending inside a
    /// compaction bracket fails with `EMSGSIZE`.
    pub fn open(&self, flags: MlogOpenFlags) -> Result<u64> {
        let pool = self.pool()?;
        let media = pool.media.as_ref();
        let id = self.shared.objid;
        let mut inner = self.lock_live()?;

        match inner.state {
            MlogState::Closed => {}
            _ => return Err(Error::new(Errno::EBUSY)),
        }

        let props = media.mlog_props(id)?;
        if !props.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        let stream = record::read_stream(media, id, props.capacity)?;
        let scan = record::scan(&stream)?;

        let csem = flags.csem || pool.config.csem_on_open;
        if scan.dangling_cstart {
            if csem {
                debug!("Mlog {} ends inside a compaction bracket", id);
                return Err(Error::new(Errno::EMSGSIZE));
            }
            warn!("Mlog {} has an unterminated compaction, reading through it", id);
        }
        if scan.torn_bytes > 0 {
            warn!(
                "Discarding {} torn bytes at offset {} of mlog {}",
                scan.torn_bytes, scan.valid_len, id
            );
        }

        let generation = scan.cend_gen.map_or(props.generation, |g| g.max(props.generation));
        *inner = MlogInner {
            flags,
            generation: Some(generation),
            cend_gen: scan.cend_gen,
            capacity: props.capacity,
            durable: scan.valid_len,
            read_start: scan.read_start,
            data_records: scan.data_records,
            ..MlogInner::default()
        };
        if flags.rdonly {
            inner.cursor = Some(Cursor {
                offset: scan.read_start,
                index: 0,
            });
            self.shared.set_state(&mut inner, MlogState::OpenRead);
        } else {
            self.shared.set_state(&mut inner, MlogState::OpenAppend);
        }

        debug!(
            "Opened mlog {} generation {} len {} records {}",
            id, generation, scan.valid_len, scan.data_records
        );
        Ok(generation)
    }

    /// Flush buffered appends and close the log
    pub fn close(&self) -> Result<()> {
        let pool = self.pool()?;
        let mut inner = self.lock_live()?;

        match inner.state {
            MlogState::Closed => return Err(Error::new(Errno::EINVAL)),
            MlogState::Erasing => return Err(Error::new(Errno::EBUSY)),
            _ => {}
        }
        flush_locked(pool.media.as_ref(), self.shared.objid, &mut inner)?;

        inner.cursor = None;
        inner.bracket = None;
        self.shared.set_state(&mut inner, MlogState::Closed);
        debug!("Closed mlog {}", self.shared.objid);

        pool.release_if_idle(&self.shared);
        Ok(())
    }

    /// Durably persist every appended record
    pub fn flush(&self) -> Result<()> {
        let pool = self.pool()?;
        let mut inner = self.lock_live()?;

        match inner.state {
            MlogState::Closed => Err(Error::new(Errno::EINVAL)),
            MlogState::Erasing => Err(Error::new(Errno::EBUSY)),
            _ => flush_locked(pool.media.as_ref(), self.shared.objid, &mut inner),
        }
    }

    /// Append one record
    pub fn append_data(&self, buf: &[u8], sync: bool) -> Result<()> {
        self.append_datav(&[buf], sync)
    }

    /// Append one record gathered from several buffers
    ///
    /// Fails with `EFBIG`, leaving the log untouched, when the record does
    /// not fit in the remaining capacity.
    pub fn append_datav(&self, iov: &[&[u8]], sync: bool) -> Result<()> {
        let pool = self.pool()?;
        let mut inner = self.lock_live()?;

        check_writable(&inner)?;
        let len: u64 = iov.iter().map(|seg| seg.len() as u64).sum();
        if len > u64::from(u32::MAX) {
            return Err(Error::new(Errno::EFBIG));
        }
        self.reserve(&mut inner, record::framed_len(len))?;

        let mark = inner.pending.len();
        record::encode_into(&mut inner.pending, RecordKind::Data, iov);
        inner.data_records += 1;

        if sync {
            if let Err(err) = flush_locked(pool.media.as_ref(), self.shared.objid, &mut inner) {
                inner.pending.truncate(mark);
                inner.data_records -= 1;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Append a flushed CSTART marker, opening a compaction bracket
    pub fn append_cstart(&self) -> Result<()> {
        let pool = self.pool()?;
        let mut inner = self.lock_live()?;

        check_writable(&inner)?;
        if inner.bracket.is_some() {
            return Err(Error::new(Errno::EINVAL));
        }
        let generation = inner.generation.ok_or_else(|| Error::new(Errno::EINVAL))?;
        self.reserve(&mut inner, MARKER_FRAMED)?;

        let mark = inner.pending.len();
        record::encode_marker(&mut inner.pending, RecordKind::CStart, generation);
        let start = inner.logical_len();
        if let Err(err) = flush_locked(pool.media.as_ref(), self.shared.objid, &mut inner) {
            inner.pending.truncate(mark);
            return Err(err);
        }

        inner.bracket = Some(start);
        debug!("Compaction start on mlog {} at generation {}", self.shared.objid, generation);
        Ok(())
    }

    /// Append a flushed CEND marker, closing the bracket and advancing generation
    pub fn append_cend(&self) -> Result<()> {
        let pool = self.pool()?;
        let mut inner = self.lock_live()?;

        check_writable(&inner)?;
        let Some(start) = inner.bracket else {
            return Err(Error::new(Errno::EINVAL));
        };
        let generation = inner.generation.ok_or_else(|| Error::new(Errno::EINVAL))?;
        let new_gen = generation + 1;
        self.reserve(&mut inner, MARKER_FRAMED)?;

        let mark = inner.pending.len();
        record::encode_marker(&mut inner.pending, RecordKind::CEnd, new_gen);
        if let Err(err) = flush_locked(pool.media.as_ref(), self.shared.objid, &mut inner) {
            inner.pending.truncate(mark);
            return Err(err);
        }

        inner.generation = Some(new_gen);
        inner.cend_gen = Some(new_gen);
        inner.read_start = start;
        inner.bracket = None;
        debug!("Compaction end on mlog {}, generation {} -> {}", self.shared.objid, generation, new_gen);
        Ok(())
    }

    /// Flush pending appends and position the read cursor at the first
    /// readable record
    pub fn read_data_init(&self) -> Result<()> {
        let pool = self.pool()?;
        let mut inner = self.lock_live()?;

        match inner.state {
            MlogState::Closed => return Err(Error::new(Errno::EINVAL)),
            MlogState::Erasing => return Err(Error::new(Errno::EBUSY)),
            _ => {}
        }
        flush_locked(pool.media.as_ref(), self.shared.objid, &mut inner)?;

        inner.cursor = Some(Cursor {
            offset: inner.read_start,
            index: 0,
        });
        self.shared.set_state(&mut inner, MlogState::OpenRead);
        Ok(())
    }

    /// Copy the next data record into `buf`
    ///
    /// `rdlen` is set to the record length. When `buf` is too small the
    /// call fails with `EOVERFLOW` and the cursor does not move. At the end
    /// of the log it fails with `ENODATA`.
    pub fn read_data_next(&self, buf: &mut [u8], rdlen: &mut usize) -> Result<()> {
        let pool = self.pool()?;
        let mut inner = self.lock_live()?;
        self.read_next_locked(pool.media.as_ref(), &mut inner, buf, rdlen)
    }

    /// Position the cursor at data record `seek`, then read as
    /// [`Self::read_data_next`]; `EINVAL` when the log has fewer records
    pub fn seek_read_data_next(&self, seek: u64, buf: &mut [u8], rdlen: &mut usize) -> Result<()> {
        let pool = self.pool()?;
        let media = pool.media.as_ref();
        let id = self.shared.objid;
        let mut inner = self.lock_live()?;

        match inner.state {
            MlogState::OpenRead => {}
            MlogState::Erasing => return Err(Error::new(Errno::EBUSY)),
            _ => return Err(Error::new(Errno::EINVAL)),
        }

        let mut offset = inner.read_start;
        for _ in 0..seek {
            match next_data_at(media, id, offset, inner.durable)? {
                Some((off, _, header)) => offset = off + header.framed_len(),
                None => return Err(Error::new(Errno::EINVAL)),
            }
        }
        inner.cursor = Some(Cursor {
            offset,
            index: seek,
        });
        self.read_next_locked(media, &mut inner, buf, rdlen)
    }

    /// Read the next data record into a new buffer; `None` at the end
    pub fn read_next_record(&self) -> Result<Option<Bytes>> {
        let pool = self.pool()?;
        let media = pool.media.as_ref();
        let id = self.shared.objid;
        let mut inner = self.lock_live()?;

        let cursor = read_cursor(&inner)?;
        let Some((off, raw, header)) = next_data_at(media, id, cursor.offset, inner.durable)? else {
            return Ok(None);
        };
        let mut buf = vec![0u8; header.len as usize];
        record::read_payload_at(media, id, off, &raw, &mut buf)?;
        inner.cursor = Some(Cursor {
            offset: off + header.framed_len(),
            index: cursor.index + 1,
        });
        Ok(Some(Bytes::from(buf)))
    }

    fn read_next_locked(
        &self,
        media: &dyn MediaPool,
        inner: &mut MlogInner,
        buf: &mut [u8],
        rdlen: &mut usize,
    ) -> Result<()> {
        let id = self.shared.objid;
        let cursor = read_cursor(inner)?;
        let Some((off, raw, header)) = next_data_at(media, id, cursor.offset, inner.durable)? else {
            return Err(Error::new(Errno::ENODATA));
        };

        let len = header.len as usize;
        *rdlen = len;
        if len > buf.len() {
            inner.cursor = Some(Cursor {
                offset: off,
                index: cursor.index,
            });
            return Err(Error::new(Errno::EOVERFLOW));
        }

        record::read_payload_at(media, id, off, &raw, &mut buf[..len])?;
        inner.cursor = Some(Cursor {
            offset: off + header.framed_len(),
            index: cursor.index + 1,
        });
        Ok(())
    }

    /// Current generation; also valid on a closed log that has been opened
    /// or erased through this handle
    pub fn generation(&self) -> Result<u64> {
        let inner = self.lock_live()?;
        match inner.state {
            MlogState::Erasing => Err(Error::new(Errno::EBUSY)),
            _ => inner.generation.ok_or_else(|| Error::new(Errno::EINVAL)),
        }
    }

    /// Generation of the last CEND found in or appended to the open log
    ///
    /// Unlike [`Self::generation`] this ignores the generation persisted by
    /// an erase, so it only moves when a compaction completes.
    pub(crate) fn last_cend(&self) -> Result<Option<u64>> {
        let inner = self.lock_live()?;
        check_open(&inner)?;
        Ok(inner.cend_gen)
    }

    /// Whether the log holds no data records
    pub fn is_empty(&self) -> Result<bool> {
        let inner = self.lock_live()?;
        check_open(&inner)?;
        Ok(inner.data_records == 0)
    }

    /// Logical length in bytes, buffered appends included
    pub fn len(&self) -> Result<u64> {
        let inner = self.lock_live()?;
        check_open(&inner)?;
        Ok(inner.logical_len())
    }

    /// Truncate the log and reset its generation to at least `mingen`
    ///
    /// Returns the new generation. The handle keeps its open/closed state.
    /// Concurrent operations on the handle see `EBUSY` meanwhile.
    pub fn erase(&self, mingen: u64) -> Result<u64> {
        let pool = self.pool()?;
        let media = pool.media.as_ref();
        let id = self.shared.objid;

        let (prior, new_gen) = {
            let mut inner = self.lock_live()?;
            if inner.state == MlogState::Erasing {
                return Err(Error::new(Errno::EBUSY));
            }
            let cur = match inner.generation {
                Some(generation) => generation,
                None => discover_gen(media, id)?,
            };
            let prior = inner.state;
            self.shared.set_state(&mut inner, MlogState::Erasing);
            (prior, cur.max(mingen))
        };

        let res = media.mlog_erase(id, new_gen);

        let mut inner = self.shared.inner.lock();
        if let Err(err) = res {
            self.shared.set_state(&mut inner, prior);
            return Err(err);
        }
        inner.generation = Some(new_gen);
        inner.cend_gen = None;
        inner.durable = 0;
        inner.pending.clear();
        inner.read_start = 0;
        inner.bracket = None;
        inner.data_records = 0;
        inner.cursor = (prior == MlogState::OpenRead).then(Cursor::default);
        self.shared.set_state(&mut inner, prior);
        if prior == MlogState::Closed {
            pool.release_if_idle(&self.shared);
        }

        debug!("Erased mlog {} to generation {}", id, new_gen);
        Ok(new_gen)
    }

    /// Reserve `framed` bytes for an append and leave read mode
    #[track_caller]
    fn reserve(&self, inner: &mut MlogInner, framed: u64) -> Result<()> {
        if inner.logical_len() + framed > inner.capacity {
            return Err(Error::new(Errno::EFBIG));
        }
        if inner.state == MlogState::OpenRead {
            inner.cursor = None;
            self.shared.set_state(inner, MlogState::OpenAppend);
        }
        Ok(())
    }
}

#[track_caller]
fn check_open(inner: &MlogInner) -> Result<()> {
    match inner.state {
        MlogState::Closed => Err(Error::new(Errno::EINVAL)),
        MlogState::Erasing => Err(Error::new(Errno::EBUSY)),
        _ => Ok(()),
    }
}

#[track_caller]
fn check_writable(inner: &MlogInner) -> Result<()> {
    check_open(inner)?;
    if inner.flags.rdonly {
        return Err(Error::new(Errno::EPERM));
    }
    Ok(())
}

#[track_caller]
fn read_cursor(inner: &MlogInner) -> Result<Cursor> {
    match inner.state {
        MlogState::OpenRead => inner.cursor.ok_or_else(|| Error::new(Errno::EINVAL)),
        MlogState::Erasing => Err(Error::new(Errno::EBUSY)),
        _ => Err(Error::new(Errno::EINVAL)),
    }
}

/// Write and sync buffered records
fn flush_locked(media: &dyn MediaPool, id: ObjectId, inner: &mut MlogInner) -> Result<()> {
    if inner.pending.is_empty() {
        return Ok(());
    }
    media.mlog_write(id, inner.durable, &[IoSlice::new(&inner.pending)])?;
    media.mlog_sync(id)?;
    inner.durable += inner.pending.len() as u64;
    inner.pending.clear();
    Ok(())
}

/// Find the next data record at or after `off`, skipping markers
fn next_data_at(
    media: &dyn MediaPool,
    id: ObjectId,
    mut off: u64,
    end: u64,
) -> Result<Option<(u64, [u8; RECORD_HEADER_SIZE], RecordHeader)>> {
    while off < end {
        let (raw, header) = record::read_header_at(media, id, off)?;
        if !header.kind.is_marker() {
            return Ok(Some((off, raw, header)));
        }
        off += header.framed_len();
    }
    Ok(None)
}

/// Generation of a log that has not been opened through this handle
fn discover_gen(media: &dyn MediaPool, id: ObjectId) -> Result<u64> {
    let props = media.mlog_props(id)?;
    let stream = record::read_stream(media, id, props.capacity)?;
    match record::scan(&stream) {
        Ok(scan) => Ok(scan.cend_gen.map_or(props.generation, |g| g.max(props.generation))),
        Err(err) => {
            warn!("Mlog {} unreadable before erase: {}", id, err);
            Ok(props.generation)
        }
    }
}
