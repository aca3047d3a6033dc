//! Metadata containers
//!
//! An MDC is a pair of mlogs giving atomic metadata rewrite. Appends go to
//! the active log. A rewrite writes a complete snapshot to the other log
//! inside a CSTART/CEND bracket, then swaps the roles and erases the old
//! active log so it can take the next snapshot.
//!
//! At open, the active side is chosen by:
//! 1. a log that opens cleanly beats one ending inside a compaction
//! 2. a log holding records beats an erased one
//! 3. the higher generation in the log's last CEND
//! 4. the higher generation
//! 5. the lower object id

use crate::lock::{LockRank, OrderedGuard, OrderedMutex};
use crate::mlog::{MlogHandle, MlogOpenFlags};
use crate::pool::Mpool;
use bytes::Bytes;
use mpool_common::{Errno, Error, MediaClass, ObjectId, Result};
use std::cmp::Reverse;
use std::fmt;
use tracing::{debug, error, info, warn};

struct MdcInner {
    logs: [MlogHandle; 2],
    /// Index of the active log
    active: usize,
    /// A CSTART has been written to the inactive log
    compacting: bool,
    closed: bool,
}

impl MdcInner {
    fn active(&self) -> &MlogHandle {
        &self.logs[self.active]
    }

    fn inactive(&self) -> &MlogHandle {
        &self.logs[1 - self.active]
    }

    /// Log receiving appends
    fn target(&self) -> &MlogHandle {
        if self.compacting {
            self.inactive()
        } else {
            self.active()
        }
    }
}

/// An open metadata container
pub struct Mdc {
    pool: Mpool,
    inner: OrderedMutex<MdcInner>,
}

impl fmt::Debug for Mdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mdc")
            .field("active", &inner.active().objid())
            .field("inactive", &inner.inactive().objid())
            .field("compacting", &inner.compacting)
            .finish()
    }
}

impl Mdc {
    /// Allocate the two mlogs of a new MDC
    pub fn alloc(pool: &Mpool, class: MediaClass, capacity: u64) -> Result<(ObjectId, ObjectId)> {
        let (first, _) = pool.mlog_alloc(class, capacity)?;
        match pool.mlog_alloc(class, capacity) {
            Ok((second, _)) => Ok((first, second)),
            Err(err) => {
                if let Err(abort_err) = pool.mlog_abort(first) {
                    warn!("Aborting mlog {} failed: {}", first, abort_err);
                }
                Err(err)
            }
        }
    }

    /// Commit both mlogs of a new MDC
    pub fn commit(pool: &Mpool, logid1: ObjectId, logid2: ObjectId) -> Result<()> {
        pool.mlog_commit(logid1)?;
        if let Err(err) = pool.mlog_commit(logid2) {
            if let Err(del_err) = pool.mlog_delete(logid1) {
                warn!("Deleting mlog {} failed: {}", logid1, del_err);
            }
            if let Err(abort_err) = pool.mlog_abort(logid2) {
                warn!("Aborting mlog {} failed: {}", logid2, abort_err);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Erase and delete both mlogs of a closed MDC
    pub fn destroy(pool: &Mpool, logid1: ObjectId, logid2: ObjectId) -> Result<()> {
        let mut res = Ok(());
        for id in [logid1, logid2] {
            let erased = pool.mlog_erase_byoid(id, 0).map(|_| ());
            res = res.and(erased).and(pool.mlog_delete(id));
        }
        res
    }

    /// Open an MDC over two committed mlogs, recovering from an
    /// interrupted rewrite
    ///
    /// Fails with `ENODATA` when neither log is usable.
    pub fn open(pool: &Mpool, logid1: ObjectId, logid2: ObjectId) -> Result<Self> {
        if logid1 == logid2 {
            return Err(Error::new(Errno::EINVAL));
        }
        let first = pool.mlog_get(logid1)?;
        let second = match pool.mlog_get(logid2) {
            Ok(handle) => handle,
            Err(err) => {
                release_logs(pool, [first], [false]);
                return Err(err);
            }
        };

        let logs = [first, second];
        let mut owned = [false; 2];
        match select_active(&logs, &mut owned) {
            Ok(active) => {
                info!(
                    "Opened MDC {}/{}, active {} gen {}",
                    logid1,
                    logid2,
                    logs[active].objid(),
                    logs[active].generation().unwrap_or_default()
                );
                Ok(Self {
                    pool: pool.clone(),
                    inner: OrderedMutex::new(
                        LockRank::Mdc,
                        MdcInner {
                            logs,
                            active,
                            compacting: false,
                            closed: false,
                        },
                    ),
                })
            }
            Err(err) => {
                release_logs(pool, logs, owned);
                Err(err)
            }
        }
    }

    /// Append a record to the MDC
    ///
    /// Between [`Self::cstart`] and [`Self::cend`] records go to the new
    /// snapshot.
    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        let inner = self.lock()?;
        inner.target().append_data(data, sync)
    }

    /// Append a record gathered from several buffers
    pub fn appendv(&self, iov: &[&[u8]], sync: bool) -> Result<()> {
        let inner = self.lock()?;
        inner.target().append_datav(iov, sync)
    }

    /// Begin writing a new snapshot to the inactive log
    pub fn cstart(&self) -> Result<()> {
        let mut inner = self.lock()?;
        cstart_locked(&mut inner)
    }

    /// Finish the snapshot and make it active; returns the new generation
    pub fn cend(&self) -> Result<u64> {
        let mut inner = self.lock()?;
        cend_locked(&mut inner)
    }

    /// Atomically replace the MDC contents with `records`
    ///
    /// On failure the previous contents stay active and the partial
    /// snapshot is discarded.
    pub fn rewrite<I, R>(&self, records: I) -> Result<u64>
    where
        I: IntoIterator<Item = R>,
        R: AsRef<[u8]>,
    {
        let mut inner = self.lock()?;
        cstart_locked(&mut inner)?;

        let written = records
            .into_iter()
            .try_for_each(|rec| inner.inactive().append_data(rec.as_ref(), false));
        let res = written.and_then(|()| cend_locked(&mut inner));
        if res.is_err() && inner.compacting {
            abort_compaction(&mut inner);
        }
        res
    }

    /// Iterate the active log; the MDC is locked until the reader drops
    pub fn reader(&self) -> Result<MdcReader<'_>> {
        let inner = self.lock()?;
        inner.active().read_data_init()?;
        Ok(MdcReader { inner })
    }

    /// Make every appended record durable
    pub fn sync(&self) -> Result<()> {
        let inner = self.lock()?;
        inner.active().flush()?;
        if inner.compacting {
            inner.inactive().flush()?;
        }
        Ok(())
    }

    /// Bytes used in the active log
    pub fn usage(&self) -> Result<u64> {
        self.lock()?.active().len()
    }

    /// Generation of the active log
    pub fn generation(&self) -> Result<u64> {
        self.lock()?.active().generation()
    }

    /// Object id of the active log
    pub fn active_objid(&self) -> Result<ObjectId> {
        Ok(self.lock()?.active().objid())
    }

    /// Close both logs and release their handles
    pub fn close(self) -> Result<()> {
        self.close_locked()
    }

    #[track_caller]
    fn lock(&self) -> Result<OrderedGuard<'_, MdcInner>> {
        let inner = self.inner.lock();
        if inner.closed {
            return Err(Error::new(Errno::EINVAL));
        }
        Ok(inner)
    }

    fn close_locked(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        if inner.compacting {
            warn!("Closing MDC during a rewrite; the partial snapshot is dropped at next open");
        }

        let mut res = Ok(());
        for log in &inner.logs {
            if log.state().is_open() {
                res = res.and(log.close());
            }
        }
        for log in inner.logs.iter().cloned() {
            res = res.and(self.pool.mlog_put(log));
        }
        debug!("Closed MDC, active {}", inner.active().objid());
        res
    }
}

impl Drop for Mdc {
    fn drop(&mut self) {
        if let Err(err) = self.close_locked() {
            error!("Closing MDC on drop failed: {}", err);
        }
    }
}

/// Reader over the active log of an MDC
///
/// Holds the MDC lock, so no rewrite can swap logs underneath it.
pub struct MdcReader<'a> {
    inner: OrderedGuard<'a, MdcInner>,
}

impl MdcReader<'_> {
    /// Next record, or `None` at the end
    pub fn next_record(&mut self) -> Result<Option<Bytes>> {
        self.inner.active().read_next_record()
    }

    /// Copy the next record into `buf`; see [`MlogHandle::read_data_next`]
    pub fn read_next(&mut self, buf: &mut [u8], rdlen: &mut usize) -> Result<()> {
        self.inner.active().read_data_next(buf, rdlen)
    }

    /// Collect the remaining records
    pub fn collect_records(mut self) -> Result<Vec<Bytes>> {
        let mut out = Vec::new();
        while let Some(rec) = self.next_record()? {
            out.push(rec);
        }
        Ok(out)
    }
}

fn cstart_locked(inner: &mut MdcInner) -> Result<()> {
    if inner.compacting {
        return Err(Error::new(Errno::EINVAL));
    }
    inner.inactive().append_cstart()?;
    inner.compacting = true;
    Ok(())
}

fn cend_locked(inner: &mut MdcInner) -> Result<u64> {
    if !inner.compacting {
        return Err(Error::new(Errno::EINVAL));
    }
    let target = 1 - inner.active;
    inner.logs[target].append_cend()?;
    let new_gen = inner.logs[target].generation()?;

    let old = inner.active;
    inner.active = target;
    inner.compacting = false;
    debug!(
        "MDC swapped active {} -> {} at gen {}",
        inner.logs[old].objid(),
        inner.logs[target].objid(),
        new_gen
    );

    // The swap is done; a stale side left behind loses at the next open
    if let Err(err) = inner.logs[old].erase(new_gen) {
        error!("Erasing superseded MDC log {} failed: {}", inner.logs[old].objid(), err);
    }
    Ok(new_gen)
}

/// Discard a partial snapshot from the inactive log
fn abort_compaction(inner: &mut MdcInner) {
    inner.compacting = false;
    let mingen = inner.active().generation().map_or(0, |g| g + 1);
    let target = inner.inactive();
    match target.erase(mingen) {
        Ok(_) => debug!("Dropped partial snapshot on MDC log {}", target.objid()),
        Err(err) => error!("Erasing partial snapshot on {} failed: {}", target.objid(), err),
    }
}

/// Open both logs and pick the active one, repairing the other
///
/// `owned` records which logs this call left open, so a failed open never
/// closes logs another holder of the shared handles opened.
fn select_active(logs: &[MlogHandle; 2], owned: &mut [bool; 2]) -> Result<usize> {
    let opened = [logs[0].open(MlogOpenFlags::CSEM), logs[1].open(MlogOpenFlags::CSEM)];
    owned[0] = opened[0].is_ok();
    owned[1] = opened[1].is_ok();

    let (active, failed) = match (&opened[0], &opened[1]) {
        (Ok(_), Ok(_)) => (pick_clean(logs)?, false),
        (Ok(_), Err(err)) if err.is(Errno::EMSGSIZE) => (0, true),
        (Err(err), Ok(_)) if err.is(Errno::EMSGSIZE) => (1, true),
        (Err(a), Err(b)) if a.is(Errno::EMSGSIZE) && b.is(Errno::EMSGSIZE) => {
            error!(
                "Both MDC logs {} and {} end inside a compaction",
                logs[0].objid(),
                logs[1].objid()
            );
            return Err(Error::new(Errno::ENODATA));
        }
        (Err(err), _) | (_, Err(err)) => return Err(*err),
    };

    let active_gen = logs[active].generation()?;
    let other = &logs[1 - active];
    if failed {
        warn!(
            "MDC log {} has an interrupted rewrite, falling back to {}",
            other.objid(),
            logs[active].objid()
        );
        other.erase(active_gen + 1)?;
        other.open(MlogOpenFlags::CSEM)?;
        owned[1 - active] = true;
    } else if other.len()? > 0 || other.generation()? < active_gen {
        other.erase(active_gen)?;
    }
    Ok(active)
}

/// Choose between two cleanly opened logs
///
/// The CEND generation is ranked before the log generation: an erase
/// interrupted after its header update leaves stale records under the new
/// generation, but never a newer CEND.
fn pick_clean(logs: &[MlogHandle; 2]) -> Result<usize> {
    type Key = (bool, Option<u64>, u64, Reverse<ObjectId>);
    let key = |log: &MlogHandle| -> Result<Key> {
        Ok((
            log.len()? > 0,
            log.last_cend()?,
            log.generation()?,
            Reverse(log.objid()),
        ))
    };
    let (k0, k1) = (key(&logs[0])?, key(&logs[1])?);

    if k0.0 && k1.0 && (k0.1, k0.2) == (k1.1, k1.2) {
        warn!(
            "MDC logs {} and {} both hold records at gen {}, keeping the lower id",
            logs[0].objid(),
            logs[1].objid(),
            k0.2
        );
    }
    Ok(if k0 >= k1 { 0 } else { 1 })
}

/// Put the handles, closing only the logs in `owned`
fn release_logs<const N: usize>(pool: &Mpool, logs: [MlogHandle; N], owned: [bool; N]) {
    for (log, owned) in logs.into_iter().zip(owned) {
        if owned && log.state().is_open() {
            if let Err(err) = log.close() {
                warn!("Closing mlog {} failed: {}", log.objid(), err);
            }
        }
        if let Err(err) = pool.mlog_put(log) {
            warn!("Releasing mlog handle failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::lock_inversions;
    use crate::test_util::{reopen, setup, setup_hooked};

    fn new_mdc(pool: &Mpool) -> (ObjectId, ObjectId) {
        let (a, b) = Mdc::alloc(pool, MediaClass::Capacity, 0).unwrap();
        Mdc::commit(pool, a, b).unwrap();
        (a, b)
    }

    fn contents(mdc: &Mdc) -> Vec<Vec<u8>> {
        let reader = mdc.reader().unwrap();
        reader
            .collect_records()
            .unwrap()
            .into_iter()
            .map(|rec| rec.to_vec())
            .collect()
    }

    /// Write records to a raw mlog, optionally inside a bracket
    fn write_raw(pool: &Mpool, id: ObjectId, mingen: u64, records: &[&[u8]], cstart: bool) {
        pool.mlog_erase_byoid(id, mingen).unwrap();
        let (mlh, _) = pool.mlog_open(id, MlogOpenFlags::NONE).unwrap();
        if cstart {
            mlh.append_cstart().unwrap();
        }
        for rec in records {
            mlh.append_data(rec, false).unwrap();
        }
        mlh.close().unwrap();
        pool.mlog_put(mlh).unwrap();
    }

    #[test]
    fn test_fresh_mdc() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_eq!(mdc.active_objid().unwrap(), a.min(b));
        assert_eq!(mdc.generation().unwrap(), 0);
        assert!(contents(&mdc).is_empty());

        mdc.append(b"one", false).unwrap();
        mdc.appendv(&[b"tw", b"o"], true).unwrap();
        assert_eq!(contents(&mdc), vec![b"one".to_vec(), b"two".to_vec()]);
        mdc.close().unwrap();

        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_eq!(contents(&mdc), vec![b"one".to_vec(), b"two".to_vec()]);
        mdc.close().unwrap();
        assert_eq!(pool.cache_stats().refs, 0);
    }

    #[test]
    fn test_rewrite_swaps_sides() {
        let (dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        let before = mdc.active_objid().unwrap();
        mdc.append(b"stale", false).unwrap();

        let generation = mdc.rewrite([b"snap1".as_slice(), b"snap2".as_slice()]).unwrap();
        assert_eq!(generation, 1);
        assert_ne!(mdc.active_objid().unwrap(), before);
        mdc.append(b"delta", true).unwrap();
        assert_eq!(
            contents(&mdc),
            vec![b"snap1".to_vec(), b"snap2".to_vec(), b"delta".to_vec()]
        );
        let active = mdc.active_objid().unwrap();
        mdc.close().unwrap();
        pool.close().unwrap();
        drop(pool);

        let pool = reopen(dir.path());
        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_eq!(mdc.active_objid().unwrap(), active);
        assert_eq!(mdc.generation().unwrap(), 1);
        assert_eq!(
            contents(&mdc),
            vec![b"snap1".to_vec(), b"snap2".to_vec(), b"delta".to_vec()]
        );
        mdc.close().unwrap();
        assert_eq!(lock_inversions(), 0);
    }

    #[test]
    fn test_explicit_cstart_cend() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);
        let mdc = Mdc::open(&pool, a, b).unwrap();

        mdc.append(b"old", false).unwrap();
        assert!(mdc.cend().unwrap_err().is(Errno::EINVAL));
        mdc.cstart().unwrap();
        assert!(mdc.cstart().unwrap_err().is(Errno::EINVAL));
        mdc.append(b"new", false).unwrap();

        // Readers still see the old snapshot until the CEND
        assert_eq!(contents(&mdc), vec![b"old".to_vec()]);
        assert_eq!(mdc.cend().unwrap(), 1);
        assert_eq!(contents(&mdc), vec![b"new".to_vec()]);
        mdc.close().unwrap();
    }

    #[test]
    fn test_crash_mid_compaction() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        mdc.append(b"committed", true).unwrap();
        let active = mdc.active_objid().unwrap();
        let target = if active == a { b } else { a };
        mdc.cstart().unwrap();
        mdc.append(b"partial", true).unwrap();
        drop(mdc);

        let err = pool.mlog_open(target, MlogOpenFlags::CSEM).unwrap_err();
        assert!(err.is(Errno::EMSGSIZE));

        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_eq!(mdc.active_objid().unwrap(), active);
        assert_eq!(contents(&mdc), vec![b"committed".to_vec()]);
        mdc.close().unwrap();

        // The failed side was reset past the active generation
        let (mlh, generation) = pool.mlog_open(target, MlogOpenFlags::CSEM).unwrap();
        assert_eq!(generation, 1);
        assert!(mlh.is_empty().unwrap());
        mlh.close().unwrap();
        pool.mlog_put(mlh).unwrap();
    }

    #[test]
    fn test_swap_after_recovery() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        write_raw(&pool, a, 3, &[b"a-snapshot"], false);
        write_raw(&pool, b, 3, &[b"b-partial"], true);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_eq!(mdc.active_objid().unwrap(), a);
        assert_eq!(mdc.generation().unwrap(), 3);
        assert_eq!(contents(&mdc), vec![b"a-snapshot".to_vec()]);
        mdc.close().unwrap();

        // Rewrite on B that crashes before A is erased
        let (mlh, generation) = pool.mlog_open(b, MlogOpenFlags::CSEM).unwrap();
        assert_eq!(generation, 4);
        mlh.append_cstart().unwrap();
        mlh.append_data(b"b-snapshot", false).unwrap();
        mlh.append_cend().unwrap();
        mlh.close().unwrap();
        pool.mlog_put(mlh).unwrap();

        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_eq!(mdc.active_objid().unwrap(), b);
        assert_eq!(mdc.generation().unwrap(), 5);
        assert_eq!(contents(&mdc), vec![b"b-snapshot".to_vec()]);

        assert_eq!(mdc.rewrite([b"a-again"]).unwrap(), 6);
        assert_eq!(mdc.active_objid().unwrap(), a);
        mdc.close().unwrap();
    }

    #[test]
    fn test_reopen_is_stable() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        mdc.rewrite([b"x"]).unwrap();
        let active = mdc.active_objid().unwrap();
        mdc.close().unwrap();

        for _ in 0..3 {
            let mdc = Mdc::open(&pool, a, b).unwrap();
            assert_eq!(mdc.active_objid().unwrap(), active);
            drop(mdc);
        }
    }

    #[test]
    fn test_equal_generation_tie_break() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        write_raw(&pool, a, 2, &[b"from-a"], false);
        write_raw(&pool, b, 2, &[b"from-b"], false);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_eq!(mdc.active_objid().unwrap(), a.min(b));
        mdc.close().unwrap();
    }

    #[test]
    fn test_both_sides_broken() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        write_raw(&pool, a, 0, &[b"a"], true);
        write_raw(&pool, b, 0, &[b"b"], true);

        let err = Mdc::open(&pool, a, b).unwrap_err();
        assert!(err.is(Errno::ENODATA));
        assert_eq!(pool.cache_stats().refs, 0);
    }

    #[test]
    fn test_failed_rewrite_keeps_old_snapshot() {
        let (_dir, pool) = setup();
        let (a, b) = Mdc::alloc(&pool, MediaClass::Capacity, 4096).unwrap();
        Mdc::commit(&pool, a, b).unwrap();

        let mdc = Mdc::open(&pool, a, b).unwrap();
        mdc.append(b"keep", true).unwrap();
        let active = mdc.active_objid().unwrap();

        let big = vec![0u8; 8192];
        let err = mdc.rewrite([big.as_slice()]).unwrap_err();
        assert!(err.is(Errno::EFBIG));
        assert_eq!(mdc.active_objid().unwrap(), active);
        assert_eq!(contents(&mdc), vec![b"keep".to_vec()]);

        let generation = mdc.rewrite([b"small"]).unwrap();
        assert!(generation >= 2);
        assert_eq!(contents(&mdc), vec![b"small".to_vec()]);
        mdc.close().unwrap();
    }

    #[test]
    fn test_crash_mid_erase_keeps_new_snapshot() {
        let (dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        mdc.append(b"stale", true).unwrap();
        let old = mdc.active_objid().unwrap();
        let old_log = dir
            .path()
            .join("mlog")
            .join(format!("{:016x}.log", old.as_u64()));
        let saved = std::fs::read(&old_log).unwrap();

        assert_eq!(mdc.rewrite([b"fresh"]).unwrap(), 1);
        mdc.close().unwrap();
        pool.close().unwrap();
        drop(pool);

        // The old side got its new header but lost the truncate
        std::fs::write(&old_log, &saved).unwrap();

        let pool = reopen(dir.path());
        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_ne!(mdc.active_objid().unwrap(), old);
        assert_eq!(contents(&mdc), vec![b"fresh".to_vec()]);
        mdc.close().unwrap();

        // Selection repaired the stale side
        let (mlh, _) = pool.mlog_open(old, MlogOpenFlags::CSEM).unwrap();
        assert!(mlh.is_empty().unwrap());
        mlh.close().unwrap();
        pool.mlog_put(mlh).unwrap();
        assert_eq!(lock_inversions(), 0);
    }

    #[test]
    fn test_second_open_leaves_live_mdc_alone() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        mdc.append(b"before", false).unwrap();

        let err = Mdc::open(&pool, a, b).unwrap_err();
        assert!(err.is(Errno::EBUSY));
        assert_eq!(pool.cache_stats().refs, 2);

        mdc.append(b"after", true).unwrap();
        assert_eq!(contents(&mdc), vec![b"before".to_vec(), b"after".to_vec()]);
        mdc.close().unwrap();
        assert_eq!(pool.cache_stats().refs, 0);
    }

    #[test]
    fn test_superseded_erase_failure_is_not_fatal() {
        let (_dir, pool, media) = setup_hooked();
        let (a, b) = new_mdc(&pool);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        mdc.append(b"old", true).unwrap();
        let old = mdc.active_objid().unwrap();

        media.set_erase_hook(|| Err(Error::new(Errno::EIO)));
        assert_eq!(mdc.rewrite([b"fresh"]).unwrap(), 1);
        assert_ne!(mdc.active_objid().unwrap(), old);
        assert_eq!(contents(&mdc), vec![b"fresh".to_vec()]);
        mdc.append(b"delta", true).unwrap();
        mdc.close().unwrap();

        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_ne!(mdc.active_objid().unwrap(), old);
        assert_eq!(contents(&mdc), vec![b"fresh".to_vec(), b"delta".to_vec()]);
        mdc.close().unwrap();
    }

    #[test]
    fn test_reader_sees_whole_snapshot_during_rewrites() {
        const RECORDS: usize = 10;

        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);
        let mdc = Mdc::open(&pool, a, b).unwrap();
        mdc.rewrite((0..RECORDS).map(|i| format!("a{i}"))).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                for letter in 'b'..='k' {
                    mdc.rewrite((0..RECORDS).map(|i| format!("{letter}{i}"))).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..50 {
                    let mut reader = mdc.reader().unwrap();
                    let mut seen = Vec::new();
                    while let Some(rec) = reader.next_record().unwrap() {
                        seen.push(rec);
                        std::thread::yield_now();
                    }
                    drop(reader);

                    assert_eq!(seen.len(), RECORDS);
                    let letter = seen[0][0];
                    for (i, rec) in seen.iter().enumerate() {
                        assert_eq!(rec.as_ref(), format!("{}{i}", letter as char).as_bytes());
                    }
                }
            });
        });

        assert_eq!(contents(&mdc)[0].as_slice(), b"k0");
        mdc.close().unwrap();
        assert_eq!(lock_inversions(), 0);
    }

    #[test]
    fn test_usage_and_destroy() {
        let (_dir, pool) = setup();
        let (a, b) = new_mdc(&pool);

        let mdc = Mdc::open(&pool, a, b).unwrap();
        assert_eq!(mdc.usage().unwrap(), 0);
        mdc.append(&[1u8; 100], false).unwrap();
        assert!(mdc.usage().unwrap() > 100);
        mdc.sync().unwrap();
        mdc.close().unwrap();

        Mdc::destroy(&pool, a, b).unwrap();
        assert!(pool.mlog_props(a).unwrap_err().is(Errno::ENOENT));
        assert!(Mdc::open(&pool, a, a).unwrap_err().is(Errno::EINVAL));
    }
}
