//! Pool handle
//!
//! [`Mpool`] binds a media pool to its configuration and owns the mlog
//! handle cache. Handles keep only a weak back-reference to the pool.

use crate::cache::{CacheStats, HandleCache};
use crate::lock::{LockRank, OrderedMutex};
use crate::mcache::McacheMap;
use crate::mlog::{MlogHandle, MlogOpenFlags, MlogShared};
use mpool_common::{
    DevRptReason, DeviceReport, Errno, Error, MblockProps, MediaClass, MlogProps, MpoolConfig,
    ObjectId, ObjectKind, Result, is_valid_pool_name,
};
use mpool_media::MediaPool;
use std::fmt;
use std::io::IoSlice;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

pub(crate) struct PoolInner {
    name: String,
    pub(crate) media: Arc<dyn MediaPool>,
    pub(crate) config: MpoolConfig,
    /// The pool lock
    cache: OrderedMutex<HandleCache>,
    closed: AtomicBool,
}

impl PoolInner {
    pub(crate) fn release_if_idle(&self, shared: &Arc<MlogShared>) {
        self.cache.lock().release_if_idle(shared);
    }
}

/// An open media pool
///
/// Cheap to clone; all clones share the handle cache.
#[derive(Clone)]
pub struct Mpool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Mpool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mpool")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Mpool {
    /// Open a pool over `media`
    ///
    /// A bad pool name is reported as [`DevRptReason::EntNamInv`], a bad
    /// configuration as [`DevRptReason::Parm`].
    pub fn open(
        media: Arc<dyn MediaPool>,
        config: MpoolConfig,
        rpt: &mut DeviceReport,
    ) -> Result<Self> {
        let name = media.name().to_string();
        if !is_valid_pool_name(&name) {
            rpt.set(DevRptReason::EntNamInv, 0);
            return Err(Error::new(Errno::EINVAL));
        }
        if let Err(err) = config.validate() {
            rpt.set(DevRptReason::Parm, 1);
            return Err(err);
        }

        info!(
            "Opened pool {} (handle cache {}, csem {})",
            name, config.handle_cache_capacity, config.csem_on_open
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                media,
                cache: OrderedMutex::new(
                    LockRank::Pool,
                    HandleCache::new(config.handle_cache_capacity),
                ),
                config,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Close the pool
    ///
    /// Fails with `EBUSY` while any mlog handle is referenced. Idle open
    /// logs are flushed and closed. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let idle = {
            let mut cache = self.inner.cache.lock();
            if self.inner.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            if cache.is_busy() {
                return Err(Error::new(Errno::EBUSY));
            }
            self.inner.closed.store(true, Ordering::Release);
            cache.drain()
        };

        let mut res = Ok(());
        for shared in idle {
            if let Err(err) = shared.shutdown(self.inner.media.as_ref()) {
                error!("Closing mlog {} failed: {}", shared.objid(), err);
                res = res.and(Err(err));
            }
        }
        info!("Closed pool {}", self.inner.name);
        res
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Pool configuration
    #[must_use]
    pub fn config(&self) -> &MpoolConfig {
        &self.inner.config
    }

    /// Underlying media pool
    #[must_use]
    pub fn media(&self) -> &Arc<dyn MediaPool> {
        &self.inner.media
    }

    #[track_caller]
    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::new(Errno::EINVAL));
        }
        Ok(())
    }

    /// Get a referenced handle for an mlog
    ///
    /// Fails with `ENOMEM` when the handle cache is full and nothing can be
    /// evicted.
    pub fn mlog_get(&self, objid: ObjectId) -> Result<MlogHandle> {
        objid.expect_kind(ObjectKind::Mlog)?;
        let shared = {
            let mut cache = self.inner.cache.lock();
            self.check_open()?;
            cache.get(objid)?
        };
        Ok(MlogHandle::new(shared, Arc::downgrade(&self.inner)))
    }

    /// Drop a reference taken by [`Self::mlog_get`]
    pub fn mlog_put(&self, handle: MlogHandle) -> Result<()> {
        self.inner.cache.lock().put(handle.shared())
    }

    /// Get a handle and open the log; returns the handle and generation
    pub fn mlog_open(&self, objid: ObjectId, flags: MlogOpenFlags) -> Result<(MlogHandle, u64)> {
        let handle = self.mlog_get(objid)?;
        match handle.open(flags) {
            Ok(generation) => Ok((handle, generation)),
            Err(err) => {
                self.mlog_put(handle)?;
                Err(err)
            }
        }
    }

    /// Erase an mlog by id; returns the new generation
    pub fn mlog_erase_byoid(&self, objid: ObjectId, mingen: u64) -> Result<u64> {
        let handle = self.mlog_get(objid)?;
        let res = handle.erase(mingen);
        self.mlog_put(handle)?;
        res
    }

    /// Allocate an uncommitted mlog; capacity 0 selects the pool default
    pub fn mlog_alloc(&self, class: MediaClass, capacity: u64) -> Result<(ObjectId, MlogProps)> {
        self.check_open()?;
        self.inner.media.mlog_alloc(class, capacity)
    }

    pub fn mlog_commit(&self, objid: ObjectId) -> Result<()> {
        self.check_open()?;
        self.inner.media.mlog_commit(objid)
    }

    pub fn mlog_abort(&self, objid: ObjectId) -> Result<()> {
        self.check_open()?;
        self.inner.media.mlog_abort(objid)
    }

    /// Delete a committed mlog; `EBUSY` while a handle references it
    pub fn mlog_delete(&self, objid: ObjectId) -> Result<()> {
        {
            let mut cache = self.inner.cache.lock();
            self.check_open()?;
            match cache.refs(objid) {
                Some(0) => cache.release(objid),
                Some(_) => return Err(Error::new(Errno::EBUSY)),
                None => {}
            }
        }
        self.inner.media.mlog_delete(objid)
    }

    pub fn mlog_props(&self, objid: ObjectId) -> Result<MlogProps> {
        self.inner.media.mlog_props(objid)
    }

    /// Allocate an uncommitted mblock
    pub fn mblock_alloc(&self, class: MediaClass, spare: bool) -> Result<(ObjectId, MblockProps)> {
        self.check_open()?;
        self.inner.media.mblock_alloc(class, spare)
    }

    pub fn mblock_write(&self, objid: ObjectId, iov: &[IoSlice<'_>]) -> Result<()> {
        self.check_open()?;
        self.inner.media.mblock_write(objid, iov)
    }

    pub fn mblock_commit(&self, objid: ObjectId) -> Result<()> {
        self.check_open()?;
        self.inner.media.mblock_commit(objid)
    }

    pub fn mblock_abort(&self, objid: ObjectId) -> Result<()> {
        self.check_open()?;
        self.inner.media.mblock_abort(objid)
    }

    pub fn mblock_delete(&self, objid: ObjectId) -> Result<()> {
        self.check_open()?;
        self.inner.media.mblock_delete(objid)
    }

    pub fn mblock_read(&self, objid: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.media.mblock_read(objid, offset, buf)
    }

    pub fn mblock_props(&self, objid: ObjectId) -> Result<MblockProps> {
        self.inner.media.mblock_props(objid)
    }

    /// Map committed mblocks with the pool's default advice
    pub fn mcache_mmap(&self, ids: &[ObjectId]) -> Result<McacheMap> {
        self.check_open()?;
        McacheMap::mmap(self, ids, self.inner.config.mcache_advice_default)
    }

    /// Handle cache statistics
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.lock().stats()
    }
}
