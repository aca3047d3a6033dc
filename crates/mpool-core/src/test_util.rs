//! Shared fixtures for unit tests

use crate::pool::Mpool;
use mpool_common::{
    DeviceReport, MblockProps, MediaClass, MlogProps, MpoolConfig, ObjectId, Result,
};
use mpool_media::{DirPool, DirPoolParams, MapSource, MediaPool};
use parking_lot::Mutex;
use std::io::IoSlice;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

type EraseHook = Box<dyn FnOnce() -> Result<()> + Send>;

/// A [`DirPool`] whose next mlog erase first runs a one-shot hook
///
/// The hook runs with no core lock held. An error from it fails the erase
/// before the media is touched.
pub(crate) struct HookedMedia {
    inner: DirPool,
    erase_hook: Mutex<Option<EraseHook>>,
}

impl HookedMedia {
    pub(crate) fn set_erase_hook(&self, hook: impl FnOnce() -> Result<()> + Send + 'static) {
        *self.erase_hook.lock() = Some(Box::new(hook));
    }
}

impl MediaPool for HookedMedia {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn mblock_alloc(&self, class: MediaClass, spare: bool) -> Result<(ObjectId, MblockProps)> {
        self.inner.mblock_alloc(class, spare)
    }

    fn mblock_write(&self, id: ObjectId, iov: &[IoSlice<'_>]) -> Result<()> {
        self.inner.mblock_write(id, iov)
    }

    fn mblock_commit(&self, id: ObjectId) -> Result<()> {
        self.inner.mblock_commit(id)
    }

    fn mblock_abort(&self, id: ObjectId) -> Result<()> {
        self.inner.mblock_abort(id)
    }

    fn mblock_delete(&self, id: ObjectId) -> Result<()> {
        self.inner.mblock_delete(id)
    }

    fn mblock_read(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.mblock_read(id, offset, buf)
    }

    fn mblock_props(&self, id: ObjectId) -> Result<MblockProps> {
        self.inner.mblock_props(id)
    }

    fn mblock_map_source(&self, id: ObjectId) -> Result<MapSource> {
        self.inner.mblock_map_source(id)
    }

    fn mlog_alloc(&self, class: MediaClass, capacity: u64) -> Result<(ObjectId, MlogProps)> {
        self.inner.mlog_alloc(class, capacity)
    }

    fn mlog_commit(&self, id: ObjectId) -> Result<()> {
        self.inner.mlog_commit(id)
    }

    fn mlog_abort(&self, id: ObjectId) -> Result<()> {
        self.inner.mlog_abort(id)
    }

    fn mlog_delete(&self, id: ObjectId) -> Result<()> {
        self.inner.mlog_delete(id)
    }

    fn mlog_props(&self, id: ObjectId) -> Result<MlogProps> {
        self.inner.mlog_props(id)
    }

    fn mlog_read(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.mlog_read(id, offset, buf)
    }

    fn mlog_write(&self, id: ObjectId, offset: u64, iov: &[IoSlice<'_>]) -> Result<()> {
        self.inner.mlog_write(id, offset, iov)
    }

    fn mlog_sync(&self, id: ObjectId) -> Result<()> {
        self.inner.mlog_sync(id)
    }

    fn mlog_erase(&self, id: ObjectId, generation: u64) -> Result<()> {
        let hook = self.erase_hook.lock().take();
        if let Some(hook) = hook {
            hook()?;
        }
        self.inner.mlog_erase(id, generation)
    }
}

fn create_media(dir: &TempDir) -> DirPool {
    let mut rpt = DeviceReport::new();
    let params = DirPoolParams {
        mblock_capacity: 8 << 20,
        mlog_capacity: 1 << 20,
    };
    DirPool::create(dir.path(), "mp0", params, &mut rpt).unwrap()
}

pub(crate) fn setup() -> (TempDir, Mpool) {
    setup_with(MpoolConfig::default())
}

pub(crate) fn setup_with(config: MpoolConfig) -> (TempDir, Mpool) {
    let dir = tempfile::tempdir().unwrap();
    let media = create_media(&dir);
    let mut rpt = DeviceReport::new();
    let pool = Mpool::open(Arc::new(media), config, &mut rpt).unwrap();
    (dir, pool)
}

/// A pool over [`HookedMedia`], returned alongside so tests can arm hooks
pub(crate) fn setup_hooked() -> (TempDir, Mpool, Arc<HookedMedia>) {
    let dir = tempfile::tempdir().unwrap();
    let media = Arc::new(HookedMedia {
        inner: create_media(&dir),
        erase_hook: Mutex::new(None),
    });
    let mut rpt = DeviceReport::new();
    let pool = Mpool::open(media.clone(), MpoolConfig::default(), &mut rpt).unwrap();
    (dir, pool, media)
}

/// Reopen the pool stored at `path`, as after a restart
pub(crate) fn reopen(path: &Path) -> Mpool {
    let mut rpt = DeviceReport::new();
    let media = DirPool::open(path, &mut rpt).unwrap();
    Mpool::open(Arc::new(media), MpoolConfig::default(), &mut rpt).unwrap()
}

/// Allocate and commit an mlog; capacity 0 selects the pool default
pub(crate) fn new_mlog(pool: &Mpool, capacity: u64) -> ObjectId {
    let (id, _) = pool.mlog_alloc(MediaClass::Capacity, capacity).unwrap();
    pool.mlog_commit(id).unwrap();
    id
}
