//! Directory-backed media pool
//!
//! Every object is a file under the pool directory (see [`crate::layout`]).
//! Uncommitted objects live under a `.pending` name and are renamed on
//! commit, so a crash never exposes a half-written object as committed.
//! Uncommitted objects found when the pool is opened are discarded.

use crate::layout::{ALIGNMENT, MlogHeader, PoolSuperblock};
use crate::media::{MapSource, MediaPool};
use mpool_common::{
    DevRptReason, DeviceReport, Errno, Error, MblockProps, MediaClass, MlogProps, ObjectId,
    ObjectKind, Result, is_valid_pool_name,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{IoSlice, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

const SUPERBLOCK_FILE: &str = "superblock";
const MBLOCK_DIR: &str = "mblock";
const MLOG_DIR: &str = "mlog";

const PENDING_EXT: &str = "pending";
const MBLOCK_EXT: &str = "data";
const MLOG_EXT: &str = "log";
const MLOG_HDR_EXT: &str = "hdr";

/// Parameters for a new directory pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirPoolParams {
    /// Capacity of every mblock (multiple of 4KB)
    pub mblock_capacity: u64,
    /// Capacity used when an mlog is allocated with capacity 0
    pub mlog_capacity: u64,
}

impl Default for DirPoolParams {
    fn default() -> Self {
        Self {
            mblock_capacity: 32 * 1024 * 1024, // 32 MB
            mlog_capacity: 4 * 1024 * 1024,    // 4 MB
        }
    }
}

struct MblockEntry {
    file: File,
    class: MediaClass,
    written: u64,
    committed: bool,
}

struct MlogEntry {
    file: File,
    header: MlogHeader,
    committed: bool,
}

/// Media pool stored in a directory
pub struct DirPool {
    root: PathBuf,
    superblock: PoolSuperblock,
    next_uniq: AtomicU64,
    mblocks: RwLock<HashMap<ObjectId, Arc<Mutex<MblockEntry>>>>,
    mlogs: RwLock<HashMap<ObjectId, Arc<Mutex<MlogEntry>>>>,
}

#[track_caller]
fn io_err(e: &std::io::Error) -> Error {
    Error::from_io(e)
}

impl DirPool {
    /// Format a new pool in `path`
    ///
    /// The directory is created if needed. Failures are described in `rpt`:
    /// argument 0 is the path, argument 1 the name, argument 2 the params.
    pub fn create(
        path: impl AsRef<Path>,
        name: &str,
        params: DirPoolParams,
        rpt: &mut DeviceReport,
    ) -> Result<Self> {
        let root = path.as_ref().to_path_buf();

        if !is_valid_pool_name(name) {
            rpt.set(DevRptReason::EntNamInv, 1);
            return Err(Error::new(Errno::EINVAL));
        }

        fs::create_dir_all(&root).map_err(|e| {
            rpt.set(DevRptReason::Open, 0);
            io_err(&e)
        })?;

        let sb_path = root.join(SUPERBLOCK_FILE);
        match fs::read(&sb_path) {
            Ok(data) if PoolSuperblock::has_magic(&data) => {
                rpt.set(DevRptReason::Magic, 0);
                return Err(Error::new(Errno::EEXIST));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                rpt.set(DevRptReason::Stat, 0);
                return Err(io_err(&e));
            }
        }

        let superblock = PoolSuperblock::new(name, params.mblock_capacity, params.mlog_capacity)
            .inspect_err(|_| rpt.set(DevRptReason::Parm, 2))?;

        for dir in [MBLOCK_DIR, MLOG_DIR] {
            fs::create_dir_all(root.join(dir)).map_err(|e| {
                rpt.set(DevRptReason::DevRw, 0);
                io_err(&e)
            })?;
        }

        write_atomic(&sb_path, &superblock.to_bytes()).inspect_err(|_| {
            rpt.set(DevRptReason::DevRw, 0);
        })?;

        info!(
            "Created pool {} ({}) at {}",
            superblock.name,
            superblock.uuid,
            root.display()
        );

        Ok(Self {
            root,
            superblock,
            next_uniq: AtomicU64::new(1),
            mblocks: RwLock::new(HashMap::new()),
            mlogs: RwLock::new(HashMap::new()),
        })
    }

    /// Open an existing pool
    pub fn open(path: impl AsRef<Path>, rpt: &mut DeviceReport) -> Result<Self> {
        let root = path.as_ref().to_path_buf();

        match fs::metadata(&root) {
            Ok(m) if m.is_dir() => {}
            Ok(_) => {
                rpt.set(DevRptReason::InvalDev, 0);
                return Err(Error::new(Errno::EINVAL));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                rpt.set(DevRptReason::MpNoDev, 0);
                return Err(io_err(&e));
            }
            Err(e) => {
                rpt.set(DevRptReason::Stat, 0);
                return Err(io_err(&e));
            }
        }

        let data = fs::read(root.join(SUPERBLOCK_FILE)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                rpt.set(DevRptReason::MpNoDev, 0);
            } else {
                rpt.set(DevRptReason::DevRw, 0);
            }
            io_err(&e)
        })?;
        let superblock = PoolSuperblock::from_bytes(&data).inspect_err(|_| {
            rpt.set(DevRptReason::InvalDev, 0);
        })?;

        let pool = Self {
            root,
            superblock,
            next_uniq: AtomicU64::new(1),
            mblocks: RwLock::new(HashMap::new()),
            mlogs: RwLock::new(HashMap::new()),
        };
        pool.recover().inspect_err(|_| rpt.set(DevRptReason::DevRw, 0))?;

        info!(
            "Opened pool {} ({}): {} mblocks, {} mlogs",
            pool.superblock.name,
            pool.superblock.uuid,
            pool.mblocks.read().len(),
            pool.mlogs.read().len()
        );
        Ok(pool)
    }

    /// Rebuild the object tables from the directory contents
    fn recover(&self) -> Result<()> {
        let mut max_uniq = 0u64;

        for (id, ext, path) in list_objects(&self.root.join(MBLOCK_DIR))? {
            match ext.as_str() {
                MBLOCK_EXT => {
                    let file = File::open(&path).map_err(|e| io_err(&e))?;
                    let written = file.metadata().map_err(|e| io_err(&e))?.len();
                    self.mblocks.write().insert(
                        id,
                        Arc::new(Mutex::new(MblockEntry {
                            file,
                            class: MediaClass::default(),
                            written,
                            committed: true,
                        })),
                    );
                    max_uniq = max_uniq.max(id.uniq());
                }
                PENDING_EXT => {
                    warn!("Discarding uncommitted mblock {}", id);
                    fs::remove_file(&path).map_err(|e| io_err(&e))?;
                    max_uniq = max_uniq.max(id.uniq());
                }
                _ => {}
            }
        }

        let mlog_dir = self.root.join(MLOG_DIR);
        for (id, ext, path) in list_objects(&mlog_dir)? {
            max_uniq = max_uniq.max(id.uniq());
            match ext.as_str() {
                MLOG_EXT => {
                    let header = read_header(&self.hdr_path(id))?;
                    let file = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(&path)
                        .map_err(|e| io_err(&e))?;
                    self.mlogs.write().insert(
                        id,
                        Arc::new(Mutex::new(MlogEntry {
                            file,
                            header,
                            committed: true,
                        })),
                    );
                }
                PENDING_EXT => {
                    warn!("Discarding uncommitted mlog {}", id);
                    fs::remove_file(&path).map_err(|e| io_err(&e))?;
                    remove_if_exists(&self.hdr_path(id))?;
                }
                _ => {}
            }
        }

        self.next_uniq.store(max_uniq + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Pool directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pool superblock
    pub fn superblock(&self) -> &PoolSuperblock {
        &self.superblock
    }

    /// Capacity of every mblock in this pool
    pub fn mblock_capacity(&self) -> u64 {
        self.superblock.mblock_capacity
    }

    /// Ids of every mblock in the pool, in ascending order
    pub fn mblock_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.mblocks.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of every mlog in the pool, in ascending order
    pub fn mlog_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<_> = self.mlogs.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn alloc_id(&self, kind: ObjectKind) -> ObjectId {
        ObjectId::new(self.next_uniq.fetch_add(1, Ordering::SeqCst), kind)
    }

    fn object_path(&self, dir: &str, id: ObjectId, ext: &str) -> PathBuf {
        self.root
            .join(dir)
            .join(format!("{:016x}.{}", id.as_u64(), ext))
    }

    fn hdr_path(&self, id: ObjectId) -> PathBuf {
        self.object_path(MLOG_DIR, id, MLOG_HDR_EXT)
    }

    #[track_caller]
    fn mblock(&self, id: ObjectId) -> Result<Arc<Mutex<MblockEntry>>> {
        id.expect_kind(ObjectKind::Mblock)?;
        self.mblocks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(Errno::ENOENT))
    }

    #[track_caller]
    fn mlog(&self, id: ObjectId) -> Result<Arc<Mutex<MlogEntry>>> {
        id.expect_kind(ObjectKind::Mlog)?;
        self.mlogs
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::new(Errno::ENOENT))
    }

    fn mlog_props_of(id: ObjectId, entry: &MlogEntry) -> MlogProps {
        MlogProps {
            objid: id,
            capacity: entry.header.capacity,
            generation: entry.header.generation,
            committed: entry.committed,
            class: entry.header.class,
        }
    }
}

impl MediaPool for DirPool {
    fn name(&self) -> &str {
        &self.superblock.name
    }

    fn mblock_alloc(&self, class: MediaClass, _spare: bool) -> Result<(ObjectId, MblockProps)> {
        let id = self.alloc_id(ObjectKind::Mblock);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.object_path(MBLOCK_DIR, id, PENDING_EXT))
            .map_err(|e| io_err(&e))?;

        self.mblocks.write().insert(
            id,
            Arc::new(Mutex::new(MblockEntry {
                file,
                class,
                written: 0,
                committed: false,
            })),
        );

        Ok((
            id,
            MblockProps {
                objid: id,
                capacity: self.superblock.mblock_capacity,
                written: 0,
                committed: false,
                class,
            },
        ))
    }

    fn mblock_write(&self, id: ObjectId, iov: &[IoSlice<'_>]) -> Result<()> {
        let entry = self.mblock(id)?;
        let mut entry = entry.lock();

        if entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        if iov.iter().any(|seg| seg.len() % ALIGNMENT != 0) {
            return Err(Error::new(Errno::EINVAL));
        }

        let total: u64 = iov.iter().map(|seg| seg.len() as u64).sum();
        if entry.written + total > self.superblock.mblock_capacity {
            return Err(Error::new(Errno::EFBIG));
        }

        let mut offset = entry.written;
        for seg in iov {
            entry
                .file
                .write_all_at(seg, offset)
                .map_err(|e| io_err(&e))?;
            offset += seg.len() as u64;
        }
        entry.written = offset;
        Ok(())
    }

    fn mblock_commit(&self, id: ObjectId) -> Result<()> {
        let entry = self.mblock(id)?;
        let mut entry = entry.lock();

        if entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        entry.file.sync_all().map_err(|e| io_err(&e))?;
        fs::rename(
            self.object_path(MBLOCK_DIR, id, PENDING_EXT),
            self.object_path(MBLOCK_DIR, id, MBLOCK_EXT),
        )
        .map_err(|e| io_err(&e))?;
        sync_dir(&self.root.join(MBLOCK_DIR))?;

        entry.committed = true;
        debug!("Committed mblock {} ({} bytes)", id, entry.written);
        Ok(())
    }

    fn mblock_abort(&self, id: ObjectId) -> Result<()> {
        let entry = self.mblock(id)?;
        let entry = entry.lock();

        if entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        fs::remove_file(self.object_path(MBLOCK_DIR, id, PENDING_EXT)).map_err(|e| io_err(&e))?;
        self.mblocks.write().remove(&id);
        Ok(())
    }

    fn mblock_delete(&self, id: ObjectId) -> Result<()> {
        let entry = self.mblock(id)?;
        let entry = entry.lock();

        if !entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        fs::remove_file(self.object_path(MBLOCK_DIR, id, MBLOCK_EXT)).map_err(|e| io_err(&e))?;
        self.mblocks.write().remove(&id);
        debug!("Deleted mblock {}", id);
        Ok(())
    }

    fn mblock_read(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = self.mblock(id)?;
        let entry = entry.lock();

        if !entry.committed || offset > entry.written {
            return Err(Error::new(Errno::EINVAL));
        }
        read_full_at(&entry.file, offset, buf)
    }

    fn mblock_props(&self, id: ObjectId) -> Result<MblockProps> {
        let entry = self.mblock(id)?;
        let entry = entry.lock();

        Ok(MblockProps {
            objid: id,
            capacity: self.superblock.mblock_capacity,
            written: entry.written,
            committed: entry.committed,
            class: entry.class,
        })
    }

    fn mblock_map_source(&self, id: ObjectId) -> Result<MapSource> {
        let entry = self.mblock(id)?;
        let entry = entry.lock();

        if !entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        let file =
            File::open(self.object_path(MBLOCK_DIR, id, MBLOCK_EXT)).map_err(|e| io_err(&e))?;
        Ok(MapSource {
            file,
            len: entry.written,
        })
    }

    fn mlog_alloc(&self, class: MediaClass, capacity: u64) -> Result<(ObjectId, MlogProps)> {
        let capacity = if capacity == 0 {
            self.superblock.mlog_capacity
        } else {
            capacity
        };
        let id = self.alloc_id(ObjectKind::Mlog);
        let header = MlogHeader {
            capacity,
            generation: 0,
            class,
        };

        write_atomic(&self.hdr_path(id), &header.to_bytes()?)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.object_path(MLOG_DIR, id, PENDING_EXT))
            .map_err(|e| io_err(&e))?;

        let entry = MlogEntry {
            file,
            header,
            committed: false,
        };
        let props = Self::mlog_props_of(id, &entry);
        self.mlogs.write().insert(id, Arc::new(Mutex::new(entry)));
        Ok((id, props))
    }

    fn mlog_commit(&self, id: ObjectId) -> Result<()> {
        let entry = self.mlog(id)?;
        let mut entry = entry.lock();

        if entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        entry.file.sync_all().map_err(|e| io_err(&e))?;
        fs::rename(
            self.object_path(MLOG_DIR, id, PENDING_EXT),
            self.object_path(MLOG_DIR, id, MLOG_EXT),
        )
        .map_err(|e| io_err(&e))?;
        sync_dir(&self.root.join(MLOG_DIR))?;

        entry.committed = true;
        debug!("Committed mlog {} (capacity {})", id, entry.header.capacity);
        Ok(())
    }

    fn mlog_abort(&self, id: ObjectId) -> Result<()> {
        let entry = self.mlog(id)?;
        let entry = entry.lock();

        if entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        fs::remove_file(self.object_path(MLOG_DIR, id, PENDING_EXT)).map_err(|e| io_err(&e))?;
        remove_if_exists(&self.hdr_path(id))?;
        self.mlogs.write().remove(&id);
        Ok(())
    }

    fn mlog_delete(&self, id: ObjectId) -> Result<()> {
        let entry = self.mlog(id)?;
        let entry = entry.lock();

        if !entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        fs::remove_file(self.object_path(MLOG_DIR, id, MLOG_EXT)).map_err(|e| io_err(&e))?;
        remove_if_exists(&self.hdr_path(id))?;
        self.mlogs.write().remove(&id);
        debug!("Deleted mlog {}", id);
        Ok(())
    }

    fn mlog_props(&self, id: ObjectId) -> Result<MlogProps> {
        let entry = self.mlog(id)?;
        let entry = entry.lock();
        Ok(Self::mlog_props_of(id, &entry))
    }

    fn mlog_read(&self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let entry = self.mlog(id)?;
        let entry = entry.lock();

        if !entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        read_full_at(&entry.file, offset, buf)
    }

    fn mlog_write(&self, id: ObjectId, offset: u64, iov: &[IoSlice<'_>]) -> Result<()> {
        let entry = self.mlog(id)?;
        let entry = entry.lock();

        if !entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }
        let total: u64 = iov.iter().map(|seg| seg.len() as u64).sum();
        if offset + total > entry.header.capacity {
            return Err(Error::new(Errno::EFBIG));
        }

        let mut offset = offset;
        for seg in iov {
            entry
                .file
                .write_all_at(seg, offset)
                .map_err(|e| io_err(&e))?;
            offset += seg.len() as u64;
        }
        Ok(())
    }

    fn mlog_sync(&self, id: ObjectId) -> Result<()> {
        let entry = self.mlog(id)?;
        let entry = entry.lock();
        entry.file.sync_data().map_err(|e| io_err(&e))
    }

    fn mlog_erase(&self, id: ObjectId, generation: u64) -> Result<()> {
        let entry = self.mlog(id)?;
        let mut entry = entry.lock();

        if !entry.committed {
            return Err(Error::new(Errno::EINVAL));
        }

        // Stream first: old records must never outlive a newer header
        entry.file.set_len(0).map_err(|e| io_err(&e))?;
        entry.file.sync_all().map_err(|e| io_err(&e))?;

        let mut header = entry.header;
        header.generation = generation;
        write_atomic(&self.hdr_path(id), &header.to_bytes()?)?;
        entry.header = header;
        debug!("Erased mlog {} at generation {}", id, generation);
        Ok(())
    }
}

/// Read until `buf` is full or end of file
fn read_full_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(io_err(&e)),
        }
    }
    Ok(done)
}

/// Replace `path` with `data` via a synced temporary file and rename
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp).map_err(|e| io_err(&e))?;
        file.write_all(data).map_err(|e| io_err(&e))?;
        file.sync_all().map_err(|e| io_err(&e))?;
    }
    fs::rename(&tmp, path).map_err(|e| io_err(&e))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

fn read_header(path: &Path) -> Result<MlogHeader> {
    let data = fs::read(path).map_err(|e| io_err(&e))?;
    MlogHeader::from_bytes(&data)
}

fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_err(&e))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(&e)),
    }
}

/// List `<hex id>.<ext>` files in an object directory
fn list_objects(dir: &Path) -> Result<Vec<(ObjectId, String, PathBuf)>> {
    let mut objects = Vec::new();
    for dirent in fs::read_dir(dir).map_err(|e| io_err(&e))? {
        let path = dirent.map_err(|e| io_err(&e))?.path();
        let (Some(stem), Some(ext)) = (
            path.file_stem().and_then(|s| s.to_str()),
            path.extension().and_then(|s| s.to_str()),
        ) else {
            continue;
        };
        let Ok(raw) = u64::from_str_radix(stem, 16) else {
            continue;
        };
        objects.push((ObjectId::from(raw), ext.to_string(), path.clone()));
    }
    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tempfile::tempdir;

    fn small_params() -> DirPoolParams {
        DirPoolParams {
            mblock_capacity: 64 * 1024,
            mlog_capacity: 16 * 1024,
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();

        let (mb, ml) = {
            let pool = DirPool::create(dir.path(), "mp0", small_params(), &mut rpt).unwrap();
            let (mb, _) = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
            pool.mblock_write(mb, &[IoSlice::new(&[7u8; ALIGNMENT])]).unwrap();
            pool.mblock_commit(mb).unwrap();

            let (ml, props) = pool.mlog_alloc(MediaClass::Staging, 0).unwrap();
            assert_eq!(props.capacity, 16 * 1024);
            pool.mlog_commit(ml).unwrap();
            (mb, ml)
        };

        let pool = DirPool::open(dir.path(), &mut rpt).unwrap();
        assert!(!rpt.is_set());
        assert_eq!(pool.name(), "mp0");
        assert_eq!(pool.mblock_props(mb).unwrap().written, ALIGNMENT as u64);
        let props = pool.mlog_props(ml).unwrap();
        assert!(props.committed);
        assert_eq!(props.class, MediaClass::Staging);
        assert_eq!(pool.mblock_ids(), vec![mb]);
        assert_eq!(pool.mlog_ids(), vec![ml]);

        // New ids never collide with recovered ones
        let (next, _) = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
        assert!(next.uniq() > ml.uniq());
    }

    #[test]
    fn test_create_on_formatted_dir_reports_magic() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();
        DirPool::create(dir.path(), "mp0", small_params(), &mut rpt).unwrap();

        let err = DirPool::create(dir.path(), "mp1", small_params(), &mut rpt)
            .err()
            .unwrap();
        assert!(err.is(Errno::EEXIST));
        assert_eq!(rpt.reason(), DevRptReason::Magic);
        assert_eq!(rpt.arg_offset(), 0);
    }

    #[test]
    fn test_bad_name_and_missing_pool() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();
        let err = DirPool::create(dir.path(), "bad name", small_params(), &mut rpt)
            .err()
            .unwrap();
        assert!(err.is(Errno::EINVAL));
        assert_eq!(rpt.reason(), DevRptReason::EntNamInv);

        rpt.init();
        let err = DirPool::open(dir.path().join("nope"), &mut rpt).err().unwrap();
        assert!(err.is(Errno::ENOENT));
        assert_eq!(rpt.reason(), DevRptReason::MpNoDev);
    }

    #[test]
    fn test_corrupt_superblock_reports_invaldev() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();
        DirPool::create(dir.path(), "mp0", small_params(), &mut rpt).unwrap();

        let sb = dir.path().join(SUPERBLOCK_FILE);
        let mut data = fs::read(&sb).unwrap();
        data[30] ^= 0x55;
        fs::write(&sb, data).unwrap();

        assert!(DirPool::open(dir.path(), &mut rpt).is_err());
        assert_eq!(rpt.reason(), DevRptReason::InvalDev);
    }

    #[test]
    fn test_mblock_lifecycle() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();
        let pool = DirPool::create(dir.path(), "mp0", small_params(), &mut rpt).unwrap();

        let mut data = vec![0u8; 2 * ALIGNMENT];
        rand::thread_rng().fill_bytes(&mut data);

        let (id, _) = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();

        // reads are only allowed once committed
        let mut buf = vec![0u8; ALIGNMENT];
        assert!(pool.mblock_read(id, 0, &mut buf).is_err());

        // unaligned segment
        let err = pool.mblock_write(id, &[IoSlice::new(&data[..100])]).unwrap_err();
        assert!(err.is(Errno::EINVAL));

        pool.mblock_write(
            id,
            &[IoSlice::new(&data[..ALIGNMENT]), IoSlice::new(&data[ALIGNMENT..])],
        )
        .unwrap();
        pool.mblock_commit(id).unwrap();

        // committed mblocks are immutable
        assert!(pool.mblock_write(id, &[IoSlice::new(&data[..ALIGNMENT])]).is_err());
        assert!(pool.mblock_abort(id).is_err());

        let mut out = vec![0u8; 2 * ALIGNMENT];
        assert_eq!(pool.mblock_read(id, 0, &mut out).unwrap(), 2 * ALIGNMENT);
        assert_eq!(out, data);

        let src = pool.mblock_map_source(id).unwrap();
        assert_eq!(src.len, 2 * ALIGNMENT as u64);

        pool.mblock_delete(id).unwrap();
        assert!(pool.mblock_props(id).unwrap_err().is(Errno::ENOENT));
    }

    #[test]
    fn test_mblock_capacity_limit() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();
        let pool = DirPool::create(dir.path(), "mp0", small_params(), &mut rpt).unwrap();

        let (id, props) = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
        let big = vec![1u8; props.capacity as usize + ALIGNMENT];
        let err = pool.mblock_write(id, &[IoSlice::new(&big)]).unwrap_err();
        assert!(err.is(Errno::EFBIG));
        assert_eq!(pool.mblock_props(id).unwrap().written, 0);

        pool.mblock_abort(id).unwrap();
        assert!(pool.mblock_props(id).is_err());
    }

    #[test]
    fn test_uncommitted_objects_discarded_on_open() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();
        let (mb, ml) = {
            let pool = DirPool::create(dir.path(), "mp0", small_params(), &mut rpt).unwrap();
            let (mb, _) = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
            let (ml, _) = pool.mlog_alloc(MediaClass::Capacity, 0).unwrap();
            (mb, ml)
        };

        let pool = DirPool::open(dir.path(), &mut rpt).unwrap();
        assert!(pool.mblock_props(mb).unwrap_err().is(Errno::ENOENT));
        assert!(pool.mlog_props(ml).unwrap_err().is(Errno::ENOENT));
    }

    #[test]
    fn test_mlog_raw_io_and_erase() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();
        let pool = DirPool::create(dir.path(), "mp0", small_params(), &mut rpt).unwrap();

        let (id, _) = pool.mlog_alloc(MediaClass::Capacity, 1024).unwrap();
        assert!(pool.mlog_write(id, 0, &[IoSlice::new(b"x")]).is_err());
        pool.mlog_commit(id).unwrap();

        pool.mlog_write(id, 0, &[IoSlice::new(b"hello "), IoSlice::new(b"world")])
            .unwrap();
        pool.mlog_sync(id).unwrap();

        let mut buf = [0u8; 64];
        let n = pool.mlog_read(id, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");

        let err = pool
            .mlog_write(id, 1000, &[IoSlice::new(&[0u8; 100])])
            .unwrap_err();
        assert!(err.is(Errno::EFBIG));

        pool.mlog_erase(id, 9).unwrap();
        assert_eq!(pool.mlog_read(id, 0, &mut buf).unwrap(), 0);
        assert_eq!(pool.mlog_props(id).unwrap().generation, 9);

        drop(pool);
        let pool = DirPool::open(dir.path(), &mut rpt).unwrap();
        assert_eq!(pool.mlog_props(id).unwrap().generation, 9);
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let dir = tempdir().unwrap();
        let mut rpt = DeviceReport::new();
        let pool = DirPool::create(dir.path(), "mp0", small_params(), &mut rpt).unwrap();

        let (mb, _) = pool.mblock_alloc(MediaClass::Capacity, false).unwrap();
        assert!(pool.mlog_props(mb).unwrap_err().is(Errno::EINVAL));
    }
}
