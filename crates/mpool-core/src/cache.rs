//! Per-pool mlog handle cache
//!
//! Maps object ids to shared handle state with a reference count. There is
//! at most one live handle per id. Entries are released once they are both
//! unreferenced and closed; on a full table, idle closed entries are
//! evicted to make room.

use crate::mlog::{MlogShared, MlogState};
use mpool_common::{Errno, Error, ObjectId, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Handle cache statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Gets served by an existing entry
    pub hits: u64,
    /// Gets that created an entry
    pub misses: u64,
    /// Idle entries dropped to make room
    pub evictions: u64,
    /// Gets refused because the table was full
    pub refusals: u64,
    /// Entries currently in the table
    pub entries: usize,
    /// Sum of reference counts
    pub refs: usize,
}

struct CacheEntry {
    shared: Arc<MlogShared>,
    refs: usize,
}

/// Reference-counted table of mlog handles, guarded by the pool lock
pub(crate) struct HandleCache {
    capacity: usize,
    entries: HashMap<ObjectId, CacheEntry>,
    total_refs: usize,
    stats: CacheStats,
}

impl HandleCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            total_refs: 0,
            stats: CacheStats::default(),
        }
    }

    /// Take a reference on the handle for `objid`, creating it if needed
    pub(crate) fn get(&mut self, objid: ObjectId) -> Result<Arc<MlogShared>> {
        if self.total_refs >= self.capacity {
            self.stats.refusals += 1;
            return Err(Error::new(Errno::ENOMEM));
        }

        if let Some(entry) = self.entries.get_mut(&objid) {
            entry.refs += 1;
            self.total_refs += 1;
            self.stats.hits += 1;
            return Ok(Arc::clone(&entry.shared));
        }

        if self.entries.len() >= self.capacity && !self.evict_one() {
            self.stats.refusals += 1;
            return Err(Error::new(Errno::ENOMEM));
        }

        let shared = MlogShared::new(objid);
        self.entries.insert(
            objid,
            CacheEntry {
                shared: Arc::clone(&shared),
                refs: 1,
            },
        );
        self.total_refs += 1;
        self.stats.misses += 1;
        Ok(shared)
    }

    /// Drop a reference; the entry is released once idle and closed
    pub(crate) fn put(&mut self, shared: &Arc<MlogShared>) -> Result<()> {
        let objid = shared.objid();
        let entry = match self.entries.get_mut(&objid) {
            Some(entry) if Arc::ptr_eq(&entry.shared, shared) && entry.refs > 0 => entry,
            _ => return Err(Error::new(Errno::EINVAL)),
        };

        entry.refs -= 1;
        self.total_refs -= 1;
        if entry.refs == 0 && shared.state_hint() == MlogState::Closed {
            self.release(objid);
        }
        Ok(())
    }

    /// Release the entry if nobody references it; called after a close
    pub(crate) fn release_if_idle(&mut self, shared: &Arc<MlogShared>) {
        let idle = self
            .entries
            .get(&shared.objid())
            .is_some_and(|entry| Arc::ptr_eq(&entry.shared, shared) && entry.refs == 0);
        if idle {
            self.release(shared.objid());
        }
    }

    /// Drop the entry for `objid` and mark its handle dead
    pub(crate) fn release(&mut self, objid: ObjectId) {
        if let Some(entry) = self.entries.remove(&objid) {
            entry.shared.kill();
            debug!("Released mlog handle {}", objid);
        }
    }

    /// Drop one unreferenced, closed entry
    fn evict_one(&mut self) -> bool {
        let victim = self
            .entries
            .iter()
            .find(|(_, entry)| entry.refs == 0 && entry.shared.state_hint() == MlogState::Closed)
            .map(|(objid, _)| *objid);

        match victim {
            Some(objid) => {
                self.release(objid);
                self.stats.evictions += 1;
                debug!("Evicted mlog handle {}", objid);
                true
            }
            None => false,
        }
    }

    /// Reference count of the entry for `objid`
    pub(crate) fn refs(&self, objid: ObjectId) -> Option<usize> {
        self.entries.get(&objid).map(|entry| entry.refs)
    }

    /// Whether any handle is referenced
    pub(crate) fn is_busy(&self) -> bool {
        self.total_refs > 0
    }

    /// Remove every entry, returning their shared state
    pub(crate) fn drain(&mut self) -> Vec<Arc<MlogShared>> {
        self.entries.drain().map(|(_, entry)| entry.shared).collect()
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            refs: self.total_refs,
            ..self.stats
        }
    }
}
