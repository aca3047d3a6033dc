//! Boundary-enforced mcache views
//!
//! A view maps a vector of committed mblocks read-only into one reserved
//! address range, with an inaccessible guard page before, between and after
//! the mblocks:
//!
//! ```text
//! | guard | mblock 0 | guard | mblock 1 | guard | ... | mblock n-1 | guard |
//! ```
//!
//! Any load one byte past the end of an mblock, or one byte before its
//! start, hits a guard page and faults.

use crate::pool::Mpool;
use mpool_common::{Errno, Error, McacheAdvice, ObjectId, ObjectKind, Result};
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::{self, NonNull};
use tracing::{debug, error};

/// Kernel access advice for part of a view
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MadviseHint {
    Normal,
    Random,
    Sequential,
    WillNeed,
    DontNeed,
}

impl MadviseHint {
    const fn as_raw(self) -> libc::c_int {
        match self {
            Self::Normal => libc::MADV_NORMAL,
            Self::Random => libc::MADV_RANDOM,
            Self::Sequential => libc::MADV_SEQUENTIAL,
            Self::WillNeed => libc::MADV_WILLNEED,
            Self::DontNeed => libc::MADV_DONTNEED,
        }
    }
}

impl From<McacheAdvice> for MadviseHint {
    fn from(advice: McacheAdvice) -> Self {
        match advice {
            McacheAdvice::Cold => Self::Random,
            McacheAdvice::Warm => Self::Normal,
            McacheAdvice::Hot => Self::WillNeed,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    objid: ObjectId,
    /// Offset of the mblock from the start of the reservation
    offset: usize,
    len: usize,
}

/// Read-only mapping of committed mblocks with guard pages
#[derive(Debug)]
pub struct McacheMap {
    base: NonNull<u8>,
    /// Length of the whole reservation; zero once unmapped
    len: usize,
    slots: Vec<Slot>,
    page_size: usize,
}

// The mapping is read-only and owned by the view.
unsafe impl Send for McacheMap {}
unsafe impl Sync for McacheMap {}

/// System page size
fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

#[track_caller]
fn last_os_error() -> Error {
    Error::from_io(&io::Error::last_os_error())
}

impl McacheMap {
    /// Map the committed mblocks `ids`, applying `advice` to each
    ///
    /// Every mblock length must be a multiple of the page size.
    pub fn mmap(pool: &Mpool, ids: &[ObjectId], advice: McacheAdvice) -> Result<Self> {
        let page = page_size();

        let mut sources: Vec<(File, usize)> = Vec::with_capacity(ids.len());
        let mut slots = Vec::with_capacity(ids.len());
        let mut offset = page;
        for id in ids {
            id.expect_kind(ObjectKind::Mblock)?;
            let src = pool.media().mblock_map_source(*id)?;
            let len = usize::try_from(src.len).map_err(|_| Error::new(Errno::EFBIG))?;
            if len % page != 0 {
                return Err(Error::new(Errno::EINVAL));
            }
            slots.push(Slot {
                objid: *id,
                offset,
                len,
            });
            sources.push((src.file, len));
            offset += len + page;
        }
        let total = offset;

        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(last_os_error());
        }
        let base = NonNull::new(addr.cast::<u8>()).ok_or_else(|| Error::new(Errno::ENOMEM))?;

        // From here on Drop releases the reservation on every error path
        let map = Self {
            base,
            len: total,
            slots,
            page_size: page,
        };

        for ((file, len), slot) in sources.iter().zip(&map.slots) {
            if *len == 0 {
                continue;
            }
            // MAP_FIXED replaces guard pages inside our own reservation only
            let got = unsafe {
                libc::mmap(
                    map.base.as_ptr().add(slot.offset).cast(),
                    *len,
                    libc::PROT_READ,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    file.as_raw_fd(),
                    0,
                )
            };
            if got == libc::MAP_FAILED {
                return Err(last_os_error());
            }
        }

        let hint = MadviseHint::from(advice);
        for idx in 0..map.slots.len() {
            map.madvise(idx, 0, 0, hint)?;
        }

        debug!(
            "Mapped {} mblocks ({} bytes reserved, advice {:?})",
            map.slots.len(),
            total,
            advice
        );
        Ok(map)
    }

    /// Number of mblocks in the view
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[track_caller]
    fn slot(&self, idx: usize) -> Result<Slot> {
        if self.len == 0 {
            return Err(Error::new(Errno::EINVAL));
        }
        self.slots.get(idx).copied().ok_or_else(|| Error::new(Errno::EINVAL))
    }

    fn slot_ptr(&self, slot: Slot) -> *mut u8 {
        // The offset lies inside the reservation
        unsafe { self.base.as_ptr().add(slot.offset) }
    }

    /// Base address of mblock `idx`
    pub fn getbase(&self, idx: usize) -> Result<*const u8> {
        let slot = self.slot(idx)?;
        Ok(self.slot_ptr(slot).cast_const())
    }

    /// Object id of mblock `idx`
    pub fn objid(&self, idx: usize) -> Result<ObjectId> {
        Ok(self.slot(idx)?.objid)
    }

    /// Length of mblock `idx` in bytes
    pub fn mblock_len(&self, idx: usize) -> Result<usize> {
        Ok(self.slot(idx)?.len)
    }

    /// Contents of mblock `idx`
    pub fn mblock(&self, idx: usize) -> Result<&[u8]> {
        let slot = self.slot(idx)?;
        // The slot is mapped readable for `len` bytes while the view lives
        Ok(unsafe { std::slice::from_raw_parts(self.slot_ptr(slot).cast_const(), slot.len) })
    }

    /// Addresses of the requested pages of mblock `idx`
    pub fn getpages(&self, idx: usize, pages: &[usize]) -> Result<Vec<*const u8>> {
        let slot = self.slot(idx)?;
        let count = slot.len / self.page_size;
        pages
            .iter()
            .map(|&page| {
                if page >= count {
                    return Err(Error::new(Errno::EINVAL));
                }
                Ok(unsafe { self.slot_ptr(slot).add(page * self.page_size) }.cast_const())
            })
            .collect()
    }

    /// Advise the kernel about `len` bytes at `off` in mblock `idx`; a
    /// zero `len` covers the rest of the mblock
    pub fn madvise(&self, idx: usize, off: usize, len: usize, hint: MadviseHint) -> Result<()> {
        let slot = self.slot(idx)?;
        if off % self.page_size != 0 || off > slot.len {
            return Err(Error::new(Errno::EINVAL));
        }
        let len = if len == 0 { slot.len - off } else { len };
        if len > slot.len - off {
            return Err(Error::new(Errno::EINVAL));
        }
        if len == 0 {
            return Ok(());
        }

        let ret = unsafe { libc::madvise(self.slot_ptr(slot).add(off).cast(), len, hint.as_raw()) };
        if ret != 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    /// Number of resident pages of mblock `idx`
    pub fn mincore(&self, idx: usize) -> Result<usize> {
        let slot = self.slot(idx)?;
        if slot.len == 0 {
            return Ok(0);
        }
        let mut vec = vec![0u8; slot.len.div_ceil(self.page_size)];
        let ret = unsafe { libc::mincore(self.slot_ptr(slot).cast(), slot.len, vec.as_mut_ptr()) };
        if ret != 0 {
            return Err(last_os_error());
        }
        Ok(vec.iter().filter(|v| **v & 1 != 0).count())
    }

    /// Drop the cached pages of mblock `idx`
    pub fn purge(&self, idx: usize) -> Result<()> {
        self.madvise(idx, 0, 0, MadviseHint::DontNeed)
    }

    /// Tear down the view
    pub fn munmap(mut self) -> Result<()> {
        self.unmap()
    }

    fn unmap(&mut self) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        let ret = unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        self.len = 0;
        if ret != 0 {
            return Err(last_os_error());
        }
        Ok(())
    }
}

impl Drop for McacheMap {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            error!("Unmapping mcache view failed: {}", err);
        }
    }
}
