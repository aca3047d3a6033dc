//! Ranked mutexes
//!
//! Each core lock has a rank. A thread may only acquire a lock whose rank
//! is not lower than any rank it already holds. Violations are counted in
//! a process-wide counter and logged; they indicate a bug.

use parking_lot::{Mutex, MutexGuard};
use std::cell::RefCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

/// Lock ranks, outermost first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// MDC handle mutex
    Mdc = 1,
    /// Per-mlog handle lock
    Mlog = 2,
    /// Pool lock guarding the handle cache
    Pool = 3,
}

static INVERSIONS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

/// Number of lock-order inversions observed by this process
pub fn lock_inversions() -> u64 {
    INVERSIONS.load(Ordering::Relaxed)
}

/// First held rank that must not be held while acquiring `rank`
fn outranking(held: &[LockRank], rank: LockRank) -> Option<LockRank> {
    held.iter().copied().find(|outer| *outer > rank)
}

fn note_acquire(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(outer) = outranking(&held, rank) {
            INVERSIONS.fetch_add(1, Ordering::Relaxed);
            error!("Lock order inversion: acquiring {:?} while holding {:?}", rank, outer);
        }
        held.push(rank);
    });
}

fn note_release(rank: LockRank) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|r| *r == rank) {
            held.remove(pos);
        }
    });
}

/// Mutex that checks lock order on every acquisition
#[derive(Debug)]
pub struct OrderedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    /// Create a mutex of the given rank
    pub const fn new(rank: LockRank, value: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(value),
        }
    }

    /// Acquire the lock
    pub fn lock(&self) -> OrderedGuard<'_, T> {
        note_acquire(self.rank);
        OrderedGuard {
            guard: self.inner.lock(),
            rank: self.rank,
        }
    }

    /// Rank of this lock
    pub const fn rank(&self) -> LockRank {
        self.rank
    }
}

/// Guard returned by [`OrderedMutex::lock`]
pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) {
        note_release(self.rank);
    }
}
