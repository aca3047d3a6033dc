//! Core type definitions for mpool
//!
//! Object identifiers and the property records the media pool reports for
//! mblocks and mlogs.

use crate::error::{Errno, Error, Result};
use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bits of an object id that hold the object kind
const KIND_BITS: u32 = 8;
const KIND_MASK: u64 = (1 << KIND_BITS) - 1;

/// Kind of media-pool object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    /// Fixed-capacity, immutable-after-commit data container
    Mblock = 1,
    /// Append-only record log
    Mlog = 2,
}

impl ObjectKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Mblock),
            2 => Some(Self::Mlog),
            _ => None,
        }
    }
}

/// 64-bit object identifier, stable for the object's lifetime
///
/// Layout: `uniq << 8 | kind`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Build an id from a unique sequence number and a kind
    #[must_use]
    pub const fn new(uniq: u64, kind: ObjectKind) -> Self {
        Self((uniq << KIND_BITS) | kind as u64)
    }

    /// Raw 64-bit value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Unique part of the id
    #[must_use]
    pub const fn uniq(self) -> u64 {
        self.0 >> KIND_BITS
    }

    /// Object kind, if the id is well formed
    #[must_use]
    pub fn kind(self) -> Option<ObjectKind> {
        u8::try_from(self.0 & KIND_MASK)
            .ok()
            .and_then(ObjectKind::from_u8)
    }

    /// Whether this is an mlog id
    #[must_use]
    pub fn is_mlog(self) -> bool {
        self.kind() == Some(ObjectKind::Mlog)
    }

    /// Whether this is an mblock id
    #[must_use]
    pub fn is_mblock(self) -> bool {
        self.kind() == Some(ObjectKind::Mblock)
    }

    /// Fail with `EINVAL` unless the id is of `kind`
    #[track_caller]
    pub fn expect_kind(self, kind: ObjectKind) -> Result<Self> {
        if self.kind() == Some(kind) {
            Ok(self)
        } else {
            Err(Error::new(Errno::EINVAL))
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:#x})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Maximum pool name length in bytes
pub const POOL_NAME_MAX: usize = 32;

/// Check a pool name: 1..=32 bytes of `[A-Za-z0-9._-]`, not starting with `-`
#[must_use]
pub fn is_valid_pool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= POOL_NAME_MAX
        && !name.starts_with('-')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Media class an object is placed on
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaClass {
    /// Capacity media
    #[default]
    Capacity,
    /// Staging (fast) media
    Staging,
}

/// Properties of an mblock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MblockProps {
    pub objid: ObjectId,
    /// Maximum number of bytes the mblock can hold
    pub capacity: u64,
    /// Bytes written so far
    pub written: u64,
    pub committed: bool,
    pub class: MediaClass,
}

/// Properties of an mlog as recorded by the media pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MlogProps {
    pub objid: ObjectId,
    /// Maximum size of the log stream in bytes
    pub capacity: u64,
    /// Generation persisted by the last erase
    pub generation: u64,
    pub committed: bool,
    pub class: MediaClass,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_layout() {
        let id = ObjectId::new(42, ObjectKind::Mlog);
        assert_eq!(id.uniq(), 42);
        assert_eq!(id.kind(), Some(ObjectKind::Mlog));
        assert!(id.is_mlog());
        assert!(!id.is_mblock());
        assert_eq!(id.as_u64(), (42 << 8) | 2);
    }

    #[test]
    fn test_pool_names() {
        assert!(is_valid_pool_name("mp1"));
        assert!(is_valid_pool_name("kvdb.meta_01"));
        assert!(!is_valid_pool_name(""));
        assert!(!is_valid_pool_name("-leading"));
        assert!(!is_valid_pool_name("has space"));
        assert!(!is_valid_pool_name(&"x".repeat(33)));
    }

    #[test]
    fn test_expect_kind() {
        let id = ObjectId::new(7, ObjectKind::Mblock);
        assert!(id.expect_kind(ObjectKind::Mblock).is_ok());
        let err = id.expect_kind(ObjectKind::Mlog).unwrap_err();
        assert!(err.is(Errno::EINVAL));

        let bogus = ObjectId::from(0x1234_00ff_u64);
        assert_eq!(bogus.kind(), None);
    }
}
