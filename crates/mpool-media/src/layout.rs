//! On-media layout definitions for the directory-backed pool
//!
//! Pool layout:
//! ```text
//! <root>/
//!   superblock            4KB - magic, version, UUID, name, params, CRC32C
//!   mblock/<id>.pending   mblock being written
//!   mblock/<id>.data      committed mblock
//!   mlog/<id>.hdr         mlog header (capacity, generation), bincode + CRC32C
//!   mlog/<id>.pending     allocated, uncommitted mlog stream
//!   mlog/<id>.log         committed mlog stream
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use mpool_common::{Errno, Error, MediaClass, Result, POOL_NAME_MAX};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Magic number for the pool superblock
pub const POOL_MAGIC: [u8; 8] = *b"MPOOLDIR";

/// Current on-media format version
pub const FORMAT_VERSION: u32 = 1;

/// Superblock size (4KB)
pub const SUPERBLOCK_SIZE: usize = 4096;

/// Alignment of mblock writes (4KB)
pub const ALIGNMENT: usize = 4096;

/// Encoded superblock length before padding, checksum excluded
const SUPERBLOCK_BODY: usize = 8 + 4 + 16 + 1 + POOL_NAME_MAX + 8 + 8 + 8;

/// Superblock stored at the root of each pool directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolSuperblock {
    pub magic: [u8; 8],
    pub version: u32,
    pub uuid: Uuid,
    pub name: String,
    /// Capacity of every mblock in bytes
    pub mblock_capacity: u64,
    /// Default mlog capacity in bytes
    pub mlog_capacity: u64,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
}

impl PoolSuperblock {
    /// Create a superblock for a new pool
    pub fn new(name: &str, mblock_capacity: u64, mlog_capacity: u64) -> Result<Self> {
        if name.len() > POOL_NAME_MAX {
            return Err(Error::new(Errno::EINVAL));
        }
        if mblock_capacity == 0 || mblock_capacity % ALIGNMENT as u64 != 0 || mlog_capacity == 0 {
            return Err(Error::new(Errno::EINVAL));
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Ok(Self {
            magic: POOL_MAGIC,
            version: FORMAT_VERSION,
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            mblock_capacity,
            mlog_capacity,
            created_at: now,
        })
    }

    /// Serialize to a padded 4KB block
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SUPERBLOCK_SIZE);

        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.uuid.as_bytes());

        let mut name = [0u8; POOL_NAME_MAX];
        let name_len = self.name.len().min(POOL_NAME_MAX);
        name[..name_len].copy_from_slice(&self.name.as_bytes()[..name_len]);
        buf.put_u8(name_len as u8);
        buf.put_slice(&name);

        buf.put_u64_le(self.mblock_capacity);
        buf.put_u64_le(self.mlog_capacity);
        buf.put_u64_le(self.created_at);

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);

        buf.resize(SUPERBLOCK_SIZE, 0);
        buf.freeze()
    }

    /// Parse and verify a superblock
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < SUPERBLOCK_BODY + 4 {
            return Err(Error::new(Errno::EINVAL));
        }

        let stored_crc = u32::from_le_bytes([
            data[SUPERBLOCK_BODY],
            data[SUPERBLOCK_BODY + 1],
            data[SUPERBLOCK_BODY + 2],
            data[SUPERBLOCK_BODY + 3],
        ]);
        if crc32c::crc32c(&data[..SUPERBLOCK_BODY]) != stored_crc {
            return Err(Error::new(Errno::ENODATA));
        }

        let mut buf = &data[..SUPERBLOCK_BODY];

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != POOL_MAGIC {
            return Err(Error::new(Errno::EINVAL));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::new(Errno::EINVAL));
        }

        let mut uuid = [0u8; 16];
        buf.copy_to_slice(&mut uuid);

        let name_len = usize::from(buf.get_u8());
        let mut name = [0u8; POOL_NAME_MAX];
        buf.copy_to_slice(&mut name);
        if name_len > POOL_NAME_MAX {
            return Err(Error::new(Errno::ENODATA));
        }
        let name = std::str::from_utf8(&name[..name_len])
            .map_err(|_| Error::new(Errno::ENODATA))?
            .to_string();

        Ok(Self {
            magic,
            version,
            uuid: Uuid::from_bytes(uuid),
            name,
            mblock_capacity: buf.get_u64_le(),
            mlog_capacity: buf.get_u64_le(),
            created_at: buf.get_u64_le(),
        })
    }

    /// Check whether a block starts with the pool magic
    #[must_use]
    pub fn has_magic(data: &[u8]) -> bool {
        data.len() >= POOL_MAGIC.len() && data[..POOL_MAGIC.len()] == POOL_MAGIC
    }
}

/// Per-mlog header persisted next to the log stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MlogHeader {
    /// Log capacity in bytes
    pub capacity: u64,
    /// Generation persisted by the last erase
    pub generation: u64,
    pub class: MediaClass,
}

impl MlogHeader {
    /// Serialize with a trailing CRC32C
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = bincode::serialize(self).map_err(|_| Error::new(Errno::EINVAL))?;
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Parse and verify a header
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::new(Errno::ENODATA));
        }
        let (body, crc) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32c::crc32c(body) != stored {
            return Err(Error::new(Errno::ENODATA));
        }
        bincode::deserialize(body).map_err(|_| Error::new(Errno::ENODATA))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let sb = PoolSuperblock::new("mp0", 4 << 20, 1 << 20).unwrap();
        let bytes = sb.to_bytes();
        assert_eq!(bytes.len(), SUPERBLOCK_SIZE);
        assert!(PoolSuperblock::has_magic(&bytes));

        let parsed = PoolSuperblock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn test_superblock_detects_corruption() {
        let sb = PoolSuperblock::new("mp0", 4 << 20, 1 << 20).unwrap();
        let mut bytes = sb.to_bytes().to_vec();
        bytes[20] ^= 0xff;
        let err = PoolSuperblock::from_bytes(&bytes).unwrap_err();
        assert!(err.is(Errno::ENODATA));
    }

    #[test]
    fn test_superblock_rejects_unaligned_mblocks() {
        assert!(PoolSuperblock::new("mp0", 1000, 1 << 20).is_err());
        assert!(PoolSuperblock::new(&"n".repeat(40), 4096, 1 << 20).is_err());
    }

    #[test]
    fn test_mlog_header_crc() {
        let hdr = MlogHeader {
            capacity: 1 << 20,
            generation: 7,
            class: MediaClass::Staging,
        };
        let mut bytes = hdr.to_bytes().unwrap();
        assert_eq!(MlogHeader::from_bytes(&bytes).unwrap(), hdr);

        bytes[0] ^= 1;
        assert!(MlogHeader::from_bytes(&bytes).is_err());
    }
}
