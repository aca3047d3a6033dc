//! Mlog record framing and open-time scan
//!
//! Record format:
//! ```text
//! +----------+------+---------+-----------+---------+
//! | Magic(4) | Kind | Len(4)  | Payload   | CRC(4)  |
//! +----------+------+---------+-----------+---------+
//! ```
//!
//! All integers are little endian. The CRC32C covers magic, kind, length
//! and payload. CSTART carries the generation the compaction started at,
//! CEND the generation it produced.

use bytes::{BufMut, BytesMut};
use mpool_common::{Errno, Error, ObjectId, Result};
use mpool_media::MediaPool;
use tracing::{debug, warn};

/// Record magic ("MLRC")
pub const RECORD_MAGIC: u32 = 0x4d4c_5243;

/// Magic + kind + length
pub const RECORD_HEADER_SIZE: usize = 9;

/// Trailing checksum
pub const RECORD_TRAILER_SIZE: usize = 4;

/// Framing bytes added to every record
pub const RECORD_OVERHEAD: u64 = (RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE) as u64;

/// Chunk size used when scanning a log stream
const SCAN_CHUNK: usize = 64 * 1024;

/// Kind of an mlog record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Caller data
    Data = 1,
    /// Compaction start marker
    CStart = 2,
    /// Compaction end marker
    CEnd = 3,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Data),
            2 => Some(Self::CStart),
            3 => Some(Self::CEnd),
            _ => None,
        }
    }

    /// Whether this is a compaction marker
    #[must_use]
    pub const fn is_marker(self) -> bool {
        !matches!(self, Self::Data)
    }
}

/// Decoded record header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub kind: RecordKind,
    /// Payload length in bytes
    pub len: u32,
}

impl RecordHeader {
    /// Parse a header; `None` when the magic or kind is wrong
    #[must_use]
    pub fn parse(data: &[u8; RECORD_HEADER_SIZE]) -> Option<Self> {
        let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        if magic != RECORD_MAGIC {
            return None;
        }
        let kind = RecordKind::from_u8(data[4])?;
        let len = u32::from_le_bytes([data[5], data[6], data[7], data[8]]);
        Some(Self { kind, len })
    }

    /// Total framed size of this record
    #[must_use]
    pub fn framed_len(&self) -> u64 {
        framed_len(u64::from(self.len))
    }
}

/// Framed size of a record with `payload_len` payload bytes
#[must_use]
pub const fn framed_len(payload_len: u64) -> u64 {
    payload_len + RECORD_OVERHEAD
}

/// Append a framed record to `buf`
///
/// The caller checks that the payload fits in a `u32`.
pub fn encode_into(buf: &mut BytesMut, kind: RecordKind, payload: &[&[u8]]) {
    let len: usize = payload.iter().map(|seg| seg.len()).sum();
    let start = buf.len();

    buf.reserve(len + RECORD_OVERHEAD as usize);
    buf.put_u32_le(RECORD_MAGIC);
    buf.put_u8(kind as u8);
    buf.put_u32_le(len as u32);
    for seg in payload {
        buf.put_slice(seg);
    }

    let crc = crc32c::crc32c(&buf[start..]);
    buf.put_u32_le(crc);
}

/// Append a compaction marker carrying `generation`
pub fn encode_marker(buf: &mut BytesMut, kind: RecordKind, generation: u64) {
    encode_into(buf, kind, &[&generation.to_le_bytes()]);
}

/// Verify the checksum of a complete frame
#[must_use]
pub fn verify_frame(frame: &[u8]) -> bool {
    if frame.len() < RECORD_OVERHEAD as usize {
        return false;
    }
    let (body, crc) = frame.split_at(frame.len() - RECORD_TRAILER_SIZE);
    let stored = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    crc32c::crc32c(body) == stored
}

/// Generation carried by a marker payload
fn marker_gen(payload: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(payload).ok().map(u64::from_le_bytes)
}

/// Result of scanning a log stream at open
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// End of the last valid record
    pub valid_len: u64,
    /// Bytes discarded from a torn tail
    pub torn_bytes: u64,
    /// Offset of the first record after the last matched CSTART
    pub read_start: u64,
    /// Generation of the last CEND, if any
    pub cend_gen: Option<u64>,
    /// A CSTART with no matching CEND was found at the end of the log
    pub dangling_cstart: bool,
    /// Data records in the whole log
    pub data_records: u64,
}

/// Scan a raw log stream
///
/// Validates every frame, pairs compaction markers and locates the read
/// start. A damaged frame at the tail is a torn write and is dropped; a
/// damaged frame followed by more data is corruption (`ENODATA`), as is a
/// CEND with no open CSTART.
pub fn scan(stream: &[u8]) -> Result<ScanResult> {
    let end = stream.len();
    let mut res = ScanResult::default();
    let mut off = 0usize;
    let mut open_cstart: Option<usize> = None;

    while off < end {
        let Some(header_bytes) = stream
            .get(off..off + RECORD_HEADER_SIZE)
            .and_then(|b| <&[u8; RECORD_HEADER_SIZE]>::try_from(b).ok())
        else {
            break;
        };
        let Some(header) = RecordHeader::parse(header_bytes) else {
            break;
        };
        let frame_end = off + header.framed_len() as usize;
        if frame_end > end {
            break;
        }

        let frame = &stream[off..frame_end];
        if !verify_frame(frame) {
            if frame_end == end {
                break;
            }
            debug!("Checksum mismatch at offset {} of {}", off, end);
            return Err(Error::new(Errno::ENODATA));
        }

        let payload = &frame[RECORD_HEADER_SIZE..frame.len() - RECORD_TRAILER_SIZE];
        match header.kind {
            RecordKind::Data => res.data_records += 1,
            RecordKind::CStart => {
                if open_cstart.is_some() {
                    warn!("Nested compaction start at offset {}, abandoning previous", off);
                }
                open_cstart = Some(frame_end);
            }
            RecordKind::CEnd => {
                let Some(start) = open_cstart.take() else {
                    debug!("Compaction end without start at offset {}", off);
                    return Err(Error::new(Errno::ENODATA));
                };
                let generation = marker_gen(payload).ok_or_else(|| Error::new(Errno::ENODATA))?;
                res.read_start = start as u64;
                res.cend_gen = Some(generation);
            }
        }
        off = frame_end;
    }

    res.valid_len = off as u64;
    res.torn_bytes = (end - off) as u64;
    res.dangling_cstart = open_cstart.is_some();
    Ok(res)
}

/// Read the whole written stream of an mlog
pub fn read_stream(media: &dyn MediaPool, id: ObjectId, capacity: u64) -> Result<Vec<u8>> {
    let mut stream = Vec::new();
    let mut chunk = vec![0u8; SCAN_CHUNK];
    let mut off = 0u64;

    while off < capacity {
        let want = usize::try_from(capacity - off).map_or(SCAN_CHUNK, |n| n.min(SCAN_CHUNK));
        let n = media.mlog_read(id, off, &mut chunk[..want])?;
        stream.extend_from_slice(&chunk[..n]);
        off += n as u64;
        if n < want {
            break;
        }
    }
    Ok(stream)
}

/// Read and parse the record header at `off`
///
/// Returns the raw header bytes as well, for checksum verification.
pub fn read_header_at(
    media: &dyn MediaPool,
    id: ObjectId,
    off: u64,
) -> Result<([u8; RECORD_HEADER_SIZE], RecordHeader)> {
    let mut raw = [0u8; RECORD_HEADER_SIZE];
    let n = media.mlog_read(id, off, &mut raw)?;
    if n < raw.len() {
        return Err(Error::new(Errno::ENODATA));
    }
    let header = RecordHeader::parse(&raw).ok_or_else(|| Error::new(Errno::ENODATA))?;
    Ok((raw, header))
}

/// Read the payload of the record at `off` into `buf` and verify it
///
/// `buf` must be exactly the payload length announced by `raw`.
pub fn read_payload_at(
    media: &dyn MediaPool,
    id: ObjectId,
    off: u64,
    raw: &[u8; RECORD_HEADER_SIZE],
    buf: &mut [u8],
) -> Result<()> {
    let payload_off = off + RECORD_HEADER_SIZE as u64;
    if media.mlog_read(id, payload_off, buf)? < buf.len() {
        return Err(Error::new(Errno::ENODATA));
    }
    let mut crc = [0u8; RECORD_TRAILER_SIZE];
    if media.mlog_read(id, payload_off + buf.len() as u64, &mut crc)? < crc.len() {
        return Err(Error::new(Errno::ENODATA));
    }
    let expected = crc32c::crc32c_append(crc32c::crc32c(raw), buf);
    if expected != u32::from_le_bytes(crc) {
        return Err(Error::new(Errno::ENODATA));
    }
    Ok(())
}
