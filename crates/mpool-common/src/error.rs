//! Packed error values for mpool
//!
//! Every failing operation returns a single machine word that carries the
//! errno together with the source location where the error originated:
//!
//! ```text
//! 63            48 47            32 31 30                            0
//! +---------------+----------------+--+------------------------------+
//! |    site id    |      line      |R |            errno             |
//! +---------------+----------------+--+------------------------------+
//! ```
//!
//! The site id indexes [`SITES`], a static table of the source files that
//! construct errors. Locations outside the table resolve to the reserved
//! bug marker. Errors are constructed through `#[track_caller]` functions,
//! so the recorded location is the caller's.

use std::fmt;
use std::num::NonZeroU64;
use std::panic::Location;
use thiserror::Error as ThisError;

/// Common result type for mpool operations
pub type Result<T> = std::result::Result<T, Error>;

const ERRNO_MASK: u64 = 0x7fff_ffff;
const LINE_SHIFT: u32 = 32;
const LINE_MASK: u64 = 0xffff;
const SITE_SHIFT: u32 = 48;

/// Site name reported for locations that are not in [`SITES`]
pub const BUG_SITE: &str = "mpool_bug";

/// Source files allowed to originate errors. Index 0 is the bug marker.
pub static SITES: &[&str] = &[
    BUG_SITE,
    "mpool-common/src/error.rs",
    "mpool-common/src/config.rs",
    "mpool-common/src/devrpt.rs",
    "mpool-common/src/types.rs",
    "mpool-media/src/media.rs",
    "mpool-media/src/layout.rs",
    "mpool-media/src/dir_pool.rs",
    "mpool-core/src/pool.rs",
    "mpool-core/src/cache.rs",
    "mpool-core/src/lock.rs",
    "mpool-core/src/mlog/record.rs",
    "mpool-core/src/mlog/handle.rs",
    "mpool-core/src/mdc.rs",
    "mpool-core/src/mcache.rs",
];

/// Errno values produced by mpool
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ThisError)]
#[repr(i32)]
pub enum Errno {
    #[error("operation not permitted")]
    EPERM = 1,

    #[error("no such file or directory")]
    ENOENT = 2,

    #[error("input/output error")]
    EIO = 5,

    #[error("cannot allocate memory")]
    ENOMEM = 12,

    #[error("device or resource busy")]
    EBUSY = 16,

    #[error("file exists")]
    EEXIST = 17,

    #[error("invalid argument")]
    EINVAL = 22,

    #[error("file too large")]
    EFBIG = 27,

    #[error("no space left on device")]
    ENOSPC = 28,

    #[error("no data available")]
    ENODATA = 61,

    #[error("value too large for defined data type")]
    EOVERFLOW = 75,

    #[error("message too long")]
    EMSGSIZE = 90,

    /// Invariant violation; the process is expected to abort
    #[error("software bug")]
    EBUG = 1000,
}

impl Errno {
    /// Map a raw errno back to a known value
    #[must_use]
    pub const fn from_raw(errno: i32) -> Option<Self> {
        Some(match errno {
            1 => Self::EPERM,
            2 => Self::ENOENT,
            5 => Self::EIO,
            12 => Self::ENOMEM,
            16 => Self::EBUSY,
            17 => Self::EEXIST,
            22 => Self::EINVAL,
            27 => Self::EFBIG,
            28 => Self::ENOSPC,
            61 => Self::ENODATA,
            75 => Self::EOVERFLOW,
            90 => Self::EMSGSIZE,
            1000 => Self::EBUG,
            _ => return None,
        })
    }

    /// Raw errno value
    #[must_use]
    pub const fn raw(self) -> i32 {
        self as i32
    }
}

/// Packed `{errno, site, line}` error value
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Error(NonZeroU64);

impl Error {
    /// Create an error for `errno` at the caller's location
    #[track_caller]
    #[must_use]
    pub fn new(errno: Errno) -> Self {
        Self::at(errno.raw(), Location::caller())
    }

    /// Create an error from a raw errno at the caller's location
    ///
    /// A zero or negative errno is itself a bug and packs as `EBUG`.
    #[track_caller]
    #[must_use]
    pub fn from_errno(errno: i32) -> Self {
        Self::at(errno, Location::caller())
    }

    /// Convert an I/O error, keeping the OS errno when there is one
    #[track_caller]
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        let errno = err.raw_os_error().unwrap_or(match err.kind() {
            ErrorKind::NotFound => Errno::ENOENT.raw(),
            ErrorKind::PermissionDenied => Errno::EPERM.raw(),
            ErrorKind::AlreadyExists => Errno::EEXIST.raw(),
            ErrorKind::InvalidInput => Errno::EINVAL.raw(),
            ErrorKind::OutOfMemory => Errno::ENOMEM.raw(),
            ErrorKind::UnexpectedEof => Errno::ENODATA.raw(),
            _ => Errno::EIO.raw(),
        });
        Self::at(errno, Location::caller())
    }

    /// Invariant violation at the caller's location
    #[track_caller]
    #[must_use]
    pub fn bug() -> Self {
        Self::new(Errno::EBUG)
    }

    fn at(errno: i32, location: &Location<'_>) -> Self {
        Self::pack(errno, site_id(location.file()), location.line())
    }

    /// Pack the three fields into one word
    #[must_use]
    pub fn pack(errno: i32, site: u16, line: u32) -> Self {
        let errno = if errno > 0 { errno } else { Errno::EBUG.raw() };
        let errno = u64::from(errno.unsigned_abs()) & ERRNO_MASK;
        let line = u64::from(line).min(LINE_MASK);
        let site = if usize::from(site) < SITES.len() { site } else { 0 };
        let raw = errno | (line << LINE_SHIFT) | (u64::from(site) << SITE_SHIFT);
        // errno is never zero here, so neither is the packed word
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    /// Decode a packed word; `None` when it encodes success
    #[must_use]
    pub fn from_raw(raw: u64) -> Option<Self> {
        if is_ok(raw) {
            return None;
        }
        NonZeroU64::new(raw).map(Self)
    }

    /// The packed word
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0.get()
    }

    /// Raw errno
    #[must_use]
    pub fn errno(self) -> i32 {
        // masked to 31 bits, so the conversion cannot fail
        i32::try_from(self.0.get() & ERRNO_MASK).unwrap_or(i32::MAX)
    }

    /// The errno as a known value, if it is one
    #[must_use]
    pub fn kind(self) -> Option<Errno> {
        Errno::from_raw(self.errno())
    }

    /// Whether this error carries `errno`
    #[must_use]
    pub fn is(self, errno: Errno) -> bool {
        self.errno() == errno.raw()
    }

    /// Source file and line where the error was created
    #[must_use]
    pub fn site(self) -> (&'static str, u32) {
        let raw = self.0.get();
        let site = usize::try_from(raw >> SITE_SHIFT).unwrap_or(0);
        let line = u32::try_from((raw >> LINE_SHIFT) & LINE_MASK).unwrap_or(0);
        (site_name(site), line)
    }

    /// Human readable strerror for the errno
    #[must_use]
    pub fn message(self) -> String {
        match self.kind() {
            Some(errno) => errno.to_string(),
            None => format!("errno {}", self.errno()),
        }
    }
}

/// True when a packed word encodes success
#[must_use]
pub const fn is_ok(raw: u64) -> bool {
    raw & ERRNO_MASK == 0
}

fn site_id(file: &str) -> u16 {
    let file = file.replace('\\', "/");
    SITES
        .iter()
        .skip(1)
        .position(|site| file.ends_with(site))
        .and_then(|idx| u16::try_from(idx + 1).ok())
        .unwrap_or(0)
}

fn site_name(site: usize) -> &'static str {
    match SITES.get(site) {
        Some(_) if site == 0 => BUG_SITE,
        Some(path) => path.split_once("/src/").map_or(path, |(_, rest)| rest),
        None => BUG_SITE,
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (file, line) = self.site();
        write!(f, "{}:{}: {}", file, line, self.message())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (file, line) = self.site();
        f.debug_struct("Error")
            .field("errno", &self.errno())
            .field("file", &file)
            .field("line", &line)
            .finish()
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_io(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let err = Error::pack(Errno::EIO.raw(), 3, 77);
        let raw = err.to_raw();
        assert_eq!(raw & 0x7fff_ffff, 5);
        assert_eq!((raw >> 32) & 0xffff, 77);
        assert_eq!(raw >> 48, 3);
        assert_eq!(raw & (1 << 31), 0);
    }

    #[test]
    fn test_site_is_caller() {
        let line = line!() + 1;
        let err = Error::new(Errno::EINVAL);
        assert_eq!(err.site(), ("error.rs", line));
        assert_eq!(err.kind(), Some(Errno::EINVAL));
        assert_eq!(err.to_string(), format!("error.rs:{}: invalid argument", line));
    }

    #[test]
    fn test_unknown_site_is_bug_marker() {
        let err = Error::pack(Errno::ENOENT.raw(), 9999, 12);
        assert_eq!(err.site().0, BUG_SITE);
        assert_eq!(site_id("somewhere/else.rs"), 0);
    }

    #[test]
    fn test_ebug_message() {
        let err = Error::bug();
        assert!(err.is(Errno::EBUG));
        assert!(err.to_string().ends_with(": software bug"));
    }

    #[test]
    fn test_raw_roundtrip_and_success() {
        assert!(is_ok(0));
        assert!(Error::from_raw(0).is_none());

        let err = Error::new(Errno::EMSGSIZE);
        let decoded = Error::from_raw(err.to_raw()).unwrap();
        assert_eq!(decoded, err);
        assert!(!is_ok(err.to_raw()));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::from_raw_os_error(28);
        assert_eq!(Error::from_io(&io).kind(), Some(Errno::ENOSPC));

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(Error::from_io(&io).kind(), Some(Errno::ENOENT));

        let io = std::io::Error::from_raw_os_error(113);
        let err = Error::from_io(&io);
        assert_eq!(err.kind(), None);
        assert!(err.to_string().ends_with("errno 113"));
    }

    #[test]
    fn test_line_saturates() {
        let err = Error::pack(Errno::EIO.raw(), 1, 1_000_000);
        assert_eq!(err.site().1, 0xffff);
    }

    #[test]
    fn test_nonpositive_errno_is_bug() {
        assert!(Error::from_errno(0).is(Errno::EBUG));
        assert!(Error::from_errno(-5).is(Errno::EBUG));
    }
}
