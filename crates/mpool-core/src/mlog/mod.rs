//! Append-only record logs
//!
//! An mlog is a crash-safe log of framed records stored in a media-pool
//! mlog object. Compaction is bracketed by CSTART/CEND marker records; a
//! CEND advances the log generation.

mod handle;
pub mod record;

pub use handle::{MlogHandle, MlogOpenFlags, MlogState};
pub(crate) use handle::MlogShared;
pub use record::RecordKind;
