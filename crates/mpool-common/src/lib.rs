//! mpool common - shared types and utilities
//!
//! This crate provides the packed error value, the device report, object
//! identifiers and the configuration used by every mpool component.

pub mod config;
pub mod devrpt;
pub mod error;
pub mod types;

pub use config::{McacheAdvice, MpoolConfig};
pub use devrpt::{DevRptReason, DeviceReport};
pub use error::{Errno, Error, Result};
pub use types::*;
