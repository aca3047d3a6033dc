//! Configuration types for mpool
//!
//! The core has a closed set of knobs; everything else is fixed.

use crate::error::{Errno, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Smallest accepted handle cache capacity
pub const MIN_HANDLE_CACHE_CAPACITY: usize = 1;

/// Largest accepted handle cache capacity
pub const MAX_HANDLE_CACHE_CAPACITY: usize = 4096;

/// Default handle cache capacity per pool
pub const DEFAULT_HANDLE_CACHE_CAPACITY: usize = 512;

/// Access advice for new mcache views
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McacheAdvice {
    /// Rarely touched; read pages on demand only
    Cold,
    /// Normal access pattern
    #[default]
    Warm,
    /// Hot data; prefetch the whole mapping
    Hot,
}

/// Pool configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MpoolConfig {
    /// Maximum number of live mlog handles per pool
    pub handle_cache_capacity: usize,
    /// Require matched CSTART/CEND markers when opening mlogs
    pub csem_on_open: bool,
    /// Default advice for new mcache views
    pub mcache_advice_default: McacheAdvice,
}

impl Default for MpoolConfig {
    fn default() -> Self {
        Self {
            handle_cache_capacity: DEFAULT_HANDLE_CACHE_CAPACITY,
            csem_on_open: false,
            mcache_advice_default: McacheAdvice::Warm,
        }
    }
}

impl MpoolConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()
            .map_err(|_| Error::new(Errno::EINVAL))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|_| Error::new(Errno::EINVAL))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every knob is within bounds
    pub fn validate(&self) -> Result<()> {
        if !(MIN_HANDLE_CACHE_CAPACITY..=MAX_HANDLE_CACHE_CAPACITY)
            .contains(&self.handle_cache_capacity)
        {
            return Err(Error::new(Errno::EINVAL));
        }
        Ok(())
    }

    /// Builder-style capacity override
    #[must_use]
    pub const fn with_handle_cache_capacity(mut self, capacity: usize) -> Self {
        self.handle_cache_capacity = capacity;
        self
    }

    /// Builder-style csem override
    #[must_use]
    pub const fn with_csem_on_open(mut self, csem: bool) -> Self {
        self.csem_on_open = csem;
        self
    }
}
