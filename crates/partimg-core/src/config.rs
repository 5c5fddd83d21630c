//! Configuration for copy engine runs

use std::fmt;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::progress::SKIP_REPORT_INTERVAL;
use crate::rescue::SECTOR_SIZE;

/// What a run does with its source and target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Device to image container
    Create,
    /// Image container to device
    Restore,
    /// Device to device, used blocks only
    Duplicate,
    /// Read an image and verify every checksum without writing anything
    Check,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Create => "create",
            Mode::Restore => "restore",
            Mode::Duplicate => "duplicate",
            Mode::Check => "check",
        };
        f.write_str(name)
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Re-read failed source blocks sector by sector
    pub rescue: bool,

    /// Refuse to write to a target smaller than the imaged device
    pub check_size: bool,

    /// Refuse to create an image that cannot fit on the target filesystem
    pub check_free_space: bool,

    /// Sector size for rescue reads
    pub sector_size: usize,

    /// Unused blocks between progress updates
    pub skip_report_interval: u64,

    /// Ask reporters to render at most once per second
    pub progress_limit: bool,

    /// Sync the target once traversal finishes
    pub sync_on_complete: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rescue: false,
            check_size: true,
            check_free_space: true,
            sector_size: SECTOR_SIZE,
            skip_report_interval: SKIP_REPORT_INTERVAL,
            progress_limit: false,
            sync_on_complete: true,
        }
    }
}

impl EngineConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set rescue mode
    pub fn rescue(mut self, rescue: bool) -> Self {
        self.rescue = rescue;
        self
    }

    /// Set target size checking
    pub fn check_size(mut self, check: bool) -> Self {
        self.check_size = check;
        self
    }

    /// Set free space checking
    pub fn check_free_space(mut self, check: bool) -> Self {
        self.check_free_space = check;
        self
    }

    /// Set rescue sector size
    pub fn sector_size(mut self, size: usize) -> Self {
        self.sector_size = size;
        self
    }

    /// Set progress interval for unused runs
    pub fn skip_report_interval(mut self, blocks: u64) -> Self {
        self.skip_report_interval = blocks;
        self
    }

    /// Set the render rate-limit hint
    pub fn progress_limit(mut self, limit: bool) -> Self {
        self.progress_limit = limit;
        self
    }

    /// Set sync_on_complete
    pub fn sync_on_complete(mut self, sync: bool) -> Self {
        self.sync_on_complete = sync;
        self
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.sector_size == 0 {
            return Err(Error::InvalidConfig(
                "sector size must be non-zero".to_string(),
            ));
        }
        if self.skip_report_interval == 0 {
            return Err(Error::InvalidConfig(
                "progress interval must be at least one block".to_string(),
            ));
        }
        Ok(())
    }
}
