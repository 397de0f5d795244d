use serde::{Deserialize, Serialize};

/// Tuning for the superblock recovery worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Entries scanned per batch. The exclusive superblock lock is held for
    /// one batch at a time.
    pub batch_size: u64,
    /// Minimum seconds between completed runs before the trigger fires
    /// again. Zero disables throttling. An interrupted run is never
    /// throttled.
    pub min_interval_secs: u64,
    /// Lowest inode scanned. Entries below it are reserved and never
    /// relinked.
    pub min_inode: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: 1024,
            min_interval_secs: 60,
            min_inode: 1,
        }
    }
}
