use hcfs_cache::UsageDelta;
use hcfs_types::InodeNumber;
use serde::{Deserialize, Serialize};

/// Summary of one recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// The pass picked up an interrupted run instead of starting over.
    pub resumed: bool,
    /// First inode this pass relinked from.
    pub start_inode: InodeNumber,
    pub end_inode: InodeNumber,
    pub batches: u64,
    pub entries_scanned: u64,
    /// Entries before the resume point whose bytes were counted again.
    pub entries_recounted: u64,
    pub dirty_linked: u64,
    /// Dirty bytes the accountant was rebuilt with.
    pub dirty_cache_size: i64,
    pub unpin_dirty_size: i64,
    /// Dirty chain length after the pass.
    pub num_dirty: u64,
    pub elapsed_ms: u64,
}

impl RecoveryReport {
    pub(crate) fn absorb(&mut self, delta: &UsageDelta) {
        self.dirty_cache_size += delta.dirty_cache_size;
        self.unpin_dirty_size += delta.unpin_dirty_size;
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
