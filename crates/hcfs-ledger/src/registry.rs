//! Minimal in-process metadata cache: one locked block table per open
//! regular file.
//!
//! A limited registry evicts idle tables (held by nobody but the registry)
//! to stay under its limit. Tables in use are never evicted, so the limit
//! is exceeded while more than `limit` tables are locked or cloned at once.
//! Only tables that can be reopened from their device belong in a limited
//! registry.

use crate::table::FileBlocks;
use hcfs_block::SharedDevice;
use hcfs_error::Result;
use hcfs_types::InodeNumber;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// A regular file's block table behind its per-inode metadata lock.
pub type FileMeta = Arc<Mutex<FileBlocks<SharedDevice>>>;

#[derive(Default)]
pub struct MetaRegistry {
    files: RwLock<HashMap<InodeNumber, FileMeta>>,
    limit: Option<usize>,
}

impl std::fmt::Debug for MetaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaRegistry")
            .field("files", &self.files.read().len())
            .field("limit", &self.limit)
            .finish()
    }
}

impl MetaRegistry {
    /// Registry that keeps every table until removed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that evicts idle tables beyond `limit`.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            files: RwLock::default(),
            limit: Some(limit.max(1)),
        }
    }

    /// Register a table, replacing any previous one for the same inode.
    pub fn insert(&self, table: FileBlocks<SharedDevice>) -> FileMeta {
        let inode = table.inode();
        let meta = Arc::new(Mutex::new(table));
        let mut files = self.files.write();
        files.remove(&inode);
        self.make_room(&mut files);
        files.insert(inode, Arc::clone(&meta));
        meta
    }

    #[must_use]
    pub fn get(&self, inode: InodeNumber) -> Option<FileMeta> {
        self.files.read().get(&inode).cloned()
    }

    /// The registered table for `inode`, or the one `open` produces. `open`
    /// runs under the registry's write lock, so a table is opened once.
    pub fn get_or_insert_with(
        &self,
        inode: InodeNumber,
        open: impl FnOnce() -> Result<FileBlocks<SharedDevice>>,
    ) -> Result<FileMeta> {
        let mut files = self.files.write();
        if let Some(meta) = files.get(&inode) {
            return Ok(Arc::clone(meta));
        }
        let meta = Arc::new(Mutex::new(open()?));
        self.make_room(&mut files);
        files.insert(inode, Arc::clone(&meta));
        Ok(meta)
    }

    /// Drop every table nobody else holds. Returns how many were dropped.
    pub fn evict_idle(&self) -> usize {
        let mut files = self.files.write();
        let before = files.len();
        files.retain(|_, meta| Arc::strong_count(meta) > 1);
        before - files.len()
    }

    /// Evict idle tables until one more fits under the limit. Runs under
    /// the write lock, so no `get` can clone a table being evicted.
    fn make_room(&self, files: &mut HashMap<InodeNumber, FileMeta>) {
        let Some(limit) = self.limit else {
            return;
        };
        if files.len() < limit {
            return;
        }
        let excess = files.len() + 1 - limit;
        let idle: Vec<InodeNumber> = files
            .iter()
            .filter(|(_, meta)| Arc::strong_count(meta) == 1)
            .map(|(inode, _)| *inode)
            .take(excess)
            .collect();
        for inode in &idle {
            files.remove(inode);
        }
        trace!(
            target: "hcfs::ledger",
            event = "meta_tables_evicted",
            evicted = idle.len(),
            open = files.len(),
            limit
        );
    }

    pub fn remove(&self, inode: InodeNumber) -> Option<FileMeta> {
        self.files.write().remove(&inode)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hcfs_block::MemoryByteDevice;

    fn table(inode: u64) -> FileBlocks<SharedDevice> {
        let dev: SharedDevice = Arc::new(MemoryByteDevice::new());
        FileBlocks::create(dev, InodeNumber(inode), false).expect("table")
    }

    #[test]
    fn limited_registry_evicts_only_idle_tables() {
        let registry = MetaRegistry::with_limit(2);
        let held = registry.insert(table(1));
        registry.insert(table(2));
        registry.insert(table(3));
        assert_eq!(registry.len(), 2);
        assert!(registry.get(InodeNumber(1)).is_some());
        assert!(registry.get(InodeNumber(2)).is_none());

        // Everything is held: the limit gives way.
        let also_held = registry.get(InodeNumber(3)).expect("3");
        registry.insert(table(4));
        assert_eq!(registry.len(), 3);

        drop((held, also_held));
        assert_eq!(registry.evict_idle(), 3);
        assert!(registry.is_empty());
    }

    #[test]
    fn unlimited_registry_keeps_everything() {
        let registry = MetaRegistry::new();
        for inode in 1..=50 {
            registry.insert(table(inode));
        }
        assert_eq!(registry.len(), 50);
    }
}
