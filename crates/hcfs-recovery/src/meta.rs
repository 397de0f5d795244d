//! Access to per-file metadata during a recovery batch.

use hcfs_error::Result;
use hcfs_ledger::{FileBlocks, FileMeta, MetaRegistry, SharedDevice};
use hcfs_types::InodeNumber;
use parking_lot::{ArcMutexGuard, RawMutex};

/// A held metadata lock for one regular file.
pub trait FileMetaGuard {
    /// Cached bytes of the file not yet acknowledged by the backend.
    fn dirty_data_size(&self) -> u64;
}

/// Source of per-file metadata locks.
pub trait FileMetaCache: Send + Sync {
    /// Lock the metadata of `inode` if it is a known regular file. The lock
    /// is held until the guard drops.
    fn lock_regular(&self, inode: InodeNumber) -> Result<Option<Box<dyn FileMetaGuard>>>;
}

/// Owned lock on a registered block table.
pub struct LockedFile(ArcMutexGuard<RawMutex, FileBlocks<SharedDevice>>);

impl LockedFile {
    #[must_use]
    pub fn lock(meta: &FileMeta) -> Self {
        Self(meta.lock_arc())
    }
}

impl FileMetaGuard for LockedFile {
    fn dirty_data_size(&self) -> u64 {
        self.0.stats().dirty_data_size
    }
}

impl FileMetaCache for MetaRegistry {
    fn lock_regular(&self, inode: InodeNumber) -> Result<Option<Box<dyn FileMetaGuard>>> {
        Ok(self
            .get(inode)
            .map(|meta| Box::new(LockedFile::lock(&meta)) as Box<dyn FileMetaGuard>))
    }
}

/// No regular files have metadata loaded; only metadata-dirty bytes count.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFileMeta;

impl FileMetaCache for NoFileMeta {
    fn lock_regular(&self, _inode: InodeNumber) -> Result<Option<Box<dyn FileMetaGuard>>> {
        Ok(None)
    }
}
