//! Backing devices of the superblock and the append-only unclaimed log.

use hcfs_block::{FileByteDevice, MemoryByteDevice, SharedDevice};
use hcfs_error::{HcfsError, Result};
use hcfs_types::InodeNumber;
use fs2::{FileExt, lock_contended_error};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub const SUPERBLOCK_FILE: &str = "superblock";
pub const UNCLAIMED_FILE: &str = "unclaimed_list";
pub const LOCK_FILE: &str = "superblock.lock";

/// Where the index lives.
///
/// The head record is cached by the [`Superblock`](crate::Superblock) that
/// owns the storage, so a directory has exactly one owner at a time:
/// [`SuperblockStorage::open_dir`] takes an exclusive `flock` on
/// [`LOCK_FILE`] and keeps it until the last clone is dropped. Other threads
/// and processes reach the index through that owner. Memory-backed storage
/// is private to this process.
#[derive(Clone)]
pub struct SuperblockStorage {
    pub index: SharedDevice,
    pub unclaimed: SharedDevice,
    owner: Option<Arc<File>>,
}

impl SuperblockStorage {
    #[must_use]
    pub fn new(index: SharedDevice, unclaimed: SharedDevice) -> Self {
        Self {
            index,
            unclaimed,
            owner: None,
        }
    }

    /// Open the index files under `dir`. Fails with [`HcfsError::Busy`]
    /// while another open storage owns the directory.
    pub fn open_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if let Err(err) = lock.try_lock_exclusive() {
            if err.raw_os_error() == lock_contended_error().raw_os_error() {
                warn!(
                    target: "hcfs::superblock",
                    event = "superblock_busy",
                    dir = %dir.display()
                );
                return Err(HcfsError::Busy(format!(
                    "superblock in {} is open elsewhere",
                    dir.display()
                )));
            }
            return Err(err.into());
        }
        let index = FileByteDevice::open_or_create(dir.join(SUPERBLOCK_FILE))?;
        let unclaimed = FileByteDevice::open_or_create(dir.join(UNCLAIMED_FILE))?;
        Ok(Self {
            owner: Some(Arc::new(lock)),
            ..Self::new(Arc::new(index), Arc::new(unclaimed))
        })
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryByteDevice::new()),
            Arc::new(MemoryByteDevice::new()),
        )
    }

    /// Whether this storage holds the directory lock.
    #[must_use]
    pub fn owns_dir(&self) -> bool {
        self.owner.is_some()
    }
}

impl std::fmt::Debug for SuperblockStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperblockStorage").finish_non_exhaustive()
    }
}

/// Raw little-endian u64 inode numbers, appended by `delete` and drained by
/// `reclaim`.
pub(crate) struct UnclaimedLog<'a> {
    dev: &'a SharedDevice,
}

const RECORD: u64 = 8;

impl<'a> UnclaimedLog<'a> {
    pub(crate) fn new(dev: &'a SharedDevice) -> Self {
        Self { dev }
    }

    pub(crate) fn append(&self, inode: InodeNumber) -> Result<()> {
        let len = self.dev.len_bytes()?;
        // A torn append leaves a partial record; overwrite it.
        let at = len - len % RECORD;
        self.dev.write_all_at(at, &inode.0.to_le_bytes())
    }

    pub(crate) fn read_all(&self) -> Result<Vec<InodeNumber>> {
        let len = self.dev.len_bytes()?;
        if len % RECORD != 0 {
            warn!(
                target: "hcfs::superblock",
                event = "unclaimed_log_torn_tail",
                len
            );
        }
        let whole = usize::try_from(len - len % RECORD)
            .map_err(|_| HcfsError::Format("unclaimed log too large".to_owned()))?;
        let mut buf = vec![0_u8; whole];
        self.dev.read_exact_at(0, &mut buf)?;
        Ok(buf
            .chunks_exact(RECORD as usize)
            .map(|chunk| {
                let mut raw = [0_u8; 8];
                raw.copy_from_slice(chunk);
                InodeNumber(u64::from_le_bytes(raw))
            })
            .collect())
    }

    pub(crate) fn clear(&self) -> Result<()> {
        self.dev.set_len(0)
    }
}
