//! The engine: one cache accountant, block ledger, superblock index and
//! recovery worker over a metadata directory.
//!
//! Directory layout:
//!
//! ```text
//! <meta_dir>/superblock         superblock index
//! <meta_dir>/unclaimed_list     inodes awaiting reclaim
//! <meta_dir>/recovery_progress  present only while recovery runs
//! <meta_dir>/cache_usage.json   accountant snapshot, present only while closed
//! <meta_dir>/meta/<inode>       block table of a regular file
//! ```
//!
//! The usage snapshot is consumed on open. Opening a non-empty index
//! without one means the last shutdown was unclean: the dirty counters are
//! unknown and the index is flagged for recovery.

use crate::config::HcfsConfig;
use hcfs_block::{FileByteDevice, MemoryByteDevice, SharedDevice};
use hcfs_cache::{CacheAccountant, CacheUsage};
use hcfs_error::{HcfsError, Result};
use hcfs_ledger::{
    BlockLedger, BlockStatus, BlockStore, FileBlocks, FileMeta, MetaRegistry, TruncateReport,
};
use hcfs_recovery::{
    FileMetaCache, FileMetaGuard, FileProgressStore, LockedFile, MemoryProgressStore,
    ProgressStore, Reconstructor, RecoveryReport,
};
use hcfs_superblock::{Superblock, SuperblockStorage};
use hcfs_types::{BlockNumber, InodeNumber, InodeStat};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

pub const META_SUBDIR: &str = "meta";
pub const USAGE_FILE: &str = "cache_usage.json";

/// Block tables of regular files, opened from the metadata directory on
/// first use.
#[derive(Debug)]
pub struct FileTables {
    registry: MetaRegistry,
    dir: Option<PathBuf>,
}

impl FileTables {
    /// Tables under `dir` are closed when idle beyond `open_tables`;
    /// memory-backed tables stay until removed.
    fn new(dir: Option<PathBuf>, open_tables: usize) -> Self {
        let registry = match dir {
            Some(_) => MetaRegistry::with_limit(open_tables),
            None => MetaRegistry::new(),
        };
        Self { registry, dir }
    }

    fn path(&self, inode: InodeNumber) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(inode.0.to_string()))
    }

    /// Start an empty table for a new regular file.
    pub fn create(&self, inode: InodeNumber, pinned: bool) -> Result<FileMeta> {
        let dev: SharedDevice = match self.path(inode) {
            Some(path) => Arc::new(FileByteDevice::open_or_create(path)?),
            None => Arc::new(MemoryByteDevice::new()),
        };
        Ok(self.registry.insert(FileBlocks::create(dev, inode, pinned)?))
    }

    /// The table of `inode`; `None` when it has none.
    pub fn get(&self, inode: InodeNumber) -> Result<Option<FileMeta>> {
        if let Some(meta) = self.registry.get(inode) {
            return Ok(Some(meta));
        }
        let Some(path) = self.path(inode) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        self.registry
            .get_or_insert_with(inode, || {
                let dev: SharedDevice = Arc::new(FileByteDevice::open(&path)?);
                FileBlocks::open(dev)
            })
            .map(Some)
    }

    /// Forget the table and remove its file.
    pub fn remove(&self, inode: InodeNumber) -> Result<()> {
        self.registry.remove(inode);
        if let Some(path) = self.path(inode) {
            match fs::remove_file(path) {
                Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
                _ => {}
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn loaded(&self) -> usize {
        self.registry.len()
    }

    /// Cache-side counters summed over every table on disk: logical size,
    /// cached bytes and blocks, and cached bytes of pinned files. Each table
    /// is opened and closed in turn. Unreadable tables are skipped.
    pub fn scan_usage(&self) -> Result<CacheUsage> {
        let mut usage = CacheUsage::default();
        let Some(dir) = &self.dir else {
            return Ok(usage);
        };
        let mut scanned = 0_u64;
        for dirent in fs::read_dir(dir)? {
            let path = dirent?.path();
            let Some(inode) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.parse::<u64>().ok())
            else {
                continue;
            };
            let opened = FileByteDevice::open(&path).and_then(|dev| {
                let dev: SharedDevice = Arc::new(dev);
                FileBlocks::open(dev)
            });
            let table = match opened {
                Ok(table) => table,
                Err(
                    err @ (HcfsError::Format(_)
                    | HcfsError::Corruption { .. }
                    | HcfsError::ShortIo { .. }),
                ) => {
                    warn!(
                        target: "hcfs::engine",
                        event = "block_table_unreadable",
                        inode,
                        error = %err
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            let stats = table.stats();
            let cached = signed(stats.cached_size);
            usage.system_size = usage.system_size.saturating_add(signed(stats.file_size));
            usage.cache_size = usage.cache_size.saturating_add(cached);
            usage.cache_blocks = usage
                .cache_blocks
                .saturating_add(signed(stats.num_cached_blocks));
            if table.pinned() {
                usage.pinned_size = usage.pinned_size.saturating_add(cached);
            }
            scanned += 1;
        }
        info!(
            target: "hcfs::engine",
            event = "cache_usage_rebuilt",
            tables = scanned,
            cache_size = usage.cache_size,
            cache_blocks = usage.cache_blocks
        );
        Ok(usage)
    }
}

impl FileMetaCache for FileTables {
    fn lock_regular(&self, inode: InodeNumber) -> Result<Option<Box<dyn FileMetaGuard>>> {
        Ok(self
            .get(inode)?
            .map(|meta| Box::new(LockedFile::lock(&meta)) as Box<dyn FileMetaGuard>))
    }
}

pub struct Hcfs {
    config: HcfsConfig,
    dir: Option<PathBuf>,
    accountant: Arc<CacheAccountant>,
    ledger: BlockLedger,
    superblock: Arc<Superblock>,
    files: Arc<FileTables>,
    recovery: Arc<Reconstructor>,
}

impl std::fmt::Debug for Hcfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hcfs")
            .field("dir", &self.dir)
            .field("superblock", &self.superblock)
            .finish_non_exhaustive()
    }
}

impl Hcfs {
    /// Open (or create) the engine state under `dir`.
    pub fn open(
        dir: impl AsRef<Path>,
        config: HcfsConfig,
        store: Arc<dyn BlockStore>,
    ) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(META_SUBDIR))?;

        let storage = SuperblockStorage::open_dir(&dir)?;
        let files = Arc::new(FileTables::new(
            Some(dir.join(META_SUBDIR)),
            config.ledger.open_tables,
        ));
        let saved = take_saved_usage(&dir)?;
        let usage = match saved {
            Some(usage) => usage,
            // Dirty counters are left to recovery.
            None => files.scan_usage()?,
        };
        let accountant = Arc::new(CacheAccountant::with_usage(config.cache.clone(), usage));
        let superblock = Arc::new(Superblock::open(
            storage,
            config.superblock.clone(),
            Arc::clone(&accountant),
        )?);
        if saved.is_none() && superblock.head().num_total_inodes > 0 {
            warn!(
                target: "hcfs::engine",
                event = "unclean_shutdown",
                dir = %dir.display(),
                cache_size = usage.cache_size,
                cache_blocks = usage.cache_blocks
            );
            superblock.flag_suspect(InodeNumber::NULL, "cache usage was not saved at shutdown");
        }

        let progress: Arc<dyn ProgressStore> = Arc::new(FileProgressStore::new(&dir));
        let engine = Self::assemble(config, Some(dir), accountant, superblock, files, progress, store);
        info!(
            target: "hcfs::engine",
            event = "engine_opened",
            total_inodes = engine.superblock.head().num_total_inodes,
            restored_usage = saved.is_some()
        );
        Ok(engine)
    }

    /// Engine with every structure in memory.
    pub fn in_memory(config: HcfsConfig, store: Arc<dyn BlockStore>) -> Result<Self> {
        let accountant = Arc::new(CacheAccountant::new(config.cache.clone()));
        let superblock = Arc::new(Superblock::in_memory(
            config.superblock.clone(),
            Arc::clone(&accountant),
        )?);
        let files = Arc::new(FileTables::new(None, config.ledger.open_tables));
        Ok(Self::assemble(
            config,
            None,
            accountant,
            superblock,
            files,
            Arc::new(MemoryProgressStore::new()),
            store,
        ))
    }

    fn assemble(
        config: HcfsConfig,
        dir: Option<PathBuf>,
        accountant: Arc<CacheAccountant>,
        superblock: Arc<Superblock>,
        files: Arc<FileTables>,
        progress: Arc<dyn ProgressStore>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        let recovery = Arc::new(Reconstructor::new(
            Arc::clone(&superblock),
            Arc::clone(&files) as Arc<dyn FileMetaCache>,
            progress,
            config.recovery,
        ));
        let ledger = BlockLedger::new(store, Arc::clone(&accountant), config.ledger.clone());
        Self {
            config,
            dir,
            accountant,
            ledger,
            superblock,
            files,
            recovery,
        }
    }

    #[must_use]
    pub fn config(&self) -> &HcfsConfig {
        &self.config
    }

    #[must_use]
    pub fn superblock(&self) -> &Arc<Superblock> {
        &self.superblock
    }

    #[must_use]
    pub fn ledger(&self) -> &BlockLedger {
        &self.ledger
    }

    #[must_use]
    pub fn files(&self) -> &Arc<FileTables> {
        &self.files
    }

    #[must_use]
    pub fn recovery(&self) -> &Arc<Reconstructor> {
        &self.recovery
    }

    #[must_use]
    pub fn usage(&self) -> CacheUsage {
        self.accountant.snapshot()
    }

    /// Allocate an inode, give a regular file an empty block table, and
    /// queue the new inode for sync.
    pub fn create(&self, stat: InodeStat, pin: bool) -> Result<InodeNumber> {
        let inode = self.superblock.allocate_inode(stat, pin)?;
        if stat.is_regular() {
            self.files.create(inode, pin)?;
        }
        self.superblock.mark_dirty(inode)?;
        debug!(target: "hcfs::engine", event = "inode_created", inode = inode.0);
        Ok(inode)
    }

    fn file(&self, inode: InodeNumber) -> Result<FileMeta> {
        self.files
            .get(inode)?
            .ok_or_else(|| HcfsError::NotFound(format!("no block table for inode {inode}")))
    }

    pub fn read_block(&self, inode: InodeNumber, block: BlockNumber) -> Result<BlockStatus> {
        self.ledger.read_block(&*self.file(inode)?, block)
    }

    /// Local write of `block`, then queue the inode for sync. A write past
    /// the end of file grows the recorded size. The metadata lock is
    /// released before the superblock is touched.
    pub fn write_block(
        &self,
        inode: InodeNumber,
        block: BlockNumber,
        new_block_bytes: u64,
    ) -> Result<BlockStatus> {
        let meta = self.file(inode)?;
        let status = self.ledger.write_block(&*meta, block, new_block_bytes)?;
        let end = block
            .0
            .saturating_mul(self.config.ledger.block_size)
            .saturating_add(new_block_bytes);
        let size = self.ledger.extend(&*meta, end)?;
        drop(meta);

        let stat = self.superblock.read_entry(inode)?.stat;
        if stat.size < size {
            self.superblock.update_stat(inode, InodeStat { size, ..stat })?;
        } else {
            self.superblock.mark_dirty(inode)?;
        }
        Ok(status)
    }

    /// Cut the file to `new_size` bytes and record the new size.
    pub fn truncate(&self, inode: InodeNumber, new_size: u64) -> Result<TruncateReport> {
        let report = self.ledger.truncate(&*self.file(inode)?, new_size)?;
        let stat = self.superblock.read_entry(inode)?.stat;
        self.superblock.update_stat(
            inode,
            InodeStat {
                size: new_size,
                ..stat
            },
        )?;
        Ok(report)
    }

    /// Unlink to zero: drop the file's blocks and queue the inode for
    /// backend deletion. The returned blocks go to the delete worker.
    pub fn unlink(&self, inode: InodeNumber) -> Result<TruncateReport> {
        let report = match self.files.get(inode)? {
            Some(meta) => self.ledger.truncate(&*meta, 0)?,
            None => TruncateReport::default(),
        };
        self.superblock.to_delete(inode)?;
        Ok(report)
    }

    /// The backend has deleted the inode: drop its table and queue the
    /// entry for reclaim.
    pub fn forget(&self, inode: InodeNumber) -> Result<()> {
        self.files.remove(inode)?;
        self.superblock.delete(inode)
    }

    pub fn recover_if_needed(&self) -> Result<Option<RecoveryReport>> {
        self.recovery.run_if_needed()
    }

    pub fn spawn_recovery(&self) -> Result<JoinHandle<Result<RecoveryReport>>> {
        Arc::clone(&self.recovery).spawn()
    }

    /// Flush the index, then leave an accountant snapshot for the next open.
    pub fn close(self) -> Result<()> {
        self.superblock.flush()?;
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        save_usage(dir, &self.accountant.snapshot())?;
        info!(target: "hcfs::engine", event = "engine_closed", dir = %dir.display());
        Ok(())
    }
}

fn signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn take_saved_usage(dir: &Path) -> Result<Option<CacheUsage>> {
    let path = dir.join(USAGE_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    fs::remove_file(&path)?;
    File::open(dir)?.sync_all()?;
    match serde_json::from_str(&text) {
        Ok(usage) => Ok(Some(usage)),
        Err(err) => {
            warn!(
                target: "hcfs::engine",
                event = "usage_snapshot_unreadable",
                path = %path.display(),
                error = %err
            );
            Ok(None)
        }
    }
}

fn save_usage(dir: &Path, usage: &CacheUsage) -> Result<()> {
    let json = serde_json::to_vec(usage)
        .map_err(|e| HcfsError::Format(format!("cache usage: {e}")))?;
    let tmp = dir.join(format!("{USAGE_FILE}.tmp"));
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, dir.join(USAGE_FILE))?;
    File::open(dir)?.sync_all()?;
    Ok(())
}
