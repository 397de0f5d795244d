//! Transition engine: applies the state machine to a locked block table.
//!
//! Every function takes the caller's per-inode metadata lock (a
//! `parking_lot::Mutex<FileBlocks<D>>`) and performs read-transition-write
//! as one critical section. Accounting for a transition is applied to the
//! [`CacheAccountant`] before that lock is released.
//!
//! The only place the lock is dropped mid-operation is the fetch protocol:
//!
//! 1. mark the block CtoL and release the metadata lock;
//! 2. wait for cache space, then download (blocking, no lock held);
//! 3. re-acquire and re-check: only a block still in CtoL is promoted;
//!    anything else (a truncate won the race) discards the download.

use crate::status::{
    BlockEntry, BlockStatus, FetchPurpose, ReadAction, TruncateAction, WriteAction,
};
use crate::table::{FileBlocks, FileStats};
use hcfs_block::ByteDevice;
use hcfs_cache::{CacheAccountant, UsageDelta};
use hcfs_error::{HcfsError, Result};
use hcfs_types::{BlockNumber, InodeNumber};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Local cache and backend primitives the ledger drives.
pub trait BlockStore: Send + Sync {
    /// Download `block` into the local cache, returning the bytes now cached.
    fn fetch(&self, inode: InodeNumber, block: BlockNumber, entry: &BlockEntry) -> Result<u64>;

    /// Create an empty local copy for a new block.
    fn allocate_local(&self, inode: InodeNumber, block: BlockNumber) -> Result<()>;

    /// Size of the local copy.
    fn local_size(&self, inode: InodeNumber, block: BlockNumber) -> Result<u64>;

    /// Remove the local copy, returning the bytes freed (0 when absent).
    fn unlink_local(&self, inode: InodeNumber, block: BlockNumber) -> Result<u64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Bytes of file data per block.
    pub block_size: u64,
    /// Block tables kept open at once by a file-backed metadata cache. Idle
    /// tables beyond this are closed and reopened on next use.
    pub open_tables: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            block_size: 1 << 20,
            open_tables: 256,
        }
    }
}

/// What a truncate did to the blocks past the new end of file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TruncateReport {
    /// Blocks now TODELETE, with the entry they had, for the delete worker.
    pub to_delete: Vec<(BlockNumber, BlockEntry)>,
    /// LDISK blocks dropped outright.
    pub unlinked: u64,
    pub freed_bytes: u64,
}

enum FetchOutcome {
    Landed(BlockStatus),
    Raced(BlockStatus),
}

pub struct BlockLedger {
    store: Arc<dyn BlockStore>,
    accountant: Arc<CacheAccountant>,
    config: LedgerConfig,
}

impl std::fmt::Debug for BlockLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLedger")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BlockLedger {
    #[must_use]
    pub fn new(
        store: Arc<dyn BlockStore>,
        accountant: Arc<CacheAccountant>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            accountant,
            config,
        }
    }

    #[must_use]
    pub fn accountant(&self) -> &Arc<CacheAccountant> {
        &self.accountant
    }

    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Make `block` readable locally; returns the status it ends in.
    pub fn read_block<D: ByteDevice>(
        &self,
        meta: &Mutex<FileBlocks<D>>,
        block: BlockNumber,
    ) -> Result<BlockStatus> {
        loop {
            let table = meta.lock();
            let status = table.entry(block)?.status;
            if status.on_read() == ReadAction::Ready {
                return Ok(status);
            }
            match self.fetch(meta, table, block, FetchPurpose::Read)? {
                FetchOutcome::Landed(status) => return Ok(status),
                // A failed concurrent fetch put it back to CLOUD: try again.
                FetchOutcome::Raced(BlockStatus::Cloud | BlockStatus::CtoL) => {}
                FetchOutcome::Raced(status) => return Ok(status),
            }
        }
    }

    /// Prepare `block` for a local write. `new_block_bytes` is the size of
    /// the local copy when the write creates one.
    pub fn write_block<D: ByteDevice>(
        &self,
        meta: &Mutex<FileBlocks<D>>,
        block: BlockNumber,
        new_block_bytes: u64,
    ) -> Result<BlockStatus> {
        loop {
            let mut table = meta.lock();
            let mut entry = table.entry(block)?;
            match entry.status.on_write() {
                WriteAction::AlreadyDirty => {
                    entry.seq_num += 1;
                    table.set_entry(block, &entry)?;
                    return Ok(BlockStatus::Ldisk);
                }
                WriteAction::Diverge => {
                    let inode = table.inode();
                    let from = entry.status;
                    // LtoC is already counted dirty.
                    let bytes = if from.is_dirty() {
                        0
                    } else {
                        self.store.local_size(inode, block)?
                    };
                    entry.status = BlockStatus::Ldisk;
                    entry.seq_num += 1;
                    table.set_entry(block, &entry)?;
                    let pinned = table.pinned();
                    update_stats(&mut *table, |s| {
                        s.dirty_data_size += bytes;
                    })?;
                    self.accountant
                        .apply(UsageDelta::dirty(signed(bytes), pinned));
                    drop(table);
                    trace_transition(inode, block, from, BlockStatus::Ldisk);
                    return Ok(BlockStatus::Ldisk);
                }
                WriteAction::Allocate => {
                    if self.accountant.is_full() {
                        drop(table);
                        self.accountant.wait_for_space();
                        continue;
                    }
                    let inode = table.inode();
                    self.store.allocate_local(inode, block)?;
                    let from = entry.status;
                    entry = BlockEntry {
                        status: BlockStatus::Ldisk,
                        seq_num: entry.seq_num + 1,
                        ..BlockEntry::default()
                    };
                    table.set_entry(block, &entry)?;
                    let pinned = table.pinned();
                    update_stats(&mut *table, |s| {
                        s.num_blocks = s.num_blocks.max(block.0 + 1);
                        s.num_cached_blocks += 1;
                        s.cached_size += new_block_bytes;
                        s.dirty_data_size += new_block_bytes;
                    })?;
                    let bytes = signed(new_block_bytes);
                    self.accountant.apply(
                        UsageDelta::cached_block(bytes, pinned)
                            .plus(UsageDelta::dirty(bytes, pinned)),
                    );
                    drop(table);
                    trace_transition(inode, block, from, BlockStatus::Ldisk);
                    return Ok(BlockStatus::Ldisk);
                }
                WriteAction::Fetch => match self.fetch(meta, table, block, FetchPurpose::Write)? {
                    FetchOutcome::Landed(status) => return Ok(status),
                    // Re-evaluate against whatever won the race.
                    FetchOutcome::Raced(_) => {}
                },
            }
        }
    }

    fn fetch<D: ByteDevice>(
        &self,
        meta: &Mutex<FileBlocks<D>>,
        mut table: MutexGuard<'_, FileBlocks<D>>,
        block: BlockNumber,
        purpose: FetchPurpose,
    ) -> Result<FetchOutcome> {
        let inode = table.inode();
        let mut entry = table.entry(block)?;
        if entry.status == BlockStatus::Cloud {
            entry.status = BlockStatus::CtoL;
            table.set_entry(block, &entry)?;
            trace_transition(inode, block, BlockStatus::Cloud, BlockStatus::CtoL);
        }
        drop(table);

        self.accountant.wait_for_space();
        let fetched = self.store.fetch(inode, block, &entry);

        let mut table = meta.lock();
        let mut now = table.entry(block)?;
        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(err) => {
                if now.status == BlockStatus::CtoL {
                    now.status = BlockStatus::Cloud;
                    table.set_entry(block, &now)?;
                }
                drop(table);
                warn!(
                    target: "hcfs::ledger",
                    event = "block_fetch_failed",
                    inode = inode.0,
                    block = block.0,
                    error = %err
                );
                return Err(err);
            }
        };

        let Some(next) = now.status.on_fetched(purpose) else {
            let raced = now.status;
            if !raced.is_cached() {
                // Truncated (or reverted) while downloading: the copy we just
                // made is not referenced by any entry.
                self.store.unlink_local(inode, block)?;
            }
            drop(table);
            debug!(
                target: "hcfs::ledger",
                event = "block_fetch_raced",
                inode = inode.0,
                block = block.0,
                status = %raced
            );
            return Ok(FetchOutcome::Raced(raced));
        };

        now.status = next;
        if next == BlockStatus::Ldisk {
            now.seq_num += 1;
        }
        table.set_entry(block, &now)?;
        let pinned = table.pinned();
        let dirty = if next == BlockStatus::Ldisk { bytes } else { 0 };
        update_stats(&mut *table, |s| {
            s.num_cached_blocks += 1;
            s.cached_size += bytes;
            s.dirty_data_size += dirty;
        })?;
        self.accountant.apply(
            UsageDelta::cached_block(signed(bytes), pinned)
                .plus(UsageDelta::dirty(signed(dirty), pinned)),
        );
        drop(table);
        trace_transition(inode, block, BlockStatus::CtoL, next);
        Ok(FetchOutcome::Landed(next))
    }

    /// Apply truncate rules to every block at or beyond `new_size`.
    pub fn truncate<D: ByteDevice>(
        &self,
        meta: &Mutex<FileBlocks<D>>,
        new_size: u64,
    ) -> Result<TruncateReport> {
        let first_gone = new_size.div_ceil(self.config.block_size.max(1));
        let mut table = meta.lock();
        let inode = table.inode();
        let pinned = table.pinned();
        let mut stats = table.stats();
        let mut report = TruncateReport::default();
        let mut delta = UsageDelta::default();

        for raw in first_gone..stats.num_blocks {
            let block = BlockNumber(raw);
            let entry = table.entry(block)?;
            match entry.status.on_truncate() {
                TruncateAction::Keep => continue,
                TruncateAction::UnlinkLocal => {
                    let freed = self.store.unlink_local(inode, block)?;
                    table.set_entry(block, &BlockEntry::default())?;
                    forget_cached(&mut stats, &mut delta, entry.status, freed, pinned);
                    report.unlinked += 1;
                    report.freed_bytes += freed;
                    trace_transition(inode, block, entry.status, BlockStatus::None);
                }
                TruncateAction::MarkDelete { drop_local } => {
                    if drop_local {
                        let freed = self.store.unlink_local(inode, block)?;
                        if entry.status.is_cached() {
                            forget_cached(&mut stats, &mut delta, entry.status, freed, pinned);
                            report.freed_bytes += freed;
                        }
                    }
                    let marked = BlockEntry {
                        status: BlockStatus::ToDelete,
                        ..entry
                    };
                    table.set_entry(block, &marked)?;
                    report.to_delete.push((block, entry));
                    trace_transition(inode, block, entry.status, BlockStatus::ToDelete);
                }
            }
        }

        stats.num_blocks = stats.num_blocks.min(first_gone);
        delta = delta.plus(UsageDelta::system(
            signed(new_size) - signed(stats.file_size),
        ));
        stats.file_size = new_size;
        table.set_stats(stats)?;
        self.accountant.apply(delta);
        drop(table);
        debug!(
            target: "hcfs::ledger",
            event = "file_truncate",
            inode = inode.0,
            new_size,
            to_delete = report.to_delete.len(),
            unlinked = report.unlinked,
            freed_bytes = report.freed_bytes
        );
        Ok(report)
    }

    /// A write reached byte `end` of the file. Grows the logical size when
    /// `end` lies past it and returns the size afterwards.
    pub fn extend<D: ByteDevice>(&self, meta: &Mutex<FileBlocks<D>>, end: u64) -> Result<u64> {
        let mut table = meta.lock();
        let mut stats = table.stats();
        if end <= stats.file_size {
            return Ok(stats.file_size);
        }
        let grown = end - stats.file_size;
        stats.file_size = end;
        table.set_stats(stats)?;
        self.accountant.apply(UsageDelta::system(signed(grown)));
        drop(table);
        Ok(end)
    }

    /// The sync engine picked `block` for upload: LDISK → LtoC. Returns the
    /// sequence number the upload covers.
    pub fn begin_upload<D: ByteDevice>(
        &self,
        meta: &Mutex<FileBlocks<D>>,
        block: BlockNumber,
    ) -> Result<u64> {
        let mut table = meta.lock();
        let mut entry = table.entry(block)?;
        let inode = table.inode();
        let Some(next) = entry.status.on_upload_start() else {
            return Err(invalid(inode, block, entry.status, "begin upload"));
        };
        let from = entry.status;
        entry.status = next;
        table.set_entry(block, &entry)?;
        drop(table);
        trace_transition(inode, block, from, next);
        Ok(entry.seq_num)
    }

    /// The backend acknowledged an upload of `block` taken at `uploaded_seq`.
    ///
    /// LtoC always settles to BOTH. LDISK settles only if nothing was written
    /// after the uploaded snapshot; otherwise it stays dirty for the next
    /// sync. Any other status means the block was truncated meanwhile and the
    /// acknowledgement is ignored.
    pub fn upload_complete<D: ByteDevice>(
        &self,
        meta: &Mutex<FileBlocks<D>>,
        block: BlockNumber,
        uploaded_seq: u64,
        object_id: u64,
    ) -> Result<BlockStatus> {
        let mut table = meta.lock();
        let mut entry = table.entry(block)?;
        let inode = table.inode();
        let from = entry.status;
        let settles = match from {
            BlockStatus::LtoC => true,
            BlockStatus::Ldisk => entry.seq_num == uploaded_seq,
            _ => false,
        };
        if !settles {
            drop(table);
            debug!(
                target: "hcfs::ledger",
                event = "upload_ack_ignored",
                inode = inode.0,
                block = block.0,
                status = %from
            );
            return Ok(from);
        }
        let Some(next) = from.on_upload_ack() else {
            return Err(invalid(inode, block, from, "upload ack"));
        };

        let bytes = self.store.local_size(inode, block)?;
        entry.status = next;
        entry.uploaded = true;
        entry.object_id = object_id;
        table.set_entry(block, &entry)?;
        let pinned = table.pinned();
        update_stats(&mut *table, |s| {
            s.dirty_data_size = s.dirty_data_size.saturating_sub(bytes);
        })?;
        self.accountant
            .apply(UsageDelta::dirty(-signed(bytes), pinned));
        drop(table);
        trace_transition(inode, block, from, next);
        Ok(next)
    }

    /// Evict the local copy of a clean block: BOTH → CLOUD.
    pub fn page_out<D: ByteDevice>(
        &self,
        meta: &Mutex<FileBlocks<D>>,
        block: BlockNumber,
    ) -> Result<u64> {
        let mut table = meta.lock();
        let mut entry = table.entry(block)?;
        let inode = table.inode();
        if table.pinned() {
            return Err(HcfsError::InvalidTransition {
                inode: inode.0,
                detail: format!("block {block}: pinned inode cannot be paged out"),
            });
        }
        let Some(next) = entry.status.on_page_out() else {
            return Err(invalid(inode, block, entry.status, "page out"));
        };

        let freed = self.store.unlink_local(inode, block)?;
        entry.status = next;
        entry.paged_out_count = entry.paged_out_count.saturating_add(1);
        table.set_entry(block, &entry)?;
        update_stats(&mut *table, |s| {
            s.num_cached_blocks = s.num_cached_blocks.saturating_sub(1);
            s.cached_size = s.cached_size.saturating_sub(freed);
        })?;
        self.accountant
            .apply(UsageDelta::cached_block(-signed(freed), false));
        drop(table);
        trace_transition(inode, block, BlockStatus::Both, next);
        Ok(freed)
    }

    /// The backend object of a truncated block is gone: TODELETE → NONE.
    pub fn delete_complete<D: ByteDevice>(
        &self,
        meta: &Mutex<FileBlocks<D>>,
        block: BlockNumber,
    ) -> Result<()> {
        let mut table = meta.lock();
        let entry = table.entry(block)?;
        let inode = table.inode();
        if entry.status.on_delete_complete().is_none() {
            return Err(invalid(inode, block, entry.status, "delete complete"));
        }
        table.set_entry(block, &BlockEntry::default())?;
        drop(table);
        trace_transition(inode, block, BlockStatus::ToDelete, BlockStatus::None);
        Ok(())
    }
}

fn forget_cached(
    stats: &mut FileStats,
    delta: &mut UsageDelta,
    status: BlockStatus,
    freed: u64,
    pinned: bool,
) {
    stats.num_cached_blocks = stats.num_cached_blocks.saturating_sub(1);
    stats.cached_size = stats.cached_size.saturating_sub(freed);
    *delta = delta.plus(UsageDelta::cached_block(-signed(freed), pinned));
    if status.is_dirty() {
        stats.dirty_data_size = stats.dirty_data_size.saturating_sub(freed);
        *delta = delta.plus(UsageDelta::dirty(-signed(freed), pinned));
    }
}

fn update_stats<D: ByteDevice>(
    table: &mut FileBlocks<D>,
    f: impl FnOnce(&mut FileStats),
) -> Result<()> {
    let mut stats = table.stats();
    f(&mut stats);
    table.set_stats(stats)
}

fn signed(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

fn invalid(inode: InodeNumber, block: BlockNumber, status: BlockStatus, op: &str) -> HcfsError {
    HcfsError::InvalidTransition {
        inode: inode.0,
        detail: format!("{op} on block {block} in state {status}"),
    }
}

fn trace_transition(inode: InodeNumber, block: BlockNumber, from: BlockStatus, to: BlockStatus) {
    trace!(
        target: "hcfs::ledger",
        inode = inode.0,
        block = block.0,
        from = %from,
        to = %to,
        "block_transition"
    );
}
