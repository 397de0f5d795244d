use crate::layout::{
    Chain, PinStatus, QueueStatus, SuperblockEntry, SuperblockHead, entry_offset,
};
use crate::lock::ShareLock;
use crate::session::{
    ExclusiveSession, meta_charge, read_entries_at, read_entry_at, read_head_at, write_head_at,
};
use crate::storage::SuperblockStorage;
use hcfs_block::SharedDevice;
use hcfs_cache::{CacheAccountant, UsageDelta};
use hcfs_error::{HcfsError, Result};
use hcfs_types::{Generation, InodeNumber, InodeStat, unix_now};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Superblock tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SuperblockConfig {
    /// Pending reclaims at which [`Superblock::reclaim`] drains the
    /// unclaimed log.
    pub reclaim_threshold: u64,
    /// Entries per read during full scans.
    pub scan_batch: u64,
}

impl Default for SuperblockConfig {
    fn default() -> Self {
        Self {
            reclaim_threshold: 1000,
            scan_batch: 1024,
        }
    }
}

/// Chain tails recorded when a full sync was requested. A side reads null
/// once every entry that was queued on it at that moment has left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPoint {
    pub dirty_tail: InodeNumber,
    pub delete_tail: InodeNumber,
}

impl SyncPoint {
    #[must_use]
    pub fn is_reached(&self) -> bool {
        self.dirty_tail.is_null() && self.delete_tail.is_null()
    }
}

/// The inode work-queue index.
///
/// Point reads take the shared side of [`ShareLock`]; anything that
/// touches the head or chain topology takes the exclusive side for the
/// whole read-modify-write.
pub struct Superblock {
    storage: SuperblockStorage,
    config: SuperblockConfig,
    accountant: Arc<CacheAccountant>,
    lock: ShareLock,
    head: Mutex<SuperblockHead>,
    syncpoint: Mutex<Option<SyncPoint>>,
    suspect: AtomicBool,
}

impl Superblock {
    /// Open the index on `storage`, formatting an empty device.
    pub fn open(
        storage: SuperblockStorage,
        config: SuperblockConfig,
        accountant: Arc<CacheAccountant>,
    ) -> Result<Self> {
        let len = storage.index.len_bytes()?;
        let head = if len == 0 {
            let head = SuperblockHead::default();
            write_head_at(&storage.index, &head)?;
            storage.index.sync()?;
            info!(target: "hcfs::superblock", event = "superblock_formatted");
            head
        } else {
            let head = read_head_at(&storage.index)?;
            let needed = entry_offset(InodeNumber(head.num_total_inodes.saturating_add(1)));
            if len < needed {
                return Err(HcfsError::ShortIo {
                    offset: len,
                    expected: usize::try_from(needed - len).unwrap_or(usize::MAX),
                    actual: 0,
                });
            }
            debug!(
                target: "hcfs::superblock",
                event = "superblock_opened",
                total = head.num_total_inodes,
                active = head.num_active_inodes,
                dirty = head.dirty.count,
                recovery_ongoing = head.recovery.ongoing
            );
            head
        };
        Ok(Self {
            storage,
            config,
            accountant,
            lock: ShareLock::new(),
            head: Mutex::new(head),
            syncpoint: Mutex::new(None),
            suspect: AtomicBool::new(false),
        })
    }

    pub fn in_memory(config: SuperblockConfig, accountant: Arc<CacheAccountant>) -> Result<Self> {
        Self::open(SuperblockStorage::in_memory(), config, accountant)
    }

    #[must_use]
    pub fn config(&self) -> &SuperblockConfig {
        &self.config
    }

    #[must_use]
    pub fn accountant(&self) -> &Arc<CacheAccountant> {
        &self.accountant
    }

    #[must_use]
    pub fn storage(&self) -> &SuperblockStorage {
        &self.storage
    }

    pub(crate) fn index(&self) -> &SharedDevice {
        &self.storage.index
    }

    /// Take the exclusive lock. Callers that also need a per-inode metadata
    /// lock must take that one first.
    pub fn exclusive(&self) -> ExclusiveSession<'_> {
        let lock = self.lock.exclusive();
        let head = self.head.lock();
        ExclusiveSession::new(self, head, lock)
    }

    /// Copy of the head record.
    #[must_use]
    pub fn head(&self) -> SuperblockHead {
        let _shared = self.lock.shared();
        *self.head.lock()
    }

    pub fn read_entry(&self, inode: InodeNumber) -> Result<SuperblockEntry> {
        self.with_shared(|head| read_entry_at(&self.storage.index, inode, head.num_total_inodes))
    }

    /// `count` consecutive entries from `first`, read under the shared lock.
    pub fn read_entries(&self, first: InodeNumber, count: u64) -> Result<Vec<SuperblockEntry>> {
        self.with_shared(|head| {
            read_entries_at(&self.storage.index, first, count, head.num_total_inodes)
        })
    }

    /// Run a read-only `op` under the shared lock with a copy of the head.
    pub(crate) fn with_shared<T>(&self, op: impl FnOnce(&SuperblockHead) -> Result<T>) -> Result<T> {
        let _shared = self.lock.shared();
        let head = *self.head.lock();
        op(&head)
    }

    /// Raw entry write; no chain bookkeeping.
    pub fn write_entry(&self, inode: InodeNumber, entry: &SuperblockEntry) -> Result<()> {
        if entry.this_index != inode {
            return Err(HcfsError::InvalidTransition {
                inode: inode.0,
                detail: format!("entry carries index {}", entry.this_index),
            });
        }
        self.exclusive().write_entry(entry)
    }

    /// Sync both backing devices.
    pub fn flush(&self) -> Result<()> {
        let _session = self.exclusive();
        self.storage.index.sync()?;
        self.storage.unclaimed.sync()
    }

    /// Run `op` under the exclusive lock. On error the in-memory head goes
    /// back to what it was, and if `op` had already changed it the index is
    /// flagged suspect.
    pub(crate) fn mutate<T>(
        &self,
        name: &'static str,
        op: impl FnOnce(&mut ExclusiveSession<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.exclusive();
        let before = *session.head();
        match op(&mut session) {
            Ok(value) => Ok(value),
            Err(err) => {
                if *session.head() != before {
                    *session.head_mut() = before;
                    self.flag_suspect(InodeNumber::NULL, name);
                }
                warn!(
                    target: "hcfs::superblock",
                    event = "superblock_op_failed",
                    op = name,
                    error = %err
                );
                Err(err)
            }
        }
    }

    /// Allocate an inode, reusing the head of the reclaim chain when there
    /// is one. The new entry is not queued anywhere.
    pub fn allocate_inode(&self, stat: InodeStat, pin: bool) -> Result<InodeNumber> {
        self.mutate("allocate_inode", |s| {
            let (inode, generation) = match s.pop_reclaimed()? {
                Some(reused) => (reused.this_index, Generation(reused.generation.0 + 1)),
                None => {
                    let inode = InodeNumber(s.head().num_total_inodes + 1);
                    s.head_mut().num_total_inodes = inode.0;
                    (inode, Generation(1))
                }
            };
            let pin_status = if pin { PinStatus::Pin } else { PinStatus::Unpin };
            let entry = SuperblockEntry::allocated(inode, stat, pin_status, generation);
            s.write_entry(&entry)?;
            s.head_mut().num_active_inodes += 1;
            s.write_head()?;
            debug!(
                target: "hcfs::superblock",
                event = "inode_allocated",
                inode = inode.0,
                generation = generation.0,
                pin
            );
            Ok(inode)
        })
    }

    /// Queue the inode for sync if it is not queued yet.
    pub fn mark_dirty(&self, inode: InodeNumber) -> Result<()> {
        self.mutate("mark_dirty", |s| {
            let mut entry = s.read_entry(inode)?;
            if entry.stat.is_removed() {
                debug!(target: "hcfs::superblock", event = "mark_dirty_removed", inode = inode.0);
                return Ok(());
            }
            touch_dirty(s, &mut entry)?;
            s.write_entry(&entry)?;
            s.write_head()
        })
    }

    /// Replace the stat snapshot and queue the inode for sync.
    pub fn update_stat(&self, inode: InodeNumber, stat: InodeStat) -> Result<()> {
        self.mutate("update_stat", |s| {
            let mut entry = s.read_entry(inode)?;
            if entry.stat.is_removed() {
                warn!(target: "hcfs::superblock", event = "update_stat_removed", inode = inode.0);
                return Ok(());
            }
            entry.stat = InodeStat { ino: inode.0, ..stat };
            touch_dirty(s, &mut entry)?;
            s.write_entry(&entry)?;
            s.write_head()
        })
    }

    /// Replace the stat snapshot without queueing the inode.
    pub fn update_stat_local(&self, inode: InodeNumber, stat: InodeStat) -> Result<()> {
        self.mutate("update_stat_local", |s| {
            let mut entry = s.read_entry(inode)?;
            if entry.stat.is_removed() {
                return Ok(());
            }
            entry.stat = InodeStat { ino: inode.0, ..stat };
            s.write_entry(&entry)
        })
    }

    /// Record how many metadata bytes of the inode are dirty. While the
    /// entry is counted on the dirty chain the accountant follows.
    pub fn set_dirty_meta_size(&self, inode: InodeNumber, bytes: u64) -> Result<()> {
        self.mutate("set_dirty_meta_size", |s| {
            let mut entry = s.read_entry(inode)?;
            let old = entry.dirty_meta_size;
            entry.dirty_meta_size = bytes;
            if entry.status() == QueueStatus::Dirty && !s.head().awaits_recovery(inode) {
                s.accountant().apply(UsageDelta::dirty(
                    meta_charge(bytes) - meta_charge(old),
                    entry.pin_status.is_pinned(),
                ));
            }
            s.write_entry(&entry)
        })
    }

    /// A sync worker picked the inode up.
    pub fn begin_transit(&self, inode: InodeNumber) -> Result<()> {
        self.mutate("begin_transit", |s| {
            let mut entry = s.read_entry(inode)?;
            entry.in_transit = true;
            entry.mod_after_in_transit = false;
            s.write_entry(&entry)
        })
    }

    /// A sync worker is done with the inode. After a complete sync the
    /// entry leaves the dirty chain unless it was modified meanwhile; a
    /// modified entry stays queued, moved to the tail while a sync point is
    /// pending so the point does not wait on it.
    pub fn end_transit(&self, inode: InodeNumber, complete: bool) -> Result<()> {
        self.mutate("end_transit", |s| {
            let mut entry = s.read_entry(inode)?;
            if complete && entry.status() == QueueStatus::Dirty {
                entry.last_sync_time = unix_now();
                if !entry.mod_after_in_transit {
                    s.dequeue(&mut entry)?;
                } else if self.syncpoint.lock().is_some() {
                    let meta = entry.dirty_meta_size;
                    s.dequeue(&mut entry)?;
                    entry.dirty_meta_size = meta;
                    s.enqueue(&mut entry, QueueStatus::Dirty)?;
                }
            }
            entry.in_transit = false;
            entry.mod_after_in_transit = false;
            s.write_entry(&entry)?;
            s.write_head()
        })
    }

    /// Unlink-to-zero: queue for backend deletion, clear the stat except the
    /// file type, and stop counting the inode as active.
    pub fn to_delete(&self, inode: InodeNumber) -> Result<()> {
        self.mark_deleted(inode, true)
    }

    /// Like [`Self::to_delete`] but leave the entry unqueued; a later
    /// [`Self::enqueue_delete`] puts it on the to-delete chain.
    pub fn to_delete_deferred(&self, inode: InodeNumber) -> Result<()> {
        self.mark_deleted(inode, false)
    }

    pub fn enqueue_delete(&self, inode: InodeNumber) -> Result<()> {
        self.mutate("enqueue_delete", |s| {
            let mut entry = s.read_entry(inode)?;
            if entry.status() != QueueStatus::None || entry.pin_status != PinStatus::Deleted {
                return Err(HcfsError::InvalidTransition {
                    inode: inode.0,
                    detail: format!(
                        "enqueue_delete needs a deleted, unqueued entry (status {}, pin {:?})",
                        entry.status(),
                        entry.pin_status
                    ),
                });
            }
            s.enqueue(&mut entry, QueueStatus::ToDelete)?;
            s.write_entry(&entry)?;
            s.write_head()
        })
    }

    fn mark_deleted(&self, inode: InodeNumber, enqueue_now: bool) -> Result<()> {
        self.mutate("to_delete", |s| {
            let mut entry = s.read_entry(inode)?;
            match entry.status() {
                QueueStatus::ToDelete => return Ok(()),
                QueueStatus::ToReclaim | QueueStatus::Reclaimed => {
                    return Err(HcfsError::InvalidTransition {
                        inode: inode.0,
                        detail: format!("inode already {}", entry.status()),
                    });
                }
                QueueStatus::None | QueueStatus::Dirty => {}
            }
            let already_deleted = entry.pin_status == PinStatus::Deleted;
            if entry.pin_status == PinStatus::Pinning {
                s.pin_dequeue(&mut entry)?;
            }
            if enqueue_now {
                s.enqueue(&mut entry, QueueStatus::ToDelete)?;
            } else {
                s.dequeue(&mut entry)?;
            }
            if !already_deleted {
                let head = s.head_mut();
                head.num_active_inodes = head.num_active_inodes.saturating_sub(1);
            }
            entry.pin_status = PinStatus::Deleted;
            entry.in_transit = false;
            entry.mod_after_in_transit = false;
            entry.stat = entry.stat.cleared_keep_type();
            s.write_entry(&entry)?;
            s.write_head()?;
            debug!(
                target: "hcfs::superblock",
                event = "inode_to_delete",
                inode = inode.0,
                queued = enqueue_now
            );
            Ok(())
        })
    }

    /// Record the current chain tails as a sync point. Returns false when
    /// both chains are empty and there is nothing to wait for.
    pub fn set_syncpoint(&self) -> bool {
        let session = self.exclusive();
        let head = session.head();
        if head.dirty.count == 0 && head.to_delete.count == 0 {
            return false;
        }
        let point = SyncPoint {
            dirty_tail: head.dirty.last,
            delete_tail: head.to_delete.last,
        };
        *self.syncpoint.lock() = Some(point);
        drop(session);
        info!(
            target: "hcfs::superblock",
            event = "syncpoint_set",
            dirty_tail = point.dirty_tail.0,
            delete_tail = point.delete_tail.0
        );
        true
    }

    pub fn cancel_syncpoint(&self) {
        if self.syncpoint.lock().take().is_some() {
            info!(target: "hcfs::superblock", event = "syncpoint_cancelled");
        }
    }

    /// The pending sync point; `None` once it is reached or cancelled.
    #[must_use]
    pub fn syncpoint(&self) -> Option<SyncPoint> {
        *self.syncpoint.lock()
    }

    pub(crate) fn passed_syncpoint(&self, chain: Chain, inode: InodeNumber, prev: InodeNumber) {
        let mut guard = self.syncpoint.lock();
        let Some(point) = guard.as_mut() else {
            return;
        };
        let tail = match chain {
            Chain::Dirty => &mut point.dirty_tail,
            Chain::ToDelete => &mut point.delete_tail,
        };
        if *tail == inode {
            *tail = prev;
        }
        if point.is_reached() {
            *guard = None;
            drop(guard);
            info!(target: "hcfs::superblock", event = "syncpoint_reached");
        }
    }

    /// Live splicing met a queue topology it could not trust.
    #[must_use]
    pub fn is_suspect(&self) -> bool {
        self.suspect.load(Ordering::Acquire)
    }

    pub fn clear_suspect(&self) {
        self.suspect.store(false, Ordering::Release);
    }

    /// Ask for a recovery pass. Owners call this with a null inode when the
    /// dirty counters were lost, e.g. after an unclean shutdown.
    pub fn flag_suspect(&self, inode: InodeNumber, detail: &'static str) {
        warn!(
            target: "hcfs::superblock",
            event = "chain_topology_suspect",
            inode = inode.0,
            detail
        );
        self.suspect.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Superblock")
            .field("config", &self.config)
            .field("suspect", &self.is_suspect())
            .finish_non_exhaustive()
    }
}

/// Queue an unqueued entry on the dirty chain, and note a mutation that
/// raced an in-flight sync.
fn touch_dirty(s: &mut ExclusiveSession<'_>, entry: &mut SuperblockEntry) -> Result<()> {
    if entry.status() == QueueStatus::None {
        s.enqueue(entry, QueueStatus::Dirty)?;
    }
    if entry.in_transit {
        entry.mod_after_in_transit = true;
    }
    Ok(())
}
