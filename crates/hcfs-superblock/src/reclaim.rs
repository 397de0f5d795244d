//! Freeing inode slots: `delete` parks an entry in the unclaimed log,
//! `reclaim` moves logged entries onto the reclaim chain in bulk, and
//! `reclaim_fullscan` rebuilds that chain from entry statuses alone.

use crate::Superblock;
use crate::layout::{ChainEnds, PinStatus, QueueStatus};
use crate::storage::UnclaimedLog;
use hcfs_error::Result;
use hcfs_types::InodeNumber;
use tracing::{debug, info, warn};

impl Superblock {
    /// Backend deletion of the inode finished: take it off every chain and
    /// log it for reclaim.
    pub fn delete(&self, inode: InodeNumber) -> Result<()> {
        self.mutate("delete", |s| {
            let mut entry = s.read_entry(inode)?;
            if matches!(
                entry.status(),
                QueueStatus::ToReclaim | QueueStatus::Reclaimed
            ) {
                debug!(target: "hcfs::superblock", event = "delete_repeat", inode = inode.0);
                return Ok(());
            }
            let was_active = entry.pin_status != PinStatus::Deleted;
            if entry.pin_status == PinStatus::Pinning {
                s.pin_dequeue(&mut entry)?;
            }
            s.dequeue(&mut entry)?;
            entry.set_status(QueueStatus::ToReclaim);
            entry.pin_status = PinStatus::Deleted;
            entry.in_transit = false;
            entry.mod_after_in_transit = false;
            entry.stat = entry.stat.cleared_keep_type();
            s.write_entry(&entry)?;
            UnclaimedLog::new(&self.storage().unclaimed).append(inode)?;

            let head = s.head_mut();
            head.num_to_reclaim += 1;
            if was_active {
                head.num_active_inodes = head.num_active_inodes.saturating_sub(1);
            }
            s.write_head()
        })
    }

    /// Drain the unclaimed log once `num_to_reclaim` reaches the configured
    /// threshold. Returns how many entries became reusable.
    ///
    /// Logged inodes are visited in descending order and each is pushed on
    /// the chain head, so the lowest number is handed out first. Entries no
    /// longer TO_BE_RECLAIMED, duplicates and out-of-range numbers are
    /// skipped.
    pub fn reclaim(&self) -> Result<u64> {
        self.mutate("reclaim", |s| {
            let pending = s.head().num_to_reclaim;
            if pending == 0 || pending < self.config().reclaim_threshold {
                return Ok(0);
            }
            let log = UnclaimedLog::new(&self.storage().unclaimed);
            let mut logged = log.read_all()?;
            logged.sort_unstable_by(|a, b| b.cmp(a));
            logged.dedup();

            let total = s.head().num_total_inodes;
            let mut reclaimed = 0_u64;
            for inode in logged {
                if inode.is_null() || inode.0 > total {
                    warn!(
                        target: "hcfs::superblock",
                        event = "unclaimed_log_bad_inode",
                        inode = inode.0,
                        total
                    );
                    continue;
                }
                let mut entry = s.read_entry(inode)?;
                if entry.status() != QueueStatus::ToReclaim {
                    continue;
                }
                entry.set_status(QueueStatus::Reclaimed);
                entry.set_reclaim_next(s.head().reclaimed.first)?;
                s.write_entry(&entry)?;
                push_reclaimed(&mut s.head_mut().reclaimed, inode);
                reclaimed += 1;
            }
            s.head_mut().num_to_reclaim = 0;
            s.write_head()?;
            log.clear()?;
            info!(
                target: "hcfs::superblock",
                event = "reclaim_done",
                pending,
                reclaimed
            );
            Ok(reclaimed)
        })
    }

    /// Rebuild the reclaim chain from every entry's status, folding any
    /// TO_BE_RECLAIMED entries in. Holds the exclusive lock for the whole
    /// scan. Returns the chain length.
    pub fn reclaim_fullscan(&self) -> Result<u64> {
        self.mutate("reclaim_fullscan", |s| {
            let total = s.head().num_total_inodes;
            let batch = self.config().scan_batch.max(1);
            let mut ends = ChainEnds::default();
            let mut hi = total;
            while hi > 0 {
                let lo = hi.saturating_sub(batch) + 1;
                let mut entries = s.read_entries(InodeNumber(lo), hi - lo + 1)?;
                let mut changed = false;
                for entry in entries.iter_mut().rev() {
                    if !matches!(
                        entry.status(),
                        QueueStatus::ToReclaim | QueueStatus::Reclaimed
                    ) {
                        continue;
                    }
                    entry.set_status(QueueStatus::Reclaimed);
                    entry.set_reclaim_next(ends.first)?;
                    push_reclaimed(&mut ends, entry.this_index);
                    changed = true;
                }
                if changed {
                    s.write_entries(&entries)?;
                }
                hi = lo - 1;
            }
            let head = s.head_mut();
            head.reclaimed = ends;
            head.num_to_reclaim = 0;
            s.write_head()?;
            UnclaimedLog::new(&self.storage().unclaimed).clear()?;
            info!(
                target: "hcfs::superblock",
                event = "reclaim_fullscan_done",
                total,
                reclaimed = ends.count
            );
            Ok(ends.count)
        })
    }
}

fn push_reclaimed(ends: &mut ChainEnds, inode: InodeNumber) {
    if ends.first.is_null() {
        ends.last = inode;
    }
    ends.first = inode;
    ends.count += 1;
}
