#![forbid(unsafe_code)]
//! Superblock index: one fixed-size entry per inode plus a head record of
//! counters and list ends, kept in a flat file.
//!
//! Entries are threaded onto work queues by inode-number links:
//!
//! - the dirty chain (doubly linked), consumed by sync workers;
//! - the to-delete chain (doubly linked), consumed by delete workers;
//! - the reclaim chain (singly linked), consumed by allocation;
//! - the pin chain (doubly linked through separate link fields), for
//!   PINNING files.
//!
//! TO_BE_RECLAIMED entries are on no chain; they are listed in the
//! append-only unclaimed log until [`Superblock::reclaim`] drains it.

mod inspect;
pub mod layout;
pub mod lock;
mod pin;
mod reclaim;
mod session;
pub mod storage;
mod superblock;

pub use inspect::{ChainReport, ChainWalk};
pub use layout::{
    Chain, ChainEnds, ChainLinks, ENTRY_SIZE, HEAD_SIZE, PinStatus, QueueStatus, RecoveryControl,
    SuperblockEntry, SuperblockHead, entry_offset,
};
pub use session::{ExclusiveSession, meta_charge};
pub use storage::SuperblockStorage;
pub use superblock::{Superblock, SuperblockConfig, SyncPoint};

#[cfg(test)]
mod tests {
    use super::*;
    use hcfs_cache::{CacheAccountant, CacheLimits};
    use hcfs_error::HcfsError;
    use hcfs_types::{InodeNumber, InodeStat, S_IFDIR, S_IFREG};
    use std::sync::Arc;

    fn superblock(reclaim_threshold: u64) -> Superblock {
        let config = SuperblockConfig {
            reclaim_threshold,
            scan_batch: 3,
        };
        Superblock::in_memory(config, Arc::new(CacheAccountant::new(CacheLimits::default())))
            .expect("open in-memory superblock")
    }

    fn file() -> InodeStat {
        InodeStat::with_mode(S_IFREG | 0o644)
    }

    fn ino(n: u64) -> InodeNumber {
        InodeNumber(n)
    }

    fn assert_consistent(sb: &Superblock) -> ChainReport {
        let report = sb.verify_chains().expect("verify");
        assert!(report.is_consistent(), "{report:#?}");
        report
    }

    #[test]
    fn allocation_extends_the_array() {
        let sb = superblock(1000);
        for expected in 1..=5 {
            assert_eq!(sb.allocate_inode(file(), false).expect("alloc"), ino(expected));
        }
        let head = sb.head();
        assert_eq!(head.num_total_inodes, 5);
        assert_eq!(head.num_active_inodes, 5);
        assert_eq!(head.dirty.count, 0, "allocation must not enqueue");
        let entry = sb.read_entry(ino(3)).expect("read");
        assert_eq!(entry.stat.ino, 3);
        assert_eq!(entry.status(), QueueStatus::None);
        assert_eq!(entry.generation.0, 1);
        assert_eq!(entry.pin_status, PinStatus::Unpin);
    }

    #[test]
    fn read_entry_rejects_out_of_range() {
        let sb = superblock(1000);
        sb.allocate_inode(file(), false).expect("alloc");
        assert!(matches!(sb.read_entry(ino(0)), Err(HcfsError::InvalidInode(0))));
        assert!(matches!(sb.read_entry(ino(2)), Err(HcfsError::InvalidInode(2))));
    }

    #[test]
    fn write_then_read_returns_every_field() {
        let sb = superblock(1000);
        for _ in 0..3 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        let mut entry = sb.read_entry(ino(2)).expect("read");
        entry.set_status(QueueStatus::ToDelete);
        entry
            .set_links(ChainLinks {
                prev: ino(1),
                next: ino(3),
            })
            .expect("links");
        entry.pin_status = PinStatus::Pinning;
        entry.in_transit = true;
        entry.mod_after_in_transit = true;
        entry.pin_prev = ino(3);
        entry.dirty_meta_size = 777;
        entry.last_sync_time = -5;
        entry.stat.size = 1 << 40;
        sb.write_entry(ino(2), &entry).expect("write");
        assert_eq!(sb.read_entry(ino(2)).expect("read"), entry);
        assert!(sb.write_entry(ino(3), &entry).is_err());
    }

    #[test]
    fn mark_dirty_twice_queues_once() {
        let sb = superblock(1000);
        for _ in 0..5 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        sb.mark_dirty(ino(3)).expect("dirty");
        sb.mark_dirty(ino(3)).expect("dirty again");
        let head = sb.head();
        assert_eq!(head.dirty.count, 1);
        assert_eq!(head.dirty.first, ino(3));
        assert_eq!(head.dirty.last, ino(3));
        assert_consistent(&sb);
    }

    #[test]
    fn dirty_chain_keeps_insertion_order_and_splices() {
        let sb = superblock(1000);
        for _ in 0..5 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        for n in [4, 1, 5, 2] {
            sb.mark_dirty(ino(n)).expect("dirty");
        }
        let report = assert_consistent(&sb);
        assert_eq!(report.dirty.members, vec![ino(4), ino(1), ino(5), ino(2)]);

        // middle, head, tail
        sb.begin_transit(ino(1)).expect("transit");
        sb.end_transit(ino(1), true).expect("synced");
        sb.begin_transit(ino(4)).expect("transit");
        sb.end_transit(ino(4), true).expect("synced");
        sb.begin_transit(ino(2)).expect("transit");
        sb.end_transit(ino(2), true).expect("synced");
        let report = assert_consistent(&sb);
        assert_eq!(report.dirty.members, vec![ino(5)]);
        assert!(sb.read_entry(ino(1)).expect("read").last_sync_time > 0);
    }

    #[test]
    fn modification_during_transit_keeps_entry_queued() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        sb.update_stat(a, InodeStat { size: 10, ..file() }).expect("stat");
        sb.begin_transit(a).expect("transit");
        sb.update_stat(a, InodeStat { size: 20, ..file() }).expect("stat");
        let entry = sb.read_entry(a).expect("read");
        assert!(entry.mod_after_in_transit);
        assert_eq!(entry.stat.size, 20);
        assert_eq!(entry.stat.ino, a.0);

        sb.end_transit(a, true).expect("end");
        let entry = sb.read_entry(a).expect("read");
        assert_eq!(entry.status(), QueueStatus::Dirty);
        assert!(!entry.in_transit);
        assert!(!entry.mod_after_in_transit);
        assert_eq!(sb.head().dirty.count, 1);
    }

    #[test]
    fn incomplete_transit_keeps_entry_queued() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        sb.mark_dirty(a).expect("dirty");
        sb.begin_transit(a).expect("transit");
        sb.end_transit(a, false).expect("end");
        assert_eq!(sb.read_entry(a).expect("read").status(), QueueStatus::Dirty);
        assert_eq!(sb.read_entry(a).expect("read").last_sync_time, 0);
    }

    #[test]
    fn update_stat_local_does_not_queue() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        sb.update_stat_local(a, InodeStat { size: 99, ..file() })
            .expect("stat");
        assert_eq!(sb.read_entry(a).expect("read").stat.size, 99);
        assert_eq!(sb.head().dirty.count, 0);
    }

    #[test]
    fn dirty_meta_size_follows_chain_membership() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        sb.set_dirty_meta_size(a, 100).expect("meta");
        assert_eq!(sb.accountant().snapshot().dirty_cache_size, 0);

        sb.mark_dirty(a).expect("dirty");
        assert_eq!(sb.accountant().snapshot().dirty_cache_size, 4096);
        sb.set_dirty_meta_size(a, 5000).expect("meta");
        let usage = sb.accountant().snapshot();
        assert_eq!(usage.dirty_cache_size, 8192);
        assert_eq!(usage.unpin_dirty_size, 8192);

        sb.begin_transit(a).expect("transit");
        sb.end_transit(a, true).expect("synced");
        let usage = sb.accountant().snapshot();
        assert_eq!(usage.dirty_cache_size, 0);
        assert_eq!(usage.unpin_dirty_size, 0);
        assert_eq!(sb.read_entry(a).expect("read").dirty_meta_size, 0);
    }

    #[test]
    fn to_delete_moves_between_chains() {
        let sb = superblock(1000);
        for _ in 0..3 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        sb.update_stat(ino(2), InodeStat { size: 55, uid: 7, ..file() })
            .expect("stat");
        sb.to_delete(ino(2)).expect("to_delete");
        sb.to_delete(ino(2)).expect("to_delete is idempotent");

        let head = sb.head();
        assert_eq!(head.dirty.count, 0);
        assert_eq!(head.to_delete.count, 1);
        assert_eq!(head.num_active_inodes, 2);
        let entry = sb.read_entry(ino(2)).expect("read");
        assert_eq!(entry.status(), QueueStatus::ToDelete);
        assert_eq!(entry.pin_status, PinStatus::Deleted);
        assert_eq!(entry.stat, InodeStat::with_mode(S_IFREG).cleared_keep_type());
        assert_consistent(&sb);

        // Deleted entries ignore further mutation.
        sb.mark_dirty(ino(2)).expect("mark_dirty on deleted");
        assert_eq!(sb.head().dirty.count, 0);
    }

    #[test]
    fn deferred_delete_enqueues_later() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        sb.mark_dirty(a).expect("dirty");
        sb.to_delete_deferred(a).expect("deferred");
        let head = sb.head();
        assert_eq!(head.dirty.count, 0);
        assert_eq!(head.to_delete.count, 0);
        assert_eq!(head.num_active_inodes, 0);

        sb.enqueue_delete(a).expect("enqueue");
        assert_eq!(sb.head().to_delete.count, 1);
        let err = sb.enqueue_delete(a).unwrap_err();
        assert!(matches!(err, HcfsError::InvalidTransition { .. }));
        assert_consistent(&sb);
    }

    #[test]
    fn enqueue_delete_refuses_live_inode() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        assert!(sb.enqueue_delete(a).is_err());
    }

    #[test]
    fn delete_then_reclaim_reuses_slot() {
        let sb = superblock(1);
        for _ in 0..5 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        sb.to_delete(ino(3)).expect("to_delete");
        sb.delete(ino(3)).expect("delete");
        sb.delete(ino(3)).expect("delete is idempotent");
        assert_eq!(sb.head().num_to_reclaim, 1);
        assert_eq!(
            sb.read_entry(ino(3)).expect("read").status(),
            QueueStatus::ToReclaim
        );

        assert_eq!(sb.reclaim().expect("reclaim"), 1);
        let entry = sb.read_entry(ino(3)).expect("read");
        assert_eq!(entry.status(), QueueStatus::Reclaimed);
        assert_eq!(entry.reclaim_next(), Some(InodeNumber::NULL));
        let head = sb.head();
        assert_eq!(head.num_to_reclaim, 0);
        assert_eq!(head.reclaimed.first, ino(3));
        assert_consistent(&sb);

        let reused = sb.allocate_inode(file(), true).expect("alloc");
        assert_eq!(reused, ino(3));
        let entry = sb.read_entry(reused).expect("read");
        assert_eq!(entry.generation.0, 2);
        assert_eq!(entry.pin_status, PinStatus::Pin);
        let head = sb.head();
        assert_eq!(head.num_total_inodes, 5);
        assert_eq!(head.num_active_inodes, 5);
        assert_eq!(head.reclaimed.count, 0);
        assert_eq!(sb.allocate_inode(file(), false).expect("alloc"), ino(6));
    }

    #[test]
    fn reclaim_waits_for_threshold_and_hands_out_lowest_first() {
        let sb = superblock(3);
        for _ in 0..6 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        for n in [5, 2] {
            sb.to_delete(ino(n)).expect("to_delete");
            sb.delete(ino(n)).expect("delete");
        }
        assert_eq!(sb.reclaim().expect("below threshold"), 0);
        sb.delete(ino(4)).expect("delete live inode");
        assert_eq!(sb.head().num_active_inodes, 3);
        assert_eq!(sb.reclaim().expect("reclaim"), 3);

        let report = assert_consistent(&sb);
        assert_eq!(report.reclaimed.members, vec![ino(2), ino(4), ino(5)]);
        assert_eq!(sb.allocate_inode(file(), false).expect("alloc"), ino(2));
        assert_eq!(sb.allocate_inode(file(), false).expect("alloc"), ino(4));
    }

    #[test]
    fn reclaim_skips_entries_that_left_to_reclaim() {
        let sb = superblock(1);
        for _ in 0..3 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        sb.delete(ino(1)).expect("delete");
        sb.delete(ino(2)).expect("delete");
        // Simulate a stale log record for an entry that was rewritten.
        let mut entry = sb.read_entry(ino(2)).expect("read");
        entry.set_status(QueueStatus::None);
        sb.write_entry(ino(2), &entry).expect("write");

        assert_eq!(sb.reclaim().expect("reclaim"), 1);
        assert_eq!(sb.head().reclaimed.first, ino(1));
    }

    #[test]
    fn fullscan_recovers_a_lost_unclaimed_log() {
        let sb = superblock(1);
        for _ in 0..7 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        for n in [6, 3, 1] {
            sb.delete(ino(n)).expect("delete");
        }
        sb.storage().unclaimed.set_len(0).expect("lose the log");
        assert_eq!(sb.reclaim().expect("reclaim"), 0);

        assert_eq!(sb.reclaim_fullscan().expect("fullscan"), 3);
        let report = assert_consistent(&sb);
        assert_eq!(report.reclaimed.members, vec![ino(1), ino(3), ino(6)]);
        assert_eq!(sb.head().reclaimed.last, ino(6));
        assert_eq!(sb.allocate_inode(file(), false).expect("alloc"), ino(1));
    }

    #[test]
    fn pin_chain_tracks_pinning_files() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        let b = sb.allocate_inode(file(), false).expect("alloc");
        let dir = sb
            .allocate_inode(InodeStat::with_mode(S_IFDIR | 0o755), false)
            .expect("alloc");

        assert!(sb.mark_pin(a).expect("pin"));
        assert!(sb.mark_pin(b).expect("pin"));
        assert!(!sb.mark_pin(b).expect("pin again"));
        assert!(sb.mark_pin(dir).expect("pin dir"));
        assert_eq!(sb.read_entry(dir).expect("read").pin_status, PinStatus::Pin);

        let report = assert_consistent(&sb);
        assert_eq!(report.pinning.members, vec![a, b]);

        assert!(sb.finish_pinning(a).expect("finish"));
        assert!(!sb.finish_pinning(a).expect("finish again"));
        assert!(sb.mark_unpin(b).expect("unpin"));
        let report = assert_consistent(&sb);
        assert!(report.pinning.members.is_empty());
        assert_eq!(sb.read_entry(a).expect("read").pin_status, PinStatus::Pin);
        assert_eq!(sb.read_entry(b).expect("read").pin_status, PinStatus::Unpin);
    }

    #[test]
    fn deleting_a_pinning_file_leaves_the_pin_chain() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        let b = sb.allocate_inode(file(), false).expect("alloc");
        sb.mark_pin(a).expect("pin");
        sb.mark_pin(b).expect("pin");
        sb.to_delete(a).expect("to_delete");
        let report = assert_consistent(&sb);
        assert_eq!(report.pinning.members, vec![b]);
        assert!(sb.mark_pin(a).is_err());
    }

    #[test]
    fn syncpoint_moves_back_as_entries_leave() {
        let sb = superblock(1000);
        for _ in 0..3 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        assert!(!sb.set_syncpoint(), "nothing queued");
        for n in 1..=3 {
            sb.mark_dirty(ino(n)).expect("dirty");
        }
        assert!(sb.set_syncpoint());
        assert_eq!(
            sb.syncpoint(),
            Some(SyncPoint {
                dirty_tail: ino(3),
                delete_tail: InodeNumber::NULL,
            })
        );

        sb.begin_transit(ino(3)).expect("transit");
        sb.end_transit(ino(3), true).expect("synced");
        assert_eq!(sb.syncpoint().map(|p| p.dirty_tail), Some(ino(2)));

        // Modified during transit: re-queued behind the point.
        sb.begin_transit(ino(1)).expect("transit");
        sb.mark_dirty(ino(1)).expect("dirty");
        sb.end_transit(ino(1), true).expect("end");
        let report = assert_consistent(&sb);
        assert_eq!(report.dirty.members, vec![ino(2), ino(1)]);

        sb.begin_transit(ino(2)).expect("transit");
        sb.end_transit(ino(2), true).expect("synced");
        assert_eq!(sb.syncpoint(), None, "point reached");
    }

    #[test]
    fn cancel_syncpoint_clears_it() {
        let sb = superblock(1000);
        let a = sb.allocate_inode(file(), false).expect("alloc");
        sb.mark_dirty(a).expect("dirty");
        assert!(sb.set_syncpoint());
        sb.cancel_syncpoint();
        assert_eq!(sb.syncpoint(), None);
    }

    #[test]
    fn out_of_range_link_is_worked_around_and_flagged() {
        let sb = superblock(1000);
        for _ in 0..3 {
            sb.allocate_inode(file(), false).expect("alloc");
        }
        for n in 1..=3 {
            sb.mark_dirty(ino(n)).expect("dirty");
        }
        let mut entry = sb.read_entry(ino(2)).expect("read");
        entry
            .set_links(ChainLinks {
                prev: ino(1),
                next: ino(99),
            })
            .expect("links");
        sb.write_entry(ino(2), &entry).expect("corrupt");
        assert!(!sb.is_suspect());

        sb.begin_transit(ino(2)).expect("transit");
        sb.end_transit(ino(2), true).expect("dequeue survives bad link");
        assert!(sb.is_suspect());
        assert_eq!(
            sb.read_entry(ino(2)).expect("read").status(),
            QueueStatus::None
        );
        assert_eq!(sb.head().dirty.count, 2);
    }

    #[test]
    fn file_backed_superblock_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let accountant = Arc::new(CacheAccountant::new(CacheLimits::default()));
        {
            let storage = SuperblockStorage::open_dir(dir.path()).expect("storage");
            let sb = Superblock::open(storage, SuperblockConfig::default(), Arc::clone(&accountant))
                .expect("open");
            for _ in 0..4 {
                sb.allocate_inode(file(), false).expect("alloc");
            }
            sb.mark_dirty(ino(2)).expect("dirty");
            sb.mark_dirty(ino(4)).expect("dirty");
            sb.flush().expect("flush");
        }
        let storage = SuperblockStorage::open_dir(dir.path()).expect("storage");
        let sb = Superblock::open(storage, SuperblockConfig::default(), accountant)
            .expect("reopen");
        let report = assert_consistent(&sb);
        assert_eq!(report.dirty.members, vec![ino(2), ino(4)]);
        assert_eq!(sb.head().num_total_inodes, 4);
    }

    #[test]
    fn two_owners_of_one_directory_cannot_both_allocate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let accountant = Arc::new(CacheAccountant::new(CacheLimits::default()));
        let storage = SuperblockStorage::open_dir(dir.path()).expect("storage");
        let a = Superblock::open(storage, SuperblockConfig::default(), Arc::clone(&accountant))
            .expect("open");
        assert_eq!(a.allocate_inode(file(), false).expect("alloc"), ino(1));

        let err = SuperblockStorage::open_dir(dir.path()).expect_err("second owner");
        assert!(matches!(err, HcfsError::Busy(_)), "{err}");

        drop(a);
        let storage = SuperblockStorage::open_dir(dir.path()).expect("storage");
        let b = Superblock::open(storage, SuperblockConfig::default(), accountant).expect("open");
        assert_eq!(b.allocate_inode(file(), false).expect("alloc"), ino(2));
    }

    #[test]
    fn truncated_superblock_file_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let accountant = Arc::new(CacheAccountant::new(CacheLimits::default()));
        {
            let storage = SuperblockStorage::open_dir(dir.path()).expect("storage");
            let sb = Superblock::open(storage, SuperblockConfig::default(), Arc::clone(&accountant))
                .expect("open");
            sb.allocate_inode(file(), false).expect("alloc");
            sb.allocate_inode(file(), false).expect("alloc");
        }
        let storage = SuperblockStorage::open_dir(dir.path()).expect("storage");
        let len = storage.index.len_bytes().expect("len");
        storage.index.set_len(len - 10).expect("truncate");
        let err = Superblock::open(storage, SuperblockConfig::default(), accountant).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.to_neg_errno(), -5);
    }
}
