#![forbid(unsafe_code)]

use hcfs_block::MemoryByteDevice;
use hcfs_cache::{CacheAccountant, CacheLimits};
use hcfs_error::{HcfsError, Result};
use hcfs_ledger::{
    BlockEntry, BlockLedger, BlockStatus, BlockStore, FileBlocks, FileMeta, FileStats,
    LedgerConfig, MetaRegistry, SharedDevice,
};
use hcfs_types::{BlockNumber, InodeNumber};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

const BLOCK: u64 = 4096;
const INODE: InodeNumber = InodeNumber(7);

type FetchHook = Box<dyn Fn() + Send + Sync>;

/// Local cache stand-in: every local copy is `BLOCK` bytes.
#[derive(Default)]
struct MockStore {
    local: Mutex<HashMap<u64, u64>>,
    fetches: AtomicUsize,
    unlinks: AtomicUsize,
    fail_fetch: AtomicBool,
    /// Runs inside `fetch`, while the ledger holds no lock.
    during_fetch: Mutex<Option<FetchHook>>,
}

impl MockStore {
    fn is_local(&self, block: u64) -> bool {
        self.local.lock().contains_key(&block)
    }
}

impl BlockStore for MockStore {
    fn fetch(&self, _inode: InodeNumber, block: BlockNumber, _entry: &BlockEntry) -> Result<u64> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.during_fetch.lock().as_ref() {
            hook();
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(HcfsError::Io(std::io::Error::other("backend unreachable")));
        }
        self.local.lock().insert(block.0, BLOCK);
        Ok(BLOCK)
    }

    fn allocate_local(&self, _inode: InodeNumber, block: BlockNumber) -> Result<()> {
        self.local.lock().insert(block.0, BLOCK);
        Ok(())
    }

    fn local_size(&self, _inode: InodeNumber, block: BlockNumber) -> Result<u64> {
        Ok(self.local.lock().get(&block.0).copied().unwrap_or(0))
    }

    fn unlink_local(&self, _inode: InodeNumber, block: BlockNumber) -> Result<u64> {
        self.unlinks.fetch_add(1, Ordering::SeqCst);
        Ok(self.local.lock().remove(&block.0).unwrap_or(0))
    }
}

struct Fixture {
    store: Arc<MockStore>,
    ledger: Arc<BlockLedger>,
    meta: FileMeta,
}

fn fixture(hard_limit: u64, pinned: bool) -> Fixture {
    let store = Arc::new(MockStore::default());
    let accountant = Arc::new(CacheAccountant::new(CacheLimits {
        hard_limit,
        poll_interval_ms: 5,
    }));
    let ledger = Arc::new(BlockLedger::new(
        Arc::clone(&store) as Arc<dyn BlockStore>,
        accountant,
        LedgerConfig {
            block_size: BLOCK,
            ..LedgerConfig::default()
        },
    ));
    let dev: SharedDevice = Arc::new(MemoryByteDevice::new());
    let registry = MetaRegistry::new();
    let meta = registry.insert(FileBlocks::create(dev, INODE, pinned).expect("table"));
    Fixture {
        store,
        ledger,
        meta,
    }
}

/// Seed blocks with given statuses as if they already existed on disk.
fn seed(fx: &Fixture, statuses: &[BlockStatus]) {
    let mut table = fx.meta.lock();
    let mut stats = FileStats {
        num_blocks: statuses.len() as u64,
        ..FileStats::default()
    };
    let mut delta = hcfs_cache::UsageDelta::default();
    for (i, status) in statuses.iter().enumerate() {
        let entry = BlockEntry {
            status: *status,
            ..BlockEntry::default()
        };
        table.set_entry(BlockNumber(i as u64), &entry).expect("seed");
        if status.is_cached() {
            fx.store.local.lock().insert(i as u64, BLOCK);
            stats.num_cached_blocks += 1;
            stats.cached_size += BLOCK;
            delta = delta.plus(hcfs_cache::UsageDelta::cached_block(BLOCK as i64, false));
        }
        if status.is_dirty() {
            stats.dirty_data_size += BLOCK;
            delta = delta.plus(hcfs_cache::UsageDelta::dirty(BLOCK as i64, false));
        }
    }
    table.set_stats(stats).expect("stats");
    drop(table);
    fx.ledger.accountant().apply(delta);
}

fn status_of(fx: &Fixture, block: u64) -> BlockStatus {
    fx.meta
        .lock()
        .entry(BlockNumber(block))
        .expect("entry")
        .status
}

#[test]
fn read_of_cloud_block_passes_through_ctol_without_holding_the_lock() {
    let fx = fixture(1 << 30, false);
    seed(&fx, &[BlockStatus::Cloud]);
    let before = fx.ledger.accountant().snapshot();

    let observed = Arc::new(Mutex::new(Vec::new()));
    {
        let meta = Arc::clone(&fx.meta);
        let observed = Arc::clone(&observed);
        *fx.store.during_fetch.lock() = Some(Box::new(move || {
            let table = meta.try_lock().expect("metadata lock must be free during fetch");
            observed
                .lock()
                .push(table.entry(BlockNumber(0)).expect("entry").status);
        }));
    }

    let status = fx.ledger.read_block(&*fx.meta, BlockNumber(0)).expect("read");
    assert_eq!(status, BlockStatus::Both);
    assert_eq!(*observed.lock(), vec![BlockStatus::CtoL]);
    assert_eq!(status_of(&fx, 0), BlockStatus::Both);

    let after = fx.ledger.accountant().snapshot();
    assert_eq!(after.cache_size - before.cache_size, BLOCK as i64);
    assert_eq!(after.cache_blocks - before.cache_blocks, 1);
    assert_eq!(after.dirty_cache_size, before.dirty_cache_size);

    let stats = fx.meta.lock().stats();
    assert_eq!(stats.num_cached_blocks, 1);
    assert_eq!(stats.cached_size, BLOCK);
}

#[test]
fn read_of_local_block_does_not_fetch() {
    let fx = fixture(1 << 30, false);
    seed(&fx, &[BlockStatus::Both, BlockStatus::Ldisk, BlockStatus::None]);
    for block in 0..3 {
        fx.ledger
            .read_block(&*fx.meta, BlockNumber(block))
            .expect("read");
    }
    assert_eq!(fx.store.fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn write_to_none_allocates_dirty_local_block() {
    let fx = fixture(1 << 30, true);
    let status = fx
        .ledger
        .write_block(&*fx.meta, BlockNumber(3), BLOCK)
        .expect("write");
    assert_eq!(status, BlockStatus::Ldisk);
    assert!(fx.store.is_local(3));

    let usage = fx.ledger.accountant().snapshot();
    assert_eq!(usage.cache_size, BLOCK as i64);
    assert_eq!(usage.dirty_cache_size, BLOCK as i64);
    assert_eq!(usage.pinned_size, BLOCK as i64);
    assert_eq!(usage.unpin_dirty_size, 0);
    assert_eq!(fx.meta.lock().stats().num_blocks, 4);
}

#[test]
fn write_to_cloud_block_fetches_then_marks_dirty() {
    let fx = fixture(1 << 30, false);
    seed(&fx, &[BlockStatus::Cloud]);
    let status = fx
        .ledger
        .write_block(&*fx.meta, BlockNumber(0), BLOCK)
        .expect("write");
    assert_eq!(status, BlockStatus::Ldisk);
    assert_eq!(fx.store.fetches.load(Ordering::SeqCst), 1);

    let usage = fx.ledger.accountant().snapshot();
    assert_eq!(usage.cache_size, BLOCK as i64);
    assert_eq!(usage.dirty_cache_size, BLOCK as i64);
    assert_eq!(usage.unpin_dirty_size, BLOCK as i64);
}

#[test]
fn write_to_synced_block_diverges() {
    let fx = fixture(1 << 30, false);
    seed(&fx, &[BlockStatus::Both, BlockStatus::LtoC]);
    let dirty_before = fx.ledger.accountant().snapshot().dirty_cache_size;

    for block in 0..2 {
        assert_eq!(
            fx.ledger
                .write_block(&*fx.meta, BlockNumber(block), BLOCK)
                .expect("write"),
            BlockStatus::Ldisk
        );
    }
    // Only the BOTH block adds dirty bytes; LtoC was already dirty.
    let dirty_after = fx.ledger.accountant().snapshot().dirty_cache_size;
    assert_eq!(dirty_after - dirty_before, BLOCK as i64);
}

#[test]
fn truncate_applies_per_state_rules() {
    let fx = fixture(1 << 30, false);
    seed(
        &fx,
        &[
            BlockStatus::Ldisk,
            BlockStatus::Ldisk,
            BlockStatus::Cloud,
            BlockStatus::Both,
            BlockStatus::LtoC,
            BlockStatus::None,
        ],
    );

    let report = fx.ledger.truncate(&*fx.meta, BLOCK).expect("truncate");
    assert_eq!(status_of(&fx, 0), BlockStatus::Ldisk);
    assert_eq!(status_of(&fx, 1), BlockStatus::None);
    assert_eq!(status_of(&fx, 2), BlockStatus::ToDelete);
    assert_eq!(status_of(&fx, 3), BlockStatus::ToDelete);
    assert_eq!(status_of(&fx, 4), BlockStatus::ToDelete);
    assert_eq!(status_of(&fx, 5), BlockStatus::None);

    assert_eq!(report.unlinked, 1);
    let marked: Vec<u64> = report.to_delete.iter().map(|(b, _)| b.0).collect();
    assert_eq!(marked, vec![2, 3, 4]);
    assert_eq!(report.freed_bytes, 3 * BLOCK);

    assert!(fx.store.is_local(0));
    for block in [1, 3, 4] {
        assert!(!fx.store.is_local(block), "block {block} still local");
    }

    let usage = fx.ledger.accountant().snapshot();
    assert_eq!(usage.cache_size, BLOCK as i64);
    assert_eq!(usage.dirty_cache_size, BLOCK as i64);
    let stats = fx.meta.lock().stats();
    assert_eq!(stats.num_blocks, 1);
    assert_eq!(stats.num_cached_blocks, 1);
    assert_eq!(stats.dirty_data_size, BLOCK);
}

#[test]
fn truncate_racing_a_fetch_discards_the_download() {
    let fx = fixture(1 << 30, false);
    seed(&fx, &[BlockStatus::Cloud]);
    {
        let ledger = Arc::clone(&fx.ledger);
        let meta = Arc::clone(&fx.meta);
        *fx.store.during_fetch.lock() = Some(Box::new(move || {
            ledger.truncate(&*meta, 0).expect("concurrent truncate");
        }));
    }

    let status = fx.ledger.read_block(&*fx.meta, BlockNumber(0)).expect("read");
    assert_eq!(status, BlockStatus::ToDelete);
    assert!(!fx.store.is_local(0), "orphaned download left behind");
    assert_eq!(fx.ledger.accountant().snapshot().cache_size, 0);
    assert_eq!(fx.meta.lock().stats().num_cached_blocks, 0);
}

#[test]
fn failed_fetch_reverts_to_cloud() {
    let fx = fixture(1 << 30, false);
    seed(&fx, &[BlockStatus::Cloud]);
    fx.store.fail_fetch.store(true, Ordering::SeqCst);

    let err = fx
        .ledger
        .read_block(&*fx.meta, BlockNumber(0))
        .unwrap_err();
    assert!(matches!(err, HcfsError::Io(_)));
    assert_eq!(status_of(&fx, 0), BlockStatus::Cloud);
    assert_eq!(fx.ledger.accountant().snapshot().cache_size, 0);
}

#[test]
fn upload_ack_settles_only_the_uploaded_version() {
    let fx = fixture(1 << 30, false);
    fx.ledger
        .write_block(&*fx.meta, BlockNumber(0), BLOCK)
        .expect("write");

    let seq = fx
        .ledger
        .begin_upload(&*fx.meta, BlockNumber(0))
        .expect("begin");
    assert_eq!(status_of(&fx, 0), BlockStatus::LtoC);
    assert_eq!(
        fx.ledger
            .upload_complete(&*fx.meta, BlockNumber(0), seq, 0xA1)
            .expect("ack"),
        BlockStatus::Both
    );
    assert_eq!(fx.ledger.accountant().snapshot().dirty_cache_size, 0);
    let entry = fx.meta.lock().entry(BlockNumber(0)).expect("entry");
    assert!(entry.uploaded);
    assert_eq!(entry.object_id, 0xA1);

    // Rewritten while uploading: the stale ack must not hide the new data.
    fx.ledger
        .write_block(&*fx.meta, BlockNumber(0), BLOCK)
        .expect("rewrite");
    let seq = fx
        .ledger
        .begin_upload(&*fx.meta, BlockNumber(0))
        .expect("begin");
    fx.ledger
        .write_block(&*fx.meta, BlockNumber(0), BLOCK)
        .expect("write during upload");
    assert_eq!(
        fx.ledger
            .upload_complete(&*fx.meta, BlockNumber(0), seq, 0xA2)
            .expect("stale ack"),
        BlockStatus::Ldisk
    );
    assert_eq!(
        fx.ledger.accountant().snapshot().dirty_cache_size,
        BLOCK as i64
    );
}

#[test]
fn begin_upload_requires_ldisk() {
    let fx = fixture(1 << 30, false);
    seed(&fx, &[BlockStatus::Cloud]);
    let err = fx
        .ledger
        .begin_upload(&*fx.meta, BlockNumber(0))
        .unwrap_err();
    assert!(matches!(err, HcfsError::InvalidTransition { inode: 7, .. }));
    assert_eq!(err.to_neg_errno(), -22);
}

#[test]
fn page_out_frees_space_for_a_blocked_writer() {
    let fx = fixture(BLOCK, false);
    seed(&fx, &[BlockStatus::Both]);
    assert!(fx.ledger.accountant().is_full());

    let evicted = Arc::new(AtomicBool::new(false));
    let writer = {
        let ledger = Arc::clone(&fx.ledger);
        let meta = Arc::clone(&fx.meta);
        let evicted = Arc::clone(&evicted);
        thread::spawn(move || {
            let status = ledger
                .write_block(&*meta, BlockNumber(1), BLOCK)
                .expect("write");
            (status, evicted.load(Ordering::SeqCst))
        })
    };

    thread::sleep(Duration::from_millis(40));
    evicted.store(true, Ordering::SeqCst);
    let freed = fx
        .ledger
        .page_out(&*fx.meta, BlockNumber(0))
        .expect("page out");
    assert_eq!(freed, BLOCK);

    let (status, saw_eviction) = writer.join().expect("writer");
    assert_eq!(status, BlockStatus::Ldisk);
    assert!(saw_eviction, "writer grew the cache past the hard limit");
    assert_eq!(status_of(&fx, 0), BlockStatus::Cloud);
    let entry = fx.meta.lock().entry(BlockNumber(0)).expect("entry");
    assert_eq!(entry.paged_out_count, 1);
}

#[test]
fn pinned_blocks_are_not_paged_out() {
    let fx = fixture(1 << 30, true);
    seed(&fx, &[BlockStatus::Both]);
    assert!(matches!(
        fx.ledger.page_out(&*fx.meta, BlockNumber(0)),
        Err(HcfsError::InvalidTransition { .. })
    ));
    assert_eq!(status_of(&fx, 0), BlockStatus::Both);
}

#[test]
fn delete_completion_clears_the_entry() {
    let fx = fixture(1 << 30, false);
    seed(&fx, &[BlockStatus::Cloud]);
    fx.ledger.truncate(&*fx.meta, 0).expect("truncate");
    fx.ledger
        .delete_complete(&*fx.meta, BlockNumber(0))
        .expect("delete done");
    assert_eq!(
        fx.meta.lock().entry(BlockNumber(0)).expect("entry"),
        BlockEntry::default()
    );
    assert!(
        fx.ledger
            .delete_complete(&*fx.meta, BlockNumber(0))
            .is_err()
    );
}

#[test]
fn logical_size_follows_extend_and_truncate() {
    let fx = fixture(1 << 30, false);
    for block in 0..2 {
        fx.ledger
            .write_block(&*fx.meta, BlockNumber(block), BLOCK)
            .expect("write");
        fx.ledger
            .extend(&*fx.meta, (block + 1) * BLOCK)
            .expect("extend");
    }
    // Rewriting inside the file does not grow it.
    assert_eq!(fx.ledger.extend(&*fx.meta, 100).expect("extend"), 2 * BLOCK);
    assert_eq!(fx.ledger.accountant().snapshot().system_size, 2 * BLOCK as i64);
    assert_eq!(fx.meta.lock().stats().file_size, 2 * BLOCK);

    fx.ledger.truncate(&*fx.meta, 0).expect("shrink");
    assert_eq!(fx.ledger.accountant().snapshot().system_size, 0);

    fx.ledger.truncate(&*fx.meta, 3 * BLOCK).expect("grow");
    let usage = fx.ledger.accountant().snapshot();
    assert_eq!(usage.system_size, 3 * BLOCK as i64);
    assert_eq!(usage.cache_size, 0);
    assert_eq!(fx.meta.lock().stats().file_size, 3 * BLOCK);
}

#[derive(Debug, Clone)]
enum Op {
    Read(u64),
    Write(u64),
    Truncate(u64),
    BeginUpload(u64),
    Ack(u64),
    PageOut(u64),
    DeleteDone(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0_u64..6).prop_map(Op::Read),
        (0_u64..6).prop_map(Op::Write),
        (0_u64..7).prop_map(Op::Truncate),
        (0_u64..6).prop_map(Op::BeginUpload),
        (0_u64..6).prop_map(Op::Ack),
        (0_u64..6).prop_map(Op::PageOut),
        (0_u64..6).prop_map(Op::DeleteDone),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn counters_always_match_block_states(ops in proptest::collection::vec(op(), 1..40)) {
        let fx = fixture(1 << 30, false);
        seed(&fx, &[BlockStatus::Cloud, BlockStatus::Cloud, BlockStatus::Both]);

        for op in ops {
            let res = match op {
                Op::Read(b) => fx.ledger.read_block(&*fx.meta, BlockNumber(b)).map(|_| ()),
                Op::Write(b) => fx.ledger.write_block(&*fx.meta, BlockNumber(b), BLOCK).map(|_| ()),
                Op::Truncate(blocks) => fx.ledger.truncate(&*fx.meta, blocks * BLOCK).map(|_| ()),
                Op::BeginUpload(b) => fx.ledger.begin_upload(&*fx.meta, BlockNumber(b)).map(|_| ()),
                Op::Ack(b) => {
                    let seq = fx.meta.lock().entry(BlockNumber(b)).expect("entry").seq_num;
                    fx.ledger.upload_complete(&*fx.meta, BlockNumber(b), seq, 1).map(|_| ())
                }
                Op::PageOut(b) => fx.ledger.page_out(&*fx.meta, BlockNumber(b)).map(|_| ()),
                Op::DeleteDone(b) => fx.ledger.delete_complete(&*fx.meta, BlockNumber(b)),
            };
            if let Err(err) = res {
                prop_assert!(matches!(err, HcfsError::InvalidTransition { .. }), "{err}");
            }
        }

        let mut cached = 0_i64;
        let mut dirty = 0_i64;
        for b in 0..8 {
            let status = status_of(&fx, b);
            if status.is_cached() {
                cached += 1;
                prop_assert!(fx.store.is_local(b), "block {} cached but not local", b);
            }
            if status.is_dirty() {
                dirty += 1;
            }
        }
        let usage = fx.ledger.accountant().snapshot();
        prop_assert_eq!(usage.cache_blocks, cached);
        prop_assert_eq!(usage.cache_size, cached * BLOCK as i64);
        prop_assert_eq!(usage.dirty_cache_size, dirty * BLOCK as i64);

        let stats = fx.meta.lock().stats();
        prop_assert_eq!(stats.num_cached_blocks as i64, cached);
        prop_assert_eq!(stats.dirty_data_size as i64, dirty * BLOCK as i64);
    }
}
