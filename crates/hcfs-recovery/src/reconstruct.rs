//! Batched rebuild of the dirty chain and the dirty-size counters.
//!
//! A run gates `[start, end]` in the head: live traffic changes only the
//! status of gated dirty entries and never links or counts them. Each batch
//! relinks the dirty entries it scans after the current chain tail and
//! commits by writing the head, which carries the new tail, the count, and
//! the advanced cursor in one record. A resumed run trusts that cursor, so
//! an entry is never linked twice.

use crate::config::RecoveryConfig;
use crate::meta::{FileMetaCache, FileMetaGuard};
use crate::progress::{Progress, ProgressStore};
use crate::report::RecoveryReport;
use hcfs_cache::{CacheUsage, UsageDelta};
use hcfs_error::{HcfsError, Result};
use hcfs_superblock::{
    ChainEnds, ChainLinks, ExclusiveSession, QueueStatus, RecoveryControl, Superblock,
    SuperblockEntry, SuperblockHead, meta_charge,
};
use hcfs_types::{InodeNumber, unix_now};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Link dirty entries and add their bytes.
    Relink,
    /// Add the bytes of entries an earlier attempt already linked.
    Recount,
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchTally {
    linked: u64,
    dirty: i64,
    unpin: i64,
}

impl BatchTally {
    fn delta(&self) -> UsageDelta {
        UsageDelta {
            dirty_cache_size: self.dirty,
            unpin_dirty_size: self.unpin,
            ..UsageDelta::default()
        }
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

type FileLocks = Vec<Option<Box<dyn FileMetaGuard>>>;

/// Rebuilds the superblock's dirty chain. At most one run is active per
/// instance.
pub struct Reconstructor {
    sb: Arc<Superblock>,
    meta: Arc<dyn FileMetaCache>,
    progress: Arc<dyn ProgressStore>,
    config: RecoveryConfig,
    running: AtomicBool,
}

impl std::fmt::Debug for Reconstructor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconstructor")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Reconstructor {
    #[must_use]
    pub fn new(
        sb: Arc<Superblock>,
        meta: Arc<dyn FileMetaCache>,
        progress: Arc<dyn ProgressStore>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            sb,
            meta,
            progress,
            config,
            running: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether the dirty bookkeeping needs a rebuild.
    ///
    /// Never while a run is active or a sync point is pending. An
    /// interrupted run always needs finishing; every other reason is
    /// throttled by `min_interval_secs` since the last completed run.
    pub fn need_recover_sb(&self) -> Result<bool> {
        if self.is_running() || self.sb.syncpoint().is_some() {
            return Ok(false);
        }
        let head = self.sb.head();
        if head.recovery.ongoing || self.progress.load()?.is_some() {
            debug!(
                target: "hcfs::recovery",
                event = "recovery_needed",
                reason = "interrupted run"
            );
            return Ok(true);
        }
        if self.throttled(&head) {
            return Ok(false);
        }
        let usage = self.sb.accountant().snapshot();
        let reason = broken_dirty_bookkeeping(&head, &usage).or_else(|| {
            self.sb
                .is_suspect()
                .then_some("live splicing found a broken link")
        });
        match reason {
            Some(reason) => {
                info!(target: "hcfs::recovery", event = "recovery_needed", reason);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn throttled(&self, head: &SuperblockHead) -> bool {
        let min = i64::try_from(self.config.min_interval_secs).unwrap_or(i64::MAX);
        let last = head.recovery.last_recovery_ts;
        min > 0 && last != 0 && unix_now().saturating_sub(last) < min
    }

    /// Run the trigger and, if it fires, a full pass.
    pub fn run_if_needed(&self) -> Result<Option<RecoveryReport>> {
        if self.need_recover_sb()? {
            self.run().map(Some)
        } else {
            Ok(None)
        }
    }

    /// One full pass: resume an interrupted run or start a new one, then
    /// process every batch up to the recorded end.
    ///
    /// A failing step aborts the pass and leaves the head cursor and the
    /// progress marker where the last committed batch put them.
    pub fn run(&self) -> Result<RecoveryReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(HcfsError::Busy(
                "superblock recovery is already running".to_owned(),
            ));
        }
        let _running = RunGuard(&self.running);
        let started = Instant::now();
        match self.run_pass() {
            Ok(mut report) => {
                report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                info!(
                    target: "hcfs::recovery",
                    event = "recovery_complete",
                    resumed = report.resumed,
                    batches = report.batches,
                    linked = report.dirty_linked,
                    num_dirty = report.num_dirty,
                    dirty_cache_size = report.dirty_cache_size,
                    elapsed_ms = report.elapsed_ms
                );
                Ok(report)
            }
            Err(err) => {
                error!(target: "hcfs::recovery", event = "recovery_failed", error = %err);
                Err(err)
            }
        }
    }

    /// Run one pass on a background thread.
    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<Result<RecoveryReport>>> {
        let handle = std::thread::Builder::new()
            .name("hcfs-sb-recovery".to_owned())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    fn run_pass(&self) -> Result<RecoveryReport> {
        if self.sb.syncpoint().is_some() {
            return Err(HcfsError::Busy("a sync point is pending".to_owned()));
        }
        let marker = self.progress.load()?;
        let mut report = self.begin(marker)?;
        let batch = self.config.batch_size.max(1);

        if report.resumed {
            let mut next = InodeNumber(self.config.min_inode.max(1));
            while next < report.start_inode {
                let count = batch.min(report.start_inode.0 - next.0);
                let tally = self.batch(Pass::Recount, next, count, report.end_inode)?;
                report.entries_recounted += count;
                report.absorb(&tally.delta());
                next = InodeNumber(next.0 + count);
            }
        }

        let end = report.end_inode;
        let mut next = report.start_inode;
        while !end.is_null() && next <= end {
            let count = batch.min(end.0 - next.0 + 1);
            let tally = self.batch(Pass::Relink, next, count, end)?;
            report.batches += 1;
            report.entries_scanned += count;
            report.dirty_linked += tally.linked;
            report.absorb(&tally.delta());
            next = InodeNumber(next.0 + count);
        }

        self.finish(&mut report)?;
        Ok(report)
    }

    /// Open the run: either pick up the committed cursor of an interrupted
    /// run, or empty the dirty chain and gate the whole index.
    fn begin(&self, marker: Option<Progress>) -> Result<RecoveryReport> {
        let mut session = self.sb.exclusive();
        let head = *session.head();

        if head.recovery.ongoing {
            let cursor = head.recovery.start;
            match marker {
                Some(m) if m.next < cursor => debug!(
                    target: "hcfs::recovery",
                    event = "progress_fast_forward",
                    marker = m.next.0,
                    cursor = cursor.0
                ),
                Some(m) if m.next > cursor => warn!(
                    target: "hcfs::recovery",
                    event = "progress_ahead_of_head",
                    marker = m.next.0,
                    cursor = cursor.0
                ),
                Some(_) => {}
                None => debug!(
                    target: "hcfs::recovery",
                    event = "progress_marker_missing",
                    cursor = cursor.0
                ),
            }
            // The prefix is recounted from entry state.
            session.accountant().reset_dirty();
            drop(session);
            self.sb.clear_suspect();
            info!(
                target: "hcfs::recovery",
                event = "recovery_resumed",
                cursor = cursor.0,
                end = head.recovery.end.0
            );
            return Ok(RecoveryReport {
                resumed: true,
                start_inode: cursor,
                end_inode: head.recovery.end,
                ..RecoveryReport::default()
            });
        }

        if marker.is_some() {
            // The previous run committed its end but crashed before
            // removing the marker.
            info!(target: "hcfs::recovery", event = "stale_progress_marker");
        }
        let start = InodeNumber(self.config.min_inode.max(1));
        let end = InodeNumber(head.num_total_inodes);
        {
            let h = session.head_mut();
            h.dirty = ChainEnds::default();
            h.recovery = RecoveryControl {
                ongoing: true,
                start,
                end,
                last_recovery_ts: head.recovery.last_recovery_ts,
            };
        }
        if let Err(err) = session.write_head() {
            *session.head_mut() = head;
            return Err(err);
        }
        session.accountant().reset_dirty();
        drop(session);
        self.sb.clear_suspect();
        self.progress.store(Progress { next: start, end })?;
        info!(
            target: "hcfs::recovery",
            event = "recovery_started",
            start = start.0,
            end = end.0,
            stale_dirty = head.dirty.count
        );
        Ok(RecoveryReport {
            resumed: false,
            start_inode: start,
            end_inode: end,
            ..RecoveryReport::default()
        })
    }

    /// Process `[first, first + count)`: read the entries under the shared
    /// lock, lock the metadata of the dirty ones, then take the exclusive
    /// lock.
    fn batch(
        &self,
        pass: Pass,
        first: InodeNumber,
        count: u64,
        end: InodeNumber,
    ) -> Result<BatchTally> {
        let files = self.lock_dirty_files(first, count)?;
        let mut session = self.sb.exclusive();
        let result = match pass {
            Pass::Recount => recount(&session, first, count, &files),
            Pass::Relink => relink(&mut session, first, count, &files).and_then(|tally| {
                self.progress.store(Progress {
                    next: InodeNumber(first.0 + count),
                    end,
                })?;
                Ok(tally)
            }),
        };
        drop(session);
        drop(files);
        if let Ok(tally) = &result {
            debug!(
                target: "hcfs::recovery",
                event = "batch_done",
                pass = ?pass,
                first = first.0,
                count,
                linked = tally.linked,
                dirty = tally.dirty
            );
        }
        result
    }

    /// Metadata locks indexed like the batch; `None` for entries that are
    /// not dirty. An entry that turns dirty before the exclusive lock is
    /// linked without file data: its new dirty bytes reach the accountant
    /// through the live write path.
    fn lock_dirty_files(&self, first: InodeNumber, count: u64) -> Result<FileLocks> {
        self.sb
            .read_entries(first, count)?
            .iter()
            .map(|entry| match entry.status() {
                QueueStatus::Dirty => self.meta.lock_regular(entry.this_index),
                _ => Ok(None),
            })
            .collect()
    }

    fn finish(&self, report: &mut RecoveryReport) -> Result<()> {
        let mut session = self.sb.exclusive();
        let before = *session.head();
        session.head_mut().recovery = RecoveryControl {
            ongoing: false,
            start: InodeNumber::NULL,
            end: InodeNumber::NULL,
            last_recovery_ts: unix_now(),
        };
        if let Err(err) = session.write_head() {
            *session.head_mut() = before;
            return Err(err);
        }
        report.num_dirty = session.head().dirty.count;
        drop(session);
        self.progress.clear()
    }
}

/// Why the head and accountant disagree about dirty inodes, if they do.
fn broken_dirty_bookkeeping(head: &SuperblockHead, usage: &CacheUsage) -> Option<&'static str> {
    let dirty = head.dirty;
    let empty = dirty.count == 0;
    if empty && (usage.dirty_cache_size != 0 || usage.unpin_dirty_size != 0) {
        return Some("dirty bytes without dirty inodes");
    }
    if empty != dirty.first.is_null() {
        return Some("dirty count disagrees with the chain head");
    }
    if empty != dirty.last.is_null() {
        return Some("dirty count disagrees with the chain tail");
    }
    None
}

/// Bytes a dirty entry contributes: rounded file data plus rounded
/// metadata, and the same again as unpinned when the inode is not pinned.
fn contribution(entry: &SuperblockEntry, file: Option<&dyn FileMetaGuard>) -> (i64, i64) {
    let data = file.map_or(0, |f| meta_charge(f.dirty_data_size()));
    let dirty = data + meta_charge(entry.dirty_meta_size);
    let unpin = if entry.pin_status.is_pinned() { 0 } else { dirty };
    (dirty, unpin)
}

fn relink(
    session: &mut ExclusiveSession<'_>,
    first: InodeNumber,
    count: u64,
    files: &FileLocks,
) -> Result<BatchTally> {
    let before = *session.head();
    let mut entries = session.read_entries(first, count)?;

    let tail = before.dirty.last;
    let mut tail_entry = match tail.non_null() {
        Some(tail) => {
            let entry = session.read_entry(tail)?;
            if entry.status() != QueueStatus::Dirty {
                return Err(HcfsError::RecoveryFailed(format!(
                    "rebuilt dirty chain ends at {tail}, which is {}",
                    entry.status()
                )));
            }
            Some(entry)
        }
        None => None,
    };

    let mut tally = BatchTally::default();
    let mut prev = tail;
    let mut prev_idx: Option<usize> = None;
    let mut first_linked = InodeNumber::NULL;
    for idx in 0..entries.len() {
        if entries[idx].status() != QueueStatus::Dirty {
            continue;
        }
        let inode = entries[idx].this_index;
        let (dirty, unpin) = contribution(&entries[idx], files.get(idx).and_then(|f| f.as_deref()));
        tally.dirty += dirty;
        tally.unpin += unpin;

        entries[idx].set_links(ChainLinks {
            prev,
            next: InodeNumber::NULL,
        })?;
        let before_this = match prev_idx {
            Some(p) => Some(&mut entries[p]),
            None => {
                first_linked = inode;
                tail_entry.as_mut()
            }
        };
        if let Some(neighbor) = before_this {
            let links = neighbor.raw_links();
            neighbor.set_links(ChainLinks {
                prev: links.prev,
                next: inode,
            })?;
        }
        prev = inode;
        prev_idx = Some(idx);
        tally.linked += 1;
    }

    if tally.linked > 0 {
        session.write_entries(&entries)?;
        if let Some(tail_entry) = &tail_entry {
            session.write_entry(tail_entry)?;
        }
    }

    let head = session.head_mut();
    if tally.linked > 0 {
        if head.dirty.first.is_null() {
            head.dirty.first = first_linked;
        }
        head.dirty.last = prev;
        head.dirty.count += tally.linked;
    }
    head.recovery.start = InodeNumber(first.0 + count);
    if let Err(err) = session.write_head() {
        *session.head_mut() = before;
        return Err(err);
    }
    session.accountant().apply(tally.delta());
    Ok(tally)
}

fn recount(
    session: &ExclusiveSession<'_>,
    first: InodeNumber,
    count: u64,
    files: &FileLocks,
) -> Result<BatchTally> {
    let entries = session.read_entries(first, count)?;
    let mut tally = BatchTally::default();
    for (idx, entry) in entries.iter().enumerate() {
        if entry.status() != QueueStatus::Dirty {
            continue;
        }
        let (dirty, unpin) = contribution(entry, files.get(idx).and_then(|f| f.as_deref()));
        tally.dirty += dirty;
        tally.unpin += unpin;
    }
    session.accountant().apply(tally.delta());
    Ok(tally)
}
