#![forbid(unsafe_code)]
//! Process-wide cache accountant.
//!
//! One mutex guards every counter so a ledger transition can move bytes
//! between categories (cached, dirty, pinned) in a single step. Callers that
//! change a block's on-disk footprint call [`CacheAccountant::apply`] while
//! still holding the per-inode metadata lock that covers the status write;
//! the accountant's mutex is a leaf and never held across other locks.
//!
//! The hard limit is enforced by callers, not by `apply`: anything about to
//! grow local storage first calls [`CacheAccountant::wait_for_space`], which
//! sleeps until eviction or upload completion brings the cache back under the
//! limit.

use hcfs_error::{HcfsError, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Snapshot of the accountant's counters, in bytes except `cache_blocks`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUsage {
    /// Logical size of all file data, local or remote.
    pub system_size: i64,
    /// Bytes of block data present in the local cache.
    pub cache_size: i64,
    /// Number of blocks present in the local cache.
    pub cache_blocks: i64,
    /// Cached bytes (data and metadata) not yet acknowledged by the backend.
    pub dirty_cache_size: i64,
    /// The part of `dirty_cache_size` that belongs to unpinned inodes.
    pub unpin_dirty_size: i64,
    /// Cached bytes of pinned inodes (exempt from eviction).
    pub pinned_size: i64,
}

/// Signed change to [`CacheUsage`]. Fields left at zero are untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageDelta {
    pub system_size: i64,
    pub cache_size: i64,
    pub cache_blocks: i64,
    pub dirty_cache_size: i64,
    pub unpin_dirty_size: i64,
    pub pinned_size: i64,
}

impl UsageDelta {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    /// Dirty bytes for an inode; unpinned inodes also count toward
    /// `unpin_dirty_size`.
    #[must_use]
    pub fn dirty(bytes: i64, pinned: bool) -> Self {
        Self {
            dirty_cache_size: bytes,
            unpin_dirty_size: if pinned { 0 } else { bytes },
            ..Self::default()
        }
    }

    /// Logical file size growing (positive) or shrinking (negative).
    #[must_use]
    pub fn system(bytes: i64) -> Self {
        Self {
            system_size: bytes,
            ..Self::default()
        }
    }

    /// A block of `bytes` entering (positive) or leaving (negative) the local
    /// cache.
    #[must_use]
    pub fn cached_block(bytes: i64, pinned: bool) -> Self {
        let blocks = match bytes.signum() {
            1 => 1,
            -1 => -1,
            _ => 0,
        };
        Self {
            cache_size: bytes,
            cache_blocks: blocks,
            pinned_size: if pinned { bytes } else { 0 },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        Self {
            system_size: self.system_size + other.system_size,
            cache_size: self.cache_size + other.cache_size,
            cache_blocks: self.cache_blocks + other.cache_blocks,
            dirty_cache_size: self.dirty_cache_size + other.dirty_cache_size,
            unpin_dirty_size: self.unpin_dirty_size + other.unpin_dirty_size,
            pinned_size: self.pinned_size + other.pinned_size,
        }
    }
}

/// Cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheLimits {
    /// Local cache bytes at or above which growth blocks.
    pub hard_limit: u64,
    /// Upper bound on one sleep of [`CacheAccountant::wait_for_space`] before
    /// re-checking. Wakeups from `apply` usually come sooner.
    pub poll_interval_ms: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            hard_limit: 4 << 30,
            poll_interval_ms: 100,
        }
    }
}

impl CacheLimits {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug)]
pub struct CacheAccountant {
    usage: Mutex<CacheUsage>,
    space_freed: Condvar,
    limits: CacheLimits,
}

impl CacheAccountant {
    #[must_use]
    pub fn new(limits: CacheLimits) -> Self {
        Self::with_usage(limits, CacheUsage::default())
    }

    /// Start from previously persisted counters.
    #[must_use]
    pub fn with_usage(limits: CacheLimits, usage: CacheUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
            space_freed: Condvar::new(),
            limits,
        }
    }

    #[must_use]
    pub fn limits(&self) -> &CacheLimits {
        &self.limits
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheUsage {
        *self.usage.lock()
    }

    /// Apply a delta to all counters atomically.
    ///
    /// A counter that would go negative is clamped to zero; that only happens
    /// when bookkeeping already drifted, which recovery later corrects.
    pub fn apply(&self, delta: UsageDelta) {
        if delta.is_zero() {
            return;
        }
        let mut usage = self.usage.lock();
        usage.system_size = clamped_add(usage.system_size, delta.system_size, "system_size");
        usage.cache_size = clamped_add(usage.cache_size, delta.cache_size, "cache_size");
        usage.cache_blocks = clamped_add(usage.cache_blocks, delta.cache_blocks, "cache_blocks");
        usage.dirty_cache_size = clamped_add(
            usage.dirty_cache_size,
            delta.dirty_cache_size,
            "dirty_cache_size",
        );
        usage.unpin_dirty_size = clamped_add(
            usage.unpin_dirty_size,
            delta.unpin_dirty_size,
            "unpin_dirty_size",
        );
        usage.pinned_size = clamped_add(usage.pinned_size, delta.pinned_size, "pinned_size");
        let cache_size = usage.cache_size;
        drop(usage);

        trace!(
            target: "hcfs::cache",
            cache_delta = delta.cache_size,
            dirty_delta = delta.dirty_cache_size,
            cache_size,
            "cache_usage_apply"
        );
        if delta.cache_size < 0 {
            self.space_freed.notify_all();
        }
    }

    /// Zero the dirty counters ahead of a full dirty-chain reconstruction.
    pub fn reset_dirty(&self) {
        let mut usage = self.usage.lock();
        usage.dirty_cache_size = 0;
        usage.unpin_dirty_size = 0;
        drop(usage);
        debug!(target: "hcfs::cache", event = "cache_dirty_reset");
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.is_full_locked(&self.usage.lock())
    }

    fn is_full_locked(&self, usage: &CacheUsage) -> bool {
        u64::try_from(usage.cache_size).unwrap_or(0) >= self.limits.hard_limit
    }

    /// Block until the local cache is under the hard limit.
    pub fn wait_for_space(&self) {
        let mut usage = self.usage.lock();
        let mut waited = false;
        while self.is_full_locked(&usage) {
            if !waited {
                debug!(
                    target: "hcfs::cache",
                    event = "cache_full_wait",
                    cache_size = usage.cache_size,
                    hard_limit = self.limits.hard_limit
                );
                waited = true;
            }
            self.space_freed
                .wait_for(&mut usage, self.limits.poll_interval());
        }
        drop(usage);
    }

    /// Like [`Self::wait_for_space`], giving up after `timeout`.
    pub fn wait_for_space_for(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut usage = self.usage.lock();
        while self.is_full_locked(&usage) {
            let now = Instant::now();
            if now >= deadline {
                return Err(HcfsError::NoSpace);
            }
            let slice = (deadline - now).min(self.limits.poll_interval());
            self.space_freed.wait_for(&mut usage, slice);
        }
        drop(usage);
        Ok(())
    }
}

fn clamped_add(current: i64, delta: i64, counter: &'static str) -> i64 {
    let next = current.saturating_add(delta);
    if next < 0 {
        warn!(
            target: "hcfs::cache",
            event = "cache_counter_underflow",
            counter,
            current,
            delta
        );
        0
    } else {
        next
    }
}
