//! Pin state. A pinned regular file passes through PINNING while its
//! blocks are fetched; PINNING entries sit on the pin chain for the worker
//! that does the fetching.

use crate::Superblock;
use crate::layout::{PinStatus, QueueStatus, SuperblockEntry};
use crate::session::{ExclusiveSession, meta_charge};
use hcfs_cache::UsageDelta;
use hcfs_error::{HcfsError, Result};
use hcfs_types::InodeNumber;

impl Superblock {
    /// Returns whether the pin state changed.
    pub fn mark_pin(&self, inode: InodeNumber) -> Result<bool> {
        self.mutate("mark_pin", |s| {
            let mut entry = s.read_entry(inode)?;
            match entry.pin_status {
                PinStatus::Deleted => return Err(deleted(inode)),
                PinStatus::Pinning | PinStatus::Pin => return Ok(false),
                PinStatus::Unpin => {}
            }
            if entry.stat.is_regular() {
                entry.pin_status = PinStatus::Pinning;
                s.pin_enqueue(&mut entry)?;
            } else {
                entry.pin_status = PinStatus::Pin;
            }
            shift_unpin_dirty(s, &entry, -1);
            s.write_entry(&entry)?;
            s.write_head()?;
            Ok(true)
        })
    }

    /// Returns whether the pin state changed.
    pub fn mark_unpin(&self, inode: InodeNumber) -> Result<bool> {
        self.mutate("mark_unpin", |s| {
            let mut entry = s.read_entry(inode)?;
            match entry.pin_status {
                PinStatus::Deleted => return Err(deleted(inode)),
                PinStatus::Unpin => return Ok(false),
                PinStatus::Pinning => s.pin_dequeue(&mut entry)?,
                PinStatus::Pin => {}
            }
            entry.pin_status = PinStatus::Unpin;
            shift_unpin_dirty(s, &entry, 1);
            s.write_entry(&entry)?;
            s.write_head()?;
            Ok(true)
        })
    }

    /// All blocks of a PINNING file are local: PINNING → PIN.
    pub fn finish_pinning(&self, inode: InodeNumber) -> Result<bool> {
        self.mutate("finish_pinning", |s| {
            let mut entry = s.read_entry(inode)?;
            if entry.pin_status != PinStatus::Pinning {
                return Ok(false);
            }
            s.pin_dequeue(&mut entry)?;
            entry.pin_status = PinStatus::Pin;
            s.write_entry(&entry)?;
            s.write_head()?;
            Ok(true)
        })
    }
}

fn deleted(inode: InodeNumber) -> HcfsError {
    HcfsError::InvalidTransition {
        inode: inode.0,
        detail: "inode is deleted".to_owned(),
    }
}

/// A counted dirty entry's metadata bytes move in or out of the unpinned
/// share.
fn shift_unpin_dirty(s: &ExclusiveSession<'_>, entry: &SuperblockEntry, sign: i64) {
    if entry.status() != QueueStatus::Dirty || s.head().awaits_recovery(entry.this_index) {
        return;
    }
    s.accountant().apply(UsageDelta {
        unpin_dirty_size: sign * meta_charge(entry.dirty_meta_size),
        ..UsageDelta::default()
    });
}
