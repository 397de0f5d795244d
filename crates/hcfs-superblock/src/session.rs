//! Exclusive access to the superblock: entry I/O plus the chain splice
//! primitives.
//!
//! Every link read from disk is validated against `num_total_inodes`
//! before it is followed. A link that fails validation, or a neighbor that
//! does not point back, is treated as absent: the splice goes ahead on what
//! is left, and the index is flagged suspect so the recovery trigger fires.

use crate::Superblock;
use crate::layout::{
    Chain, ChainEnds, ChainLinks, ENTRY_SIZE, HEAD_SIZE, PinStatus, QueueStatus, SuperblockEntry,
    SuperblockHead, entry_offset,
};
use crate::lock::ExclusiveGuard;
use hcfs_block::SharedDevice;
use hcfs_cache::{CacheAccountant, UsageDelta};
use hcfs_error::{HcfsError, Result};
use hcfs_types::{InodeNumber, round_to_storage_block};
use parking_lot::MutexGuard;
use std::sync::Arc;

/// The superblock with the exclusive lock held.
///
/// Mutations of the head happen in memory; [`Self::write_head`] persists
/// them. Dropping the session releases the head, then the lock.
pub struct ExclusiveSession<'a> {
    sb: &'a Superblock,
    head: MutexGuard<'a, SuperblockHead>,
    _lock: ExclusiveGuard<'a>,
}

impl<'a> ExclusiveSession<'a> {
    pub(crate) fn new(
        sb: &'a Superblock,
        head: MutexGuard<'a, SuperblockHead>,
        lock: ExclusiveGuard<'a>,
    ) -> Self {
        Self {
            sb,
            head,
            _lock: lock,
        }
    }

    #[must_use]
    pub fn head(&self) -> &SuperblockHead {
        &self.head
    }

    pub fn head_mut(&mut self) -> &mut SuperblockHead {
        &mut self.head
    }

    #[must_use]
    pub fn accountant(&self) -> &Arc<CacheAccountant> {
        self.sb.accountant()
    }

    pub fn read_entry(&self, inode: InodeNumber) -> Result<SuperblockEntry> {
        read_entry_at(self.sb.index(), inode, self.head.num_total_inodes)
    }

    pub fn write_entry(&self, entry: &SuperblockEntry) -> Result<()> {
        write_entries_at(
            self.sb.index(),
            std::slice::from_ref(entry),
            self.head.num_total_inodes,
        )
    }

    /// `count` consecutive entries starting at `first`, in one read.
    pub fn read_entries(&self, first: InodeNumber, count: u64) -> Result<Vec<SuperblockEntry>> {
        read_entries_at(self.sb.index(), first, count, self.head.num_total_inodes)
    }

    /// Write consecutive entries (ascending, no gaps) in one write.
    pub fn write_entries(&self, entries: &[SuperblockEntry]) -> Result<()> {
        write_entries_at(self.sb.index(), entries, self.head.num_total_inodes)
    }

    pub fn write_head(&self) -> Result<()> {
        write_head_at(self.sb.index(), &self.head)
    }

    /// Put `entry` on the queue named by `to`, leaving whatever queue it is
    /// on first. Chain statuses append at the tail; other statuses only
    /// change the status field. The caller writes `entry` and the head.
    pub fn enqueue(&mut self, entry: &mut SuperblockEntry, to: QueueStatus) -> Result<()> {
        let inode = entry.this_index;
        if entry.status() == to {
            return Ok(());
        }
        if entry.status() != QueueStatus::None {
            self.dequeue(entry)?;
        }
        entry.set_status(to);
        let Some(chain) = to.chain() else {
            return Ok(());
        };
        if chain == Chain::Dirty && self.head.awaits_recovery(inode) {
            return Ok(());
        }

        let ends = *self.head.chain(chain);
        let mut prev = InodeNumber::NULL;
        if let Some(tail) = self.resolve(ends.last, inode, "chain tail") {
            let mut tail_entry = self.read_entry(tail)?;
            match tail_entry.links() {
                Some(links)
                    if tail_entry.status() == to && self.visible(chain, links.next).is_null() =>
                {
                    tail_entry.set_links(ChainLinks {
                        prev: links.prev,
                        next: inode,
                    })?;
                    self.write_entry(&tail_entry)?;
                    prev = tail;
                }
                _ => self.sb.flag_suspect(tail, "recorded chain tail is not a tail"),
            }
        } else if !ends.first.is_null() {
            self.sb.flag_suspect(inode, "chain has a head but no tail");
        }

        entry.set_links(ChainLinks {
            prev,
            next: InodeNumber::NULL,
        })?;
        let ends = self.head.chain_mut(chain);
        if prev.is_null() {
            ends.first = inode;
        }
        ends.last = inode;
        ends.count += 1;
        if chain == Chain::Dirty {
            self.sb.accountant().apply(UsageDelta::dirty(
                meta_charge(entry.dirty_meta_size),
                entry.pin_status.is_pinned(),
            ));
        }
        Ok(())
    }

    /// Take `entry` off its chain, repairing both neighbors' links, and set
    /// its status to NONE. Leaving the dirty chain releases the entry's
    /// metadata-dirty bytes.
    pub fn dequeue(&mut self, entry: &mut SuperblockEntry) -> Result<()> {
        let inode = entry.this_index;
        let status = entry.status();
        let chain = match status {
            QueueStatus::None => return Ok(()),
            QueueStatus::ToReclaim | QueueStatus::Reclaimed => {
                return Err(HcfsError::InvalidTransition {
                    inode: inode.0,
                    detail: format!("cannot dequeue a {status} entry"),
                });
            }
            QueueStatus::Dirty => Chain::Dirty,
            QueueStatus::ToDelete => Chain::ToDelete,
        };
        if chain == Chain::Dirty && self.head.awaits_recovery(inode) {
            entry.dirty_meta_size = 0;
            entry.set_status(QueueStatus::None);
            return Ok(());
        }

        let links = entry.raw_links();
        let prev = self.resolve(links.prev, inode, "prev link");
        let next = self.resolve(self.visible(chain, links.next), inode, "next link");
        let new_prev = prev.unwrap_or(InodeNumber::NULL);
        let new_next = next.unwrap_or(InodeNumber::NULL);

        if let Some(prev) = prev {
            let mut neighbor = self.read_entry(prev)?;
            match neighbor.links() {
                Some(l) if neighbor.status() == status && l.next == inode => {
                    neighbor.set_links(ChainLinks {
                        prev: l.prev,
                        next: new_next,
                    })?;
                    self.write_entry(&neighbor)?;
                }
                _ => self.sb.flag_suspect(prev, "prev neighbor does not link forward"),
            }
        } else if self.head.chain(chain).first == inode {
            self.head.chain_mut(chain).first = new_next;
        } else {
            self.sb.flag_suspect(inode, "entry without prev is not the chain head");
        }

        if let Some(next) = next {
            let mut neighbor = self.read_entry(next)?;
            match neighbor.links() {
                Some(l) if neighbor.status() == status && l.prev == inode => {
                    neighbor.set_links(ChainLinks {
                        prev: new_prev,
                        next: l.next,
                    })?;
                    self.write_entry(&neighbor)?;
                }
                _ => self.sb.flag_suspect(next, "next neighbor does not link back"),
            }
        } else if self.head.chain(chain).last == inode {
            self.head.chain_mut(chain).last = new_prev;
        } else {
            self.sb.flag_suspect(inode, "entry without next is not the chain tail");
        }

        let ends = self.head.chain_mut(chain);
        match ends.count.checked_sub(1) {
            Some(count) => ends.count = count,
            None => self.sb.flag_suspect(inode, "chain count underflow"),
        }
        if chain == Chain::Dirty {
            self.sb.accountant().apply(UsageDelta::dirty(
                -meta_charge(entry.dirty_meta_size),
                entry.pin_status.is_pinned(),
            ));
            entry.dirty_meta_size = 0;
        }
        self.sb.passed_syncpoint(chain, inode, new_prev);
        entry.set_status(QueueStatus::None);
        Ok(())
    }

    /// Append to the pin chain and count the entry as PINNING.
    pub(crate) fn pin_enqueue(&mut self, entry: &mut SuperblockEntry) -> Result<()> {
        let inode = entry.this_index;
        let ends = self.head.pinning;
        let mut prev = InodeNumber::NULL;
        if let Some(tail) = self.resolve(ends.last, inode, "pin tail") {
            let mut tail_entry = self.read_entry(tail)?;
            if tail_entry.pin_status == PinStatus::Pinning && tail_entry.pin_next.is_null() {
                tail_entry.pin_next = inode;
                self.write_entry(&tail_entry)?;
                prev = tail;
            } else {
                self.sb.flag_suspect(tail, "recorded pin tail is not a tail");
            }
        }
        entry.pin_prev = prev;
        entry.pin_next = InodeNumber::NULL;
        let ends = &mut self.head.pinning;
        if prev.is_null() {
            ends.first = inode;
        }
        ends.last = inode;
        ends.count += 1;
        Ok(())
    }

    pub(crate) fn pin_dequeue(&mut self, entry: &mut SuperblockEntry) -> Result<()> {
        let inode = entry.this_index;
        let prev = self.resolve(entry.pin_prev, inode, "pin prev");
        let next = self.resolve(entry.pin_next, inode, "pin next");

        if let Some(prev) = prev {
            let mut neighbor = self.read_entry(prev)?;
            if neighbor.pin_next == inode {
                neighbor.pin_next = next.unwrap_or(InodeNumber::NULL);
                self.write_entry(&neighbor)?;
            } else {
                self.sb.flag_suspect(prev, "pin prev does not link forward");
            }
        } else if self.head.pinning.first == inode {
            self.head.pinning.first = next.unwrap_or(InodeNumber::NULL);
        }

        if let Some(next) = next {
            let mut neighbor = self.read_entry(next)?;
            if neighbor.pin_prev == inode {
                neighbor.pin_prev = prev.unwrap_or(InodeNumber::NULL);
                self.write_entry(&neighbor)?;
            } else {
                self.sb.flag_suspect(next, "pin next does not link back");
            }
        } else if self.head.pinning.last == inode {
            self.head.pinning.last = prev.unwrap_or(InodeNumber::NULL);
        }

        self.head.pinning.count = self.head.pinning.count.saturating_sub(1);
        entry.pin_prev = InodeNumber::NULL;
        entry.pin_next = InodeNumber::NULL;
        Ok(())
    }

    /// Head of the reclaim chain, unlinked. `None` when the chain is empty
    /// or its head is unusable.
    pub(crate) fn pop_reclaimed(&mut self) -> Result<Option<SuperblockEntry>> {
        let ends = self.head.reclaimed;
        let Some(first) = self.resolve(ends.first, InodeNumber::NULL, "reclaim head") else {
            if ends.count != 0 {
                self.sb
                    .flag_suspect(InodeNumber::NULL, "reclaim count without a chain head");
                self.head.reclaimed = ChainEnds::default();
            }
            return Ok(None);
        };
        let entry = self.read_entry(first)?;
        let Some(next) = entry.reclaim_next() else {
            self.sb
                .flag_suspect(first, "reclaim chain head is not reclaimed");
            self.head.reclaimed = ChainEnds::default();
            return Ok(None);
        };
        let next = self
            .resolve(next, first, "reclaim next")
            .unwrap_or(InodeNumber::NULL);
        let ends = &mut self.head.reclaimed;
        ends.first = next;
        if next.is_null() {
            *ends = ChainEnds::default();
        } else {
            ends.count = ends.count.saturating_sub(1);
        }
        Ok(Some(entry))
    }

    /// A dirty-chain link into the region recovery has not reached yet is
    /// left over from an interrupted batch and reads as null.
    fn visible(&self, chain: Chain, link: InodeNumber) -> InodeNumber {
        if chain == Chain::Dirty && !link.is_null() && self.head.awaits_recovery(link) {
            InodeNumber::NULL
        } else {
            link
        }
    }

    fn resolve(
        &self,
        link: InodeNumber,
        from: InodeNumber,
        role: &'static str,
    ) -> Option<InodeNumber> {
        if link.is_null() {
            return None;
        }
        if link.0 > self.head.num_total_inodes || link == from {
            self.sb.flag_suspect(from, role);
            return None;
        }
        Some(link)
    }
}

/// Bytes a dirty entry's metadata contributes to the accountant.
#[must_use]
pub fn meta_charge(dirty_meta_size: u64) -> i64 {
    round_to_storage_block(i64::try_from(dirty_meta_size).unwrap_or(i64::MAX))
}

fn check_range(inode: InodeNumber, total: u64) -> Result<()> {
    if inode.is_null() || inode.0 > total {
        return Err(HcfsError::InvalidInode(inode.0));
    }
    Ok(())
}

pub(crate) fn read_entry_at(
    dev: &SharedDevice,
    inode: InodeNumber,
    total: u64,
) -> Result<SuperblockEntry> {
    let mut entries = read_entries_at(dev, inode, 1, total)?;
    entries
        .pop()
        .ok_or(HcfsError::InvalidInode(inode.0))
}

pub(crate) fn read_entries_at(
    dev: &SharedDevice,
    first: InodeNumber,
    count: u64,
    total: u64,
) -> Result<Vec<SuperblockEntry>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let last = InodeNumber(first.0.saturating_add(count - 1));
    check_range(first, total)?;
    check_range(last, total)?;
    let len = usize::try_from(count)
        .ok()
        .and_then(|n| n.checked_mul(ENTRY_SIZE))
        .ok_or(HcfsError::NoMemory)?;
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(entry_offset(first), &mut buf)?;

    let mut entries = Vec::with_capacity(buf.len() / ENTRY_SIZE);
    for (inode, raw) in (first.0..).zip(buf.chunks_exact(ENTRY_SIZE)) {
        let entry = SuperblockEntry::decode(raw).map_err(|err| HcfsError::Corruption {
            inode,
            detail: err.to_string(),
        })?;
        if entry.this_index.0 != inode {
            return Err(HcfsError::Corruption {
                inode,
                detail: format!("entry records index {}", entry.this_index),
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

pub(crate) fn write_entries_at(
    dev: &SharedDevice,
    entries: &[SuperblockEntry],
    total: u64,
) -> Result<()> {
    let Some(first) = entries.first().map(|e| e.this_index) else {
        return Ok(());
    };
    let mut buf = vec![0_u8; entries.len() * ENTRY_SIZE];
    for ((expected, entry), raw) in (first.0..)
        .zip(entries)
        .zip(buf.chunks_exact_mut(ENTRY_SIZE))
    {
        check_range(entry.this_index, total)?;
        if entry.this_index.0 != expected {
            return Err(HcfsError::InvalidInode(entry.this_index.0));
        }
        entry
            .encode_into(raw)
            .map_err(|err| HcfsError::Parse(err.to_string()))?;
    }
    dev.write_all_at(entry_offset(first), &buf)
}

pub(crate) fn read_head_at(dev: &SharedDevice) -> Result<SuperblockHead> {
    let mut buf = [0_u8; HEAD_SIZE];
    dev.read_exact_at(0, &mut buf)?;
    SuperblockHead::decode(&buf).map_err(|err| HcfsError::Format(format!("superblock head: {err}")))
}

pub(crate) fn write_head_at(dev: &SharedDevice, head: &SuperblockHead) -> Result<()> {
    let mut buf = [0_u8; HEAD_SIZE];
    head.encode_into(&mut buf)
        .map_err(|err| HcfsError::Parse(err.to_string()))?;
    dev.write_all_at(0, &buf)
}
