//! Read-only consistency walk over every chain.

use crate::Superblock;
use crate::layout::{ChainEnds, PinStatus, QueueStatus, SuperblockEntry, SuperblockHead};
use crate::session::read_entries_at;
use hcfs_error::Result;
use hcfs_types::InodeNumber;
use serde::Serialize;
use std::collections::HashSet;

/// What one chain walk found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainWalk {
    pub recorded: ChainEnds,
    /// Members in walk order.
    pub members: Vec<InodeNumber>,
    pub problems: Vec<String>,
}

impl ChainWalk {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub dirty: ChainWalk,
    pub to_delete: ChainWalk,
    pub reclaimed: ChainWalk,
    pub pinning: ChainWalk,
    /// Entries whose status names a chain they are not reachable on, or
    /// that are reachable on more than one.
    pub stray: Vec<String>,
}

impl ChainReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.dirty.is_consistent()
            && self.to_delete.is_consistent()
            && self.reclaimed.is_consistent()
            && self.pinning.is_consistent()
            && self.stray.is_empty()
    }
}

#[derive(Clone, Copy)]
enum Walked {
    Dirty,
    ToDelete,
    Reclaimed,
    Pinning,
}

impl Walked {
    fn is_member(self, entry: &SuperblockEntry) -> bool {
        match self {
            Self::Dirty => entry.status() == QueueStatus::Dirty,
            Self::ToDelete => entry.status() == QueueStatus::ToDelete,
            Self::Reclaimed => entry.status() == QueueStatus::Reclaimed,
            Self::Pinning => entry.pin_status == PinStatus::Pinning,
        }
    }

    /// Back link, for doubly linked chains.
    fn prev(self, entry: &SuperblockEntry) -> Option<InodeNumber> {
        match self {
            Self::Dirty | Self::ToDelete => Some(entry.raw_links().prev),
            Self::Reclaimed => None,
            Self::Pinning => Some(entry.pin_prev),
        }
    }

    fn ends(self, head: &SuperblockHead) -> ChainEnds {
        match self {
            Self::Dirty => head.dirty,
            Self::ToDelete => head.to_delete,
            Self::Reclaimed => head.reclaimed,
            Self::Pinning => head.pinning,
        }
    }

    fn next(self, head: &SuperblockHead, entry: &SuperblockEntry) -> InodeNumber {
        match self {
            // Links into the region recovery has not reached yet are stale.
            Self::Dirty if head.awaits_recovery(entry.raw_links().next) => InodeNumber::NULL,
            Self::Dirty | Self::ToDelete | Self::Reclaimed => entry.raw_links().next,
            Self::Pinning => entry.pin_next,
        }
    }
}

impl Superblock {
    /// Walk the dirty, to-delete, reclaim and pin chains under the shared
    /// lock and cross-check them against every entry's status.
    pub fn verify_chains(&self) -> Result<ChainReport> {
        let (head, entries) = self.snapshot_entries()?;

        let dirty = walk(&head, &entries, Walked::Dirty);
        let to_delete = walk(&head, &entries, Walked::ToDelete);
        let reclaimed = walk(&head, &entries, Walked::Reclaimed);
        let pinning = walk(&head, &entries, Walked::Pinning);

        let mut stray = Vec::new();
        let mut seen = HashSet::new();
        for inode in dirty
            .members
            .iter()
            .chain(&to_delete.members)
            .chain(&reclaimed.members)
        {
            if !seen.insert(*inode) {
                stray.push(format!("inode {inode} is on more than one chain"));
            }
        }
        for entry in &entries {
            let inode = entry.this_index;
            let on_chain = match entry.status() {
                QueueStatus::Dirty if head.awaits_recovery(inode) => continue,
                QueueStatus::Dirty | QueueStatus::ToDelete | QueueStatus::Reclaimed => {
                    seen.contains(&inode)
                }
                QueueStatus::None | QueueStatus::ToReclaim => continue,
            };
            if !on_chain {
                stray.push(format!(
                    "inode {inode} is {} but not on its chain",
                    entry.status()
                ));
            }
        }

        Ok(ChainReport {
            dirty,
            to_delete,
            reclaimed,
            pinning,
            stray,
        })
    }

    /// Every entry whose status is `status`, ascending.
    pub fn entries_with_status(&self, status: QueueStatus) -> Result<Vec<InodeNumber>> {
        let (_, entries) = self.snapshot_entries()?;
        Ok(entries
            .iter()
            .filter(|e| e.status() == status)
            .map(|e| e.this_index)
            .collect())
    }

    fn snapshot_entries(&self) -> Result<(SuperblockHead, Vec<SuperblockEntry>)> {
        self.with_shared(|head| {
            let mut entries = Vec::new();
            let batch = self.config().scan_batch.max(1);
            let mut next = 1_u64;
            while next <= head.num_total_inodes {
                let count = batch.min(head.num_total_inodes - next + 1);
                entries.extend(read_entries_at(
                    &self.storage().index,
                    InodeNumber(next),
                    count,
                    head.num_total_inodes,
                )?);
                next += count;
            }
            Ok((*head, entries))
        })
    }
}

fn walk(head: &SuperblockHead, entries: &[SuperblockEntry], kind: Walked) -> ChainWalk {
    let ends = kind.ends(head);
    let mut report = ChainWalk {
        recorded: ends,
        ..ChainWalk::default()
    };
    let mut seen = HashSet::new();
    let mut prev = InodeNumber::NULL;
    let mut cursor = ends.first;
    while !cursor.is_null() {
        let Some(entry) = usize::try_from(cursor.0 - 1)
            .ok()
            .and_then(|i| entries.get(i))
        else {
            report.problems.push(format!("link to {cursor} is out of range"));
            break;
        };
        if !seen.insert(cursor) {
            report.problems.push(format!("cycle through {cursor}"));
            break;
        }
        if !kind.is_member(entry) {
            report.problems.push(format!(
                "member {cursor} has status {} / {:?}",
                entry.status(),
                entry.pin_status
            ));
            break;
        }
        if let Some(back) = kind.prev(entry) {
            if back != prev {
                report
                    .problems
                    .push(format!("{cursor} links back to {back}, expected {prev}"));
            }
        }
        report.members.push(cursor);
        prev = cursor;
        cursor = kind.next(head, entry);
    }
    if prev != ends.last && report.problems.is_empty() {
        report
            .problems
            .push(format!("walk ends at {prev}, recorded tail is {}", ends.last));
    }
    if report.members.len() as u64 != ends.count {
        report.problems.push(format!(
            "walk visits {} entries, recorded count is {}",
            report.members.len(),
            ends.count
        ));
    }
    report
}
