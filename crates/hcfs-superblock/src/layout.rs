//! On-disk records of the superblock file.
//!
//! ```text
//! [head: 256 bytes][entry 1: 128 bytes][entry 2]...
//! ```
//!
//! Entry `i` lives at `HEAD_SIZE + (i - 1) * ENTRY_SIZE`. All integers are
//! little endian.

use hcfs_error::HcfsError;
use hcfs_types::{
    Generation, InodeNumber, InodeStat, ParseError, ensure_slice, ensure_slice_mut, read_le_i64,
    read_le_u16, read_le_u32, read_le_u64, write_le_i64, write_le_u16, write_le_u32, write_le_u64,
};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const HEAD_SIZE: usize = 256;
pub const ENTRY_SIZE: usize = 128;
/// "HCSB" little endian.
pub const SUPERBLOCK_MAGIC: u32 = 0x4253_4348;
pub const SUPERBLOCK_VERSION: u16 = 1;

/// Byte offset of an inode's entry.
#[must_use]
pub fn entry_offset(inode: InodeNumber) -> u64 {
    HEAD_SIZE as u64 + inode.0.saturating_sub(1) * ENTRY_SIZE as u64
}

/// Which work queue an entry belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueueStatus {
    #[default]
    None = 0,
    Dirty = 1,
    ToDelete = 2,
    /// Listed only in the unclaimed log.
    ToReclaim = 3,
    Reclaimed = 4,
}

impl QueueStatus {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        Ok(match raw {
            0 => Self::None,
            1 => Self::Dirty,
            2 => Self::ToDelete,
            3 => Self::ToReclaim,
            4 => Self::Reclaimed,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "queue_status",
                    reason: "unknown status byte",
                });
            }
        })
    }

    /// The doubly linked chain this status lives on, if any.
    #[must_use]
    pub fn chain(self) -> Option<Chain> {
        match self {
            Self::Dirty => Some(Chain::Dirty),
            Self::ToDelete => Some(Chain::ToDelete),
            Self::None | Self::ToReclaim | Self::Reclaimed => None,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Dirty => "IS_DIRTY",
            Self::ToDelete => "TO_BE_DELETED",
            Self::ToReclaim => "TO_BE_RECLAIMED",
            Self::Reclaimed => "RECLAIMED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PinStatus {
    #[default]
    Deleted = 0,
    Unpin = 1,
    /// Pinned; local copies of the file's blocks are still being fetched.
    Pinning = 2,
    Pin = 3,
}

impl PinStatus {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        Ok(match raw {
            0 => Self::Deleted,
            1 => Self::Unpin,
            2 => Self::Pinning,
            3 => Self::Pin,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "pin_status",
                    reason: "unknown status byte",
                });
            }
        })
    }

    #[must_use]
    pub fn is_pinned(self) -> bool {
        matches!(self, Self::Pinning | Self::Pin)
    }
}

/// The two doubly linked work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Chain {
    Dirty,
    ToDelete,
}

impl Chain {
    #[must_use]
    pub fn status(self) -> QueueStatus {
        match self {
            Self::Dirty => QueueStatus::Dirty,
            Self::ToDelete => QueueStatus::ToDelete,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLinks {
    pub prev: InodeNumber,
    pub next: InodeNumber,
}

/// One inode's record.
///
/// `prev`/`next` mean different things depending on the queue status, so
/// they are private: [`Self::links`] exposes them only for chain members
/// and [`Self::reclaim_next`] only for reclaimed slots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockEntry {
    pub this_index: InodeNumber,
    status: QueueStatus,
    pub pin_status: PinStatus,
    pub in_transit: bool,
    pub mod_after_in_transit: bool,
    pub stat: InodeStat,
    prev: InodeNumber,
    next: InodeNumber,
    pub pin_prev: InodeNumber,
    pub pin_next: InodeNumber,
    pub generation: Generation,
    pub dirty_meta_size: u64,
    /// Unix seconds of the last completed sync.
    pub last_sync_time: i64,
}

impl SuperblockEntry {
    /// A freshly allocated, unqueued entry.
    #[must_use]
    pub fn allocated(
        inode: InodeNumber,
        stat: InodeStat,
        pin_status: PinStatus,
        generation: Generation,
    ) -> Self {
        Self {
            this_index: inode,
            pin_status,
            stat: InodeStat { ino: inode.0, ..stat },
            generation,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        self.status
    }

    /// Change the queue status, clearing both link fields.
    pub fn set_status(&mut self, status: QueueStatus) {
        self.status = status;
        self.prev = InodeNumber::NULL;
        self.next = InodeNumber::NULL;
    }

    #[must_use]
    pub fn links(&self) -> Option<ChainLinks> {
        self.status.chain().map(|_| self.raw_links())
    }

    pub fn set_links(&mut self, links: ChainLinks) -> Result<(), HcfsError> {
        if self.status.chain().is_none() {
            return Err(self.wrong_state("chain links"));
        }
        self.prev = links.prev;
        self.next = links.next;
        Ok(())
    }

    #[must_use]
    pub fn reclaim_next(&self) -> Option<InodeNumber> {
        (self.status == QueueStatus::Reclaimed).then_some(self.next)
    }

    pub fn set_reclaim_next(&mut self, next: InodeNumber) -> Result<(), HcfsError> {
        if self.status != QueueStatus::Reclaimed {
            return Err(self.wrong_state("reclaim link"));
        }
        self.prev = InodeNumber::NULL;
        self.next = next;
        Ok(())
    }

    /// Link fields regardless of status, for diagnostics.
    #[must_use]
    pub fn raw_links(&self) -> ChainLinks {
        ChainLinks {
            prev: self.prev,
            next: self.next,
        }
    }

    fn wrong_state(&self, field: &str) -> HcfsError {
        HcfsError::InvalidTransition {
            inode: self.this_index.0,
            detail: format!("{field} not valid for status {}", self.status),
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        let out = ensure_slice_mut(buf, 0, ENTRY_SIZE)?;
        out.fill(0);
        write_le_u64(out, 0, self.this_index.0)?;
        out[8] = self.status as u8;
        out[9] = self.pin_status as u8;
        out[10] = u8::from(self.in_transit);
        out[11] = u8::from(self.mod_after_in_transit);
        self.stat
            .encode_into(ensure_slice_mut(out, 16, InodeStat::ENCODED_LEN)?)?;
        write_le_u64(out, 72, self.prev.0)?;
        write_le_u64(out, 80, self.next.0)?;
        write_le_u64(out, 88, self.pin_prev.0)?;
        write_le_u64(out, 96, self.pin_next.0)?;
        write_le_u64(out, 104, self.generation.0)?;
        write_le_u64(out, 112, self.dirty_meta_size)?;
        write_le_i64(out, 120, self.last_sync_time)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(buf, 0, ENTRY_SIZE)?;
        Ok(Self {
            this_index: InodeNumber(read_le_u64(raw, 0)?),
            status: QueueStatus::from_raw(raw[8])?,
            pin_status: PinStatus::from_raw(raw[9])?,
            in_transit: raw[10] != 0,
            mod_after_in_transit: raw[11] != 0,
            stat: InodeStat::decode(ensure_slice(raw, 16, InodeStat::ENCODED_LEN)?)?,
            prev: InodeNumber(read_le_u64(raw, 72)?),
            next: InodeNumber(read_le_u64(raw, 80)?),
            pin_prev: InodeNumber(read_le_u64(raw, 88)?),
            pin_next: InodeNumber(read_le_u64(raw, 96)?),
            generation: Generation(read_le_u64(raw, 104)?),
            dirty_meta_size: read_le_u64(raw, 112)?,
            last_sync_time: read_le_i64(raw, 120)?,
        })
    }
}

/// First/last/count of one list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEnds {
    pub first: InodeNumber,
    pub last: InodeNumber,
    pub count: u64,
}

/// Recovery control block, committed together with the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryControl {
    pub ongoing: bool,
    /// Next inode the reconstructor will process.
    pub start: InodeNumber,
    /// Last inode of the run.
    pub end: InodeNumber,
    /// Unix seconds of the last completed run.
    pub last_recovery_ts: i64,
}

/// The head record: counters and list ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperblockHead {
    pub num_total_inodes: u64,
    pub num_active_inodes: u64,
    pub dirty: ChainEnds,
    pub to_delete: ChainEnds,
    pub num_to_reclaim: u64,
    /// Singly linked through `reclaim_next`; `last` is kept for diagnostics.
    pub reclaimed: ChainEnds,
    /// Entries in PINNING state, linked through `pin_prev`/`pin_next`.
    pub pinning: ChainEnds,
    pub recovery: RecoveryControl,
}

impl SuperblockHead {
    #[must_use]
    pub fn chain(&self, chain: Chain) -> &ChainEnds {
        match chain {
            Chain::Dirty => &self.dirty,
            Chain::ToDelete => &self.to_delete,
        }
    }

    pub fn chain_mut(&mut self, chain: Chain) -> &mut ChainEnds {
        match chain {
            Chain::Dirty => &mut self.dirty,
            Chain::ToDelete => &mut self.to_delete,
        }
    }

    /// True while the reconstructor has not yet reached `inode`; live
    /// traffic must not link or count it.
    #[must_use]
    pub fn awaits_recovery(&self, inode: InodeNumber) -> bool {
        self.recovery.ongoing && inode >= self.recovery.start && inode <= self.recovery.end
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        let out = ensure_slice_mut(buf, 0, HEAD_SIZE)?;
        out.fill(0);
        write_le_u32(out, 0, SUPERBLOCK_MAGIC)?;
        write_le_u16(out, 4, SUPERBLOCK_VERSION)?;
        write_le_u64(out, 8, self.num_total_inodes)?;
        write_le_u64(out, 16, self.num_active_inodes)?;
        write_le_u64(out, 24, self.dirty.count)?;
        write_le_u64(out, 32, self.to_delete.count)?;
        write_le_u64(out, 40, self.num_to_reclaim)?;
        write_le_u64(out, 48, self.reclaimed.count)?;
        write_le_u64(out, 56, self.dirty.first.0)?;
        write_le_u64(out, 64, self.dirty.last.0)?;
        write_le_u64(out, 72, self.to_delete.first.0)?;
        write_le_u64(out, 80, self.to_delete.last.0)?;
        write_le_u64(out, 88, self.reclaimed.first.0)?;
        write_le_u64(out, 96, self.reclaimed.last.0)?;
        write_le_u64(out, 104, self.pinning.first.0)?;
        write_le_u64(out, 112, self.pinning.last.0)?;
        write_le_u64(out, 120, self.pinning.count)?;
        out[128] = u8::from(self.recovery.ongoing);
        write_le_u64(out, 136, self.recovery.start.0)?;
        write_le_u64(out, 144, self.recovery.end.0)?;
        write_le_i64(out, 152, self.recovery.last_recovery_ts)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let raw = ensure_slice(buf, 0, HEAD_SIZE)?;
        let magic = read_le_u32(raw, 0)?;
        if magic != SUPERBLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPERBLOCK_MAGIC),
                actual: u64::from(magic),
            });
        }
        if read_le_u16(raw, 4)? != SUPERBLOCK_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported superblock version",
            });
        }
        let ino = |offset| read_le_u64(raw, offset).map(InodeNumber);
        Ok(Self {
            num_total_inodes: read_le_u64(raw, 8)?,
            num_active_inodes: read_le_u64(raw, 16)?,
            dirty: ChainEnds {
                first: ino(56)?,
                last: ino(64)?,
                count: read_le_u64(raw, 24)?,
            },
            to_delete: ChainEnds {
                first: ino(72)?,
                last: ino(80)?,
                count: read_le_u64(raw, 32)?,
            },
            num_to_reclaim: read_le_u64(raw, 40)?,
            reclaimed: ChainEnds {
                first: ino(88)?,
                last: ino(96)?,
                count: read_le_u64(raw, 48)?,
            },
            pinning: ChainEnds {
                first: ino(104)?,
                last: ino(112)?,
                count: read_le_u64(raw, 120)?,
            },
            recovery: RecoveryControl {
                ongoing: raw[128] != 0,
                start: ino(136)?,
                end: ino(144)?,
                last_recovery_ts: read_le_i64(raw, 152)?,
            },
        })
    }
}
