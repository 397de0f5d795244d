//! Block entry record and the pure tiering state machine.
//!
//! The functions here decide what a transition *should* do; applying it
//! (metadata writes, local storage, accounting) is [`crate::BlockLedger`]'s
//! job.

use hcfs_types::{ParseError, read_le_u32, read_le_u64, write_le_u32, write_le_u64};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where the authoritative copy of one data block lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockStatus {
    /// No data (hole, or never written).
    #[default]
    None = 0,
    /// Local only, not yet uploaded.
    Ldisk = 1,
    /// Backend only.
    Cloud = 2,
    /// Consistent copies on both sides.
    Both = 3,
    /// Local copy being uploaded.
    LtoC = 4,
    /// Backend copy being downloaded.
    CtoL = 5,
    /// Logically gone; backend object pending asynchronous deletion.
    ToDelete = 6,
}

impl BlockStatus {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        Ok(match raw {
            0 => Self::None,
            1 => Self::Ldisk,
            2 => Self::Cloud,
            3 => Self::Both,
            4 => Self::LtoC,
            5 => Self::CtoL,
            6 => Self::ToDelete,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "block_status",
                    reason: "unknown status byte",
                });
            }
        })
    }

    /// A local copy exists and is counted by the cache accountant.
    #[must_use]
    pub fn is_cached(self) -> bool {
        matches!(self, Self::Ldisk | Self::Both | Self::LtoC)
    }

    /// The local copy holds data the backend has not acknowledged.
    #[must_use]
    pub fn is_dirty(self) -> bool {
        matches!(self, Self::Ldisk | Self::LtoC)
    }

    #[must_use]
    pub fn on_read(self) -> ReadAction {
        match self {
            Self::Cloud | Self::CtoL => ReadAction::Fetch,
            Self::None | Self::Ldisk | Self::Both | Self::LtoC | Self::ToDelete => {
                ReadAction::Ready
            }
        }
    }

    #[must_use]
    pub fn on_write(self) -> WriteAction {
        match self {
            // A truncated block's backend object is already queued for
            // deletion; writing starts a fresh local block.
            Self::None | Self::ToDelete => WriteAction::Allocate,
            Self::Cloud | Self::CtoL => WriteAction::Fetch,
            Self::Both | Self::LtoC => WriteAction::Diverge,
            Self::Ldisk => WriteAction::AlreadyDirty,
        }
    }

    #[must_use]
    pub fn on_truncate(self) -> TruncateAction {
        match self {
            Self::None | Self::ToDelete => TruncateAction::Keep,
            Self::Ldisk => TruncateAction::UnlinkLocal,
            Self::Cloud => TruncateAction::MarkDelete { drop_local: false },
            Self::Both | Self::LtoC | Self::CtoL => TruncateAction::MarkDelete { drop_local: true },
        }
    }

    /// Target of a completed download, or `None` when the block is no longer
    /// waiting for one (truncated, or another fetch already landed).
    #[must_use]
    pub fn on_fetched(self, purpose: FetchPurpose) -> Option<Self> {
        match (self, purpose) {
            (Self::CtoL, FetchPurpose::Read) => Some(Self::Both),
            (Self::CtoL, FetchPurpose::Write) => Some(Self::Ldisk),
            _ => None,
        }
    }

    #[must_use]
    pub fn on_upload_start(self) -> Option<Self> {
        match self {
            Self::Ldisk => Some(Self::LtoC),
            _ => None,
        }
    }

    #[must_use]
    pub fn on_upload_ack(self) -> Option<Self> {
        match self {
            Self::Ldisk | Self::LtoC => Some(Self::Both),
            _ => None,
        }
    }

    #[must_use]
    pub fn on_page_out(self) -> Option<Self> {
        match self {
            Self::Both => Some(Self::Cloud),
            _ => None,
        }
    }

    #[must_use]
    pub fn on_delete_complete(self) -> Option<Self> {
        match self {
            Self::ToDelete => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Ldisk => "LDISK",
            Self::Cloud => "CLOUD",
            Self::Both => "BOTH",
            Self::LtoC => "LtoC",
            Self::CtoL => "CtoL",
            Self::ToDelete => "TODELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAction {
    /// Serve from what is local (or a hole).
    Ready,
    /// Download first.
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    /// Create a local block, then LDISK.
    Allocate,
    /// Download first, then LDISK.
    Fetch,
    /// Local copy diverges from the backend: LDISK.
    Diverge,
    AlreadyDirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncateAction {
    Keep,
    /// LDISK → NONE.
    UnlinkLocal,
    /// → TODELETE, dropping the local copy when one exists.
    MarkDelete { drop_local: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPurpose {
    Read,
    Write,
}

/// One block's ledger record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub status: BlockStatus,
    /// The backend has acknowledged at least one upload of this block.
    pub uploaded: bool,
    /// Dedup object id or backend version of the last upload.
    pub object_id: u64,
    pub paged_out_count: u32,
    /// Bumped on every local modification; an upload acknowledgement only
    /// settles the block when it covers the current sequence number.
    pub seq_num: u64,
}

impl BlockEntry {
    pub const ENCODED_LEN: usize = 24;

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        let head = u32::from(self.status as u8) | (u32::from(self.uploaded) << 8);
        write_le_u32(buf, 0, head)?;
        write_le_u32(buf, 4, self.paged_out_count)?;
        write_le_u64(buf, 8, self.seq_num)?;
        write_le_u64(buf, 16, self.object_id)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        let head = read_le_u32(buf, 0)?;
        let [status, uploaded, _, _] = head.to_le_bytes();
        Ok(Self {
            status: BlockStatus::from_raw(status)?,
            uploaded: uploaded != 0,
            paged_out_count: read_le_u32(buf, 4)?,
            seq_num: read_le_u64(buf, 8)?,
            object_id: read_le_u64(buf, 16)?,
        })
    }
}
