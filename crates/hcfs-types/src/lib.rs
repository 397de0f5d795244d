#![forbid(unsafe_code)]
//! Shared newtypes, the inode stat record and bounded little-endian codec
//! helpers used by every HCFS crate.
//!
//! ```
//! use hcfs_types::{read_le_u32, round_to_storage_block, write_le_u32, InodeNumber};
//!
//! let mut buf = [0_u8; 8];
//! write_le_u32(&mut buf, 4, 0xdead_beef).unwrap();
//! assert_eq!(read_le_u32(&buf, 4).unwrap(), 0xdead_beef);
//! assert!(read_le_u32(&buf, 6).is_err());
//!
//! assert_eq!(round_to_storage_block(1), 4096);
//! assert_eq!(round_to_storage_block(-4097), -8192);
//! assert!(InodeNumber::NULL.is_null());
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Rounding unit for cache accounting ("storage block size").
pub const STORAGE_BLOCK_SIZE: u64 = 4096;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BlockNumber(pub u64);

/// Inode number. Also the 1-based index of the inode's superblock entry;
/// `InodeNumber(0)` is the null link.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct InodeNumber(pub u64);

impl InodeNumber {
    pub const NULL: Self = Self(0);
    pub const FIRST: Self = Self(1);

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `None` for the null link.
    #[must_use]
    pub fn non_null(self) -> Option<Self> {
        if self.is_null() { None } else { Some(self) }
    }
}

/// Reuse counter of an inode slot; bumped each time a reclaimed slot is
/// handed out again.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(pub u64);

// ── File mode bits ──────────────────────────────────────────────────────────

/// File type mask.
pub const S_IFMT: u32 = 0o170_000;
/// FIFO.
pub const S_IFIFO: u32 = 0o010_000;
/// Directory.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u32 = 0o140_000;

/// Snapshot of an inode's attributes as kept in its superblock entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeStat {
    /// Owning inode; zero once the inode has been deleted.
    pub ino: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl InodeStat {
    pub const ENCODED_LEN: usize = 56;

    /// A fresh stat for a file of the given mode.
    #[must_use]
    pub fn with_mode(mode: u32) -> Self {
        Self {
            mode,
            nlink: 1,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn file_type(&self) -> u32 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type() == S_IFREG
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.ino == 0
    }

    /// Everything cleared except the file-type bits of `mode`.
    #[must_use]
    pub fn cleared_keep_type(&self) -> Self {
        Self {
            mode: self.file_type(),
            ..Self::default()
        }
    }

    pub fn encode_into(&self, buf: &mut [u8]) -> Result<(), ParseError> {
        write_le_u64(buf, 0, self.ino)?;
        write_le_u32(buf, 8, self.mode)?;
        write_le_u32(buf, 12, self.nlink)?;
        write_le_u32(buf, 16, self.uid)?;
        write_le_u32(buf, 20, self.gid)?;
        write_le_u64(buf, 24, self.size)?;
        write_le_i64(buf, 32, self.atime)?;
        write_le_i64(buf, 40, self.mtime)?;
        write_le_i64(buf, 48, self.ctime)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            ino: read_le_u64(buf, 0)?,
            mode: read_le_u32(buf, 8)?,
            nlink: read_le_u32(buf, 12)?,
            uid: read_le_u32(buf, 16)?,
            gid: read_le_u32(buf, 20)?,
            size: read_le_u64(buf, 24)?,
            atime: read_le_i64(buf, 32)?,
            mtime: read_le_i64(buf, 40)?,
            ctime: read_le_i64(buf, 48)?,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(
    data: &mut [u8],
    offset: usize,
    len: usize,
) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| i64::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Round `bytes` up to a whole number of [`STORAGE_BLOCK_SIZE`] units.
///
/// Negative sizes round away from zero symmetrically, so a delta and its
/// reversal cancel out.
#[must_use]
pub fn round_to_storage_block(bytes: i64) -> i64 {
    let unit = STORAGE_BLOCK_SIZE as i64;
    let magnitude = bytes.unsigned_abs().div_ceil(STORAGE_BLOCK_SIZE);
    let rounded = i64::try_from(magnitude).unwrap_or(i64::MAX / unit) * unit;
    if bytes < 0 { -rounded } else { rounded }
}

/// Wall-clock seconds since the Unix epoch; zero if the clock is before it.
#[must_use]
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX)
        })
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
