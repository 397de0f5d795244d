#![forbid(unsafe_code)]
//! Error types for the HCFS core.
//!
//! # Error Taxonomy
//!
//! The core uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `hcfs-types` | Record-format violations detected while decoding bytes |
//! | Runtime | `HcfsError` | `hcfs-error` (this crate) | Errors returned by the ledger, superblock and recovery APIs |
//!
//! `hcfs-error` does not depend on `hcfs-types`; the conversion from
//! `ParseError` happens in the crate that decodes the record, because only
//! that crate knows which inode the bytes belonged to.
//!
//! | ParseError Variant | HcfsError Variant |
//! |--------------------|-------------------|
//! | `InsufficientData` | `Corruption { inode, detail }` |
//! | `InvalidMagic` | `Format(detail)` |
//! | `InvalidField` | `Corruption` for live records, `Format` when opening |
//!
//! ## Categories
//!
//! - I/O errors: a short positioned read or write is `ShortIo`; an OS error
//!   is `Io`. Both are propagated immediately, never retried here.
//! - Logical errors: `InvalidInode`, `InvalidTransition`, `NotFound`,
//!   `Busy`. These carry fixed errno values.
//! - Allocation failures: `NoMemory`.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`HcfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms). Call sites that speak the
//! FUSE convention use [`HcfsError::to_neg_errno`].
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `ShortIo` | `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format` | `EINVAL` |
//! | `Parse` | `EINVAL` |
//! | `InvalidInode` | `EINVAL` |
//! | `InvalidTransition` | `EINVAL` |
//! | `NotFound` | `ENOENT` |
//! | `NoMemory` | `ENOMEM` |
//! | `NoSpace` | `ENOSPC` |
//! | `Busy` | `EBUSY` |
//! | `RecoveryFailed` | `EIO` |

use thiserror::Error;

/// Unified error type for all HCFS core operations.
#[derive(Debug, Error)]
pub enum HcfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A positioned read or write transferred fewer bytes than requested.
    #[error("short I/O at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortIo {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// A persisted record for a known inode failed to decode or holds
    /// out-of-range values.
    #[error("corrupt record for inode {inode}: {detail}")]
    Corruption { inode: u64, detail: String },

    /// A file does not have the expected structure (bad magic, unknown
    /// version, misaligned length).
    #[error("invalid format: {0}")]
    Format(String),

    /// Parse-layer error surfaced without inode context.
    #[error("parse error: {0}")]
    Parse(String),

    /// Inode number outside the allocated range of the index.
    #[error("invalid inode number {0}")]
    InvalidInode(u64),

    /// The requested state change is not legal from the current state.
    #[error("invalid transition for inode {inode}: {detail}")]
    InvalidTransition { inode: u64, detail: String },

    /// A named object is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// A buffer or table could not be allocated.
    #[error("out of memory")]
    NoMemory,

    /// No space left for local cache growth.
    #[error("no space left on device")]
    NoSpace,

    /// The operation is not allowed right now (recovery running, sync point
    /// pending).
    #[error("busy: {0}")]
    Busy(String),

    /// A superblock recovery run could not complete.
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
}

impl HcfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant is a compile error until
    /// its errno is assigned.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::ShortIo { .. } | Self::Corruption { .. } | Self::RecoveryFailed(_) => {
                libc::EIO
            }
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidInode(_)
            | Self::InvalidTransition { .. } => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::NoMemory => libc::ENOMEM,
            Self::NoSpace => libc::ENOSPC,
            Self::Busy(_) => libc::EBUSY,
        }
    }

    /// Negated errno, the convention of the FUSE reply path.
    #[must_use]
    pub fn to_neg_errno(&self) -> libc::c_int {
        -self.to_errno()
    }

    /// True for errors that mean persisted metadata can no longer be trusted.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ShortIo { .. } | Self::Corruption { .. })
    }
}

/// Result alias using `HcfsError`.
pub type Result<T> = std::result::Result<T, HcfsError>;
