#![forbid(unsafe_code)]
//! Superblock recovery: detects broken dirty-chain bookkeeping and rebuilds
//! it from entry statuses in resumable batches.
//!
//! Lock order follows the rest of the core: per-file metadata locks first,
//! then the exclusive superblock lock; the accountant is a leaf.

mod config;
mod meta;
mod progress;
mod reconstruct;
mod report;

pub use config::RecoveryConfig;
pub use meta::{FileMetaCache, FileMetaGuard, LockedFile, NoFileMeta};
pub use progress::{
    FileProgressStore, MemoryProgressStore, PROGRESS_FILE, Progress, ProgressStore,
};
pub use reconstruct::Reconstructor;
pub use report::RecoveryReport;
