#![forbid(unsafe_code)]
//! Block status ledger.
//!
//! Tracks, per data block of a regular file, where the authoritative copy
//! lives (local, backend, both, or in flight) inside that file's own
//! metadata, and drives the cache accountant as blocks move between tiers.

pub mod ledger;
pub mod registry;
pub mod status;
pub mod table;

pub use ledger::{BlockLedger, BlockStore, LedgerConfig, TruncateReport};
pub use hcfs_block::SharedDevice;
pub use registry::{FileMeta, MetaRegistry};
pub use status::{
    BlockEntry, BlockStatus, FetchPurpose, ReadAction, TruncateAction, WriteAction,
};
pub use table::{ENTRIES_PER_PAGE, FileBlocks, FileStats, POINTERS_PER_PAGE, PageRoute};
