#![forbid(unsafe_code)]
//! HCFS core engine.
//!
//! Wires the block status ledger, cache accountant, superblock index and
//! superblock recovery over one metadata directory. The component crates
//! are re-exported for callers that drive them directly (sync and delete
//! workers go through [`Hcfs::ledger`] and [`Hcfs::superblock`]).

mod config;
mod engine;

pub use config::HcfsConfig;
pub use engine::{FileTables, Hcfs, META_SUBDIR, USAGE_FILE};

pub use hcfs_block as block;
pub use hcfs_cache as cache;
pub use hcfs_error::{HcfsError, Result};
pub use hcfs_ledger as ledger;
pub use hcfs_recovery as recovery;
pub use hcfs_superblock as superblock;
pub use hcfs_types as types;
