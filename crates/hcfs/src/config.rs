use hcfs_cache::CacheLimits;
use hcfs_error::{HcfsError, Result};
use hcfs_ledger::LedgerConfig;
use hcfs_recovery::RecoveryConfig;
use hcfs_superblock::SuperblockConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration. Every section and field is optional in JSON and
/// falls back to its default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HcfsConfig {
    pub cache: CacheLimits,
    pub ledger: LedgerConfig,
    pub superblock: SuperblockConfig,
    pub recovery: RecoveryConfig,
}

impl HcfsConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| HcfsError::Format(format!("config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| HcfsError::Format(format!("{}: {e}", path.display())))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| HcfsError::Format(format!("config: {e}")))
    }
}
