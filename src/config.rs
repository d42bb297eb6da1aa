//! Sync layer configuration.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Sync layer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Collection holding one profile document per principal.
    /// Default: "users"
    pub profile_collection: String,

    /// Include rejected payloads in permission-denial reports.
    /// Default: true
    pub report_write_payloads: bool,

    /// Run compound writes (comment + counter) as one atomic batch instead
    /// of two sequential writes.
    /// Default: true
    pub atomic_compound_writes: bool,

    /// Register the logging listener on the permission-error channel.
    /// Default: true
    pub log_permission_denials: bool,

    /// Longest accepted comment body, in characters.
    /// Default: 1000
    pub max_comment_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            profile_collection: "users".to_string(),
            report_write_payloads: true,
            atomic_compound_writes: true,
            log_permission_denials: true,
            max_comment_len: 1000,
        }
    }
}

impl SyncConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: SyncConfig =
            serde_json::from_str(raw).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        let collection = self.profile_collection.trim();
        if collection.is_empty() || collection.contains('/') {
            return Err(SyncError::Config(format!(
                "profile_collection must be a single root collection, got {:?}",
                self.profile_collection
            )));
        }
        if self.max_comment_len == 0 {
            return Err(SyncError::Config("max_comment_len must be positive".to_string()));
        }
        Ok(())
    }
}
