//! Resolution tuning knobs.

use crate::error::{MapperError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Cap on distinct parent values for a simplified `right in (...)` fetch.
    pub max_in_clause: usize,
    /// Let `map`, `map_back` and the plans resolve against a partially cached
    /// entity when the probed index is unique. Off by default;
    /// `map_return_null_if_incomplete_index_hit` never needs it.
    pub allow_partial_cache_hits: bool,
    /// Alias prefix for tables in generated SQL (`t0`, `t1`, ...).
    pub table_alias_prefix: String,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            max_in_clause: 1000,
            allow_partial_cache_hits: false,
            table_alias_prefix: "t".to_string(),
        }
    }
}

impl MapperConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| MapperError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }
}
