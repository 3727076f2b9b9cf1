// SPDX-License-Identifier: PMPL-1.0-or-later
//! Engine configuration.
//!
//! Defaults:
//! - key_mode: type_only
//! - schema: public, table_prefix: vs_doc_
//! - slow_compile_ms: 50.0

use serde::{Deserialize, Serialize};

use crate::error::{CompiledQueryError, Result};
use crate::key::KeyMode;

/// Configuration for a [`CompiledQueryEngine`](crate::executor::CompiledQueryEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompiledQueryConfig {
    /// How template instances map to cache keys.
    pub key_mode: KeyMode,
    /// Schema holding the document tables.
    pub schema: String,
    /// Prefix prepended to a collection name to form its table name.
    pub table_prefix: String,
    /// Compiles at or above this many milliseconds are logged as warnings.
    pub slow_compile_ms: f64,
}

impl Default for CompiledQueryConfig {
    fn default() -> Self {
        Self {
            key_mode: KeyMode::TypeOnly,
            schema: "public".to_string(),
            table_prefix: "vs_doc_".to_string(),
            slow_compile_ms: 50.0,
        }
    }
}

impl CompiledQueryConfig {
    /// Parse a JSON configuration; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| CompiledQueryError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the translator cannot render.
    pub fn validate(&self) -> Result<()> {
        if !is_identifier(&self.schema) {
            return Err(CompiledQueryError::InvalidConfig(format!(
                "schema {:?} is not a plain identifier",
                self.schema
            )));
        }
        if !self.table_prefix.is_empty() && !is_identifier(&self.table_prefix) {
            return Err(CompiledQueryError::InvalidConfig(format!(
                "table_prefix {:?} is not a plain identifier",
                self.table_prefix
            )));
        }
        if !self.slow_compile_ms.is_finite() || self.slow_compile_ms < 0.0 {
            return Err(CompiledQueryError::InvalidConfig(format!(
                "slow_compile_ms must be a non-negative number, got {}",
                self.slow_compile_ms
            )));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}
