//! Engine configuration.
//!
//! ```toml
//! schema = "main"
//! script_timeout_ms = 30000
//! idempotency_iterations = 3
//! resource_ttl_secs = 3600
//! row_stats = "exact"            # or "disabled"
//! excluded_tables = ["audit_log"]
//!
//! [recovery]
//! enabled = true
//! max_attempts = 1
//!
//! [pool]
//! size = 4
//! checkout_timeout_ms = 5000
//! ```
//!
//! Every field has a default, so an empty document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use schemacheck_error::{Result, SchemaCheckError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::{CaptureOptions, RowStatsMode};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Database name the engine captures (`main`, `temp` or an attached name).
    pub schema: String,
    pub script_timeout_ms: u64,
    pub idempotency_iterations: u32,
    pub resource_ttl_secs: u64,
    pub row_stats: RowStatsMode,
    /// Tables left out of snapshots in addition to internal and tracking tables.
    pub excluded_tables: Vec<String>,
    pub recovery: RecoveryConfig,
    pub pool: PoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema: "main".to_owned(),
            script_timeout_ms: 30_000,
            idempotency_iterations: 3,
            resource_ttl_secs: 3_600,
            row_stats: RowStatsMode::Exact,
            excluded_tables: Vec::new(),
            recovery: RecoveryConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    pub enabled: bool,
    /// Upper bound on remediation hook invocations per failed run.
    pub max_attempts: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub size: usize,
    pub checkout_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            checkout_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|err| SchemaCheckError::invalid_config(err.to_string()))?;
        config.checked()
    }

    /// Read, parse and validate a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loading engine configuration");
        Self::from_toml_str(&text)
    }

    /// Every out-of-range value, in field order. Empty means valid.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.schema.trim().is_empty() {
            issues.push("schema must not be empty".to_owned());
        }
        if self.script_timeout_ms == 0 {
            issues.push("script_timeout_ms must be positive".to_owned());
        }
        if self.idempotency_iterations < 2 {
            issues.push(format!(
                "idempotency_iterations must be at least 2 (got {})",
                self.idempotency_iterations
            ));
        }
        if self.resource_ttl_secs == 0 {
            issues.push("resource_ttl_secs must be positive".to_owned());
        }
        if self.recovery.max_attempts == 0 {
            issues.push("recovery.max_attempts must be at least 1".to_owned());
        }
        if self.pool.size == 0 {
            issues.push("pool.size must be at least 1".to_owned());
        }
        if self.pool.checkout_timeout_ms == 0 {
            issues.push("pool.checkout_timeout_ms must be positive".to_owned());
        }
        issues
    }

    /// `self` if valid, otherwise every issue at once.
    pub fn checked(self) -> Result<Self> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(self)
        } else {
            Err(SchemaCheckError::InvalidConfig { issues })
        }
    }

    pub const fn script_timeout(&self) -> Duration {
        Duration::from_millis(self.script_timeout_ms)
    }

    pub const fn resource_ttl(&self) -> Duration {
        Duration::from_secs(self.resource_ttl_secs)
    }

    pub const fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.checkout_timeout_ms)
    }

    /// Capture options for the configured namespace.
    pub fn capture_options(&self) -> CaptureOptions {
        let mut options = CaptureOptions::for_schema(self.schema.clone()).row_stats(self.row_stats);
        for table in &self.excluded_tables {
            options = options.exclude(table.clone());
        }
        options
    }
}
