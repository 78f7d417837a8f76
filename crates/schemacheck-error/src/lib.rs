//! Error taxonomy shared by every schemacheck crate.
//!
//! Only failures that abort an operation live here. Expectation mismatches,
//! unknown resource types during teardown and failed remediation hooks are
//! captured as report entries by their components; the matching variants
//! exist so callers that want to escalate a report entry can do so with a
//! typed error.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = SchemaCheckError> = std::result::Result<T, E>;

/// Every way a schemacheck operation can fail.
#[derive(Debug, Error)]
pub enum SchemaCheckError {
    /// The database could not be reached or read. Never retried automatically.
    #[error("database unreachable during {operation}: {source}")]
    Connectivity {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// The change script itself failed and was rolled back.
    #[error("change script failed: {message}")]
    Script { message: String },

    /// The change script exceeded its budget and was rolled back.
    #[error("change script exceeded its {budget_ms} ms budget after {elapsed_ms} ms")]
    Timeout { budget_ms: u64, elapsed_ms: u64 },

    /// Teardown met a resource type with no deletion operation.
    #[error("no deletion operation registered for resource type `{resource_type}`")]
    UnknownResourceType { resource_type: String },

    /// A remediation hook failed.
    #[error("recovery attempt failed: {reason}")]
    RecoveryAttemptFailed { reason: String },

    /// The (type, id) pair is already registered and live.
    #[error("resource `{resource_type}/{id}` is already registered")]
    DuplicateResource { resource_type: String, id: String },

    /// An audit record with this key already exists. Records are never
    /// overwritten.
    #[error("{table} already holds a record for `{key}`")]
    DuplicateRecord { table: &'static str, key: String },

    /// An identifier was not found in the catalog allow-list or is malformed.
    #[error("invalid identifier `{name}`: {reason}")]
    InvalidIdentifier { name: String, reason: String },

    /// One or more configuration values are out of range.
    #[error("invalid configuration: {}", issues.join("; "))]
    InvalidConfig { issues: Vec<String> },

    /// No pooled connection became free within the checkout budget.
    #[error("connection pool exhausted after waiting {waited_ms} ms")]
    PoolExhausted { waited_ms: u64 },

    /// Writing or reading the tracking tables failed.
    #[error("tracking store {operation} failed: {source}")]
    Tracking {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Filesystem error (configuration files, database paths).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchemaCheckError {
    /// Adapter for `map_err` on catalog/connection calls.
    pub fn connectivity(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Connectivity { operation, source }
    }

    /// Adapter for `map_err` on tracking-store calls.
    pub fn tracking(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Tracking { operation, source }
    }

    pub fn invalid_config(issue: impl Into<String>) -> Self {
        Self::InvalidConfig {
            issues: vec![issue.into()],
        }
    }

    /// Only a timeout may be retried, and only with a larger budget.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::PoolExhausted { .. })
    }
}
