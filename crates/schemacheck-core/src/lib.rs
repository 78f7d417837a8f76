//! Schema-change verification and test-resource lifecycle over SQLite.
//!
//! Components, leaf-first:
//!
//! - [`catalog`]: deterministic catalog snapshots and their fingerprints
//! - [`executor`]: all-or-nothing script execution with an engine-side deadline
//! - [`verifier`]: expected structural delta vs. a before/after pair
//! - [`idempotency`]: repeated application on one connection
//! - [`registry`]: dependency-ordered teardown and expiry sweeps
//! - [`recovery`]: bounded, audited remediation after a failed script
//!
//! The components do not call each other; callers compose them, usually
//! through [`cycle::run_cycle`]. [`tracking`] holds the durable audit
//! tables, [`pool`] hands out per-worker connections.

pub mod catalog;
pub mod config;
pub mod cycle;
pub mod executor;
pub mod idempotency;
pub mod pool;
pub mod recovery;
pub mod registry;
pub mod telemetry;
pub mod tracking;
pub mod verifier;

pub use catalog::{CaptureOptions, CatalogAllowList, RowStatsMode, SqlIdent, capture};
pub use config::{EngineConfig, PoolConfig, RecoveryConfig};
pub use cycle::{CycleOptions, CycleOutcome, run_cycle};
pub use executor::execute;
pub use idempotency::{IdempotencyChecker, check_idempotency};
pub use pool::{ConnectionPool, PooledConnection};
pub use recovery::{RecoveryContext, RecoveryCoordinator, RemediationHook};
pub use registry::{CascadeDeleter, DeleteResult, ResourceDeleter, ResourceRegistry};
pub use telemetry::{LogFormat, init_tracing};
pub use verifier::verify;

pub use schemacheck_error::{Result, SchemaCheckError};
pub use schemacheck_types as types;
