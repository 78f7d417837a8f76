//! Engine-independent value types for schema-change verification.
//!
//! Nothing in this crate touches a database. Snapshots are built by
//! `schemacheck-core` from a live catalog and then only compared; reports and
//! resource records are plain data that can be serialized for artifacts.

pub mod execution;
pub mod expectation;
pub mod idempotency;
pub mod recovery;
pub mod report;
pub mod resource;
pub mod snapshot;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use execution::{ExecutionFailure, ExecutionResult};
pub use expectation::{ChangeExpectation, ExpectedChange};
pub use idempotency::{IdempotencyRun, IdempotencyVerdict};
pub use recovery::{RecoveryAction, RecoveryOutcome};
pub use report::{CheckOutcome, Presence, VerificationReport};
pub use resource::{
    ResourceKey, ResourceSpec, TeardownEntry, TeardownFilter, TeardownOutcome, TeardownReport,
    TestResource, sort_for_teardown,
};
pub use snapshot::{
    CatalogSnapshot, ColumnEntry, Fingerprint, ForeignKeyEntry, IndexEntry, RowStats,
    RowStatsChange, SnapshotDiff,
};

/// Milliseconds since the Unix epoch; clamps pre-epoch times to zero.
pub fn unix_ms(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, duration_ms)
}

/// Whole milliseconds of a duration, saturating at `u64::MAX`.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// SHA-256 hex digest of a script or other text artifact.
pub fn text_digest(text: &str) -> String {
    use sha2::{Digest, Sha256};
    hex_encode(&Sha256::digest(text.as_bytes()))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}
