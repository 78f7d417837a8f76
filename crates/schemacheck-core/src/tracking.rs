//! Durable tracking tables kept in the database under test.
//!
//! Three append-only tables hold the audit trail and the registry's source
//! of truth:
//!
//! - `change_test_runs`: one row per executed change script
//! - `idempotency_runs`: one row per idempotency iteration
//! - `resource_registry`: every registered test resource; teardown stamps
//!   `torn_down_unix_ms` instead of deleting the row
//!
//! The tables never appear in catalog snapshots (see
//! [`crate::catalog::CaptureOptions`]).

use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use schemacheck_error::{Result, SchemaCheckError};
use schemacheck_types::{
    ExecutionResult, Fingerprint, IdempotencyRun, RecoveryOutcome, TestResource, duration_ms,
    text_digest,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Tables owned by the tracking store.
pub const TRACKING_TABLES: [&str; 3] =
    ["change_test_runs", "resource_registry", "idempotency_runs"];

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS change_test_runs (
    run_id                 TEXT PRIMARY KEY,
    script_digest          TEXT NOT NULL,
    success                INTEGER NOT NULL,
    duration_ms            INTEGER NOT NULL,
    failure                TEXT,
    before_fingerprint     TEXT,
    after_fingerprint      TEXT,
    verification_satisfied INTEGER,
    recovery_action        TEXT,
    recorded_unix_ms       INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS idempotency_runs (
    check_id           TEXT NOT NULL,
    iteration          INTEGER NOT NULL,
    duration_ms        INTEGER NOT NULL,
    fingerprint_before TEXT,
    fingerprint        TEXT,
    success            INTEGER NOT NULL,
    changed_state      INTEGER NOT NULL,
    error              TEXT,
    recorded_unix_ms   INTEGER NOT NULL,
    PRIMARY KEY (check_id, iteration)
);
CREATE TABLE IF NOT EXISTS resource_registry (
    seq                INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_type      TEXT NOT NULL,
    resource_id        TEXT NOT NULL,
    parent_id          TEXT,
    scope_id           TEXT,
    cleanup_order      INTEGER NOT NULL,
    registered_unix_ms INTEGER NOT NULL,
    expires_unix_ms    INTEGER NOT NULL,
    torn_down_unix_ms  INTEGER
);
CREATE UNIQUE INDEX IF NOT EXISTS resource_registry_live
    ON resource_registry (resource_type, resource_id)
    WHERE torn_down_unix_ms IS NULL;
";

/// Create the tracking tables if they are missing. Safe to call repeatedly.
pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA_SQL)
        .map_err(SchemaCheckError::tracking("ensure schema"))
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ms(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or(0)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _) if failure.code == ErrorCode::ConstraintViolation
    )
}

/// Map an append failure, turning a key collision into
/// [`SchemaCheckError::DuplicateRecord`].
fn append_error(
    operation: &'static str,
    table: &'static str,
    key: impl FnOnce() -> String,
) -> impl FnOnce(rusqlite::Error) -> SchemaCheckError {
    move |err| {
        if is_constraint_violation(&err) {
            SchemaCheckError::DuplicateRecord { table, key: key() }
        } else {
            SchemaCheckError::tracking(operation)(err)
        }
    }
}

// ---------------------------------------------------------------------------
// change_test_runs
// ---------------------------------------------------------------------------

/// One audited change-script run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRunRecord {
    pub run_id: String,
    pub script_digest: String,
    pub success: bool,
    pub duration_ms: u64,
    pub failure: Option<String>,
    pub before_fingerprint: Option<String>,
    pub after_fingerprint: Option<String>,
    pub verification_satisfied: Option<bool>,
    pub recovery_action: Option<String>,
    pub recorded_unix_ms: u64,
}

impl ChangeRunRecord {
    pub fn from_execution(
        run_id: impl Into<String>,
        script: &str,
        result: &ExecutionResult,
        recorded_unix_ms: u64,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            script_digest: text_digest(script),
            success: result.success,
            duration_ms: duration_ms(result.duration),
            failure: result.failure.as_ref().map(|failure| failure.reason()),
            before_fingerprint: None,
            after_fingerprint: None,
            verification_satisfied: None,
            recovery_action: None,
            recorded_unix_ms,
        }
    }

    pub fn with_fingerprints(mut self, before: &Fingerprint, after: &Fingerprint) -> Self {
        self.before_fingerprint = Some(before.to_hex());
        self.after_fingerprint = Some(after.to_hex());
        self
    }

    pub const fn with_verification(mut self, satisfied: bool) -> Self {
        self.verification_satisfied = Some(satisfied);
        self
    }

    pub fn with_recovery(mut self, outcome: &RecoveryOutcome) -> Self {
        self.recovery_action = Some(outcome.action.label().to_owned());
        self
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            script_digest: row.get(1)?,
            success: row.get(2)?,
            duration_ms: from_sql_ms(row.get(3)?),
            failure: row.get(4)?,
            before_fingerprint: row.get(5)?,
            after_fingerprint: row.get(6)?,
            verification_satisfied: row.get(7)?,
            recovery_action: row.get(8)?,
            recorded_unix_ms: from_sql_ms(row.get(9)?),
        })
    }
}

/// Append the record for `record.run_id`. An existing record for the same
/// run fails with [`SchemaCheckError::DuplicateRecord`] and is kept.
pub fn record_change_run(conn: &Connection, record: &ChangeRunRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO change_test_runs (
             run_id, script_digest, success, duration_ms, failure,
             before_fingerprint, after_fingerprint, verification_satisfied,
             recovery_action, recorded_unix_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            record.run_id,
            record.script_digest,
            record.success,
            to_sql_ms(record.duration_ms),
            record.failure,
            record.before_fingerprint,
            record.after_fingerprint,
            record.verification_satisfied,
            record.recovery_action,
            to_sql_ms(record.recorded_unix_ms),
        ],
    )
    .map_err(append_error("record change run", "change_test_runs", || {
        record.run_id.clone()
    }))?;
    debug!(run_id = %record.run_id, success = record.success, "change run recorded");
    Ok(())
}

/// All recorded change runs, oldest first.
pub fn change_runs(conn: &Connection) -> Result<Vec<ChangeRunRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT run_id, script_digest, success, duration_ms, failure,
                    before_fingerprint, after_fingerprint, verification_satisfied,
                    recovery_action, recorded_unix_ms
             FROM change_test_runs
             ORDER BY recorded_unix_ms, run_id",
        )
        .map_err(SchemaCheckError::tracking("list change runs"))?;
    let rows = stmt
        .query_map([], ChangeRunRecord::from_row)
        .map_err(SchemaCheckError::tracking("list change runs"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(SchemaCheckError::tracking("list change runs"))
}

/// Look up one change run by id.
pub fn change_run(conn: &Connection, run_id: &str) -> Result<Option<ChangeRunRecord>> {
    conn.query_row(
        "SELECT run_id, script_digest, success, duration_ms, failure,
                before_fingerprint, after_fingerprint, verification_satisfied,
                recovery_action, recorded_unix_ms
         FROM change_test_runs WHERE run_id = ?1",
        [run_id],
        ChangeRunRecord::from_row,
    )
    .optional()
    .map_err(SchemaCheckError::tracking("load change run"))
}

// ---------------------------------------------------------------------------
// idempotency_runs
// ---------------------------------------------------------------------------

/// Append one iteration of `check_id`. Fails with
/// [`SchemaCheckError::DuplicateRecord`] if that iteration is already stored.
pub fn record_idempotency_run(
    conn: &Connection,
    check_id: &str,
    run: &IdempotencyRun,
    recorded_unix_ms: u64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO idempotency_runs (
             check_id, iteration, duration_ms, fingerprint_before, fingerprint,
             success, changed_state, error, recorded_unix_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            check_id,
            run.iteration,
            to_sql_ms(duration_ms(run.duration)),
            run.fingerprint_before.as_ref().map(Fingerprint::to_hex),
            run.fingerprint.as_ref().map(Fingerprint::to_hex),
            run.success,
            run.changed_state,
            run.error,
            to_sql_ms(recorded_unix_ms),
        ],
    )
    .map_err(append_error("record idempotency run", "idempotency_runs", || {
        format!("{check_id}#{}", run.iteration)
    }))?;
    Ok(())
}

/// Recorded iterations of one idempotency check, in iteration order.
pub fn idempotency_runs(conn: &Connection, check_id: &str) -> Result<Vec<IdempotencyRun>> {
    let mut stmt = conn
        .prepare(
            "SELECT iteration, duration_ms, fingerprint_before, fingerprint, success,
                    changed_state, error
             FROM idempotency_runs WHERE check_id = ?1 ORDER BY iteration",
        )
        .map_err(SchemaCheckError::tracking("list idempotency runs"))?;
    let rows = stmt
        .query_map([check_id], |row| {
            let before: Option<String> = row.get(2)?;
            let fingerprint: Option<String> = row.get(3)?;
            let mut run = IdempotencyRun::new(
                row.get(0)?,
                Duration::from_millis(from_sql_ms(row.get(1)?)),
                fingerprint.as_deref().and_then(Fingerprint::from_hex),
                row.get(4)?,
                row.get(6)?,
            )
            .with_before(before.as_deref().and_then(Fingerprint::from_hex));
            run.changed_state = row.get(5)?;
            Ok(run)
        })
        .map_err(SchemaCheckError::tracking("list idempotency runs"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(SchemaCheckError::tracking("list idempotency runs"))
}

// ---------------------------------------------------------------------------
// resource_registry
// ---------------------------------------------------------------------------

/// Insert a live registry row and return its sequence number.
///
/// A live row with the same `(resource_type, id)` fails with
/// [`SchemaCheckError::DuplicateResource`].
#[allow(clippy::too_many_arguments)]
pub fn insert_resource(
    conn: &Connection,
    resource_type: &str,
    id: &str,
    parent_id: Option<&str>,
    scope_id: Option<&str>,
    cleanup_order: i32,
    registered_unix_ms: u64,
    expires_unix_ms: u64,
) -> Result<i64> {
    let inserted = conn.execute(
        "INSERT INTO resource_registry (
             resource_type, resource_id, parent_id, scope_id, cleanup_order,
             registered_unix_ms, expires_unix_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            resource_type,
            id,
            parent_id,
            scope_id,
            cleanup_order,
            to_sql_ms(registered_unix_ms),
            to_sql_ms(expires_unix_ms),
        ],
    );
    match inserted {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(err) if is_constraint_violation(&err) => Err(SchemaCheckError::DuplicateResource {
            resource_type: resource_type.to_owned(),
            id: id.to_owned(),
        }),
        Err(err) => Err(SchemaCheckError::tracking("insert resource")(err)),
    }
}

/// Retire the live row for `(resource_type, id)`. Returns whether a live row
/// existed.
pub fn mark_torn_down(
    conn: &Connection,
    resource_type: &str,
    id: &str,
    torn_down_unix_ms: u64,
) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE resource_registry SET torn_down_unix_ms = ?3
             WHERE resource_type = ?1 AND resource_id = ?2 AND torn_down_unix_ms IS NULL",
            params![resource_type, id, to_sql_ms(torn_down_unix_ms)],
        )
        .map_err(SchemaCheckError::tracking("mark resource torn down"))?;
    Ok(changed > 0)
}

/// Every resource that has not been torn down, in registration order.
pub fn load_active_resources(conn: &Connection) -> Result<Vec<TestResource>> {
    let mut stmt = conn
        .prepare(
            "SELECT seq, resource_type, resource_id, parent_id, scope_id, cleanup_order,
                    registered_unix_ms, expires_unix_ms
             FROM resource_registry
             WHERE torn_down_unix_ms IS NULL
             ORDER BY seq",
        )
        .map_err(SchemaCheckError::tracking("load active resources"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TestResource {
                registered_seq: row.get(0)?,
                resource_type: row.get(1)?,
                id: row.get(2)?,
                parent_id: row.get(3)?,
                scope_id: row.get(4)?,
                cleanup_order: row.get(5)?,
                registered_unix_ms: from_sql_ms(row.get(6)?),
                expires_unix_ms: from_sql_ms(row.get(7)?),
            })
        })
        .map_err(SchemaCheckError::tracking("load active resources"))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(SchemaCheckError::tracking("load active resources"))
}
