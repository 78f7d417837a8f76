//! Idempotency verdicts for guarded and unguarded change scripts.

use std::time::Duration;

use rusqlite::Connection;
use schemacheck_core::tracking;
use schemacheck_core::{EngineConfig, IdempotencyChecker, SchemaCheckError, check_idempotency};

const TIMEOUT: Duration = Duration::from_secs(5);

fn file_db() -> (tempfile::TempDir, Connection) {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = Connection::open(dir.path().join("idem.db")).expect("open");
    (dir, conn)
}

#[test]
fn guarded_script_is_idempotent_over_three_iterations() {
    let (_dir, conn) = file_db();
    let script = "
        CREATE TABLE IF NOT EXISTS settings (key TEXT PRIMARY KEY, value TEXT);
        CREATE INDEX IF NOT EXISTS idx_settings_value ON settings(value);
        INSERT OR IGNORE INTO settings VALUES ('mode', 'strict');
    ";
    let verdict = check_idempotency(&conn, script, 3, TIMEOUT).expect("check");
    assert!(verdict.idempotent, "{}", verdict.triage_line());
    assert_eq!(verdict.runs.len(), 3);
    assert!(verdict.runs.iter().all(|run| run.success));
    assert_eq!(verdict.changed_iterations, vec![1]);
    let repeats = verdict.repeat_fingerprints();
    assert_eq!(repeats[0], repeats[1]);
    assert_ne!(verdict.baseline, verdict.runs[0].fingerprint);
}

#[test]
fn unconditional_insert_is_not_idempotent() {
    let (_dir, conn) = file_db();
    conn.execute_batch(
        "CREATE TABLE events (id INTEGER PRIMARY KEY AUTOINCREMENT, kind TEXT);",
    )
    .expect("events");
    let script = "INSERT INTO events (kind) VALUES ('seeded');";
    let verdict = check_idempotency(&conn, script, 3, TIMEOUT).expect("check");
    assert!(!verdict.idempotent);
    assert!(verdict.runs.iter().all(|run| run.success));
    assert!(verdict.changed_iterations.len() >= 2, "{}", verdict.triage_line());
    assert_eq!(verdict.changed_iterations, vec![1, 2, 3]);
}

#[test]
fn failing_iteration_does_not_hide_later_ones() {
    let (_dir, conn) = file_db();
    // Iteration 1 inserts the key; every later iteration collides with it
    // and is still attempted.
    conn.execute_batch("CREATE TABLE once (k INTEGER PRIMARY KEY);")
        .expect("once");
    let verdict = check_idempotency(&conn, "INSERT INTO once VALUES (1);", 4, TIMEOUT)
        .expect("check");
    assert_eq!(verdict.runs.len(), 4);
    assert!(verdict.runs[0].success);
    assert!(verdict.runs[1..].iter().all(|run| !run.success));
    assert!(verdict.runs[1..].iter().all(|run| run.fingerprint.is_some()));
    assert!(!verdict.idempotent);
    assert_eq!(verdict.changed_iterations, vec![1]);
    assert!(verdict.triage_line().contains("3 failed"));
}

#[test]
fn empty_script_is_a_degenerate_idempotent_case() {
    let (_dir, conn) = file_db();
    let verdict = check_idempotency(&conn, "  ;  ", 2, TIMEOUT).expect("check");
    assert!(verdict.idempotent);
    assert!(verdict.changed_iterations.is_empty());
}

#[test]
fn configured_checker_records_every_iteration() {
    let (_dir, conn) = file_db();
    tracking::ensure_schema(&conn).expect("tracking schema");
    let config = EngineConfig::from_toml_str("idempotency_iterations = 4").expect("config");
    let checker = IdempotencyChecker::from_config(&config)
        .expect("checker")
        .with_tracking(true);
    assert_eq!(checker.iterations(), 4);

    let verdict = checker
        .check_as(&conn, "nightly", "CREATE TABLE IF NOT EXISTS t (x);")
        .expect("check");
    assert!(verdict.idempotent);
    let stored = tracking::idempotency_runs(&conn, "nightly").expect("stored runs");
    let changed: Vec<bool> = stored.iter().map(|run| run.changed_state).collect();
    assert_eq!(changed, vec![true, false, false, false]);
}

#[test]
fn too_few_iterations_is_a_configuration_error() {
    let (_dir, conn) = file_db();
    let err = check_idempotency(&conn, "SELECT 1;", 1, TIMEOUT).expect_err("rejected");
    assert!(matches!(err, SchemaCheckError::InvalidConfig { .. }));
}
