//! Snapshot determinism and change detection against real database files.

use std::time::Duration;

use proptest::prelude::*;
use rusqlite::Connection;
use schemacheck_core::types::{ChangeExpectation, RowStats};
use schemacheck_core::{CaptureOptions, RowStatsMode, SchemaCheckError, capture, execute, verify};

const DDL: [&str; 5] = [
    "CREATE TABLE owners (id INTEGER PRIMARY KEY, email TEXT NOT NULL UNIQUE)",
    "CREATE TABLE widgets (id INTEGER PRIMARY KEY, name TEXT, owner_id INTEGER REFERENCES owners(id))",
    "CREATE INDEX idx_widgets_name ON widgets(name)",
    "CREATE TABLE tags (widget_id INTEGER REFERENCES widgets(id), tag TEXT, PRIMARY KEY (widget_id, tag))",
    "CREATE TABLE audit (at INTEGER, note TEXT)",
];

fn open_file_db(dir: &tempfile::TempDir, name: &str) -> Connection {
    Connection::open(dir.path().join(name)).expect("open database file")
}

#[test]
fn repeated_capture_is_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = open_file_db(&dir, "stable.db");
    conn.execute_batch(&DDL.join(";\n")).expect("apply ddl");

    let first = capture(&conn, &CaptureOptions::default()).expect("first capture");
    let second = capture(&conn, &CaptureOptions::default()).expect("second capture");
    assert_eq!(first.fingerprint(), second.fingerprint());
    assert_eq!(first.canonical_bytes(), second.canonical_bytes());
    assert!(first.diff(&second).is_empty());
}

#[test]
fn capture_time_and_schema_name_do_not_affect_fingerprint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = open_file_db(&dir, "main.db");
    conn.execute_batch("CREATE TABLE t (x INTEGER);").expect("ddl");
    let attached = dir.path().join("aux.db");
    conn.execute("ATTACH DATABASE ?1 AS aux", [attached.to_string_lossy().into_owned()])
        .expect("attach");
    conn.execute_batch("CREATE TABLE aux.t (x INTEGER);").expect("aux ddl");

    let main = capture(&conn, &CaptureOptions::default()).expect("main");
    std::thread::sleep(Duration::from_millis(5));
    let aux = capture(&conn, &CaptureOptions::for_schema("aux")).expect("aux");
    assert_eq!(aux.schema(), "aux");
    assert_ne!(main.captured_unix_ms(), 0);
    assert_eq!(main.fingerprint(), aux.fingerprint());
}

#[test]
fn creating_a_table_changes_the_fingerprint_and_satisfies_the_expectation() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conn = open_file_db(&dir, "detect.db");
    let before = capture(&conn, &CaptureOptions::default()).expect("before");

    let result = execute(&conn, "CREATE TABLE widgets (id INTEGER);", Duration::from_secs(5))
        .expect("execute");
    assert!(result.success);

    let after = capture(&conn, &CaptureOptions::default()).expect("after");
    assert_ne!(before.fingerprint(), after.fingerprint());
    let report = verify(&before, &after, &ChangeExpectation::new().table_appears("widgets"));
    assert!(report.satisfied(), "{}", report.render_diff());
}

#[test]
fn row_changes_are_visible_only_when_stats_are_enabled() {
    let conn = Connection::open_in_memory().expect("open");
    conn.execute_batch("CREATE TABLE t (x INTEGER);").expect("ddl");
    let exact = CaptureOptions::default();
    let disabled = CaptureOptions::default().row_stats(RowStatsMode::Disabled);

    let exact_before = capture(&conn, &exact).expect("capture");
    let disabled_before = capture(&conn, &disabled).expect("capture");
    conn.execute("INSERT INTO t VALUES (1)", []).expect("insert");
    let exact_after = capture(&conn, &exact).expect("capture");
    let disabled_after = capture(&conn, &disabled).expect("capture");

    assert_ne!(exact_before.fingerprint(), exact_after.fingerprint());
    assert_eq!(exact_after.row_stats().get("t"), Some(&RowStats::Rows(1)));
    assert_eq!(disabled_before.fingerprint(), disabled_after.fingerprint());
    assert_eq!(
        exact_before.diff(&exact_after).render(),
        "~ rows t: 0 rows -> 1 rows"
    );
}

#[test]
fn unreachable_catalog_propagates_as_connectivity() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("garbage.db");
    std::fs::write(&path, vec![0xAB_u8; 8192]).expect("write garbage");
    let conn = Connection::open(&path).expect("open lazily");
    let err = capture(&conn, &CaptureOptions::default()).expect_err("not a database");
    assert!(err.is_connectivity(), "{err}");
    assert!(matches!(err, SchemaCheckError::Connectivity { .. }));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// The order objects were created in never reaches the fingerprint.
    #[test]
    fn creation_order_does_not_matter(order in Just(vec![0_usize, 1, 2, 3, 4]).prop_shuffle()) {
        // Dependencies: widgets needs owners (FK), the index needs widgets,
        // tags needs widgets. SQLite resolves FK targets lazily, so only
        // the index must follow its table.
        let mut order = order;
        let index_pos = order.iter().position(|&i| i == 2).unwrap();
        let widgets_pos = order.iter().position(|&i| i == 1).unwrap();
        if index_pos < widgets_pos {
            order.swap(index_pos, widgets_pos);
        }

        let reference = Connection::open_in_memory().unwrap();
        reference.execute_batch(&DDL.join(";\n")).unwrap();
        let expected = capture(&reference, &CaptureOptions::default()).unwrap();

        let shuffled = Connection::open_in_memory().unwrap();
        for i in order {
            shuffled.execute_batch(DDL[i]).unwrap();
        }
        let observed = capture(&shuffled, &CaptureOptions::default()).unwrap();
        prop_assert_eq!(expected.fingerprint(), observed.fingerprint());
    }
}
