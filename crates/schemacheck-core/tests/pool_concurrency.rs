//! Concurrent verification cycles, each on its own pooled connection.

use std::time::Duration;

use schemacheck_core::tracking;
use schemacheck_core::types::ChangeExpectation;
use schemacheck_core::{ConnectionPool, CycleOptions, EngineConfig, SchemaCheckError, run_cycle};

const WORKERS: usize = 4;

#[test]
fn workers_verify_independent_changes_concurrently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = ConnectionPool::open(dir.path().join("shared.db"), WORKERS).expect("pool");
    {
        let conn = pool.checkout(Duration::from_secs(1)).expect("setup connection");
        tracking::ensure_schema(&conn).expect("tracking schema");
    }

    let mut options = CycleOptions::default().recording(true);
    options.timeout = Duration::from_secs(20);

    let outcomes = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let pool = &pool;
                let options = &options;
                scope.spawn(move || {
                    let conn = pool.checkout(Duration::from_secs(10)).expect("checkout");
                    let table = format!("worker_{worker}");
                    let script = format!(
                        "CREATE TABLE {table} (id INTEGER PRIMARY KEY, payload TEXT);
                         CREATE INDEX idx_{table}_payload ON {table}(payload);
                         INSERT INTO {table} (payload) VALUES ('seed');"
                    );
                    let expectation = ChangeExpectation::new()
                        .table_appears(table.clone())
                        .index_appears(format!("idx_{table}_payload"));
                    run_cycle(&conn, &format!("run-{worker}"), &script, &expectation, options)
                        .expect("cycle")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("worker panicked"))
            .collect::<Vec<_>>()
    });

    for outcome in &outcomes {
        assert!(
            outcome.passed(),
            "{}: {:?} {}",
            outcome.run_id,
            outcome.execution.failure,
            outcome.report.render_diff()
        );
    }
    assert_eq!(pool.idle_count(), WORKERS);

    let conn = pool.checkout(Duration::from_secs(1)).expect("verify connection");
    let mut recorded: Vec<String> = tracking::change_runs(&conn)
        .expect("change runs")
        .into_iter()
        .map(|run| run.run_id)
        .collect();
    recorded.sort();
    assert_eq!(recorded, vec!["run-0", "run-1", "run-2", "run-3"]);
}

#[test]
fn exhausted_pool_reports_how_long_it_waited() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = ConnectionPool::open(dir.path().join("small.db"), 1).expect("pool");
    let held = pool.checkout(Duration::from_millis(10)).expect("first checkout");

    let err = pool
        .checkout(Duration::from_millis(50))
        .expect_err("pool is empty");
    assert!(
        matches!(err, SchemaCheckError::PoolExhausted { waited_ms } if waited_ms >= 50),
        "{err}"
    );
    assert!(err.is_connectivity());
    assert!(!err.is_retryable());

    drop(held);
    assert!(pool.checkout(Duration::from_millis(10)).is_ok());
}

#[test]
fn waiting_worker_gets_the_returned_connection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let pool = ConnectionPool::open(dir.path().join("handoff.db"), 1).expect("pool");
    let held = pool.checkout(Duration::from_millis(10)).expect("first checkout");

    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| {
            let conn = pool.checkout(Duration::from_secs(5)).expect("handed over");
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .expect("usable")
        });
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().expect("waiter"), 1);
    });
}

#[test]
fn pool_size_comes_from_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = EngineConfig::from_toml_str(
        "
        [pool]
        size = 2
        checkout_timeout_ms = 100
        ",
    )
    .expect("config");
    let pool = ConnectionPool::open(dir.path().join("configured.db"), config.pool.size)
        .expect("pool");
    assert_eq!(pool.size(), 2);

    let first = pool.checkout(config.checkout_timeout()).expect("first");
    let second = pool.checkout(config.checkout_timeout()).expect("second");
    assert_eq!(pool.idle_count(), 0);
    assert!(pool.checkout(config.checkout_timeout()).is_err());
    drop((first, second));
    assert_eq!(pool.idle_count(), 2);
}
