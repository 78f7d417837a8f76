//! Repeated application of one change script on one connection.
//!
//! Iterations run strictly in sequence on the caller's connection, so
//! iteration `i + 1` always observes the committed effect of iteration `i`.
//! A failing iteration does not stop the check; its outcome is recorded and
//! the next iteration runs.

use std::time::{Duration, SystemTime};

use rusqlite::Connection;
use schemacheck_error::{Result, SchemaCheckError};
use schemacheck_types::{Fingerprint, IdempotencyRun, IdempotencyVerdict, text_digest, unix_ms};
use tracing::{debug, info, warn};

use crate::catalog::{self, CaptureOptions};
use crate::config::EngineConfig;
use crate::executor;
use crate::tracking;

/// Drives the executor `iterations` times and judges the fingerprints.
#[derive(Debug, Clone)]
pub struct IdempotencyChecker {
    iterations: u32,
    timeout: Duration,
    capture: CaptureOptions,
    record_runs: bool,
}

impl IdempotencyChecker {
    /// `iterations` must be at least 2 and `timeout` positive.
    pub fn new(iterations: u32, timeout: Duration) -> Result<Self> {
        let mut issues = Vec::new();
        if iterations < 2 {
            issues.push(format!(
                "idempotency iterations must be at least 2 (got {iterations})"
            ));
        }
        if timeout.is_zero() {
            issues.push("script timeout must be a positive duration".to_owned());
        }
        if !issues.is_empty() {
            return Err(SchemaCheckError::InvalidConfig { issues });
        }
        Ok(Self {
            iterations,
            timeout,
            capture: CaptureOptions::default(),
            record_runs: false,
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Ok(Self::new(config.idempotency_iterations, config.script_timeout())?
            .with_capture(config.capture_options()))
    }

    #[must_use]
    pub fn with_capture(mut self, capture: CaptureOptions) -> Self {
        self.capture = capture;
        self
    }

    /// Persist every iteration to `idempotency_runs`. The tracking tables
    /// must exist.
    #[must_use]
    pub const fn with_tracking(mut self, record_runs: bool) -> Self {
        self.record_runs = record_runs;
        self
    }

    pub const fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Run the check under a fresh random check id.
    pub fn check(&self, conn: &Connection, script: &str) -> Result<IdempotencyVerdict> {
        let check_id = format!("idem-{:016x}", rand::random::<u64>());
        self.check_as(conn, &check_id, script)
    }

    /// Run the check, recording iterations under `check_id` when tracking
    /// is enabled.
    ///
    /// Only the pristine baseline capture, or a tracked `check_id` that was
    /// already used, can fail the call. Everything after the baseline is
    /// best-effort and lands in the verdict.
    pub fn check_as(
        &self,
        conn: &Connection,
        check_id: &str,
        script: &str,
    ) -> Result<IdempotencyVerdict> {
        if self.record_runs && !tracking::idempotency_runs(conn, check_id)?.is_empty() {
            return Err(SchemaCheckError::DuplicateRecord {
                table: "idempotency_runs",
                key: check_id.to_owned(),
            });
        }
        let digest = text_digest(script);
        let baseline = catalog::capture(conn, &self.capture)?.fingerprint();
        debug!(
            check_id,
            script = %&digest[..12],
            baseline = %baseline.short(),
            "idempotency baseline captured"
        );

        let mut previous_after = Some(baseline);
        let mut runs = Vec::with_capacity(self.iterations as usize);
        for iteration in 1..=self.iterations {
            let run = self.run_once(conn, script, iteration, previous_after);
            if run.fingerprint.is_some() {
                previous_after = run.fingerprint;
            }
            runs.push(run);
        }

        let verdict = IdempotencyVerdict::evaluate(Some(baseline), runs);
        if self.record_runs {
            let now = unix_ms(SystemTime::now());
            for run in &verdict.runs {
                if let Err(err) = tracking::record_idempotency_run(conn, check_id, run, now) {
                    warn!(
                        check_id,
                        iteration = run.iteration,
                        error = %err,
                        "idempotency run not recorded"
                    );
                }
            }
        }

        if verdict.idempotent {
            info!(check_id, script = %&digest[..12], "{}", verdict.triage_line());
        } else {
            warn!(
                check_id,
                script = %&digest[..12],
                changed = ?verdict.changed_iterations,
                "{}",
                verdict.triage_line()
            );
        }
        Ok(verdict)
    }

    fn run_once(
        &self,
        conn: &Connection,
        script: &str,
        iteration: u32,
        previous_after: Option<Fingerprint>,
    ) -> IdempotencyRun {
        let fingerprint_before = match catalog::capture(conn, &self.capture) {
            Ok(before) => {
                let before = before.fingerprint();
                if previous_after.is_some_and(|prev| prev != before) {
                    warn!(
                        iteration,
                        "schema changed between iterations outside the checked script"
                    );
                }
                Some(before)
            }
            Err(err) => {
                warn!(iteration, error = %err, "pre-iteration capture failed");
                None
            }
        };

        let (duration, success, mut error) = match executor::execute(conn, script, self.timeout) {
            Ok(result) => (
                result.duration,
                result.success,
                result.failure.as_ref().map(|failure| failure.reason()),
            ),
            Err(err) => (Duration::ZERO, false, Some(err.to_string())),
        };

        let fingerprint = match catalog::capture(conn, &self.capture) {
            Ok(after) => Some(after.fingerprint()),
            Err(err) => {
                warn!(iteration, error = %err, "post-iteration capture failed");
                error.get_or_insert_with(|| format!("post-iteration capture failed: {err}"));
                None
            }
        };

        debug!(
            iteration,
            success,
            fingerprint = ?fingerprint.map(|fp| fp.short()),
            "idempotency iteration finished"
        );
        IdempotencyRun::new(iteration, duration, fingerprint, success, error)
            .with_before(fingerprint_before)
    }
}

/// One-shot form of [`IdempotencyChecker::check`].
pub fn check_idempotency(
    conn: &Connection,
    script: &str,
    iterations: u32,
    timeout: Duration,
) -> Result<IdempotencyVerdict> {
    IdempotencyChecker::new(iterations, timeout)?.check(conn, script)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn iteration_count_below_two_is_rejected() {
        let err = IdempotencyChecker::new(1, Duration::ZERO).unwrap_err();
        match err {
            SchemaCheckError::InvalidConfig { issues } => assert_eq!(issues.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn guarded_create_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let script = "CREATE TABLE IF NOT EXISTS t (id INTEGER);";
        let verdict = check_idempotency(&conn, script, 3, SECOND).unwrap();
        assert!(verdict.idempotent, "{}", verdict.triage_line());
        assert_eq!(verdict.changed_iterations, vec![1]);
        assert_eq!(verdict.runs[1].fingerprint, verdict.runs[2].fingerprint);
    }

    #[test]
    fn unguarded_create_fails_on_repeat_but_keeps_going() {
        let conn = Connection::open_in_memory().unwrap();
        let verdict = check_idempotency(&conn, "CREATE TABLE t (id INTEGER);", 3, SECOND).unwrap();
        assert!(!verdict.idempotent);
        assert_eq!(verdict.runs.len(), 3);
        assert!(verdict.runs[0].success);
        assert_eq!(verdict.failed_iterations().count(), 2);
        let error = verdict.runs[2].error.as_deref().unwrap_or_default();
        assert!(error.contains("already exists"), "{error}");
    }

    #[test]
    fn empty_script_is_trivially_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        let verdict = check_idempotency(&conn, "", 2, SECOND).unwrap();
        assert!(verdict.idempotent, "{}", verdict.triage_line());
    }

    #[test]
    fn tracked_iterations_are_persisted() {
        let conn = Connection::open_in_memory().unwrap();
        tracking::ensure_schema(&conn).unwrap();
        let checker = IdempotencyChecker::new(2, SECOND).unwrap().with_tracking(true);
        let verdict = checker
            .check_as(&conn, "check-1", "CREATE TABLE IF NOT EXISTS t (id INTEGER);")
            .unwrap();
        let stored = tracking::idempotency_runs(&conn, "check-1").unwrap();
        assert_eq!(stored.len(), 2);
        for (stored, run) in stored.iter().zip(&verdict.runs) {
            assert_eq!(stored.iteration, run.iteration);
            assert_eq!(stored.fingerprint, run.fingerprint);
            assert_eq!(stored.changed_state, run.changed_state);
            assert_eq!(stored.success, run.success);
            assert_eq!(stored.fingerprint_before, run.fingerprint_before);
        }
        assert_eq!(stored[0].fingerprint_before, verdict.baseline);
        assert_eq!(stored[1].fingerprint_before, stored[0].fingerprint);
        assert!(verdict.drifted_iterations.is_empty());
    }

    #[test]
    fn reused_check_id_is_refused_when_tracking() {
        let conn = Connection::open_in_memory().unwrap();
        tracking::ensure_schema(&conn).unwrap();
        let checker = IdempotencyChecker::new(2, SECOND).unwrap().with_tracking(true);
        checker
            .check_as(&conn, "check-1", "CREATE TABLE IF NOT EXISTS t (id INTEGER);")
            .unwrap();
        let err = checker
            .check_as(&conn, "check-1", "CREATE TABLE IF NOT EXISTS u (id INTEGER);")
            .unwrap_err();
        assert!(
            matches!(err, SchemaCheckError::DuplicateRecord { table: "idempotency_runs", .. }),
            "{err}"
        );
        // The second script never ran.
        let u: i64 = conn
            .query_row("SELECT count(*) FROM sqlite_master WHERE name = 'u'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(u, 0);
        assert_eq!(tracking::idempotency_runs(&conn, "check-1").unwrap().len(), 2);
    }
}
