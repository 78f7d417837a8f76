//! One verification cycle on one connection:
//! capture before, execute, capture after, verify, recover, record.
//!
//! The pieces stay independently usable; this is the composition most
//! callers want, with every step traced under a single `change_cycle` span.

use std::time::{Duration, SystemTime};

use rusqlite::Connection;
use schemacheck_error::{Result, SchemaCheckError};
use schemacheck_types::{
    CatalogSnapshot, ChangeExpectation, ExecutionResult, RecoveryOutcome, VerificationReport,
    unix_ms,
};
use serde::Serialize;
use tracing::warn;

use crate::catalog::{self, CaptureOptions};
use crate::config::EngineConfig;
use crate::executor;
use crate::recovery::{RecoveryContext, RecoveryCoordinator};
use crate::telemetry::cycle_span;
use crate::tracking::{self, ChangeRunRecord};
use crate::verifier;

/// How a cycle runs.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub capture: CaptureOptions,
    pub timeout: Duration,
    pub recovery: RecoveryCoordinator,
    /// Write a `change_test_runs` row. The tracking tables must exist.
    pub record: bool,
}

impl CycleOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            capture: config.capture_options(),
            timeout: config.script_timeout(),
            recovery: RecoveryCoordinator::from_config(&config.recovery),
            record: false,
        }
    }

    #[must_use]
    pub fn with_recovery(mut self, recovery: RecoveryCoordinator) -> Self {
        self.recovery = recovery;
        self
    }

    #[must_use]
    pub const fn recording(mut self, record: bool) -> Self {
        self.record = record;
        self
    }
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Everything one cycle observed.
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub run_id: String,
    pub execution: ExecutionResult,
    pub before: CatalogSnapshot,
    pub after: CatalogSnapshot,
    pub report: VerificationReport,
    /// Present only when the script failed.
    pub recovery: Option<RecoveryOutcome>,
}

impl CycleOutcome {
    /// Script committed and every expectation held.
    pub fn passed(&self) -> bool {
        self.execution.success && self.report.satisfied()
    }
}

/// Run `script` between two captures and verify `expectation`.
///
/// Capture and connectivity failures propagate. Script failures and
/// timeouts are rolled back by the executor, handed to the recovery
/// coordinator, and reported in the outcome. When recording, a `run_id`
/// that already has an audit record is refused before anything runs.
pub fn run_cycle(
    conn: &Connection,
    run_id: &str,
    script: &str,
    expectation: &ChangeExpectation,
    options: &CycleOptions,
) -> Result<CycleOutcome> {
    let span = cycle_span(run_id, &options.capture.schema);
    let _entered = span.enter();

    if options.record && tracking::change_run(conn, run_id)?.is_some() {
        return Err(SchemaCheckError::DuplicateRecord {
            table: "change_test_runs",
            key: run_id.to_owned(),
        });
    }

    let before = catalog::capture(conn, &options.capture)?;
    let execution = executor::execute(conn, script, options.timeout)?;
    let after = catalog::capture(conn, &options.capture)?;
    let report = verifier::verify(&before, &after, expectation);
    let recovery = options
        .recovery
        .recover_if_failed(&RecoveryContext::new(run_id, script), &execution);

    if options.record {
        let mut record =
            ChangeRunRecord::from_execution(run_id, script, &execution, unix_ms(SystemTime::now()))
                .with_fingerprints(&before.fingerprint(), &after.fingerprint())
                .with_verification(report.satisfied());
        if let Some(outcome) = &recovery {
            record = record.with_recovery(outcome);
        }
        if let Err(err) = tracking::record_change_run(conn, &record) {
            warn!(run_id, error = %err, "change run not recorded");
        }
    }

    Ok(CycleOutcome {
        run_id: run_id.to_owned(),
        execution,
        before,
        after,
        report,
        recovery,
    })
}
