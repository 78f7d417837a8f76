//! Transactional change-script execution with an engine-enforced deadline.
//!
//! ```text
//!  busy_timeout(budget) + progress_handler(deadline)
//!    BEGIN IMMEDIATE
//!      authorizer: deny BEGIN/COMMIT/ROLLBACK from the script
//!      <script>
//!      authorizer: cleared
//!    COMMIT                       (or ROLLBACK on any failure)
//!  handlers cleared, busy_timeout restored
//! ```
//!
//! The deadline is checked by SQLite's VM through the progress handler, so an
//! in-flight statement is aborted by the engine with `SQLITE_INTERRUPT`
//! rather than abandoned by the client. Lock waits are bounded by the same
//! budget through `busy_timeout`. The transaction is closed before
//! [`execute`] returns on every path, including unwinding.

use std::time::{Duration, Instant};

use rusqlite::hooks::{AuthAction, AuthContext, Authorization};
use rusqlite::{Connection, ErrorCode};
use schemacheck_error::{Result, SchemaCheckError};
use schemacheck_types::{ExecutionFailure, ExecutionResult, duration_ms, text_digest};
use tracing::{error, info, warn};

/// VM instructions between deadline checks.
const PROGRESS_CHECK_OPS: i32 = 100;

/// busy_timeout put back on the connection after a script.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Run `script` inside one transaction with a hard `timeout`.
///
/// Script failures and timeouts are reported in the returned
/// [`ExecutionResult`] after a full rollback. Connectivity failures (the
/// transaction cannot be opened, I/O errors) propagate as errors.
pub fn execute(conn: &Connection, script: &str, timeout: Duration) -> Result<ExecutionResult> {
    if timeout.is_zero() {
        return Err(SchemaCheckError::invalid_config(
            "script timeout must be a positive duration",
        ));
    }
    let started = Instant::now();
    let digest = text_digest(script);

    if is_blank(script) {
        let result = ExecutionResult::committed(started.elapsed());
        info!(script = %&digest[..12], "empty change script; nothing to execute");
        return Ok(result);
    }

    if !conn.is_autocommit() {
        warn!(script = %&digest[..12], "caller transaction open; change script not started");
        return Ok(ExecutionResult::rolled_back(
            started.elapsed(),
            ExecutionFailure::Script {
                message: "connection already has an open transaction".to_owned(),
            },
        ));
    }

    let deadline = started + timeout;
    let mut session = match ScriptSession::begin(conn, deadline, timeout) {
        Ok(session) => session,
        Err(err) => return settle(started, timeout, &digest, "begin change transaction", err),
    };

    match session.run(script) {
        Ok(()) => {
            session
                .release()
                .map_err(SchemaCheckError::connectivity("release change session"))?;
            let duration = started.elapsed();
            info!(
                script = %&digest[..12],
                duration_ms = duration_ms(duration),
                "change script committed"
            );
            Ok(ExecutionResult::committed(duration))
        }
        Err(err) => {
            let rolled_back = session
                .release()
                .map_err(SchemaCheckError::connectivity("roll back change script"))?;
            warn!(script = %&digest[..12], rolled_back, error = %err, "change script rolled back");
            settle(started, timeout, &digest, "execute change script", err)
        }
    }
}

/// Map a failure that happened inside the session to a result or error.
fn settle(
    started: Instant,
    budget: Duration,
    digest: &str,
    operation: &'static str,
    err: rusqlite::Error,
) -> Result<ExecutionResult> {
    let elapsed = started.elapsed();
    match classify(&err, elapsed >= budget) {
        FailureClass::Timeout => {
            warn!(
                script = %&digest[..12],
                budget_ms = duration_ms(budget),
                elapsed_ms = duration_ms(elapsed),
                "change script timed out"
            );
            Ok(ExecutionResult::rolled_back(
                elapsed,
                ExecutionFailure::Timeout { budget },
            ))
        }
        FailureClass::Script => Ok(ExecutionResult::rolled_back(
            elapsed,
            ExecutionFailure::Script {
                message: err.to_string(),
            },
        )),
        FailureClass::Connectivity => {
            error!(script = %&digest[..12], error = %err, "{operation} failed");
            Err(SchemaCheckError::connectivity(operation)(err))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    Timeout,
    Script,
    Connectivity,
}

fn classify(err: &rusqlite::Error, deadline_passed: bool) -> FailureClass {
    let code = match err {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    };
    match code {
        Some(ErrorCode::OperationInterrupted) => FailureClass::Timeout,
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) if deadline_passed => {
            FailureClass::Timeout
        }
        Some(
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::SystemIoFailure
            | ErrorCode::PermissionDenied,
        ) => FailureClass::Connectivity,
        _ => FailureClass::Script,
    }
}

/// Whitespace and bare semicolons only.
fn is_blank(script: &str) -> bool {
    script
        .chars()
        .all(|c| c.is_whitespace() || c == ';')
}

fn deny_transaction_control(ctx: AuthContext<'_>) -> Authorization {
    match ctx.action {
        AuthAction::Transaction { .. } => Authorization::Deny,
        _ => Authorization::Allow,
    }
}

fn clear_authorizer(conn: &Connection) {
    conn.authorizer(None::<fn(AuthContext<'_>) -> Authorization>);
}

/// An open change transaction with its deadline hooks installed.
struct ScriptSession<'c> {
    conn: &'c Connection,
    /// Hooks are installed.
    armed: bool,
    /// `BEGIN` succeeded, so any open transaction is ours to roll back.
    owns_transaction: bool,
}

impl<'c> ScriptSession<'c> {
    fn begin(conn: &'c Connection, deadline: Instant, budget: Duration) -> rusqlite::Result<Self> {
        conn.busy_timeout(budget)?;
        conn.progress_handler(PROGRESS_CHECK_OPS, Some(move || Instant::now() >= deadline));
        let mut session = Self {
            conn,
            armed: true,
            owns_transaction: false,
        };
        conn.execute_batch("BEGIN IMMEDIATE")?;
        session.owns_transaction = true;
        conn.authorizer(Some(deny_transaction_control));
        Ok(session)
    }

    fn run(&self, script: &str) -> rusqlite::Result<()> {
        let outcome = self.conn.execute_batch(script);
        clear_authorizer(self.conn);
        outcome?;
        self.conn.execute_batch("COMMIT")
    }

    /// Clear the hooks and roll back anything still open. Returns whether a
    /// rollback was issued. Idempotent.
    fn release(&mut self) -> rusqlite::Result<bool> {
        if !self.armed {
            return Ok(false);
        }
        self.armed = false;
        clear_authorizer(self.conn);
        self.conn.progress_handler(0, None::<fn() -> bool>);
        let rolled_back = if !self.owns_transaction || self.conn.is_autocommit() {
            false
        } else {
            self.conn.execute_batch("ROLLBACK")?;
            true
        };
        self.conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(rolled_back)
    }
}

impl Drop for ScriptSession<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            error!(error = %err, "failed to release change session");
        }
    }
}
