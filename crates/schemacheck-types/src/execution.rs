//! Outcome of running one change script.

use std::time::Duration;

use schemacheck_error::SchemaCheckError;
use serde::{Deserialize, Serialize};

use crate::duration_ms;

/// Why a script did not commit. Either way the transaction was rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// A statement failed. Not retried.
    Script { message: String },
    /// The budget elapsed. May be retried with a larger budget.
    Timeout { budget: Duration },
}

impl ExecutionFailure {
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Script { message } => format!("script error: {message}"),
            Self::Timeout { budget } => {
                format!("timed out after {} ms budget", duration_ms(*budget))
            }
        }
    }
}

/// Success flag, wall-clock duration and optional failure. Schema effects are
/// only observable through snapshots taken around the call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub duration: Duration,
    pub failure: Option<ExecutionFailure>,
}

impl ExecutionResult {
    pub const fn committed(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
            failure: None,
        }
    }

    pub const fn rolled_back(duration: Duration, failure: ExecutionFailure) -> Self {
        Self {
            success: false,
            duration,
            failure: Some(failure),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.failure.as_ref().is_some_and(ExecutionFailure::is_timeout)
    }

    /// Escalate a failed execution into the matching typed error.
    pub fn into_result(self) -> Result<Duration, SchemaCheckError> {
        match self.failure {
            None => Ok(self.duration),
            Some(ExecutionFailure::Script { message }) => Err(SchemaCheckError::Script { message }),
            Some(ExecutionFailure::Timeout { budget }) => Err(SchemaCheckError::Timeout {
                budget_ms: duration_ms(budget),
                elapsed_ms: duration_ms(self.duration),
            }),
        }
    }
}
