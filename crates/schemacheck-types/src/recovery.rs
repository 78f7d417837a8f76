//! Audit record of a recovery decision after a failed change script.

use serde::{Deserialize, Serialize};

/// What the recovery coordinator did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Recovery is turned off; the failure is recorded and nothing else.
    Disabled,
    /// Enabled but no remediation hook supplied.
    AuditOnly,
    /// The hook reported success.
    Remediated { detail: String },
    /// Every bounded attempt failed.
    RemediationFailed { reason: String },
}

impl RecoveryAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::AuditOnly => "audit_only",
            Self::Remediated { .. } => "remediated",
            Self::RemediationFailed { .. } => "remediation_failed",
        }
    }
}

/// One recovery decision. Produced for every failed run, even when nothing
/// was attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub run_id: String,
    pub failure_reason: String,
    pub action: RecoveryAction,
    /// Number of hook invocations.
    pub attempts: u32,
    pub recorded_unix_ms: u64,
}

impl RecoveryOutcome {
    pub const fn recovered(&self) -> bool {
        matches!(self.action, RecoveryAction::Remediated { .. })
    }
}
