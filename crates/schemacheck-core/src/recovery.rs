//! Recovery coordination after a failed change script.
//!
//! The coordinator never repairs data on its own. It records the failure,
//! optionally hands it to a caller-supplied [`RemediationHook`] a bounded
//! number of times, and returns an auditable [`RecoveryOutcome`] either way.
//! A failing or panicking hook is logged and reported, never propagated.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::SystemTime;

use schemacheck_error::SchemaCheckError;
use schemacheck_types::{ExecutionResult, RecoveryAction, RecoveryOutcome, text_digest, unix_ms};
use tracing::{info, warn};

use crate::config::RecoveryConfig;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// What the hook knows about the failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryContext {
    pub run_id: String,
    pub script_digest: String,
    /// Caller-defined pointer to a prior good state (backup file, snapshot id).
    pub backup_reference: Option<String>,
}

impl RecoveryContext {
    pub fn new(run_id: impl Into<String>, script: &str) -> Self {
        Self {
            run_id: run_id.into(),
            script_digest: text_digest(script),
            backup_reference: None,
        }
    }

    #[must_use]
    pub fn with_backup(mut self, reference: impl Into<String>) -> Self {
        self.backup_reference = Some(reference.into());
        self
    }
}

/// Caller-supplied remediation, e.g. restoring from `backup_reference`.
/// Returns a short description of what was done.
pub trait RemediationHook: Send + Sync {
    fn remediate(
        &self,
        context: &RecoveryContext,
        failure_reason: &str,
    ) -> Result<String, HookError>;
}

impl<F> RemediationHook for F
where
    F: Fn(&RecoveryContext, &str) -> Result<String, HookError> + Send + Sync,
{
    fn remediate(
        &self,
        context: &RecoveryContext,
        failure_reason: &str,
    ) -> Result<String, HookError> {
        self(context, failure_reason)
    }
}

#[derive(Clone)]
pub struct RecoveryCoordinator {
    enabled: bool,
    max_attempts: u32,
    hook: Option<Arc<dyn RemediationHook>>,
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("enabled", &self.enabled)
            .field("max_attempts", &self.max_attempts)
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl Default for RecoveryCoordinator {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

impl RecoveryCoordinator {
    /// `max_attempts` is clamped to at least one.
    pub fn new(enabled: bool, max_attempts: u32) -> Self {
        Self {
            enabled,
            max_attempts: max_attempts.max(1),
            hook: None,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.enabled, config.max_attempts)
    }

    #[must_use]
    pub fn with_hook(mut self, hook: impl RemediationHook + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Decide and record what to do about a failed run.
    pub fn attempt_recovery(
        &self,
        context: &RecoveryContext,
        failure_reason: &str,
    ) -> RecoveryOutcome {
        let (action, attempts) = match (self.enabled, &self.hook) {
            (false, _) => (RecoveryAction::Disabled, 0),
            (true, None) => (RecoveryAction::AuditOnly, 0),
            (true, Some(hook)) => self.run_hook(hook.as_ref(), context, failure_reason),
        };

        let outcome = RecoveryOutcome {
            run_id: context.run_id.clone(),
            failure_reason: failure_reason.to_owned(),
            action,
            attempts,
            recorded_unix_ms: unix_ms(SystemTime::now()),
        };
        if matches!(outcome.action, RecoveryAction::RemediationFailed { .. }) {
            warn!(
                run_id = %outcome.run_id,
                attempts,
                failure = failure_reason,
                "remediation exhausted every attempt"
            );
        } else {
            info!(
                run_id = %outcome.run_id,
                action = outcome.action.label(),
                attempts,
                failure = failure_reason,
                "recovery decision recorded"
            );
        }
        outcome
    }

    /// [`attempt_recovery`](Self::attempt_recovery) for a failed execution;
    /// `None` when the script committed.
    pub fn recover_if_failed(
        &self,
        context: &RecoveryContext,
        result: &ExecutionResult,
    ) -> Option<RecoveryOutcome> {
        result
            .failure
            .as_ref()
            .map(|failure| self.attempt_recovery(context, &failure.reason()))
    }

    fn run_hook(
        &self,
        hook: &dyn RemediationHook,
        context: &RecoveryContext,
        failure_reason: &str,
    ) -> (RecoveryAction, u32) {
        let mut last_reason = String::new();
        for attempt in 1..=self.max_attempts {
            let result =
                catch_unwind(AssertUnwindSafe(|| hook.remediate(context, failure_reason)));
            let reason = match result {
                Ok(Ok(detail)) => return (RecoveryAction::Remediated { detail }, attempt),
                Ok(Err(err)) => err.to_string(),
                Err(_) => "remediation hook panicked".to_owned(),
            };
            warn!(
                run_id = %context.run_id,
                attempt,
                max_attempts = self.max_attempts,
                "{}",
                SchemaCheckError::RecoveryAttemptFailed {
                    reason: reason.clone()
                }
            );
            last_reason = reason;
        }
        (
            RecoveryAction::RemediationFailed {
                reason: last_reason,
            },
            self.max_attempts,
        )
    }
}
