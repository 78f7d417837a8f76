//! Idempotency runs and the verdict aggregated over them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::snapshot::Fingerprint;

/// One application of the script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRun {
    /// 1-based.
    pub iteration: u32,
    pub duration: Duration,
    /// Fingerprint just before the run; `None` when that capture failed.
    #[serde(default)]
    pub fingerprint_before: Option<Fingerprint>,
    /// Fingerprint after the run; `None` when the after-capture failed.
    pub fingerprint: Option<Fingerprint>,
    pub success: bool,
    /// Set by [`IdempotencyVerdict::evaluate`].
    pub changed_state: bool,
    pub error: Option<String>,
}

impl IdempotencyRun {
    pub const fn new(
        iteration: u32,
        duration: Duration,
        fingerprint: Option<Fingerprint>,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self {
            iteration,
            duration,
            fingerprint_before: None,
            fingerprint,
            success,
            changed_state: false,
            error,
        }
    }

    #[must_use]
    pub const fn with_before(mut self, fingerprint_before: Option<Fingerprint>) -> Self {
        self.fingerprint_before = fingerprint_before;
        self
    }
}

/// Aggregate over a sequence of runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyVerdict {
    /// Fingerprint of the pristine state before iteration 1.
    pub baseline: Option<Fingerprint>,
    pub runs: Vec<IdempotencyRun>,
    /// Iterations whose result differs from their predecessor's.
    pub changed_iterations: Vec<u32>,
    /// Iterations that started from a state other than the last one
    /// observed, i.e. something outside the script changed the schema.
    #[serde(default)]
    pub drifted_iterations: Vec<u32>,
    pub idempotent: bool,
}

impl IdempotencyVerdict {
    /// Mark every run that changed state and decide the verdict.
    ///
    /// Iteration 1 is compared against `baseline`; iteration `i > 1` against
    /// the last fingerprint observed before it. A run without a fingerprint
    /// cannot be compared and counts as unchanged (it already fails the
    /// verdict through `success == false`). A comparison against a missing
    /// predecessor counts as a change.
    ///
    /// Idempotent iff there are at least two runs, every run succeeded, and
    /// no run after the first changed state. Drift is reported but does not
    /// decide the verdict on its own.
    pub fn evaluate(baseline: Option<Fingerprint>, mut runs: Vec<IdempotencyRun>) -> Self {
        let mut previous = baseline;
        let mut changed_iterations = Vec::new();
        let mut drifted_iterations = Vec::new();
        for run in &mut runs {
            if run
                .fingerprint_before
                .zip(previous)
                .is_some_and(|(before, last)| before != last)
            {
                drifted_iterations.push(run.iteration);
            }
            if let Some(current) = run.fingerprint {
                run.changed_state = previous != Some(current);
                previous = Some(current);
            } else {
                run.changed_state = false;
            }
            if run.changed_state {
                changed_iterations.push(run.iteration);
            }
        }

        let all_succeeded = runs.iter().all(|run| run.success);
        let only_first_changed = changed_iterations.iter().all(|&iteration| iteration == 1);
        let idempotent = runs.len() >= 2 && all_succeeded && only_first_changed;

        Self {
            baseline,
            runs,
            changed_iterations,
            drifted_iterations,
            idempotent,
        }
    }

    pub fn failed_iterations(&self) -> impl Iterator<Item = &IdempotencyRun> {
        self.runs.iter().filter(|run| !run.success)
    }

    /// Fingerprints of iterations 2..N, in order.
    pub fn repeat_fingerprints(&self) -> Vec<Option<Fingerprint>> {
        self.runs.iter().skip(1).map(|run| run.fingerprint).collect()
    }

    pub fn triage_line(&self) -> String {
        let failed = self.failed_iterations().count();
        let verdict = if self.idempotent { "IDEMPOTENT" } else { "NOT IDEMPOTENT" };
        let mut line = format!(
            "{verdict}: {} iterations, {} changed state {:?}, {failed} failed",
            self.runs.len(),
            self.changed_iterations.len(),
            self.changed_iterations,
        );
        if !self.drifted_iterations.is_empty() {
            line.push_str(&format!(", drift before {:?}", self.drifted_iterations));
        }
        line
    }
}
