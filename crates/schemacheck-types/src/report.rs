//! Delta verification report.

use serde::{Deserialize, Serialize};

use crate::expectation::ExpectedChange;
use crate::snapshot::{Fingerprint, SnapshotDiff};

/// Whether an object was observed before and after the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub before: bool,
    pub after: bool,
}

impl Presence {
    fn describe(self) -> &'static str {
        match (self.before, self.after) {
            (false, false) => "absent before and after",
            (false, true) => "absent before, present after",
            (true, false) => "present before, absent after",
            (true, true) => "present before and after",
        }
    }
}

/// Outcome of one expectation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub expectation: ExpectedChange,
    pub observed: Presence,
    pub satisfied: bool,
    /// Expected vs observed, one line.
    pub detail: String,
}

impl CheckOutcome {
    /// An appearing object must be absent before and present after; a
    /// disappearing object the reverse. A pre-existing "appearing" object is a
    /// failure, not a skip.
    pub fn evaluate(expectation: ExpectedChange, observed: Presence) -> Self {
        let expected = if expectation.expects_presence_after() {
            Presence {
                before: false,
                after: true,
            }
        } else {
            Presence {
                before: true,
                after: false,
            }
        };
        let satisfied = observed == expected;
        let detail = if satisfied {
            format!("{}: {}", expectation.object_label(), observed.describe())
        } else {
            format!(
                "{}: expected {}, observed {}",
                expectation.object_label(),
                expected.describe(),
                observed.describe()
            )
        };
        Self {
            expectation,
            observed,
            satisfied,
            detail,
        }
    }
}

/// Itemized result of comparing an expectation to a before/after pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub before_fingerprint: Fingerprint,
    pub after_fingerprint: Fingerprint,
    pub checks: Vec<CheckOutcome>,
    pub structural_diff: SnapshotDiff,
}

impl VerificationReport {
    /// True iff every individual check is satisfied. No partial credit.
    pub fn satisfied(&self) -> bool {
        self.checks.iter().all(|check| check.satisfied)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|check| !check.satisfied)
    }

    pub fn schema_changed(&self) -> bool {
        self.before_fingerprint != self.after_fingerprint
    }

    pub fn triage_line(&self) -> String {
        let failed = self.failures().count();
        if failed == 0 {
            format!(
                "PASS: {} checks satisfied, fingerprint {} -> {}",
                self.checks.len(),
                self.before_fingerprint.short(),
                self.after_fingerprint.short(),
            )
        } else {
            format!(
                "FAIL: {failed} of {} checks unsatisfied, fingerprint {} -> {}",
                self.checks.len(),
                self.before_fingerprint.short(),
                self.after_fingerprint.short(),
            )
        }
    }

    /// Every check with its verdict followed by the observed structural diff.
    pub fn render_diff(&self) -> String {
        let mut out = self.triage_line();
        out.push('\n');
        for check in &self.checks {
            let mark = if check.satisfied { "ok  " } else { "FAIL" };
            out.push_str(&format!("[{mark}] {}\n", check.detail));
        }
        out.push_str("observed changes:\n");
        out.push_str(&self.structural_diff.render());
        out
    }
}
