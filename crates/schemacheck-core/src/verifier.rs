//! Delta verification: expected structural change vs. a before/after pair.

use schemacheck_types::{
    CatalogSnapshot, ChangeExpectation, CheckOutcome, ExpectedChange, Presence,
    VerificationReport,
};
use tracing::{debug, info, warn};

fn presence_in(snapshot: &CatalogSnapshot, item: &ExpectedChange) -> bool {
    match item {
        ExpectedChange::TableAppears(table) | ExpectedChange::TableDisappears(table) => {
            snapshot.has_table(table)
        }
        ExpectedChange::ForeignKeyAppears(fk) | ExpectedChange::ForeignKeyDisappears(fk) => {
            snapshot.has_foreign_key(fk)
        }
        ExpectedChange::IndexAppears(index) | ExpectedChange::IndexDisappears(index) => {
            snapshot.has_index(index)
        }
    }
}

/// Check every expectation item against `before` and `after`.
///
/// Every item is evaluated; a mismatch never stops the remaining checks. The
/// report always carries the full structural diff so an unsatisfied check
/// can be read against what actually changed.
pub fn verify(
    before: &CatalogSnapshot,
    after: &CatalogSnapshot,
    expectation: &ChangeExpectation,
) -> VerificationReport {
    let checks: Vec<CheckOutcome> = expectation
        .items()
        .into_iter()
        .map(|item| {
            let observed = Presence {
                before: presence_in(before, &item),
                after: presence_in(after, &item),
            };
            let outcome = CheckOutcome::evaluate(item, observed);
            debug!(satisfied = outcome.satisfied, detail = %outcome.detail, "expectation checked");
            outcome
        })
        .collect();

    let report = VerificationReport {
        before_fingerprint: before.fingerprint(),
        after_fingerprint: after.fingerprint(),
        checks,
        structural_diff: before.diff(after),
    };

    if report.satisfied() {
        info!(schema = after.schema(), checks = report.checks.len(), "{}", report.triage_line());
    } else {
        warn!(
            schema = after.schema(),
            failed = report.failures().count(),
            "{}",
            report.triage_line()
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use schemacheck_types::{ColumnEntry, ForeignKeyEntry, IndexEntry};

    fn snapshot(
        tables: &[&str],
        fks: Vec<ForeignKeyEntry>,
        indexes: &[(&str, &str)],
    ) -> CatalogSnapshot {
        CatalogSnapshot::new(
            "main",
            0,
            tables.iter().map(|t| (*t).to_owned()).collect(),
            tables
                .iter()
                .map(|t| ColumnEntry::new(*t, "id", "INTEGER", true))
                .collect(),
            indexes
                .iter()
                .map(|(name, table)| {
                    IndexEntry::new(*name, *table, format!("CREATE INDEX {name}"))
                })
                .collect(),
            fks,
            BTreeMap::new(),
        )
    }

    fn widget_fk() -> ForeignKeyEntry {
        ForeignKeyEntry::new("widgets", "owner_id", "owners", "id")
    }

    #[test]
    fn satisfied_when_every_object_moves_as_expected() {
        let before = snapshot(&["legacy", "owners"], vec![], &[("legacy_idx", "legacy")]);
        let after = snapshot(
            &["owners", "widgets"],
            vec![widget_fk()],
            &[("widgets_owner", "widgets")],
        );
        let expectation = ChangeExpectation::new()
            .table_appears("widgets")
            .table_disappears("legacy")
            .fk_appears(widget_fk())
            .index_appears("widgets_owner")
            .index_disappears("legacy_idx");

        let report = verify(&before, &after, &expectation);
        assert!(report.satisfied(), "{}", report.render_diff());
        assert_eq!(report.checks.len(), 5);
        assert!(report.schema_changed());
        assert_eq!(report.structural_diff.tables_added, vec!["widgets".to_owned()]);
    }

    #[test]
    fn pre_existing_table_fails_instead_of_skipping() {
        let before = snapshot(&["widgets"], vec![], &[]);
        let after = snapshot(&["widgets"], vec![], &[]);
        let report = verify(&before, &after, &ChangeExpectation::new().table_appears("widgets"));
        assert!(!report.satisfied());
        assert!(!report.schema_changed());
        assert!(report.checks[0].detail.contains("present before and after"));
    }

    #[test]
    fn every_mismatch_is_reported() {
        let before = snapshot(&[], vec![], &[]);
        let after = snapshot(&[], vec![], &[]);
        let expectation = ChangeExpectation::new()
            .table_appears("a")
            .table_appears("b")
            .fk_disappears(widget_fk())
            .index_appears("idx");
        let report = verify(&before, &after, &expectation);
        assert_eq!(report.failures().count(), 4);
        let rendered = report.render_diff();
        assert!(rendered.starts_with("FAIL: 4 of 4"), "{rendered}");
        assert!(rendered.contains("[FAIL] table a"));
        assert!(rendered.contains("(no structural changes)"));
    }

    #[test]
    fn empty_expectation_is_trivially_satisfied() {
        let before = snapshot(&[], vec![], &[]);
        let after = snapshot(&["surprise"], vec![], &[]);
        let report = verify(&before, &after, &ChangeExpectation::new());
        assert!(report.satisfied());
        assert!(report.schema_changed());
        assert!(report.render_diff().contains("+ table surprise"));
    }
}
