//! Caller-supplied description of the structural delta a script should produce.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::snapshot::ForeignKeyEntry;

/// One expected structural change.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "target", rename_all = "snake_case")]
pub enum ExpectedChange {
    TableAppears(String),
    TableDisappears(String),
    ForeignKeyAppears(ForeignKeyEntry),
    ForeignKeyDisappears(ForeignKeyEntry),
    IndexAppears(String),
    IndexDisappears(String),
}

impl ExpectedChange {
    /// Whether the object must exist after the script (and not before).
    pub const fn expects_presence_after(&self) -> bool {
        matches!(
            self,
            Self::TableAppears(_) | Self::ForeignKeyAppears(_) | Self::IndexAppears(_)
        )
    }

    /// Human label of the object the expectation is about.
    pub fn object_label(&self) -> String {
        match self {
            Self::TableAppears(name) | Self::TableDisappears(name) => format!("table {name}"),
            Self::ForeignKeyAppears(fk) | Self::ForeignKeyDisappears(fk) => {
                format!("foreign key {fk}")
            }
            Self::IndexAppears(name) | Self::IndexDisappears(name) => format!("index {name}"),
        }
    }
}

impl fmt::Display for ExpectedChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.expects_presence_after() {
            "appears"
        } else {
            "disappears"
        };
        write!(f, "{} {verb}", self.object_label())
    }
}

/// Expected structural delta. Used only for comparison, never executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeExpectation {
    pub tables_appearing: BTreeSet<String>,
    pub tables_disappearing: BTreeSet<String>,
    pub foreign_keys_appearing: BTreeSet<ForeignKeyEntry>,
    pub foreign_keys_disappearing: BTreeSet<ForeignKeyEntry>,
    pub indexes_appearing: BTreeSet<String>,
    pub indexes_disappearing: BTreeSet<String>,
}

impl ChangeExpectation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_appears(mut self, table: impl Into<String>) -> Self {
        self.tables_appearing.insert(table.into());
        self
    }

    pub fn table_disappears(mut self, table: impl Into<String>) -> Self {
        self.tables_disappearing.insert(table.into());
        self
    }

    pub fn fk_appears(mut self, fk: ForeignKeyEntry) -> Self {
        self.foreign_keys_appearing.insert(fk);
        self
    }

    pub fn fk_disappears(mut self, fk: ForeignKeyEntry) -> Self {
        self.foreign_keys_disappearing.insert(fk);
        self
    }

    pub fn index_appears(mut self, index: impl Into<String>) -> Self {
        self.indexes_appearing.insert(index.into());
        self
    }

    pub fn index_disappears(mut self, index: impl Into<String>) -> Self {
        self.indexes_disappearing.insert(index.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    /// Every expectation as an individual item, in a fixed order: tables,
    /// foreign keys, indexes; appearing before disappearing; sorted within.
    pub fn items(&self) -> Vec<ExpectedChange> {
        let mut items = Vec::new();
        items.extend(
            self.tables_appearing
                .iter()
                .cloned()
                .map(ExpectedChange::TableAppears),
        );
        items.extend(
            self.tables_disappearing
                .iter()
                .cloned()
                .map(ExpectedChange::TableDisappears),
        );
        items.extend(
            self.foreign_keys_appearing
                .iter()
                .cloned()
                .map(ExpectedChange::ForeignKeyAppears),
        );
        items.extend(
            self.foreign_keys_disappearing
                .iter()
                .cloned()
                .map(ExpectedChange::ForeignKeyDisappears),
        );
        items.extend(
            self.indexes_appearing
                .iter()
                .cloned()
                .map(ExpectedChange::IndexAppears),
        );
        items.extend(
            self.indexes_disappearing
                .iter()
                .cloned()
                .map(ExpectedChange::IndexDisappears),
        );
        items
    }
}
