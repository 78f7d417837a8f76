//! Normalized structural snapshot of one schema namespace and its fingerprint.
//!
//! Every list is sorted by its full tuple before the snapshot is sealed, so the
//! order in which the catalog returned rows never reaches the canonical
//! encoding. The encoding is length-prefixed (`<len>:<bytes>|`) with one record
//! per line and a fixed tag per record kind:
//!
//! ```text
//! schemacheck.snapshot.v1
//! T|7:widgets|
//! C|7:widgets|2:id|7:INTEGER|1:0|
//! I|9:idx_owner|7:widgets|43:CREATE INDEX idx_owner ON widgets(owner_id)|
//! F|7:widgets|8:owner_id|6:owners|2:id|
//! R|7:widgets|1:3|
//! ```
//!
//! The namespace name and capture time are not part of the encoding:
//! two databases with identical structure fingerprint identically.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Header line of the canonical encoding. Bump when the record layout changes.
pub const SNAPSHOT_ENCODING_V1: &str = "schemacheck.snapshot.v1";

/// One column of a base table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColumnEntry {
    pub table: String,
    pub column: String,
    /// Declared type as written in the DDL (may be empty).
    pub declared_type: String,
    pub nullable: bool,
}

impl ColumnEntry {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        declared_type: impl Into<String>,
        nullable: bool,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            declared_type: declared_type.into(),
            nullable,
        }
    }
}

impl fmt::Display for ColumnEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let null = if self.nullable { "NULL" } else { "NOT NULL" };
        if self.declared_type.is_empty() {
            write!(f, "{}.{} {null}", self.table, self.column)
        } else {
            write!(
                f,
                "{}.{} {} {null}",
                self.table, self.column, self.declared_type
            )
        }
    }
}

/// One index with its definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexEntry {
    pub name: String,
    pub table: String,
    pub definition: String,
}

impl IndexEntry {
    pub fn new(
        name: impl Into<String>,
        table: impl Into<String>,
        definition: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            definition: definition.into(),
        }
    }
}

impl fmt::Display for IndexEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {} [{}]", self.name, self.table, self.definition)
    }
}

/// A foreign key resolved to a single child/parent column pair.
///
/// Composite keys produce one entry per column pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKeyEntry {
    pub child_table: String,
    pub child_column: String,
    pub parent_table: String,
    pub parent_column: String,
}

impl ForeignKeyEntry {
    pub fn new(
        child_table: impl Into<String>,
        child_column: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            child_table: child_table.into(),
            child_column: child_column.into(),
            parent_table: parent_table.into(),
            parent_column: parent_column.into(),
        }
    }
}

impl fmt::Display for ForeignKeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.child_table, self.child_column, self.parent_table, self.parent_column
        )
    }
}

/// Row-level statistic observed for a table.
///
/// `Unavailable` is distinct from `Rows(0)`: it means the engine could not
/// report a value, not that the table is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStats {
    Unavailable,
    Rows(u64),
}

impl fmt::Display for RowStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => f.write_str("unavailable"),
            Self::Rows(rows) => write!(f, "{rows} rows"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// SHA-256 over the canonical snapshot encoding.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0_u8; 32];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        crate::hex_encode(&self.0)
    }

    /// Parse 64 hex characters (either case).
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0_u8; 32];
        for (slot, pair) in bytes.iter_mut().zip(hex.as_bytes().chunks_exact(2)) {
            let pair = std::str::from_utf8(pair).ok()?;
            *slot = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom("fingerprint must be 64 hex characters"))
    }
}

// ---------------------------------------------------------------------------
// CatalogSnapshot
// ---------------------------------------------------------------------------

/// Immutable structural capture of one schema namespace.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogSnapshot {
    schema: String,
    captured_unix_ms: u64,
    tables: Vec<String>,
    columns: Vec<ColumnEntry>,
    indexes: Vec<IndexEntry>,
    foreign_keys: Vec<ForeignKeyEntry>,
    row_stats: BTreeMap<String, RowStats>,
    fingerprint: Fingerprint,
}

impl CatalogSnapshot {
    /// Normalize the captured lists and seal the snapshot.
    pub fn new(
        schema: impl Into<String>,
        captured_unix_ms: u64,
        mut tables: Vec<String>,
        mut columns: Vec<ColumnEntry>,
        mut indexes: Vec<IndexEntry>,
        mut foreign_keys: Vec<ForeignKeyEntry>,
        row_stats: BTreeMap<String, RowStats>,
    ) -> Self {
        tables.sort_unstable();
        tables.dedup();
        columns.sort_unstable();
        columns.dedup();
        indexes.sort_unstable();
        indexes.dedup();
        foreign_keys.sort_unstable();
        foreign_keys.dedup();

        let fingerprint = Fingerprint::of(&encode(
            &tables,
            &columns,
            &indexes,
            &foreign_keys,
            &row_stats,
        ));

        Self {
            schema: schema.into(),
            captured_unix_ms,
            tables,
            columns,
            indexes,
            foreign_keys,
            row_stats,
            fingerprint,
        }
    }

    /// A snapshot of a namespace with no user objects.
    pub fn empty(schema: impl Into<String>, captured_unix_ms: u64) -> Self {
        Self::new(
            schema,
            captured_unix_ms,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            BTreeMap::new(),
        )
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub const fn captured_unix_ms(&self) -> u64 {
        self.captured_unix_ms
    }

    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn columns(&self) -> &[ColumnEntry] {
        &self.columns
    }

    pub fn indexes(&self) -> &[IndexEntry] {
        &self.indexes
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyEntry] {
        &self.foreign_keys
    }

    pub const fn row_stats(&self) -> &BTreeMap<String, RowStats> {
        &self.row_stats
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.indexes.is_empty()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables
            .binary_search_by(|candidate| candidate.as_str().cmp(table))
            .is_ok()
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|index| index.name == name)
    }

    pub fn has_foreign_key(&self, fk: &ForeignKeyEntry) -> bool {
        self.foreign_keys.binary_search(fk).is_ok()
    }

    pub fn columns_of<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ColumnEntry> + 'a {
        self.columns.iter().filter(move |column| column.table == table)
    }

    /// Equality is decided by fingerprint only.
    pub fn same_state_as(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }

    /// The exact bytes the fingerprint is computed over.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        encode(
            &self.tables,
            &self.columns,
            &self.indexes,
            &self.foreign_keys,
            &self.row_stats,
        )
    }

    /// Itemized structural difference from `self` (before) to `after`.
    pub fn diff(&self, after: &Self) -> SnapshotDiff {
        let before_tables: BTreeSet<&String> = self.tables.iter().collect();
        let after_tables: BTreeSet<&String> = after.tables.iter().collect();

        let row_stats_changed = before_tables
            .intersection(&after_tables)
            .filter_map(|table| {
                let before_stats = self.row_stats.get(*table).copied();
                let after_stats = after.row_stats.get(*table).copied();
                (before_stats != after_stats).then(|| RowStatsChange {
                    table: (*table).clone(),
                    before: before_stats,
                    after: after_stats,
                })
            })
            .collect();

        SnapshotDiff {
            tables_added: missing_from(&after.tables, &self.tables),
            tables_removed: missing_from(&self.tables, &after.tables),
            columns_added: missing_from(&after.columns, &self.columns),
            columns_removed: missing_from(&self.columns, &after.columns),
            indexes_added: missing_from(&after.indexes, &self.indexes),
            indexes_removed: missing_from(&self.indexes, &after.indexes),
            foreign_keys_added: missing_from(&after.foreign_keys, &self.foreign_keys),
            foreign_keys_removed: missing_from(&self.foreign_keys, &after.foreign_keys),
            row_stats_changed,
        }
    }
}

/// Items of sorted `left` that are absent from sorted `right`.
fn missing_from<T: Ord + Clone>(left: &[T], right: &[T]) -> Vec<T> {
    left.iter()
        .filter(|item| right.binary_search(item).is_err())
        .cloned()
        .collect()
}

fn push_field(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(value.as_bytes());
    out.push(b'|');
}

fn push_record(out: &mut Vec<u8>, tag: u8, fields: &[&str]) {
    out.push(tag);
    out.push(b'|');
    for field in fields {
        push_field(out, field);
    }
    out.push(b'\n');
}

fn encode(
    tables: &[String],
    columns: &[ColumnEntry],
    indexes: &[IndexEntry],
    foreign_keys: &[ForeignKeyEntry],
    row_stats: &BTreeMap<String, RowStats>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 * (1 + tables.len() + columns.len()));
    out.extend_from_slice(SNAPSHOT_ENCODING_V1.as_bytes());
    out.push(b'\n');

    for table in tables {
        push_record(&mut out, b'T', &[table]);
    }
    for column in columns {
        push_record(
            &mut out,
            b'C',
            &[
                &column.table,
                &column.column,
                &column.declared_type,
                if column.nullable { "1" } else { "0" },
            ],
        );
    }
    for index in indexes {
        push_record(&mut out, b'I', &[&index.name, &index.table, &index.definition]);
    }
    for fk in foreign_keys {
        push_record(
            &mut out,
            b'F',
            &[
                &fk.child_table,
                &fk.child_column,
                &fk.parent_table,
                &fk.parent_column,
            ],
        );
    }
    for (table, stats) in row_stats {
        let value = match stats {
            RowStats::Unavailable => "-".to_owned(),
            RowStats::Rows(rows) => rows.to_string(),
        };
        push_record(&mut out, b'R', &[table, &value]);
    }
    out
}

// ---------------------------------------------------------------------------
// SnapshotDiff
// ---------------------------------------------------------------------------

/// A table whose row statistic differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowStatsChange {
    pub table: String,
    pub before: Option<RowStats>,
    pub after: Option<RowStats>,
}

/// Itemized structural difference between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub tables_added: Vec<String>,
    pub tables_removed: Vec<String>,
    pub columns_added: Vec<ColumnEntry>,
    pub columns_removed: Vec<ColumnEntry>,
    pub indexes_added: Vec<IndexEntry>,
    pub indexes_removed: Vec<IndexEntry>,
    pub foreign_keys_added: Vec<ForeignKeyEntry>,
    pub foreign_keys_removed: Vec<ForeignKeyEntry>,
    pub row_stats_changed: Vec<RowStatsChange>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.tables_added.is_empty()
            && self.tables_removed.is_empty()
            && self.columns_added.is_empty()
            && self.columns_removed.is_empty()
            && self.indexes_added.is_empty()
            && self.indexes_removed.is_empty()
            && self.foreign_keys_added.is_empty()
            && self.foreign_keys_removed.is_empty()
            && self.row_stats_changed.is_empty()
    }

    /// Unified-diff style rendering, one object per line.
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.extend(self.tables_removed.iter().map(|t| format!("- table {t}")));
        lines.extend(self.tables_added.iter().map(|t| format!("+ table {t}")));
        lines.extend(self.columns_removed.iter().map(|c| format!("- column {c}")));
        lines.extend(self.columns_added.iter().map(|c| format!("+ column {c}")));
        lines.extend(self.indexes_removed.iter().map(|i| format!("- index {i}")));
        lines.extend(self.indexes_added.iter().map(|i| format!("+ index {i}")));
        lines.extend(
            self.foreign_keys_removed
                .iter()
                .map(|fk| format!("- foreign key {fk}")),
        );
        lines.extend(
            self.foreign_keys_added
                .iter()
                .map(|fk| format!("+ foreign key {fk}")),
        );
        for change in &self.row_stats_changed {
            lines.push(format!(
                "~ rows {}: {} -> {}",
                change.table,
                change.before.map_or_else(|| "absent".to_owned(), |s| s.to_string()),
                change.after.map_or_else(|| "absent".to_owned(), |s| s.to_string()),
            ));
        }
        if lines.is_empty() {
            "(no structural changes)".to_owned()
        } else {
            lines.join("\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn widgets_snapshot(order_reversed: bool) -> CatalogSnapshot {
        let mut columns = vec![
            ColumnEntry::new("owners", "id", "INTEGER", true),
            ColumnEntry::new("widgets", "id", "INTEGER", true),
            ColumnEntry::new("widgets", "name", "TEXT", false),
            ColumnEntry::new("widgets", "owner_id", "INTEGER", true),
        ];
        let mut tables = vec!["owners".to_owned(), "widgets".to_owned()];
        if order_reversed {
            columns.reverse();
            tables.reverse();
        }
        let mut row_stats = BTreeMap::new();
        row_stats.insert("widgets".to_owned(), RowStats::Rows(0));
        row_stats.insert("owners".to_owned(), RowStats::Rows(2));
        CatalogSnapshot::new(
            "main",
            if order_reversed { 10 } else { 99 },
            tables,
            columns,
            vec![IndexEntry::new(
                "idx_widgets_owner",
                "widgets",
                "CREATE INDEX idx_widgets_owner ON widgets(owner_id)",
            )],
            vec![ForeignKeyEntry::new("widgets", "owner_id", "owners", "id")],
            row_stats,
        )
    }

    #[test]
    fn fingerprint_ignores_capture_order_and_time() {
        let a = widgets_snapshot(false);
        let b = widgets_snapshot(true);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.canonical_bytes(), b.canonical_bytes());
        assert!(a.same_state_as(&b));
        assert!(a.diff(&b).is_empty());
    }

    #[test]
    fn empty_snapshot_is_valid_and_stable() {
        let a = CatalogSnapshot::empty("main", 1);
        let b = CatalogSnapshot::empty("other", 2);
        assert!(a.is_empty());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), widgets_snapshot(false).fingerprint());
    }

    #[test]
    fn unavailable_stats_differ_from_zero_rows() {
        let mut zero = BTreeMap::new();
        zero.insert("t".to_owned(), RowStats::Rows(0));
        let mut unknown = BTreeMap::new();
        unknown.insert("t".to_owned(), RowStats::Unavailable);
        let tables = vec!["t".to_owned()];
        let a = CatalogSnapshot::new("main", 0, tables.clone(), vec![], vec![], vec![], zero);
        let b = CatalogSnapshot::new("main", 0, tables, vec![], vec![], vec![], unknown);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn length_prefix_prevents_field_smearing() {
        let a = CatalogSnapshot::new(
            "main",
            0,
            vec![],
            vec![],
            vec![IndexEntry::new("a|b", "c", "")],
            vec![],
            BTreeMap::new(),
        );
        let b = CatalogSnapshot::new(
            "main",
            0,
            vec![],
            vec![],
            vec![IndexEntry::new("a", "b|c", "")],
            vec![],
            BTreeMap::new(),
        );
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn diff_itemizes_every_change() {
        let before = CatalogSnapshot::new(
            "main",
            0,
            vec!["owners".to_owned()],
            vec![ColumnEntry::new("owners", "id", "INTEGER", true)],
            vec![],
            vec![],
            BTreeMap::from([("owners".to_owned(), RowStats::Rows(1))]),
        );
        let after = widgets_snapshot(false);
        let diff = before.diff(&after);
        assert_eq!(diff.tables_added, vec!["widgets".to_owned()]);
        assert!(diff.tables_removed.is_empty());
        assert_eq!(diff.columns_added.len(), 3);
        assert_eq!(diff.indexes_added.len(), 1);
        assert_eq!(
            diff.foreign_keys_added,
            vec![ForeignKeyEntry::new("widgets", "owner_id", "owners", "id")]
        );
        assert_eq!(diff.row_stats_changed.len(), 1);
        assert_eq!(diff.row_stats_changed[0].table, "owners");

        let rendered = diff.render();
        assert!(rendered.contains("+ table widgets"), "{rendered}");
        assert!(rendered.contains("+ foreign key widgets.owner_id -> owners.id"));
        assert!(rendered.contains("~ rows owners: 1 rows -> 2 rows"));
    }

    #[test]
    fn fingerprint_hex_round_trip() {
        let fp = widgets_snapshot(false).fingerprint();
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
        assert_eq!(Fingerprint::from_hex(&hex.to_uppercase()), Some(fp));
        assert_eq!(Fingerprint::from_hex("abc"), None);
        assert_eq!(Fingerprint::from_hex(&"zz".repeat(32)), None);

        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{hex}\""));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    proptest! {
        #[test]
        fn fingerprint_is_permutation_invariant(
            names in proptest::collection::btree_set("[a-z]{1,6}", 1..12),
            rotate in 0_usize..12,
        ) {
            let columns: Vec<ColumnEntry> = names
                .iter()
                .map(|name| ColumnEntry::new("t", name.clone(), "TEXT", true))
                .collect();
            let mut shuffled = columns.clone();
            let shift = rotate % shuffled.len();
            shuffled.rotate_left(shift);
            shuffled.reverse();

            let table = vec!["t".to_owned()];
            let a = CatalogSnapshot::new(
                "main", 0, table.clone(), columns, vec![], vec![], BTreeMap::new(),
            );
            let b = CatalogSnapshot::new(
                "main", 1, table, shuffled, vec![], vec![], BTreeMap::new(),
            );
            prop_assert_eq!(a.fingerprint(), b.fingerprint());
        }
    }
}
