//! Catalog snapshot capture over SQLite's schema table and pragma functions.
//!
//! Table names are never interpolated into SQL text unless they were first
//! read back from the catalog itself. Per-table metadata comes from the
//! table-valued pragma functions with bound parameters:
//!
//! ```text
//! pragma_database_list                 -> namespace allow-list
//! "<schema>".sqlite_master             -> tables + stored index SQL
//! pragma_table_info(?1, ?2)            -> columns
//! pragma_index_info(?1, ?2)            -> automatic index columns
//! pragma_foreign_key_list(?1, ?2)      -> foreign keys
//! SELECT count(*) FROM "<s>"."<t>"     -> row statistic (allow-listed idents)
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::SystemTime;

use rusqlite::{Connection, params};
use schemacheck_error::{Result, SchemaCheckError};
use schemacheck_types::{
    CatalogSnapshot, ColumnEntry, ForeignKeyEntry, IndexEntry, RowStats, unix_ms,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::tracking::TRACKING_TABLES;

const CAPTURE_OP: &str = "catalog capture";

/// How the row-level statistic is collected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatsMode {
    /// `count(*)` per table.
    #[default]
    Exact,
    /// Every table recorded as [`RowStats::Unavailable`].
    Disabled,
}

/// What to capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Database name as listed by `pragma_database_list`.
    pub schema: String,
    pub row_stats: RowStatsMode,
    /// Tables left out of the snapshot in addition to `sqlite_%` internals.
    pub excluded_tables: BTreeSet<String>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            schema: "main".to_owned(),
            row_stats: RowStatsMode::Exact,
            excluded_tables: TRACKING_TABLES.iter().map(|t| (*t).to_owned()).collect(),
        }
    }
}

impl CaptureOptions {
    pub fn for_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Self::default()
        }
    }

    pub const fn row_stats(mut self, mode: RowStatsMode) -> Self {
        self.row_stats = mode;
        self
    }

    pub fn exclude(mut self, table: impl Into<String>) -> Self {
        self.excluded_tables.insert(table.into());
        self
    }

    pub fn is_excluded(&self, table: &str) -> bool {
        table.starts_with("sqlite_") || self.excluded_tables.contains(table)
    }
}

// ---------------------------------------------------------------------------
// Allow-listed identifiers
// ---------------------------------------------------------------------------

/// An identifier that was read back from the catalog. Only
/// [`CatalogAllowList`] can construct one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SqlIdent(String);

impl SqlIdent {
    fn from_catalog(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(SchemaCheckError::InvalidIdentifier {
                name: name.to_owned(),
                reason: "empty identifier".to_owned(),
            });
        }
        if name.chars().any(char::is_control) {
            return Err(SchemaCheckError::InvalidIdentifier {
                name: name.escape_debug().to_string(),
                reason: "control characters are not allowed".to_owned(),
            });
        }
        Ok(Self(name.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted with embedded quotes doubled.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }
}

impl fmt::Display for SqlIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.quoted())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Ordinary,
    Virtual,
}

#[derive(Debug, Clone)]
struct AllowedTable {
    ident: SqlIdent,
    kind: TableKind,
}

/// The namespace and table names the catalog reports right now.
#[derive(Debug, Clone)]
pub struct CatalogAllowList {
    schema: SqlIdent,
    tables: BTreeMap<String, AllowedTable>,
}

impl CatalogAllowList {
    /// Fails with `InvalidIdentifier` if `schema` is not an attached database.
    pub fn load(conn: &Connection, schema: &str) -> Result<Self> {
        let known =
            attached_databases(conn).map_err(SchemaCheckError::connectivity(CAPTURE_OP))?;
        if !known.iter().any(|name| name == schema) {
            return Err(SchemaCheckError::InvalidIdentifier {
                name: schema.to_owned(),
                reason: format!("not an attached database (known: {})", known.join(", ")),
            });
        }
        let schema = SqlIdent::from_catalog(schema)?;

        let rows = read_master(conn, &schema, "table")
            .map_err(SchemaCheckError::connectivity(CAPTURE_OP))?;
        let mut tables = BTreeMap::new();
        for row in rows {
            let kind = match row.sql.as_deref() {
                Some(sql) if is_virtual_table_sql(sql) => TableKind::Virtual,
                _ => TableKind::Ordinary,
            };
            let ident = SqlIdent::from_catalog(&row.name)?;
            tables.insert(row.name, AllowedTable { ident, kind });
        }
        Ok(Self { schema, tables })
    }

    pub const fn schema(&self) -> &SqlIdent {
        &self.schema
    }

    /// Resolve a table name against the catalog.
    pub fn resolve_table(&self, name: &str) -> Result<&SqlIdent> {
        self.tables
            .get(name)
            .map(|table| &table.ident)
            .ok_or_else(|| SchemaCheckError::InvalidIdentifier {
                name: name.to_owned(),
                reason: format!("no such table in schema {}", self.schema.as_str()),
            })
    }

    pub fn kind_of(&self, name: &str) -> Option<TableKind> {
        self.tables.get(name).map(|table| table.kind)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

fn is_virtual_table_sql(sql: &str) -> bool {
    let mut words = sql.split_whitespace();
    matches!(
        (words.next(), words.next()),
        (Some(create), Some(virt))
            if create.eq_ignore_ascii_case("CREATE") && virt.eq_ignore_ascii_case("VIRTUAL")
    )
}

fn attached_databases(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_database_list ORDER BY seq")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

struct MasterRow {
    name: String,
    table: String,
    sql: Option<String>,
}

fn read_master(
    conn: &Connection,
    schema: &SqlIdent,
    object_type: &str,
) -> rusqlite::Result<Vec<MasterRow>> {
    let sql = format!(
        "SELECT name, tbl_name, sql FROM {}.sqlite_master WHERE type = ?1 ORDER BY name",
        schema.quoted()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![object_type], |row| {
            Ok(MasterRow {
                name: row.get(0)?,
                table: row.get(1)?,
                sql: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Capture a sealed snapshot of `options.schema`.
///
/// Fails only when the catalog cannot be read (or the namespace is unknown).
/// An empty schema is a valid snapshot.
pub fn capture(conn: &Connection, options: &CaptureOptions) -> Result<CatalogSnapshot> {
    let allow = CatalogAllowList::load(conn, &options.schema)?;
    let schema = allow.schema().as_str();

    let tables: Vec<String> = allow
        .table_names()
        .filter(|name| !options.is_excluded(name))
        .map(str::to_owned)
        .collect();

    let mut columns = Vec::new();
    let mut foreign_keys = Vec::new();
    for table in &tables {
        columns.extend(
            read_columns(conn, schema, table)
                .map_err(SchemaCheckError::connectivity(CAPTURE_OP))?,
        );
        foreign_keys.extend(
            read_foreign_keys(conn, schema, table)
                .map_err(SchemaCheckError::connectivity(CAPTURE_OP))?,
        );
    }

    let indexes = read_indexes(conn, &allow, options)
        .map_err(SchemaCheckError::connectivity(CAPTURE_OP))?;

    let mut row_stats = BTreeMap::new();
    for table in &tables {
        let stats = match options.row_stats {
            RowStatsMode::Disabled => RowStats::Unavailable,
            RowStatsMode::Exact => count_rows(conn, &allow, table),
        };
        row_stats.insert(table.clone(), stats);
    }

    let snapshot = CatalogSnapshot::new(
        schema,
        unix_ms(SystemTime::now()),
        tables,
        columns,
        indexes,
        foreign_keys,
        row_stats,
    );
    info!(
        schema,
        tables = snapshot.tables().len(),
        columns = snapshot.columns().len(),
        indexes = snapshot.indexes().len(),
        foreign_keys = snapshot.foreign_keys().len(),
        fingerprint = %snapshot.fingerprint().short(),
        "catalog snapshot captured"
    );
    Ok(snapshot)
}

fn read_columns(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> rusqlite::Result<Vec<ColumnEntry>> {
    let mut stmt =
        conn.prepare_cached("SELECT name, type, \"notnull\" FROM pragma_table_info(?1, ?2)")?;
    let columns = stmt
        .query_map(params![table, schema], |row| {
            let not_null: i64 = row.get(2)?;
            Ok(ColumnEntry::new(
                table,
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                not_null == 0,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn primary_key_columns(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT name FROM pragma_table_info(?1, ?2) WHERE pk > 0 ORDER BY pk",
    )?;
    let names = stmt
        .query_map(params![table, schema], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// One entry per column pair. An implicit parent column (`REFERENCES owners`)
/// resolves to the parent's primary key column at the same position, or
/// `rowid` when the parent has no declared key.
fn read_foreign_keys(
    conn: &Connection,
    schema: &str,
    table: &str,
) -> rusqlite::Result<Vec<ForeignKeyEntry>> {
    struct RawFk {
        seq: usize,
        parent: String,
        from: String,
        to: Option<String>,
    }

    let mut stmt = conn.prepare_cached(
        "SELECT seq, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1, ?2)",
    )?;
    let raw = stmt
        .query_map(params![table, schema], |row| {
            Ok(RawFk {
                seq: usize::try_from(row.get::<_, i64>(0)?).unwrap_or(0),
                parent: row.get(1)?,
                from: row.get(2)?,
                to: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut parent_keys: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut entries = Vec::with_capacity(raw.len());
    for fk in raw {
        let parent_column = match fk.to {
            Some(column) => column,
            None => {
                if !parent_keys.contains_key(&fk.parent) {
                    let keys = primary_key_columns(conn, schema, &fk.parent)?;
                    parent_keys.insert(fk.parent.clone(), keys);
                }
                parent_keys
                    .get(&fk.parent)
                    .and_then(|keys| keys.get(fk.seq))
                    .cloned()
                    .unwrap_or_else(|| "rowid".to_owned())
            }
        };
        entries.push(ForeignKeyEntry::new(table, fk.from, fk.parent, parent_column));
    }
    Ok(entries)
}

fn read_indexes(
    conn: &Connection,
    allow: &CatalogAllowList,
    options: &CaptureOptions,
) -> rusqlite::Result<Vec<IndexEntry>> {
    let schema = allow.schema().as_str();
    let mut indexes = Vec::new();
    for row in read_master(conn, allow.schema(), "index")? {
        if options.is_excluded(&row.table) {
            continue;
        }
        let definition = match row.sql {
            Some(sql) => normalize_whitespace(&sql),
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno",
                )?;
                let columns = stmt
                    .query_map(params![row.name, schema], |r| {
                        Ok(r.get::<_, Option<String>>(0)?
                            .unwrap_or_else(|| "<expr>".to_owned()))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                format!("AUTO UNIQUE ({})", columns.join(", "))
            }
        };
        debug!(index = %row.name, table = %row.table, "index captured");
        indexes.push(IndexEntry::new(row.name, row.table, definition));
    }
    Ok(indexes)
}

/// Collapse runs of whitespace so reformatted-but-identical DDL compares equal.
fn normalize_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn count_rows(conn: &Connection, allow: &CatalogAllowList, table: &str) -> RowStats {
    let ident = match allow.resolve_table(table) {
        Ok(ident) => ident,
        Err(err) => {
            warn!(table, error = %err, "row statistic unavailable");
            return RowStats::Unavailable;
        }
    };
    let sql = format!(
        "SELECT count(*) FROM {}.{}",
        allow.schema().quoted(),
        ident.quoted()
    );
    match conn.query_row(&sql, [], |row| row.get::<_, i64>(0)) {
        Ok(rows) => RowStats::Rows(u64::try_from(rows).unwrap_or(0)),
        Err(err) => {
            warn!(
                table,
                kind = ?allow.kind_of(table),
                error = %err,
                "row statistic unavailable"
            );
            RowStats::Unavailable
        }
    }
}
