//! Record store
//!
//! A thin persistence facade over SQLite. Each cached table holds the flat
//! records of one entity kind from one source; the store does not know what
//! the fields mean. Tables are always rewritten whole by
//! [`RecordStore::replace_table`], inside a single transaction, so readers
//! observe either the old or the new content.
//!
//! Columns carry no declared type unless every value in them is a boolean
//! or a date, so SQLite keeps each value's storage class and a loaded
//! record equals the record that was written.

use super::schema::{self, CACHE_META_TABLE};
use crate::config::{StorageConfig, StorageMode};
use crate::error::{Error, Result};
use crate::types::{Record, Value};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

/// A corpus table and its row count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub name: String,
    pub row_count: i64,
}

/// Bookkeeping written alongside every table replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheInfo {
    pub table_name: String,
    pub row_count: i64,
    /// SHA-256 over the column layout and the JSON-serialized records
    pub content_hash: String,
    pub refreshed_at: DateTime<Utc>,
    pub source_id: Option<String>,
    pub entity_kind: Option<String>,
}

/// Result of [`RecordStore::replace_table`]
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceOutcome {
    pub info: CacheInfo,
    /// False when the table already held identical content and was kept
    pub rewritten: bool,
}

/// Who filled a table, recorded in the cache metadata.
#[derive(Debug, Clone, Copy)]
pub struct TableOwner<'a> {
    pub source_id: &'a str,
    pub entity_kind: &'a str,
}

/// SQLite-backed record store
pub struct RecordStore {
    conn: Mutex<Connection>,
    location: String,
    max_age: Option<chrono::Duration>,
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RecordStore {
    /// Open the store described by `config`
    ///
    /// Any failure to open or migrate the backing file is reported as
    /// [`Error::StorageUnavailable`].
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let (conn, location) = match config.mode {
            StorageMode::Memory => (
                Connection::open_in_memory().map_err(unavailable)?,
                ":memory:".to_string(),
            ),
            StorageMode::Sql => {
                let path = config.cache_path();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        Error::StorageUnavailable(format!(
                            "cannot create {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                let conn = Connection::open(&path).map_err(unavailable)?;
                conn.execute_batch(
                    "
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    ",
                )
                .map_err(unavailable)?;
                (conn, path.display().to_string())
            }
        };

        schema::run_migrations(&conn).map_err(|e| {
            Error::StorageUnavailable(format!("cannot initialize {}: {}", location, e))
        })?;

        tracing::debug!(location = %location, "Opened record store");

        Ok(Self {
            conn: Mutex::new(conn),
            location,
            max_age: config.max_age(),
            table_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&StorageConfig::memory())
    }

    /// Path of the cache file, or `:memory:`
    pub fn location(&self) -> &str {
        &self.location
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::StorageUnavailable("connection lock poisoned".to_string()))
    }

    fn table_lock(&self, name: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .table_locks
            .lock()
            .map_err(|_| Error::StorageUnavailable("table lock map poisoned".to_string()))?;
        Ok(locks.entry(name.to_string()).or_default().clone())
    }

    // ============================================
    // Catalogue
    // ============================================

    /// Whether a physical table with this name exists
    pub fn table_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Whether a view with this name exists
    pub fn view_exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view' AND name = ?1",
            [name],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Number of rows in a table
    pub fn row_count(&self, name: &str) -> Result<i64> {
        validate_table_name(name)?;
        let conn = self.conn()?;
        count_rows(&conn, name)
    }

    /// All corpus tables with their row counts, sorted by name
    ///
    /// SQLite internals and the cache metadata table are not listed.
    pub fn list_tables(&self) -> Result<Vec<TableInfo>> {
        let conn = self.conn()?;
        let names: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name != ?1
                 ORDER BY name",
            )?;
            let rows = stmt.query_map([CACHE_META_TABLE], |r| r.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        names
            .into_iter()
            .map(|name| {
                let row_count = count_rows(&conn, &name)?;
                Ok(TableInfo { name, row_count })
            })
            .collect()
    }

    /// Column names of a table in declaration order; empty if it is missing
    pub fn column_names(&self, name: &str) -> Result<Vec<String>> {
        validate_table_name(name)?;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(1))?;
        let columns = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(columns)
    }

    // ============================================
    // Table content
    // ============================================

    /// Load every record of a table
    ///
    /// A missing or empty table yields an empty list. NULL columns are left
    /// out of the records.
    pub fn load_table(&self, name: &str) -> Result<Vec<Record>> {
        validate_table_name(name)?;
        if !self.table_exists(name)? {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT * FROM {}", quote_ident(name));
        self.run_query(&sql, &[])
    }

    /// Atomically replace a table's content
    ///
    /// Columns are `fields` in order, followed by any other field found in
    /// `records` (sorted). Writers to the same table are serialized. When the
    /// table already holds exactly this content only its cache metadata is
    /// touched.
    pub fn replace_table(
        &self,
        name: &str,
        fields: &[String],
        records: &[Record],
        owner: Option<TableOwner<'_>>,
    ) -> Result<ReplaceOutcome> {
        validate_table_name(name)?;

        let columns = table_columns(fields, records);
        if columns.is_empty() {
            return Err(Error::Malformed(format!("table {} has no columns", name)));
        }
        let column_decls: Vec<Option<&'static str>> = columns
            .iter()
            .map(|c| column_decl(records.iter().filter_map(|r| r.get(c))))
            .collect();
        let content_hash = content_hash(&columns, &column_decls, records)?;
        let refreshed_at = Utc::now();

        let create = format!(
            "CREATE TABLE {} ({})",
            quote_ident(name),
            columns
                .iter()
                .zip(&column_decls)
                .map(|(c, decl)| match decl {
                    Some(decl) => format!("{} {}", quote_ident(c), decl),
                    None => quote_ident(c),
                })
                .collect::<Vec<_>>()
                .join(", ")
        );
        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(name),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let lock = self.table_lock(name)?;
        let _guard = lock
            .lock()
            .map_err(|_| Error::StorageUnavailable(format!("lock on {} poisoned", name)))?;

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let previous_hash: Option<String> = tx
            .query_row(
                "SELECT m.content_hash FROM corpus_cache_meta m
                 JOIN sqlite_master t ON t.type = 'table' AND t.name = m.table_name
                 WHERE m.table_name = ?1",
                [name],
                |r| r.get(0),
            )
            .optional()?;
        let rewritten = previous_hash.as_deref() != Some(content_hash.as_str());

        if rewritten {
            tx.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)), [])?;
            tx.execute(&create, [])?;
            let mut stmt = tx.prepare(&insert)?;
            for record in records {
                let row = columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null));
                stmt.execute(rusqlite::params_from_iter(row))?;
            }
        }
        tx.execute(
            r#"
            INSERT INTO corpus_cache_meta
                (table_name, row_count, content_hash, refreshed_at, source_id, entity_kind)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(table_name) DO UPDATE SET
                row_count = excluded.row_count,
                content_hash = excluded.content_hash,
                refreshed_at = excluded.refreshed_at,
                source_id = excluded.source_id,
                entity_kind = excluded.entity_kind
            "#,
            rusqlite::params![
                name,
                records.len() as i64,
                content_hash,
                refreshed_at.to_rfc3339(),
                owner.map(|o| o.source_id),
                owner.map(|o| o.entity_kind),
            ],
        )?;
        tx.commit()?;

        if rewritten {
            tracing::debug!(
                table = name,
                rows = records.len(),
                columns = columns.len(),
                "Replaced table"
            );
        } else {
            tracing::debug!(table = name, rows = records.len(), "Table content unchanged");
        }

        Ok(ReplaceOutcome {
            info: CacheInfo {
                table_name: name.to_string(),
                row_count: records.len() as i64,
                content_hash,
                refreshed_at,
                source_id: owner.map(|o| o.source_id.to_string()),
                entity_kind: owner.map(|o| o.entity_kind.to_string()),
            },
            rewritten,
        })
    }

    /// Cache metadata of a table, if it was written through this store
    pub fn cache_info(&self, name: &str) -> Result<Option<CacheInfo>> {
        let conn = self.conn()?;
        let info = conn
            .query_row(
                "SELECT table_name, row_count, content_hash, refreshed_at, source_id, entity_kind
                 FROM corpus_cache_meta WHERE table_name = ?1",
                [name],
                |row| {
                    let refreshed: String = row.get(3)?;
                    Ok(CacheInfo {
                        table_name: row.get(0)?,
                        row_count: row.get(1)?,
                        content_hash: row.get(2)?,
                        refreshed_at: DateTime::parse_from_rfc3339(&refreshed)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC),
                        source_id: row.get(4)?,
                        entity_kind: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    /// Staleness policy: the table exists, is non-empty and, when a maximum
    /// age is configured, was refreshed within it.
    pub fn is_cached(&self, name: &str) -> Result<bool> {
        validate_table_name(name)?;
        if !self.table_exists(name)? || self.row_count(name)? == 0 {
            return Ok(false);
        }
        let Some(max_age) = self.max_age else {
            return Ok(true);
        };
        Ok(match self.cache_info(name)? {
            Some(info) => Utc::now().signed_duration_since(info.refreshed_at) <= max_age,
            None => false,
        })
    }

    // ============================================
    // Queries
    // ============================================

    /// Run a read query, binding `params` positionally
    ///
    /// Prepare failures are [`Error::QuerySyntax`], failures while stepping
    /// are [`Error::QueryExecution`].
    pub fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| syntax_error(sql, e))?;

        let columns: Vec<(String, Option<String>)> = stmt
            .columns()
            .iter()
            .map(|c| {
                (
                    c.name().to_string(),
                    c.decl_type().map(|t| t.to_ascii_uppercase()),
                )
            })
            .collect();

        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| execution_error(sql, e))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(|e| execution_error(sql, e))? {
            let mut record = Record::new();
            for (i, (name, decl_type)) in columns.iter().enumerate() {
                let value = row.get_ref(i).map_err(|e| execution_error(sql, e))?;
                let value = from_sql(value, decl_type.as_deref());
                if !value.is_null() {
                    record.set(name, value);
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Execute one internally built DDL statement
    pub fn execute_ddl(&self, sql: &str) -> Result<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(|e| syntax_error(sql, e))?;
        stmt.execute([]).map_err(|e| execution_error(sql, e))?;
        Ok(())
    }
}

// ============================================
// Helpers
// ============================================

/// Reject table names outside `[A-Za-z0-9_]+`.
pub fn validate_table_name(name: &str) -> Result<()> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::InvalidTableName(name.to_string()))
    }
}

/// Double-quote an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn count_rows(conn: &Connection, name: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(name)),
        [],
        |r| r.get(0),
    )?;
    Ok(count)
}

fn table_columns(fields: &[String], records: &[Record]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for field in fields {
        if !columns.contains(field) {
            columns.push(field.clone());
        }
    }
    let extras: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.field_names())
        .filter(|f| !columns.iter().any(|c| c == f))
        .collect();
    columns.extend(extras.into_iter().map(str::to_string));
    columns
}

/// Declared type of a column holding `values`.
///
/// Only columns whose non-null values are all booleans or all dates get a
/// declared type, so those come back as [`Value::Bool`] and [`Value::Date`].
/// Every other column is declared without a type: SQLite then applies no
/// affinity and each value keeps the storage class it was written with.
fn column_decl<'a>(values: impl Iterator<Item = &'a Value>) -> Option<&'static str> {
    let mut decl = None;
    for value in values {
        let this = match value {
            Value::Null => continue,
            Value::Bool(_) => "BOOLEAN",
            Value::Date(_) => "DATE",
            _ => return None,
        };
        match decl {
            None => decl = Some(this),
            Some(seen) if seen == this => {}
            Some(_) => return None,
        }
    }
    decl
}

fn content_hash(
    columns: &[String],
    decls: &[Option<&'static str>],
    records: &[Record],
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(&(columns, decls))?);
    hasher.update(serde_json::to_vec(records)?);
    Ok(hex::encode(hasher.finalize()))
}

fn from_sql(value: ValueRef<'_>, decl_type: Option<&str>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) if decl_type == Some("BOOLEAN") => Value::Bool(i != 0),
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            if decl_type == Some("DATE") {
                if let Ok(d) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
                    return Value::Date(d);
                }
            }
            Value::Text(text.into_owned())
        }
        ValueRef::Blob(bytes) => Value::Text(hex::encode(bytes)),
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Date(d) => ToSqlOutput::Owned(SqlValue::Text(d.format("%Y-%m-%d").to_string())),
        })
    }
}

fn unavailable(e: rusqlite::Error) -> Error {
    Error::StorageUnavailable(e.to_string())
}

fn syntax_error(sql: &str, e: rusqlite::Error) -> Error {
    Error::QuerySyntax {
        query: sql.to_string(),
        message: e.to_string(),
    }
}

fn execution_error(sql: &str, e: rusqlite::Error) -> Error {
    Error::QueryExecution {
        query: sql.to_string(),
        message: e.to_string(),
    }
}
