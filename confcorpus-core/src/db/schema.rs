//! Internal bookkeeping schema and migrations
//!
//! Cached source tables are created on the fly by
//! [`RecordStore::replace_table`](super::RecordStore::replace_table); the only
//! fixed schema is the cache metadata table, versioned via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Name of the cache metadata table (never listed as a corpus table)
pub const CACHE_META_TABLE: &str = "corpus_cache_meta";

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: cache metadata per cached table, with the source and
    // entity kind that filled it
    r#"
    CREATE TABLE IF NOT EXISTS corpus_cache_meta (
        table_name       TEXT PRIMARY KEY,
        row_count        INTEGER NOT NULL,
        content_hash     TEXT NOT NULL,
        refreshed_at     DATETIME NOT NULL,
        source_id        TEXT,
        entity_kind      TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_cache_meta_source ON corpus_cache_meta(source_id);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking cache schema migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_cache_meta_columns() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let columns: Vec<String> = conn
            .prepare("PRAGMA table_info(corpus_cache_meta)")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for expected in [
            "table_name",
            "row_count",
            "content_hash",
            "refreshed_at",
            "source_id",
            "entity_kind",
        ] {
            assert!(
                columns.iter().any(|c| c == expected),
                "column {} should exist",
                expected
            );
        }
    }
}
