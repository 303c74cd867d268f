//! Versioned schema migrations for fragment databases.
//!
//! Migrations are tracked in the `meta` table with key `schema_version`.
//! Each migration has a version number and runs exactly once.

use rusqlite::Connection;

use crate::error::{IndexerError, Result};

/// Current schema version. Increment when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Migration function type.
type MigrationFn = fn(&Connection) -> Result<()>;

/// All migrations in order. Index + 1 = version number.
const MIGRATIONS: &[MigrationFn] = &[migration_v1_base_schema, migration_v2_file_state];

/// Runs all pending migrations on the database.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(IndexerError::CorruptFragment(format!(
            "schema version {} is newer than supported ({})",
            current_version, CURRENT_SCHEMA_VERSION
        )));
    }

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as u32;
        if version > current_version {
            migration(conn)?;
            set_schema_version(conn, version)?;
            tracing::debug!("Applied fragment schema migration v{}", version);
        }
    }

    Ok(())
}

/// Gets the current schema version from the database.
pub fn get_schema_version(conn: &Connection) -> Result<u32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();

    match version {
        Some(v) => v.parse().map_err(|_| {
            IndexerError::CorruptFragment(format!("unreadable schema version {:?}", v))
        }),
        None => Ok(0),
    }
}

/// Sets the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [version.to_string()],
    )?;
    Ok(())
}

/// Checks if a column exists in a table.
fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = ?1",
            table
        ),
        [column],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Verifies that the schema matches this binary exactly.
pub fn verify_schema_compatibility(conn: &Connection) -> Result<()> {
    let current = get_schema_version(conn)?;
    if current != CURRENT_SCHEMA_VERSION {
        return Err(IndexerError::CorruptFragment(format!(
            "fragment schema version {} does not match expected {}",
            current, CURRENT_SCHEMA_VERSION
        )));
    }
    Ok(())
}

// ============================================================================
// Migrations
// ============================================================================

/// V1: files, bindings and names.
fn migration_v1_base_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY,
            location TEXT NOT NULL,
            linkage TEXT NOT NULL,
            fingerprint INTEGER NOT NULL,
            timestamp INTEGER NOT NULL,
            significant_macros_json TEXT NOT NULL,
            includes_json TEXT NOT NULL,
            macros_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_files_location ON files(location);

        CREATE TABLE IF NOT EXISTS bindings (
            id INTEGER PRIMARY KEY,
            qualified_name_json TEXT NOT NULL,
            kind_json TEXT NOT NULL,
            linkage TEXT NOT NULL,
            template_json TEXT NOT NULL,
            implicit INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS names (
            id INTEGER PRIMARY KEY,
            file_id INTEGER NOT NULL,
            binding_id INTEGER NOT NULL,
            offset INTEGER NOT NULL,
            length INTEGER NOT NULL,
            role TEXT NOT NULL,
            enclosing_id INTEGER,
            is_read INTEGER NOT NULL DEFAULT 0,
            is_write INTEGER NOT NULL DEFAULT 0,
            qualified INTEGER NOT NULL DEFAULT 0,
            polymorphic INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_names_binding ON names(binding_id);
        CREATE INDEX IF NOT EXISTS idx_names_file ON names(file_id, offset);
        "#,
    )?;
    Ok(())
}

/// V2: per-file indexing state (failed updates).
fn migration_v2_file_state(conn: &Connection) -> Result<()> {
    if !column_exists(conn, "files", "state_json")? {
        conn.execute(
            r#"ALTER TABLE files ADD COLUMN state_json TEXT NOT NULL DEFAULT '{"state":"indexed"}'"#,
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_migrations() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(column_exists(&conn, "files", "state_json").unwrap());
        verify_schema_compatibility(&conn).unwrap();
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_v1_database_is_upgraded() {
        let conn = Connection::open_in_memory().unwrap();
        get_schema_version(&conn).unwrap();
        migration_v1_base_schema(&conn).unwrap();
        set_schema_version(&conn, 1).unwrap();
        assert!(verify_schema_compatibility(&conn).is_err());

        run_migrations(&conn).unwrap();
        assert!(column_exists(&conn, "files", "state_json").unwrap());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        set_schema_version(&conn, CURRENT_SCHEMA_VERSION + 1).unwrap();
        let err = run_migrations(&conn).unwrap_err();
        assert!(err.is_corruption());
    }
}
