//! Sqlite ledger schema and migrations.

use rusqlite::Connection;

use super::error::LedgerError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 2;

const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    key TEXT PRIMARY KEY NOT NULL,
    saved_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    digest TEXT,
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_images_recorded_at ON images(recorded_at);
"#;

/// Content-hash lookups for identical images under different keys.
const SCHEMA_V2: &str = r#"
CREATE INDEX IF NOT EXISTS idx_images_digest ON images(digest);
"#;

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, LedgerError> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

/// Create or upgrade the schema. Safe to call on every open.
pub(crate) fn migrate(conn: &Connection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(LedgerError::UnsupportedSchemaVersion {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    if current_version < SCHEMA_VERSION {
        for version in (current_version + 1)..=SCHEMA_VERSION {
            migrate_to_version(conn, version)?;
        }
    }

    Ok(())
}

fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), LedgerError> {
    match version {
        1 => conn.execute_batch(SCHEMA_V1)?,
        2 => conn.execute_batch(SCHEMA_V2)?,
        other => {
            tracing::warn!("No migration defined for ledger schema version {}", other);
        }
    }
    set_schema_version(conn, version)?;
    tracing::debug!("Ledger schema at version {}", version);
    Ok(())
}
