//! Database schema definitions and migrations.
//!
//! Version history:
//! - 1: legacy layout keyed by file path (`images.file_path` primary key).
//! - 2: content-key identity (`images.content_key` primary key) plus `meta`
//!   and directory-aware `sync_runs`.

use rusqlite::Connection;

use super::error::StateError;

/// Current schema version. Increment when making schema changes.
pub const SCHEMA_VERSION: i32 = 2;

/// Identity scheme written by this build.
pub const IDENTITY_SCHEME: &str = "content-key-sha256-128";

/// Legacy path-keyed layout, kept so tests can build old databases.
#[cfg(test)]
pub(crate) const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    file_path TEXT PRIMARY KEY NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_ms INTEGER NOT NULL
);
"#;

const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS images (
    content_key TEXT PRIMARY KEY NOT NULL,
    file_path TEXT NOT NULL,
    file_name TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    modified_ms INTEGER NOT NULL,
    created_ms INTEGER
);

CREATE INDEX IF NOT EXISTS idx_images_file_path ON images(file_path);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    directory TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    added INTEGER DEFAULT 0,
    removed INTEGER DEFAULT 0,
    failed INTEGER DEFAULT 0,
    interrupted INTEGER DEFAULT 0
);
"#;

pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32, StateError> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(StateError::Schema)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    conn.pragma_update(None, "user_version", version)
        .map_err(StateError::Schema)
}

fn write_identity_scheme(conn: &Connection) -> Result<(), StateError> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES ('identity_scheme', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [IDENTITY_SCHEME],
    )
    .map_err(StateError::Schema)?;
    Ok(())
}

/// Initialize or migrate the database schema. Idempotent.
pub(crate) fn migrate(conn: &Connection) -> Result<(), StateError> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StateError::UnsupportedSchemaVersion {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        conn.execute_batch(SCHEMA_V2).map_err(StateError::Schema)?;
        write_identity_scheme(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
        tracing::debug!("Initialized database schema at version {}", SCHEMA_VERSION);
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        migrate_to_version(conn, version)?;
    }
    Ok(())
}

fn migrate_to_version(conn: &Connection, version: i32) -> Result<(), StateError> {
    match version {
        2 => {
            // Path-keyed rows cannot be re-keyed without re-reading the files,
            // so the legacy snapshot is dropped and the next pass resyncs.
            tracing::warn!(
                "State database uses the legacy path-keyed layout; \
                 discarding it and forcing a one-time full resync"
            );
            conn.execute_batch("DROP TABLE IF EXISTS images; DROP TABLE IF EXISTS sync_runs;")
                .map_err(StateError::Schema)?;
            conn.execute_batch(SCHEMA_V2).map_err(StateError::Schema)?;
            write_identity_scheme(conn)?;
        }
        other => {
            tracing::warn!("No migration defined for schema version {}", other);
        }
    }
    set_schema_version(conn, version)?;
    tracing::info!("Migrated database to schema version {}", version);
    Ok(())
}
