use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

// Absent owner and tenant are stored as '' so the partial unique index
// treats them as equal.
const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS definitions (
    base_type TEXT NOT NULL,
    base_name TEXT NOT NULL,
    package_id TEXT,
    package_version TEXT,
    document BLOB NOT NULL,
    checksum BLOB NOT NULL CHECK (length(checksum) = 32),
    updated_at TEXT NOT NULL,
    PRIMARY KEY (base_type, base_name)
);

CREATE TABLE IF NOT EXISTS overlays (
    rowid INTEGER PRIMARY KEY,
    overlay_id BLOB NOT NULL UNIQUE CHECK (length(overlay_id) = 16),
    base_type TEXT NOT NULL,
    base_name TEXT NOT NULL,
    scope TEXT NOT NULL CHECK (scope IN ('platform', 'user')),
    owner TEXT NOT NULL DEFAULT '',
    tenant_id TEXT NOT NULL DEFAULT '',
    package_id TEXT,
    package_version TEXT,
    patch BLOB NOT NULL,
    checksum BLOB NOT NULL CHECK (length(checksum) = 32),
    changes BLOB NOT NULL,
    active INTEGER NOT NULL CHECK (active IN (0, 1)),
    version INTEGER NOT NULL CHECK (version > 0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by TEXT NOT NULL,
    updated_by TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_overlays_active_key
    ON overlays (base_type, base_name, scope, owner, tenant_id) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_overlays_type_scope
    ON overlays (base_type, scope, base_name, owner) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_overlays_history
    ON overlays (base_type, base_name, scope, owner, tenant_id, rowid);
";
