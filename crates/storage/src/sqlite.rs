use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use metalayer_core::{
    FieldChange, MetaValue, Overlay, OverlayId, OverlayKey, OverlayScope, Owner, Patch, ScopeKind,
};

use crate::error::StorageError;
use crate::traits::{DefinitionInfo, DefinitionStore, OverlayStore, UpgradeCommit};

const OVERLAY_COLUMNS: &str = "overlay_id, base_type, base_name, scope, owner, tenant_id, \
     package_id, package_version, patch, checksum, changes, active, version, \
     created_at, updated_at, created_by, updated_by, rowid";

const KEY_FILTER: &str =
    "base_type = ?1 AND base_name = ?2 AND scope = ?3 AND owner = ?4 AND tenant_id = ?5";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Corrupt(format!("invalid {label} length")))
}

fn checksum(bytes: &[u8]) -> [u8; 32] {
    *blake3::hash(bytes).as_bytes()
}

fn verify_checksum(bytes: &[u8], stored: Vec<u8>, what: &str) -> Result<(), StorageError> {
    if checksum(bytes) != to_array::<32>(stored, "checksum")? {
        return Err(StorageError::Corrupt(format!("checksum mismatch for {what}")));
    }
    Ok(())
}

fn encode_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

fn to_i64(version: u64) -> Result<i64, StorageError> {
    i64::try_from(version).map_err(|_| StorageError::Serialization(format!("version {version} out of range")))
}

/// Owner and tenant columns for a key.
fn key_columns(key: &OverlayKey) -> (&'static str, &str, &str) {
    (
        key.scope.kind().as_str(),
        key.scope.owner().map(Owner::as_str).unwrap_or(""),
        key.tenant_id.as_deref().unwrap_or(""),
    )
}

pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self { conn })
    }
}

/// Raw column values of one `overlays` row, decoded outside the row closure.
struct OverlayRow {
    overlay_id: Vec<u8>,
    base_type: String,
    base_name: String,
    scope: String,
    owner: String,
    tenant_id: String,
    package_id: Option<String>,
    package_version: Option<String>,
    patch: Vec<u8>,
    checksum: Vec<u8>,
    changes: Vec<u8>,
    active: bool,
    version: i64,
    created_at: String,
    updated_at: String,
    created_by: String,
    updated_by: String,
    rowid: i64,
}

impl OverlayRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            overlay_id: row.get(0)?,
            base_type: row.get(1)?,
            base_name: row.get(2)?,
            scope: row.get(3)?,
            owner: row.get(4)?,
            tenant_id: row.get(5)?,
            package_id: row.get(6)?,
            package_version: row.get(7)?,
            patch: row.get(8)?,
            checksum: row.get(9)?,
            changes: row.get(10)?,
            active: row.get(11)?,
            version: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
            created_by: row.get(15)?,
            updated_by: row.get(16)?,
            rowid: row.get(17)?,
        })
    }

    fn decode(self) -> Result<Overlay, StorageError> {
        let id = OverlayId::from_bytes(to_array::<16>(self.overlay_id, "overlay_id")?);
        verify_checksum(&self.patch, self.checksum, &format!("overlay {id}"))?;
        let patch = Patch::from_msgpack(&self.patch)
            .map_err(|e| StorageError::Corrupt(format!("overlay {id} patch: {e}")))?;
        let changes: Vec<FieldChange> = rmp_serde::from_slice(&self.changes)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let kind = ScopeKind::parse(&self.scope)
            .map_err(|_| StorageError::Corrupt(format!("overlay {id} has scope {:?}", self.scope)))?;
        let scope = match kind {
            ScopeKind::Platform => OverlayScope::Platform,
            ScopeKind::User => OverlayScope::User {
                owner: Owner::new(self.owner)
                    .map_err(|_| StorageError::Corrupt(format!("user overlay {id} has no owner")))?,
            },
        };
        let tenant_id = Some(self.tenant_id).filter(|t| !t.is_empty());
        let version = u64::try_from(self.version)
            .map_err(|_| StorageError::Corrupt(format!("overlay {id} has version {}", self.version)))?;

        Ok(Overlay {
            id,
            key: OverlayKey::new(self.base_type, self.base_name, scope).with_tenant(tenant_id),
            package_id: self.package_id,
            package_version: self.package_version,
            patch,
            changes,
            active: self.active,
            version,
            created_at: decode_time(&self.created_at)?,
            updated_at: decode_time(&self.updated_at)?,
            created_by: self.created_by,
            updated_by: self.updated_by,
        })
    }
}

fn query_overlays<P: rusqlite::Params>(
    conn: &Connection,
    filter: &str,
    params: P,
) -> Result<Vec<(i64, Overlay)>, StorageError> {
    let sql = format!("SELECT {OVERLAY_COLUMNS} FROM overlays WHERE {filter}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, OverlayRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|row| {
            let rowid = row.rowid;
            Ok((rowid, row.decode()?))
        })
        .collect()
}

fn active_overlay(conn: &Connection, key: &OverlayKey) -> Result<Option<(i64, Overlay)>, StorageError> {
    let (scope, owner, tenant) = key_columns(key);
    let sql = format!("SELECT {OVERLAY_COLUMNS} FROM overlays WHERE {KEY_FILTER} AND active = 1");
    let row = conn
        .query_row(
            &sql,
            params![key.base_type, key.base_name, scope, owner, tenant],
            OverlayRow::from_row,
        )
        .optional()?;
    row.map(|row| {
        let rowid = row.rowid;
        Ok((rowid, row.decode()?))
    })
    .transpose()
}

fn write_overlay(
    conn: &Connection,
    overlay: &Overlay,
    expected_version: Option<u64>,
) -> Result<Overlay, StorageError> {
    let key = &overlay.key;
    let current = active_overlay(conn, key)?;
    let conflict = |found| StorageError::VersionConflict {
        key: key.to_string(),
        expected: expected_version,
        found,
    };

    let patch_bytes = overlay
        .patch
        .to_msgpack()
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let patch_sum = checksum(&patch_bytes);
    let changes_bytes =
        rmp_serde::to_vec(&overlay.changes).map_err(|e| StorageError::Serialization(e.to_string()))?;

    let mut stored = overlay.clone();
    stored.active = true;
    match (expected_version, current) {
        (None, None) => {
            stored.version = 1;
            let (scope, owner, tenant) = key_columns(key);
            let result = conn.execute(
                "INSERT INTO overlays (overlay_id, base_type, base_name, scope, owner, tenant_id, package_id, package_version, patch, checksum, changes, active, version, created_at, updated_at, created_by, updated_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, 1, ?12, ?13, ?14, ?15)",
                params![
                    stored.id.as_bytes().as_slice(),
                    key.base_type,
                    key.base_name,
                    scope,
                    owner,
                    tenant,
                    stored.package_id,
                    stored.package_version,
                    patch_bytes,
                    &patch_sum[..],
                    changes_bytes,
                    encode_time(&stored.created_at),
                    encode_time(&stored.updated_at),
                    stored.created_by,
                    stored.updated_by,
                ],
            );
            match result {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    return Err(conflict(None));
                }
                Err(e) => return Err(StorageError::Sqlite(e)),
            }
        }
        (Some(expected), Some((rowid, existing))) if existing.version == expected => {
            stored.id = existing.id;
            stored.created_at = existing.created_at;
            stored.created_by = existing.created_by;
            stored.version = expected + 1;
            conn.execute(
                "UPDATE overlays SET package_id = ?1, package_version = ?2, patch = ?3, checksum = ?4, changes = ?5,
                 version = ?6, updated_at = ?7, updated_by = ?8 WHERE rowid = ?9",
                params![
                    stored.package_id,
                    stored.package_version,
                    patch_bytes,
                    &patch_sum[..],
                    changes_bytes,
                    to_i64(stored.version)?,
                    encode_time(&stored.updated_at),
                    stored.updated_by,
                    rowid,
                ],
            )?;
        }
        (_, current) => return Err(conflict(current.map(|(_, o)| o.version))),
    }
    tracing::debug!(key = %key, version = stored.version, "overlay written");
    Ok(stored)
}

fn write_definition(
    conn: &Connection,
    base_type: &str,
    base_name: &str,
    package_id: Option<&str>,
    package_version: Option<&str>,
    document: &MetaValue,
) -> Result<(), StorageError> {
    let bytes = document
        .to_msgpack()
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let sum = checksum(&bytes);
    conn.execute(
        "INSERT INTO definitions (base_type, base_name, package_id, package_version, document, checksum, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(base_type, base_name) DO UPDATE SET package_id = excluded.package_id, package_version = excluded.package_version,
         document = excluded.document, checksum = excluded.checksum, updated_at = excluded.updated_at",
        params![
            base_type,
            base_name,
            package_id,
            package_version,
            bytes,
            &sum[..],
            encode_time(&Utc::now()),
        ],
    )?;
    tracing::debug!(base_type, base_name, ?package_version, "definition written");
    Ok(())
}

impl OverlayStore for SqliteStorage {
    fn get_overlay(&self, key: &OverlayKey) -> Result<Option<Overlay>, StorageError> {
        Ok(active_overlay(&self.conn, key)?.map(|(_, overlay)| overlay))
    }

    fn save_overlay(
        &mut self,
        overlay: &Overlay,
        expected_version: Option<u64>,
    ) -> Result<Overlay, StorageError> {
        let tx = self.conn.transaction()?;
        let stored = write_overlay(&tx, overlay, expected_version)?;
        tx.commit()?;
        Ok(stored)
    }

    fn remove_overlay(
        &mut self,
        key: &OverlayKey,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Overlay>, StorageError> {
        let tx = self.conn.transaction()?;
        let Some((rowid, mut overlay)) = active_overlay(&tx, key)? else {
            return Ok(None);
        };
        overlay.active = false;
        overlay.version += 1;
        overlay.updated_at = at;
        overlay.updated_by = actor.to_string();
        tx.execute(
            "UPDATE overlays SET active = 0, version = ?1, updated_at = ?2, updated_by = ?3 WHERE rowid = ?4",
            params![
                to_i64(overlay.version)?,
                encode_time(&at),
                overlay.updated_by,
                rowid
            ],
        )?;
        tx.commit()?;
        tracing::debug!(key = %key, version = overlay.version, "overlay removed");
        Ok(Some(overlay))
    }

    fn list_overlays(&self, base_type: &str, scope: ScopeKind) -> Result<Vec<Overlay>, StorageError> {
        let rows = query_overlays(
            &self.conn,
            "base_type = ?1 AND scope = ?2 AND active = 1 ORDER BY base_name, owner, tenant_id",
            params![base_type, scope.as_str()],
        )?;
        Ok(rows.into_iter().map(|(_, o)| o).collect())
    }

    fn overlays_for(
        &self,
        base_type: &str,
        base_name: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Overlay>, StorageError> {
        let rows = query_overlays(
            &self.conn,
            "base_type = ?1 AND base_name = ?2 AND tenant_id = ?3 AND active = 1 ORDER BY scope, owner",
            params![base_type, base_name, tenant_id.unwrap_or("")],
        )?;
        Ok(rows.into_iter().map(|(_, o)| o).collect())
    }

    fn overlay_history(&self, key: &OverlayKey) -> Result<Vec<Overlay>, StorageError> {
        let (scope, owner, tenant) = key_columns(key);
        let rows = query_overlays(
            &self.conn,
            &format!("{KEY_FILTER} ORDER BY rowid"),
            params![key.base_type, key.base_name, scope, owner, tenant],
        )?;
        Ok(rows.into_iter().map(|(_, o)| o).collect())
    }
}

impl DefinitionStore for SqliteStorage {
    fn get_definition(&self, base_type: &str, base_name: &str) -> Result<Option<MetaValue>, StorageError> {
        let row: Option<(Vec<u8>, Vec<u8>)> = self
            .conn
            .query_row(
                "SELECT document, checksum FROM definitions WHERE base_type = ?1 AND base_name = ?2",
                params![base_type, base_name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((bytes, stored_sum)) = row else {
            return Ok(None);
        };
        let what = format!("definition {base_type}/{base_name}");
        verify_checksum(&bytes, stored_sum, &what)?;
        let document = MetaValue::from_msgpack(&bytes)
            .map_err(|e| StorageError::Corrupt(format!("{what}: {e}")))?;
        Ok(Some(document))
    }

    fn put_definition(
        &mut self,
        base_type: &str,
        base_name: &str,
        package_id: Option<&str>,
        package_version: Option<&str>,
        document: &MetaValue,
    ) -> Result<(), StorageError> {
        write_definition(&self.conn, base_type, base_name, package_id, package_version, document)
    }

    fn definition_info(
        &self,
        base_type: &str,
        base_name: &str,
    ) -> Result<Option<DefinitionInfo>, StorageError> {
        let row: Option<(Option<String>, Option<String>, String)> = self
            .conn
            .query_row(
                "SELECT package_id, package_version, updated_at FROM definitions WHERE base_type = ?1 AND base_name = ?2",
                params![base_type, base_name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(|(package_id, package_version, updated_at)| {
            Ok(DefinitionInfo {
                base_type: base_type.to_string(),
                base_name: base_name.to_string(),
                package_id,
                package_version,
                updated_at: decode_time(&updated_at)?,
            })
        })
        .transpose()
    }

    fn commit_upgrade(&mut self, commit: &UpgradeCommit) -> Result<Vec<Overlay>, StorageError> {
        let tx = self.conn.transaction()?;
        write_definition(
            &tx,
            &commit.base_type,
            &commit.base_name,
            commit.package_id.as_deref(),
            commit.package_version.as_deref(),
            &commit.document,
        )?;
        let mut saved = Vec::with_capacity(commit.overlays.len());
        for write in &commit.overlays {
            saved.push(write_overlay(&tx, &write.overlay, write.expected_version)?);
        }
        tx.commit()?;
        tracing::debug!(
            base_type = %commit.base_type,
            base_name = %commit.base_name,
            overlays = saved.len(),
            "upgrade committed"
        );
        Ok(saved)
    }
}
