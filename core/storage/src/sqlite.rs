//! SQLite-backed local store.
//!
//! Persists cached records, the operation queue and sync metadata so that
//! queued edits survive process termination.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use fieldsync_common::{
    EntityId, EntityType, Error, LocalRecord, NewOperation, OpKind, OperationId,
    PendingOperation, Properties, Result, Row, ServerRecord,
};

use crate::store::{LocalEdit, LocalStore, OpenConflict, PatchFn, META_INITIALIZED};

const RECORD_COLUMNS: &str = "id, layer_id, feature_id, geometry, properties, status, dirty, \
     locked_by, locked_at, lock_expires, created_at, updated_at";

const RECORD_PLACEHOLDERS: &str = "?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12";

const QUEUE_COLUMNS: &str = "id, op, entity_type, entity_id, payload, attempts, created_at";

fn schema() -> String {
    let mut sql = String::new();
    for entity in EntityType::ALL {
        sql.push_str(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                layer_id TEXT,
                feature_id TEXT,
                geometry TEXT,
                properties TEXT NOT NULL,
                status TEXT NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                locked_by TEXT,
                locked_at TEXT,
                lock_expires TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_layer ON {table}(layer_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(status);
            "#,
            table = entity.table()
        ));
    }
    sql.push_str(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            op TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_queue_entity ON sync_queue(entity_type, entity_id);

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conflicts (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            server TEXT NOT NULL,
            detected_at TEXT NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        );
        "#,
    );
    sql
}

fn store_err(err: rusqlite::Error) -> Error {
    Error::Store(err.to_string())
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation)
}

fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Serialization(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_opt_time(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

/// Record columns as stored, before decoding.
struct RawRecord {
    id: String,
    layer_id: Option<String>,
    feature_id: Option<String>,
    geometry: Option<String>,
    properties: String,
    status: String,
    dirty: bool,
    locked_by: Option<String>,
    locked_at: Option<String>,
    lock_expires: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            layer_id: row.get(1)?,
            feature_id: row.get(2)?,
            geometry: row.get(3)?,
            properties: row.get(4)?,
            status: row.get(5)?,
            dirty: row.get(6)?,
            locked_by: row.get(7)?,
            locked_at: row.get(8)?,
            lock_expires: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn decode(self, entity_type: EntityType) -> Result<LocalRecord> {
        let properties: Properties = serde_json::from_str(&self.properties)?;
        let geometry = self
            .geometry
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(LocalRecord {
            id: EntityId::new(self.id)?,
            entity_type,
            layer_id: self.layer_id,
            feature_id: self.feature_id.map(EntityId::new).transpose()?,
            geometry,
            properties,
            status: self.status.parse()?,
            dirty: self.dirty,
            locked_by: self.locked_by,
            locked_at: parse_opt_time(self.locked_at)?,
            lock_expires: parse_opt_time(self.lock_expires)?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

/// Queue columns as stored, before decoding.
struct RawOperation {
    id: i64,
    op: String,
    entity_type: String,
    entity_id: String,
    payload: String,
    attempts: i64,
    created_at: String,
}

impl RawOperation {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            op: row.get(1)?,
            entity_type: row.get(2)?,
            entity_id: row.get(3)?,
            payload: row.get(4)?,
            attempts: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn decode(self) -> Result<PendingOperation> {
        let payload: Row = serde_json::from_str(&self.payload)?;
        Ok(PendingOperation {
            id: OperationId(self.id),
            op_kind: self.op.parse()?,
            entity_type: self.entity_type.parse()?,
            entity_id: EntityId::new(self.entity_id)?,
            payload,
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
            created_at: parse_time(&self.created_at)?,
        })
    }
}

/// Conflict columns as stored, before decoding.
struct RawConflict {
    entity_type: String,
    entity_id: String,
    server: String,
    detected_at: String,
}

impl RawConflict {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_type: row.get(0)?,
            entity_id: row.get(1)?,
            server: row.get(2)?,
            detected_at: row.get(3)?,
        })
    }

    fn decode(self) -> Result<OpenConflict> {
        let server: ServerRecord = serde_json::from_str(&self.server)?;
        Ok(OpenConflict {
            entity_type: self.entity_type.parse()?,
            entity_id: EntityId::new(self.entity_id)?,
            server,
            detected_at: parse_time(&self.detected_at)?,
        })
    }
}

/// How a record row is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Insert or overwrite.
    Replace,
    /// Insert; fail on a duplicate id.
    Insert,
    /// Insert or overwrite, unless the existing row is dirty.
    UnlessDirty,
}

fn write_record(conn: &Connection, record: &LocalRecord, mode: WriteMode) -> Result<usize> {
    let table = record.entity_type.table();
    let sql = match mode {
        WriteMode::Replace => format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            table, RECORD_COLUMNS, RECORD_PLACEHOLDERS
        ),
        WriteMode::Insert => format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table, RECORD_COLUMNS, RECORD_PLACEHOLDERS
        ),
        WriteMode::UnlessDirty => format!(
            "INSERT INTO {table} ({}) VALUES ({})
             ON CONFLICT(id) DO UPDATE SET
                layer_id = excluded.layer_id,
                feature_id = excluded.feature_id,
                geometry = excluded.geometry,
                properties = excluded.properties,
                status = excluded.status,
                dirty = excluded.dirty,
                locked_by = excluded.locked_by,
                locked_at = excluded.locked_at,
                lock_expires = excluded.lock_expires,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
             WHERE {table}.dirty = 0",
            RECORD_COLUMNS,
            RECORD_PLACEHOLDERS,
            table = table
        ),
    };
    let geometry = record
        .geometry
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let properties = serde_json::to_string(&record.properties)?;

    conn.execute(
        &sql,
        params![
            record.id.as_str(),
            record.layer_id,
            record.feature_id.as_ref().map(EntityId::as_str),
            geometry,
            properties,
            record.status.as_str(),
            record.dirty,
            record.locked_by,
            record.locked_at.as_ref().map(format_time),
            record.lock_expires.as_ref().map(format_time),
            format_time(&record.created_at),
            format_time(&record.updated_at),
        ],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            Error::AlreadyExists(format!("{} {}", record.entity_type, record.id))
        } else {
            store_err(e)
        }
    })
}

fn read_record(
    conn: &Connection,
    entity_type: EntityType,
    id: &EntityId,
) -> Result<Option<LocalRecord>> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?1",
        RECORD_COLUMNS,
        entity_type.table()
    );
    let mut stmt = conn.prepare(&sql).map_err(store_err)?;

    match stmt.query_row([id.as_str()], RawRecord::read) {
        Ok(raw) => raw.decode(entity_type).map(Some),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(store_err(e)),
    }
}

fn insert_operation(conn: &Connection, op: &NewOperation) -> Result<OperationId> {
    let payload = serde_json::to_string(&op.payload)?;
    conn.execute(
        "INSERT INTO sync_queue (op, entity_type, entity_id, payload, attempts, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![
            op.op_kind.as_str(),
            op.entity_type.as_str(),
            op.entity_id.as_str(),
            payload,
            format_time(&Utc::now()),
        ],
    )
    .map_err(store_err)?;
    Ok(OperationId(conn.last_insert_rowid()))
}

fn delete_record_in(conn: &Connection, entity_type: EntityType, id: &EntityId) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE id = ?1", entity_type.table()),
        params![id.as_str()],
    )
    .map_err(store_err)?;
    Ok(())
}

fn delete_conflict_in(conn: &Connection, entity_type: EntityType, id: &EntityId) -> Result<usize> {
    conn.execute(
        "DELETE FROM conflicts WHERE entity_type = ?1 AND entity_id = ?2",
        params![entity_type.as_str(), id.as_str()],
    )
    .map_err(store_err)
}

fn query_conflicts(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<OpenConflict>> {
    let sql = format!(
        "SELECT entity_type, entity_id, server, detected_at FROM conflicts {} \
         ORDER BY detected_at ASC, entity_id ASC",
        filter
    );
    let mut stmt = conn.prepare(&sql).map_err(store_err)?;
    let rows = stmt
        .query_map(args, RawConflict::read)
        .map_err(store_err)?;

    let mut conflicts = Vec::new();
    for row in rows {
        conflicts.push(row.map_err(store_err)?.decode()?);
    }
    Ok(conflicts)
}

fn query_operations(
    conn: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<PendingOperation>> {
    let sql = format!(
        "SELECT {} FROM sync_queue {} ORDER BY id ASC",
        QUEUE_COLUMNS, filter
    );
    let mut stmt = conn.prepare(&sql).map_err(store_err)?;
    let rows = stmt
        .query_map(args, RawOperation::read)
        .map_err(store_err)?;

    let mut ops = Vec::new();
    for row in rows {
        ops.push(row.map_err(store_err)?.decode()?);
    }
    Ok(ops)
}

/// Local store backed by a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(store_err)?;
        conn.execute_batch(&schema()).map_err(store_err)?;

        info!("Local store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("connection mutex poisoned".to_string()))
    }
}

impl LocalStore for SqliteStore {
    fn is_initialized(&self) -> Result<bool> {
        Ok(self.get_meta(META_INITIALIZED)?.as_deref() == Some("true"))
    }

    fn mark_initialized(&self) -> Result<()> {
        self.set_meta(META_INITIALIZED, "true")
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT value FROM meta WHERE key = ?1")
            .map_err(store_err)?;

        match stmt.query_row([key], |row| row.get(0)) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(store_err)?;
        Ok(())
    }

    fn get_record(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<LocalRecord>> {
        let conn = self.conn()?;
        read_record(&conn, entity_type, id)
    }

    fn put_record(&self, record: &LocalRecord) -> Result<()> {
        debug!("Upserting {} {}", record.entity_type, record.id);
        let conn = self.conn()?;
        write_record(&conn, record, WriteMode::Replace)?;
        Ok(())
    }

    fn insert_record(&self, record: &LocalRecord) -> Result<()> {
        let conn = self.conn()?;
        write_record(&conn, record, WriteMode::Insert)?;
        Ok(())
    }

    fn apply_server_record(&self, record: &LocalRecord) -> Result<bool> {
        let conn = self.conn()?;
        let written = write_record(&conn, record, WriteMode::UnlessDirty)?;
        Ok(written > 0)
    }

    fn delete_record(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        debug!("Deleting {} {}", entity_type, id);
        let conn = self.conn()?;
        delete_record_in(&conn, entity_type, id)
    }

    fn count_records(&self, entity_type: EntityType, layer_id: Option<&str>) -> Result<u64> {
        let conn = self.conn()?;
        let count: i64 = match layer_id {
            Some(layer) => conn.query_row(
                &format!("SELECT COUNT(*) FROM {} WHERE layer_id = ?1", entity_type.table()),
                [layer],
                |row| row.get(0),
            ),
            None => conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", entity_type.table()),
                [],
                |row| row.get(0),
            ),
        }
        .map_err(store_err)?;
        Ok(count as u64)
    }

    fn layer_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id FROM layers ORDER BY id")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?;

        let mut ids = Vec::new();
        for id in rows {
            ids.push(id.map_err(store_err)?);
        }
        Ok(ids)
    }

    fn locked_records(&self, entity_type: EntityType) -> Result<Vec<LocalRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM {} WHERE status = 'locked'",
            RECORD_COLUMNS,
            entity_type.table()
        );
        let mut stmt = conn.prepare(&sql).map_err(store_err)?;
        let rows = stmt.query_map([], RawRecord::read).map_err(store_err)?;

        let mut records = Vec::new();
        for raw in rows {
            records.push(raw.map_err(store_err)?.decode(entity_type)?);
        }
        Ok(records)
    }

    fn write_lock(&self, record: &LocalRecord) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {} SET status = ?2, locked_by = ?3, locked_at = ?4, lock_expires = ?5 \
                     WHERE id = ?1",
                    record.entity_type.table()
                ),
                params![
                    record.id.as_str(),
                    record.status.as_str(),
                    record.locked_by,
                    record.locked_at.as_ref().map(format_time),
                    record.lock_expires.as_ref().map(format_time),
                ],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    fn release_lock(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {} SET status = 'pending', locked_by = NULL, locked_at = NULL, \
                     lock_expires = NULL WHERE id = ?1 AND status = 'locked'",
                    entity_type.table()
                ),
                params![id.as_str()],
            )
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    fn commit_edit(&self, edit: LocalEdit<'_>, op: &NewOperation) -> Result<OperationId> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_err)?;

        match edit {
            LocalEdit::Upsert(record) => {
                write_record(&tx, record, WriteMode::Replace)?;
            }
            LocalEdit::Delete(entity_type, id) => {
                delete_record_in(&tx, entity_type, id)?;
                delete_conflict_in(&tx, entity_type, id)?;
            }
        }
        let op_id = insert_operation(&tx, op)?;

        tx.commit().map_err(store_err)?;
        debug!("Committed {} {} {} as {}", op.op_kind, op.entity_type, op.entity_id, op_id);
        Ok(op_id)
    }

    fn commit_patch(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        patch: PatchFn<'_>,
    ) -> Result<OperationId> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_err)?;

        let mut record = read_record(&tx, entity_type, id)?
            .ok_or_else(|| Error::NotFound(format!("{} {}", entity_type, id)))?;
        let payload = patch(&mut record)?;
        write_record(&tx, &record, WriteMode::Replace)?;
        let op = NewOperation {
            op_kind: OpKind::Update,
            entity_type,
            entity_id: id.clone(),
            payload,
        };
        let op_id = insert_operation(&tx, &op)?;

        tx.commit().map_err(store_err)?;
        debug!("Committed update {} {} as {}", entity_type, id, op_id);
        Ok(op_id)
    }

    fn enqueue(&self, op: &NewOperation) -> Result<OperationId> {
        let conn = self.conn()?;
        insert_operation(&conn, op)
    }

    fn list_pending(&self) -> Result<Vec<PendingOperation>> {
        let conn = self.conn()?;
        query_operations(&conn, "", &[])
    }

    fn pending_for(&self, entity_type: EntityType, id: &EntityId) -> Result<Vec<PendingOperation>> {
        let conn = self.conn()?;
        query_operations(
            &conn,
            "WHERE entity_type = ?1 AND entity_id = ?2",
            &[&entity_type.as_str(), &id.as_str()],
        )
    }

    fn remove_operation(&self, id: OperationId) -> Result<()> {
        self.conn()?
            .execute("DELETE FROM sync_queue WHERE id = ?1", params![id.0])
            .map_err(store_err)?;
        Ok(())
    }

    fn increment_attempts(&self, id: OperationId) -> Result<u32> {
        let conn = self.conn()?;
        let changed = conn
            .execute(
                "UPDATE sync_queue SET attempts = attempts + 1 WHERE id = ?1",
                params![id.0],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(Error::NotFound(format!("queued operation {}", id)));
        }

        let attempts: i64 = conn
            .query_row(
                "SELECT attempts FROM sync_queue WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(u32::try_from(attempts).unwrap_or(u32::MAX))
    }

    fn settle(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_err)?;

        let pending: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity_type.as_str(), id.as_str()],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        if pending > 0 {
            return Ok(false);
        }

        tx.execute(
            &format!("UPDATE {} SET dirty = 0 WHERE id = ?1", entity_type.table()),
            params![id.as_str()],
        )
        .map_err(store_err)?;
        tx.commit().map_err(store_err)?;
        Ok(true)
    }

    fn replace_pending(
        &self,
        record: &LocalRecord,
        op: Option<&NewOperation>,
    ) -> Result<Option<OperationId>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(store_err)?;

        let superseded = tx
            .execute(
                "DELETE FROM sync_queue WHERE entity_type = ?1 AND entity_id = ?2",
                params![record.entity_type.as_str(), record.id.as_str()],
            )
            .map_err(store_err)?;
        write_record(&tx, record, WriteMode::Replace)?;
        delete_conflict_in(&tx, record.entity_type, &record.id)?;
        let op_id = op.map(|op| insert_operation(&tx, op)).transpose()?;

        tx.commit().map_err(store_err)?;
        if superseded > 0 {
            debug!("Superseded {} queued operations for {}", superseded, record.id);
        }
        Ok(op_id)
    }

    fn record_conflict(&self, entity_type: EntityType, server: &ServerRecord) -> Result<()> {
        let snapshot = serde_json::to_string(server)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO conflicts (entity_type, entity_id, server, detected_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_type, entity_id) DO UPDATE SET server = excluded.server",
            params![
                entity_type.as_str(),
                server.id.as_str(),
                snapshot,
                format_time(&Utc::now()),
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    fn open_conflict(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<OpenConflict>> {
        let conn = self.conn()?;
        let mut found = query_conflicts(
            &conn,
            "WHERE entity_type = ?1 AND entity_id = ?2",
            &[&entity_type.as_str(), &id.as_str()],
        )?;
        Ok(found.pop())
    }

    fn open_conflicts(&self) -> Result<Vec<OpenConflict>> {
        let conn = self.conn()?;
        query_conflicts(&conn, "", &[])
    }

    fn clear_conflict(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        let conn = self.conn()?;
        delete_conflict_in(&conn, entity_type, id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_common::RecordStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn feature(id: &str, layer: &str) -> LocalRecord {
        let props: Properties = serde_json::from_value(json!({"owner": "Ada", "area": 12})).unwrap();
        LocalRecord::new(
            EntityType::Feature,
            EntityId::new(id).unwrap(),
            Some(layer.to_string()),
        )
        .with_properties(props)
        .with_geometry(json!({"type": "Point", "coordinates": [1.5, 2.5]}))
    }

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    #[test]
    fn test_record_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let record = feature("f1", "parcels");

        store.put_record(&record).unwrap();
        let loaded = store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap();
        assert_eq!(loaded, record);

        store.delete_record(EntityType::Feature, &id("f1")).unwrap();
        assert!(store.get_record(EntityType::Feature, &id("f1")).unwrap().is_none());
        // Deleting twice is fine.
        store.delete_record(EntityType::Feature, &id("f1")).unwrap();
    }

    #[test]
    fn test_insert_duplicate_is_already_exists() {
        let store = SqliteStore::in_memory().unwrap();
        let record = feature("f1", "parcels");

        store.insert_record(&record).unwrap();
        let err = store.insert_record(&record).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_apply_server_record_keeps_dirty_rows() {
        let store = SqliteStore::in_memory().unwrap();
        let mut local = feature("f1", "parcels");
        local.dirty = true;
        store.put_record(&local).unwrap();

        let mut server = feature("f1", "parcels");
        server.properties.insert("owner".to_string(), json!("Grace"));
        assert!(!store.apply_server_record(&server).unwrap());
        let kept = store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap();
        assert_eq!(kept.properties["owner"], json!("Ada"));

        local.dirty = false;
        store.put_record(&local).unwrap();
        assert!(store.apply_server_record(&server).unwrap());
        let applied = store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap();
        assert_eq!(applied.properties["owner"], json!("Grace"));

        assert!(store.apply_server_record(&feature("f2", "parcels")).unwrap());
    }

    #[test]
    fn test_queue_is_fifo() {
        let store = SqliteStore::in_memory().unwrap();
        let record = feature("f1", "parcels");

        let first = store.enqueue(&NewOperation::insert(&record)).unwrap();
        let second = store
            .enqueue(&NewOperation::update(EntityType::Feature, id("f1"), Row::new()))
            .unwrap();
        let third = store
            .enqueue(&NewOperation::delete(EntityType::Feature, id("f1")))
            .unwrap();

        let pending = store.list_pending().unwrap();
        let ids: Vec<_> = pending.iter().map(|op| op.id).collect();
        assert_eq!(ids, vec![first, second, third]);
        assert_eq!(pending[0].op_kind, OpKind::Insert);
        assert_eq!(pending[0].payload["id"], json!("f1"));
        assert_eq!(pending[2].op_kind, OpKind::Delete);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let op = store
            .enqueue(&NewOperation::delete(EntityType::Feature, id("f1")))
            .unwrap();

        store.remove_operation(op).unwrap();
        store.remove_operation(op).unwrap();
        store.remove_operation(OperationId(9999)).unwrap();
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_increment_attempts() {
        let store = SqliteStore::in_memory().unwrap();
        let op = store
            .enqueue(&NewOperation::delete(EntityType::Feature, id("f1")))
            .unwrap();

        assert_eq!(store.increment_attempts(op).unwrap(), 1);
        assert_eq!(store.increment_attempts(op).unwrap(), 2);
        assert_eq!(store.list_pending().unwrap()[0].attempts, 2);

        store.remove_operation(op).unwrap();
        assert!(matches!(store.increment_attempts(op), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_commit_edit_writes_record_and_queue() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = feature("f1", "parcels");
        record.dirty = true;

        store
            .commit_edit(LocalEdit::Upsert(&record), &NewOperation::insert(&record))
            .unwrap();
        assert!(store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap().dirty);
        assert_eq!(store.pending_for(EntityType::Feature, &id("f1")).unwrap().len(), 1);

        store
            .commit_edit(
                LocalEdit::Delete(EntityType::Feature, &id("f1")),
                &NewOperation::delete(EntityType::Feature, id("f1")),
            )
            .unwrap();
        assert!(store.get_record(EntityType::Feature, &id("f1")).unwrap().is_none());
        assert_eq!(store.pending_for(EntityType::Feature, &id("f1")).unwrap().len(), 2);
    }

    #[test]
    fn test_settle_only_when_queue_drained() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = feature("f1", "parcels");
        record.dirty = true;
        let op = store
            .commit_edit(LocalEdit::Upsert(&record), &NewOperation::insert(&record))
            .unwrap();

        assert!(!store.settle(EntityType::Feature, &id("f1")).unwrap());
        assert!(store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap().dirty);

        store.remove_operation(op).unwrap();
        assert!(store.settle(EntityType::Feature, &id("f1")).unwrap());
        assert!(!store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap().dirty);
    }

    #[test]
    fn test_replace_pending_supersedes() {
        let store = SqliteStore::in_memory().unwrap();
        let record = feature("f1", "parcels");
        store.enqueue(&NewOperation::insert(&record)).unwrap();
        store
            .enqueue(&NewOperation::update(EntityType::Feature, id("f1"), Row::new()))
            .unwrap();
        store.enqueue(&NewOperation::insert(&feature("f2", "parcels"))).unwrap();

        let op = store
            .replace_pending(
                &record,
                Some(&NewOperation::update(EntityType::Feature, id("f1"), Row::new())),
            )
            .unwrap();

        let pending = store.pending_for(EntityType::Feature, &id("f1")).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(Some(pending[0].id), op);
        assert_eq!(store.list_pending().unwrap().len(), 2);

        assert!(store.replace_pending(&record, None).unwrap().is_none());
        assert!(store.pending_for(EntityType::Feature, &id("f1")).unwrap().is_empty());
    }

    #[test]
    fn test_counts_layers_and_locks() {
        let store = SqliteStore::in_memory().unwrap();
        store.put_record(&feature("f1", "parcels")).unwrap();
        store.put_record(&feature("f2", "parcels")).unwrap();
        store.put_record(&feature("f3", "roads")).unwrap();
        for layer in ["roads", "parcels"] {
            store
                .put_record(&LocalRecord::new(EntityType::Layer, id(layer), None))
                .unwrap();
        }

        assert_eq!(store.count_records(EntityType::Feature, None).unwrap(), 3);
        assert_eq!(store.count_records(EntityType::Feature, Some("parcels")).unwrap(), 2);
        assert_eq!(store.count_records(EntityType::Feature, Some("empty")).unwrap(), 0);
        assert_eq!(store.layer_ids().unwrap(), vec!["parcels", "roads"]);

        let mut locked = feature("f4", "roads");
        locked.lock("agent", Utc::now(), std::time::Duration::from_secs(60));
        store.put_record(&locked).unwrap();
        let found = store.locked_records(EntityType::Feature).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].status, RecordStatus::Locked);
    }

    #[test]
    fn test_lock_columns_only() {
        let store = SqliteStore::in_memory().unwrap();
        let mut record = feature("f1", "parcels");
        store.put_record(&record).unwrap();

        // A concurrent edit lands after the record was read for locking.
        let mut edited = record.clone();
        edited.properties.insert("owner".to_string(), json!("Grace"));
        edited.dirty = true;
        store.put_record(&edited).unwrap();

        record.lock("agent", Utc::now(), std::time::Duration::from_secs(60));
        assert!(store.write_lock(&record).unwrap());
        let locked = store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap();
        assert_eq!(locked.status, RecordStatus::Locked);
        assert_eq!(locked.properties["owner"], json!("Grace"));
        assert!(locked.dirty);

        assert!(store.release_lock(EntityType::Feature, &id("f1")).unwrap());
        assert!(!store.release_lock(EntityType::Feature, &id("f1")).unwrap());
        let released = store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap();
        assert_eq!(released.status, RecordStatus::Pending);
        assert!(released.locked_by.is_none());
        assert_eq!(released.properties["owner"], json!("Grace"));
        assert!(released.dirty);

        assert!(!store.write_lock(&feature("ghost", "parcels")).unwrap());
    }

    #[test]
    fn test_commit_patch_reads_in_transaction() {
        let store = SqliteStore::in_memory().unwrap();
        store.put_record(&feature("f1", "parcels")).unwrap();

        let op = store
            .commit_patch(EntityType::Feature, &id("f1"), &mut |record| {
                record.properties.insert("area".to_string(), json!(40));
                record.dirty = true;
                let mut payload = Row::new();
                payload.insert("properties".to_string(), serde_json::to_value(&record.properties)?);
                Ok(payload)
            })
            .unwrap();

        let pending = store.pending_for(EntityType::Feature, &id("f1")).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, op);
        assert_eq!(pending[0].op_kind, OpKind::Update);
        assert_eq!(pending[0].payload["properties"], json!({"owner": "Ada", "area": 40}));
        assert!(store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap().dirty);

        let err = store
            .commit_patch(EntityType::Feature, &id("ghost"), &mut |_| Ok(Row::new()))
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(store.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn test_conflicts_persist_until_closed() {
        let store = SqliteStore::in_memory().unwrap();
        let record = feature("f1", "parcels");
        let server = |owner: &str| {
            let mut row = record.to_row();
            row.insert("properties".to_string(), json!({"owner": owner}));
            ServerRecord::from_row(row).unwrap()
        };

        store.record_conflict(EntityType::Feature, &server("Grace")).unwrap();
        let first = store.open_conflict(EntityType::Feature, &id("f1")).unwrap().unwrap();

        // A newer server copy refreshes the snapshot but keeps the detection time.
        store.record_conflict(EntityType::Feature, &server("Linus")).unwrap();
        let open = store.open_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].server.properties["owner"], json!("Linus"));
        assert_eq!(open[0].detected_at, first.detected_at);

        store.replace_pending(&record, None).unwrap();
        assert!(store.open_conflicts().unwrap().is_empty());

        store.record_conflict(EntityType::Feature, &server("Grace")).unwrap();
        store
            .commit_edit(
                LocalEdit::Delete(EntityType::Feature, &id("f1")),
                &NewOperation::delete(EntityType::Feature, id("f1")),
            )
            .unwrap();
        assert!(store.open_conflict(EntityType::Feature, &id("f1")).unwrap().is_none());

        store.record_conflict(EntityType::Feature, &server("Ada")).unwrap();
        store.clear_conflict(EntityType::Feature, &id("f1")).unwrap();
        store.clear_conflict(EntityType::Feature, &id("f1")).unwrap();
        assert!(store.open_conflicts().unwrap().is_empty());
    }

    #[test]
    fn test_meta_and_initialized() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(!store.is_initialized().unwrap());
        assert!(store.get_meta("last_sync").unwrap().is_none());

        store.mark_initialized().unwrap();
        store.set_meta("last_sync", "2024-01-01T00:00:00Z").unwrap();
        assert!(store.is_initialized().unwrap());
        assert_eq!(
            store.get_meta("last_sync").unwrap().as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_queue_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("fieldsync.db");

        {
            let store = SqliteStore::open(&db_path).unwrap();
            let mut record = feature("f1", "parcels");
            record.dirty = true;
            store
                .commit_edit(LocalEdit::Upsert(&record), &NewOperation::insert(&record))
                .unwrap();
        }

        {
            let store = SqliteStore::open(&db_path).unwrap();
            let pending = store.list_pending().unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].entity_id, id("f1"));
            assert!(store.get_record(EntityType::Feature, &id("f1")).unwrap().unwrap().dirty);
        }
    }
}
