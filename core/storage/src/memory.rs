//! In-memory remote delta client for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use fieldsync_common::{EntityId, EntityType, RecordStatus, Row};

use crate::remote::{RangeFilter, RemoteClient, RemoteError, RemoteResult};

/// Mutating remote method, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMethod {
    Insert,
    Upsert,
    Update,
    Delete,
}

/// One mutating call received by the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub method: RemoteMethod,
    pub table: EntityType,
    pub entity_id: String,
    /// Whether the call was applied.
    pub ok: bool,
}

#[derive(Debug, Default)]
struct Faults {
    /// Number of upcoming mutating calls that fail.
    fail_next: u32,
    /// Entities whose mutations always fail.
    failing_entities: HashSet<String>,
    /// Whether range queries fail.
    fail_queries: bool,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<EntityType, BTreeMap<String, Row>>,
    locks: HashMap<String, String>,
    faults: Faults,
    calls: Vec<RemoteCall>,
    last_stamp: Option<DateTime<Utc>>,
}

impl Inner {
    /// Server clock. Strictly increasing so each write gets a distinct `updated_at`.
    fn stamp(&mut self) -> DateTime<Utc> {
        let mut now = Utc::now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                now = last + chrono::Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn check_fault(&mut self, entity_id: &str) -> RemoteResult<()> {
        if self.faults.failing_entities.contains(entity_id) {
            return Err(RemoteError::Server {
                status: 503,
                message: format!("injected failure for {}", entity_id),
            });
        }
        if self.faults.fail_next > 0 {
            self.faults.fail_next -= 1;
            return Err(RemoteError::Network("injected connection reset".to_string()));
        }
        Ok(())
    }

    fn log(&mut self, method: RemoteMethod, table: EntityType, entity_id: &str, ok: bool) {
        self.calls.push(RemoteCall {
            method,
            table,
            entity_id: entity_id.to_string(),
            ok,
        });
    }

    fn table(&mut self, table: EntityType) -> &mut BTreeMap<String, Row> {
        self.tables.entry(table).or_default()
    }
}

/// In-memory remote store.
///
/// Useful for testing and development. Behaves like a server that owns
/// `updated_at`: every applied write is stamped with the server clock.
/// Faults can be injected to exercise retry paths.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
}

fn row_id(row: &Row) -> RemoteResult<String> {
    match row.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        _ => Err(RemoteError::Other("row has no id".to_string())),
    }
}

fn row_time(row: &Row, key: &str) -> Option<DateTime<Utc>> {
    row.get(key)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn stamp_value(stamp: DateTime<Utc>) -> Value {
    Value::String(stamp.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
}

impl MemoryRemote {
    /// Create a new empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> RemoteResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| RemoteError::Other("remote state poisoned".to_string()))
    }

    /// Place a row as-is, keeping its timestamps. Bypasses faults and the call log.
    pub fn seed(&self, table: EntityType, row: Row) -> RemoteResult<()> {
        let id = row_id(&row)?;
        self.inner()?.table(table).insert(id, row);
        Ok(())
    }

    /// Fetch a row by id.
    pub fn row(&self, table: EntityType, id: &str) -> Option<Row> {
        let inner = self.inner().ok()?;
        inner.tables.get(&table).and_then(|t| t.get(id)).cloned()
    }

    /// Number of rows in a table.
    pub fn row_count(&self, table: EntityType) -> usize {
        self.inner()
            .map(|inner| inner.tables.get(&table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Fail the next `n` mutating calls with a network error.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut inner) = self.inner() {
            inner.faults.fail_next = n;
        }
    }

    /// Fail every mutation of `entity_id` until healed.
    pub fn fail_entity(&self, entity_id: &str) {
        if let Ok(mut inner) = self.inner() {
            inner.faults.failing_entities.insert(entity_id.to_string());
        }
    }

    /// Stop failing mutations of `entity_id`.
    pub fn heal_entity(&self, entity_id: &str) {
        if let Ok(mut inner) = self.inner() {
            inner.faults.failing_entities.remove(entity_id);
        }
    }

    /// Make range queries fail (or succeed again).
    pub fn fail_queries(&self, fail: bool) {
        if let Ok(mut inner) = self.inner() {
            inner.faults.fail_queries = fail;
        }
    }

    /// All mutating calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.inner().map(|inner| inner.calls.clone()).unwrap_or_default()
    }

    /// Current lock holder of an entity.
    pub fn lock_holder(&self, entity: &str) -> Option<String> {
        self.inner().ok()?.locks.get(entity).cloned()
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn insert(&self, table: EntityType, mut row: Row) -> RemoteResult<()> {
        let id = row_id(&row)?;
        let mut inner = self.inner()?;
        if let Err(e) = inner.check_fault(&id) {
            inner.log(RemoteMethod::Insert, table, &id, false);
            return Err(e);
        }
        if inner.table(table).contains_key(&id) {
            inner.log(RemoteMethod::Insert, table, &id, false);
            return Err(RemoteError::UniqueViolation(format!("{}_pkey ({})", table.table(), id)));
        }

        let stamp = inner.stamp();
        row.insert("updated_at".to_string(), stamp_value(stamp));
        row.entry("created_at".to_string()).or_insert_with(|| stamp_value(stamp));
        inner.table(table).insert(id.clone(), row);
        inner.log(RemoteMethod::Insert, table, &id, true);
        Ok(())
    }

    async fn upsert(&self, table: EntityType, mut row: Row) -> RemoteResult<()> {
        let id = row_id(&row)?;
        let mut inner = self.inner()?;
        if let Err(e) = inner.check_fault(&id) {
            inner.log(RemoteMethod::Upsert, table, &id, false);
            return Err(e);
        }

        let stamp = inner.stamp();
        row.insert("updated_at".to_string(), stamp_value(stamp));
        let created = inner
            .table(table)
            .get(&id)
            .and_then(|existing| existing.get("created_at").cloned());
        match created {
            Some(created) => {
                row.insert("created_at".to_string(), created);
            }
            None => {
                row.entry("created_at".to_string()).or_insert_with(|| stamp_value(stamp));
            }
        }
        inner.table(table).insert(id.clone(), row);
        inner.log(RemoteMethod::Upsert, table, &id, true);
        Ok(())
    }

    async fn update(&self, table: EntityType, id: &EntityId, patch: Row) -> RemoteResult<()> {
        let mut inner = self.inner()?;
        if let Err(e) = inner.check_fault(id.as_str()) {
            inner.log(RemoteMethod::Update, table, id.as_str(), false);
            return Err(e);
        }
        if !inner.table(table).contains_key(id.as_str()) {
            inner.log(RemoteMethod::Update, table, id.as_str(), false);
            return Err(RemoteError::NotFound(id.to_string()));
        }

        let stamp = inner.stamp();
        if let Some(row) = inner.table(table).get_mut(id.as_str()) {
            for (key, value) in patch {
                if key != "id" {
                    row.insert(key, value);
                }
            }
            row.insert("updated_at".to_string(), stamp_value(stamp));
        }
        inner.log(RemoteMethod::Update, table, id.as_str(), true);
        Ok(())
    }

    async fn delete(&self, table: EntityType, id: &EntityId) -> RemoteResult<()> {
        let mut inner = self.inner()?;
        if let Err(e) = inner.check_fault(id.as_str()) {
            inner.log(RemoteMethod::Delete, table, id.as_str(), false);
            return Err(e);
        }
        inner.table(table).remove(id.as_str());
        inner.log(RemoteMethod::Delete, table, id.as_str(), true);
        Ok(())
    }

    async fn query_range(
        &self,
        table: EntityType,
        filter: &RangeFilter,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<Row>> {
        let inner = self.inner()?;
        if inner.faults.fail_queries {
            return Err(RemoteError::Network("injected query timeout".to_string()));
        }
        let Some(rows) = inner.tables.get(&table) else {
            return Ok(Vec::new());
        };

        let mut matching: Vec<(DateTime<Utc>, &String, &Row)> = rows
            .iter()
            .filter_map(|(id, row)| {
                let updated = row_time(row, "updated_at")?;
                if let Some(layer) = &filter.layer_id {
                    if row.get("layer_id").and_then(Value::as_str) != Some(layer.as_str()) {
                        return None;
                    }
                }
                if filter.updated_from.is_some_and(|from| updated < from) {
                    return None;
                }
                if let Some(from) = filter.created_from {
                    let created = row_time(row, "created_at").unwrap_or(updated);
                    if created < from {
                        return None;
                    }
                }
                Some((updated, id, row))
            })
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        Ok(matching
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|(_, _, row)| row.clone())
            .collect())
    }

    async fn lock(&self, entity: &EntityId, user: &str) -> RemoteResult<bool> {
        let mut inner = self.inner()?;
        match inner.locks.get(entity.as_str()) {
            Some(holder) if holder != user => return Ok(false),
            _ => {}
        }
        inner.locks.insert(entity.to_string(), user.to_string());

        let stamp = inner.stamp();
        if let Some(row) = inner.table(EntityType::Feature).get_mut(entity.as_str()) {
            row.insert("status".to_string(), Value::from(RecordStatus::Locked.as_str()));
            row.insert("locked_by".to_string(), Value::from(user));
            row.insert("locked_at".to_string(), stamp_value(stamp));
            row.insert("updated_at".to_string(), stamp_value(stamp));
        }
        Ok(true)
    }

    async fn unlock(&self, entity: &EntityId) -> RemoteResult<()> {
        let mut inner = self.inner()?;
        if inner.locks.remove(entity.as_str()).is_none() {
            return Ok(());
        }
        let stamp = inner.stamp();
        if let Some(row) = inner.table(EntityType::Feature).get_mut(entity.as_str()) {
            row.insert("status".to_string(), Value::from(RecordStatus::Pending.as_str()));
            row.insert("locked_by".to_string(), Value::Null);
            row.insert("locked_at".to_string(), Value::Null);
            row.insert("updated_at".to_string(), stamp_value(stamp));
        }
        Ok(())
    }
}
