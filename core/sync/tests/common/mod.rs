#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fieldsync_common::{
    EntityId, EntityType, Error, LocalRecord, NewOperation, OperationId, PendingOperation,
    Properties, Result, Row, ServerRecord,
};
use fieldsync_storage::{LocalEdit, LocalStore, MemoryRemote, OpenConflict, PatchFn, SqliteStore};
use fieldsync_sync::{ConnectivityFlag, SyncConfig, SyncEngine, SyncEvent};

pub const LAYER: &str = "parcels";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn id(s: &str) -> EntityId {
    EntityId::new(s).unwrap()
}

pub fn props(value: Value) -> Properties {
    serde_json::from_value(value).unwrap()
}

pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry_backoff_base: Duration::from_millis(1),
        max_backoff: Duration::from_millis(20),
        ..Default::default()
    }
}

/// A feature row as the server would return it.
pub fn server_feature(id: &str, properties: Value, updated_at: DateTime<Utc>) -> Row {
    let value = json!({
        "id": id,
        "layer_id": LAYER,
        "properties": properties,
        "status": "pending",
        "created_at": updated_at.to_rfc3339(),
        "updated_at": updated_at.to_rfc3339(),
    });
    match value {
        Value::Object(row) => row,
        _ => unreachable!(),
    }
}

pub fn feature(id_str: &str, properties: Value) -> LocalRecord {
    LocalRecord::new(EntityType::Feature, id(id_str), Some(LAYER.to_string()))
        .with_properties(props(properties))
}

/// Drain every event currently buffered on a subscription.
pub fn drain(events: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub struct Harness {
    pub engine: Arc<SyncEngine>,
    pub store: Arc<SqliteStore>,
    pub remote: Arc<MemoryRemote>,
    pub online: Arc<ConnectivityFlag>,
}

impl Harness {
    /// Initialized store with one known layer, empty remote.
    pub fn new() -> Self {
        init_tracing();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        Self::with_store(store)
    }

    pub fn with_store(store: Arc<SqliteStore>) -> Self {
        store.mark_initialized().unwrap();
        if store.get_record(EntityType::Layer, &id(LAYER)).unwrap().is_none() {
            store
                .put_record(&LocalRecord::new(EntityType::Layer, id(LAYER), None))
                .unwrap();
        }
        let remote = Arc::new(MemoryRemote::new());
        let online = Arc::new(ConnectivityFlag::default());
        let engine =
            SyncEngine::new(store.clone(), remote.clone(), online.clone(), test_config()).unwrap();
        Self {
            engine: Arc::new(engine),
            store,
            remote,
            online,
        }
    }

    pub fn local(&self, id_str: &str) -> Option<LocalRecord> {
        self.store.get_record(EntityType::Feature, &id(id_str)).unwrap()
    }
}

type Hook = Box<dyn FnOnce(Arc<SqliteStore>) + Send>;

/// Store wrapper with injectable faults around a real SQLite store.
///
/// - `fail_layers` makes the layer listing fail, aborting the pull phase
/// - records in `unreadable` fail to decode
/// - `after_lock_scan` runs once, right after locked features are listed
pub struct FlakyStore {
    pub inner: Arc<SqliteStore>,
    pub fail_layers: AtomicBool,
    pub unreadable: Mutex<HashSet<String>>,
    after_lock_scan: Mutex<Option<Hook>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        let inner = Arc::new(SqliteStore::in_memory().unwrap());
        inner.mark_initialized().unwrap();
        inner
            .put_record(&LocalRecord::new(EntityType::Layer, id(LAYER), None))
            .unwrap();
        Self {
            inner,
            fail_layers: AtomicBool::new(false),
            unreadable: Mutex::new(HashSet::new()),
            after_lock_scan: Mutex::new(None),
        }
    }

    pub fn make_unreadable(&self, id_str: &str) {
        self.unreadable.lock().unwrap().insert(id_str.to_string());
    }

    pub fn after_lock_scan(&self, hook: impl FnOnce(Arc<SqliteStore>) + Send + 'static) {
        *self.after_lock_scan.lock().unwrap() = Some(Box::new(hook));
    }
}

impl LocalStore for FlakyStore {
    fn is_initialized(&self) -> Result<bool> {
        self.inner.is_initialized()
    }

    fn mark_initialized(&self) -> Result<()> {
        self.inner.mark_initialized()
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_meta(key)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set_meta(key, value)
    }

    fn get_record(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<LocalRecord>> {
        if self.unreadable.lock().unwrap().contains(id.as_str()) {
            return Err(Error::Serialization(format!("bad timestamp in {}", id)));
        }
        self.inner.get_record(entity_type, id)
    }

    fn put_record(&self, record: &LocalRecord) -> Result<()> {
        self.inner.put_record(record)
    }

    fn insert_record(&self, record: &LocalRecord) -> Result<()> {
        self.inner.insert_record(record)
    }

    fn apply_server_record(&self, record: &LocalRecord) -> Result<bool> {
        self.inner.apply_server_record(record)
    }

    fn delete_record(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        self.inner.delete_record(entity_type, id)
    }

    fn count_records(&self, entity_type: EntityType, layer_id: Option<&str>) -> Result<u64> {
        self.inner.count_records(entity_type, layer_id)
    }

    fn layer_ids(&self) -> Result<Vec<String>> {
        if self.fail_layers.load(Ordering::SeqCst) {
            return Err(Error::Store("database disk image is malformed".to_string()));
        }
        self.inner.layer_ids()
    }

    fn locked_records(&self, entity_type: EntityType) -> Result<Vec<LocalRecord>> {
        let records = self.inner.locked_records(entity_type)?;
        if entity_type == EntityType::Feature {
            let hook = self.after_lock_scan.lock().unwrap().take();
            if let Some(hook) = hook {
                hook(self.inner.clone());
            }
        }
        Ok(records)
    }

    fn write_lock(&self, record: &LocalRecord) -> Result<bool> {
        self.inner.write_lock(record)
    }

    fn release_lock(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        self.inner.release_lock(entity_type, id)
    }

    fn commit_edit(&self, edit: LocalEdit<'_>, op: &NewOperation) -> Result<OperationId> {
        self.inner.commit_edit(edit, op)
    }

    fn commit_patch(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        patch: PatchFn<'_>,
    ) -> Result<OperationId> {
        self.inner.commit_patch(entity_type, id, patch)
    }

    fn enqueue(&self, op: &NewOperation) -> Result<OperationId> {
        self.inner.enqueue(op)
    }

    fn list_pending(&self) -> Result<Vec<PendingOperation>> {
        self.inner.list_pending()
    }

    fn pending_for(&self, entity_type: EntityType, id: &EntityId) -> Result<Vec<PendingOperation>> {
        self.inner.pending_for(entity_type, id)
    }

    fn remove_operation(&self, id: OperationId) -> Result<()> {
        self.inner.remove_operation(id)
    }

    fn increment_attempts(&self, id: OperationId) -> Result<u32> {
        self.inner.increment_attempts(id)
    }

    fn settle(&self, entity_type: EntityType, id: &EntityId) -> Result<bool> {
        self.inner.settle(entity_type, id)
    }

    fn replace_pending(
        &self,
        record: &LocalRecord,
        op: Option<&NewOperation>,
    ) -> Result<Option<OperationId>> {
        self.inner.replace_pending(record, op)
    }

    fn record_conflict(&self, entity_type: EntityType, server: &ServerRecord) -> Result<()> {
        self.inner.record_conflict(entity_type, server)
    }

    fn open_conflict(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<OpenConflict>> {
        self.inner.open_conflict(entity_type, id)
    }

    fn open_conflicts(&self) -> Result<Vec<OpenConflict>> {
        self.inner.open_conflicts()
    }

    fn clear_conflict(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        self.inner.clear_conflict(entity_type, id)
    }
}
