//! Local store trait definition.

use chrono::{DateTime, Utc};

use fieldsync_common::{
    EntityId, EntityType, LocalRecord, NewOperation, OperationId, PendingOperation, Result, Row,
    ServerRecord,
};

/// Meta key holding the last successful pull checkpoint (RFC 3339).
pub const META_LAST_SYNC: &str = "last_sync";

/// Meta key set once the project data has been downloaded.
pub const META_INITIALIZED: &str = "initialized";

/// A local record mutation committed together with its queue entry.
#[derive(Debug, Clone, Copy)]
pub enum LocalEdit<'a> {
    /// Insert or replace the record.
    Upsert(&'a LocalRecord),
    /// Remove the record.
    Delete(EntityType, &'a EntityId),
}

/// A conflict waiting for an operator decision.
///
/// Holds the latest server copy seen for the entity. Stays in the store
/// until the conflict is resolved or the record is deleted locally.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenConflict {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub server: ServerRecord,
    /// When the conflict was first detected.
    pub detected_at: DateTime<Utc>,
}

/// Callback for [`LocalStore::commit_patch`]: changes the record in place
/// and returns the payload of the queued update.
pub type PatchFn<'a> = &'a mut dyn FnMut(&mut LocalRecord) -> Result<Row>;

/// Durable local store used by the sync engine.
///
/// Holds the cached records (`features`, `corrections`, `layers`), the
/// operation queue and a scalar meta table. Implementations must be safe to
/// call from the engine and from UI edit actions at the same time.
///
/// Errors for which `Error::is_fatal` holds abort a sync run. Decoding
/// errors on a single record only skip that record.
pub trait LocalStore: Send + Sync {
    /// Whether the store holds project data and may be synchronized.
    fn is_initialized(&self) -> Result<bool>;

    /// Flag the store as initialized.
    fn mark_initialized(&self) -> Result<()>;

    /// Read a meta value.
    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    /// Write a meta value.
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;

    /// Fetch a record by id.
    fn get_record(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<LocalRecord>>;

    /// Insert or replace a record.
    fn put_record(&self, record: &LocalRecord) -> Result<()>;

    /// Insert a record that must not exist yet.
    ///
    /// # Errors
    /// - `Error::AlreadyExists` on a duplicate id
    fn insert_record(&self, record: &LocalRecord) -> Result<()>;

    /// Write a server copy unless the local record is dirty.
    ///
    /// The dirty check and the write happen atomically, so an edit that
    /// lands concurrently is never overwritten. Returns whether the copy
    /// was written.
    fn apply_server_record(&self, record: &LocalRecord) -> Result<bool>;

    /// Delete a record. Deleting a missing record is a no-op.
    fn delete_record(&self, entity_type: EntityType, id: &EntityId) -> Result<()>;

    /// Count cached records, optionally restricted to one layer.
    fn count_records(&self, entity_type: EntityType, layer_id: Option<&str>) -> Result<u64>;

    /// Ids of all locally known layers.
    fn layer_ids(&self) -> Result<Vec<String>>;

    /// Records whose status is `locked`.
    fn locked_records(&self, entity_type: EntityType) -> Result<Vec<LocalRecord>>;

    /// Write only the lock columns of `record`. Returns false if it is not cached.
    fn write_lock(&self, record: &LocalRecord) -> Result<bool>;

    /// Return a locked record to `pending` without touching any other column.
    ///
    /// Returns whether a lock was released.
    fn release_lock(&self, entity_type: EntityType, id: &EntityId) -> Result<bool>;

    /// Apply a local edit and queue the matching operation atomically.
    ///
    /// Deleting a record also drops its open conflict.
    fn commit_edit(&self, edit: LocalEdit<'_>, op: &NewOperation) -> Result<OperationId>;

    /// Read, change and write back a record, queueing an update, in one transaction.
    ///
    /// # Errors
    /// - `Error::NotFound` if the record is not cached
    fn commit_patch(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        patch: PatchFn<'_>,
    ) -> Result<OperationId>;

    /// Queue an operation on its own.
    fn enqueue(&self, op: &NewOperation) -> Result<OperationId>;

    /// All pending operations in creation order.
    fn list_pending(&self) -> Result<Vec<PendingOperation>>;

    /// Pending operations for one entity in creation order.
    fn pending_for(&self, entity_type: EntityType, id: &EntityId) -> Result<Vec<PendingOperation>>;

    /// Remove an operation. Removing a missing id is a no-op.
    fn remove_operation(&self, id: OperationId) -> Result<()>;

    /// Increment the attempt counter and return the new value.
    ///
    /// # Errors
    /// - `Error::NotFound` if the operation is no longer queued
    fn increment_attempts(&self, id: OperationId) -> Result<u32>;

    /// Clear `dirty` if no operation for the entity remains queued.
    ///
    /// Returns whether the record is now clean.
    fn settle(&self, entity_type: EntityType, id: &EntityId) -> Result<bool>;

    /// Replace a record and every queued operation for it in one step.
    ///
    /// Used by conflict resolution: older operations are superseded, the
    /// open conflict is closed, and `op` (if any) becomes the only pending
    /// operation for the entity.
    fn replace_pending(
        &self,
        record: &LocalRecord,
        op: Option<&NewOperation>,
    ) -> Result<Option<OperationId>>;

    /// Open or refresh the conflict for a record with the latest server copy.
    fn record_conflict(&self, entity_type: EntityType, server: &ServerRecord) -> Result<()>;

    /// Open conflict for one record, if any.
    fn open_conflict(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<OpenConflict>>;

    /// All open conflicts, oldest first.
    fn open_conflicts(&self) -> Result<Vec<OpenConflict>>;

    /// Drop the open conflict for a record. Missing conflicts are ignored.
    fn clear_conflict(&self, entity_type: EntityType, id: &EntityId) -> Result<()>;
}
