//! Durable operation queue.
//!
//! Every local mutation is captured as a [`PendingOperation`] and kept until
//! the remote confirms delivery, a conflict resolution supersedes it, or the
//! push phase abandons it. Delivery order is creation order.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use fieldsync_common::{
    EntityId, EntityType, LocalRecord, NewOperation, OpKind, OperationId, PendingOperation,
    Properties, RecordStatus, Result, Row,
};
use fieldsync_storage::{LocalEdit, LocalStore};

/// Queue facade over the local store.
#[derive(Clone)]
pub struct OperationQueue {
    store: Arc<dyn LocalStore>,
}

impl OperationQueue {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    /// Queue a raw operation. Never touches the network.
    pub fn enqueue(
        &self,
        op_kind: OpKind,
        entity_type: EntityType,
        entity_id: EntityId,
        payload: Row,
    ) -> Result<OperationId> {
        let op = NewOperation {
            op_kind,
            entity_type,
            entity_id,
            payload,
        };
        let id = self.store.enqueue(&op)?;
        debug!("Queued {} {} {} as {}", op.op_kind, op.entity_type, op.entity_id, id);
        Ok(id)
    }

    /// Pending operations in delivery order.
    pub fn list_pending(&self) -> Result<Vec<PendingOperation>> {
        self.store.list_pending()
    }

    /// Pending operations for one entity, in delivery order.
    pub fn pending_for_entity(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
    ) -> Result<Vec<PendingOperation>> {
        self.store.pending_for(entity_type, entity_id)
    }

    /// Drop an operation. Unknown ids are ignored.
    pub fn remove(&self, id: OperationId) -> Result<()> {
        self.store.remove_operation(id)
    }

    /// Record a failed delivery attempt and return the new count.
    pub fn increment_attempts(&self, id: OperationId) -> Result<u32> {
        self.store.increment_attempts(id)
    }

    /// Drop every pending operation for an entity and return how many were removed.
    pub fn supersede(&self, entity_type: EntityType, entity_id: &EntityId) -> Result<usize> {
        let pending = self.store.pending_for(entity_type, entity_id)?;
        for op in &pending {
            self.store.remove_operation(op.id)?;
        }
        if !pending.is_empty() {
            debug!("Superseded {} operations for {} {}", pending.len(), entity_type, entity_id);
        }
        Ok(pending.len())
    }

    /// Number of operations waiting for delivery.
    pub fn len(&self) -> Result<usize> {
        Ok(self.store.list_pending()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Create a record locally and queue its insert.
    pub fn record_insert(&self, record: &LocalRecord) -> Result<OperationId> {
        let mut record = record.clone();
        record.dirty = true;
        record.updated_at = Utc::now();
        self.store
            .commit_edit(LocalEdit::Upsert(&record), &NewOperation::insert(&record))
    }

    /// Change properties and optionally status of an existing record and queue the patch.
    ///
    /// Only the given property keys are changed; the queued patch carries the
    /// full resulting property map so the remote ends up identical. The
    /// record is read and written in the same transaction as the queue entry.
    ///
    /// # Errors
    /// - `Error::NotFound` if the record is not cached locally
    pub fn record_update(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        changes: Properties,
        status: Option<RecordStatus>,
    ) -> Result<OperationId> {
        let mut changes = Some(changes);
        self.store
            .commit_patch(entity_type, entity_id, &mut |record| {
                record.properties.extend(changes.take().unwrap_or_default());
                let mut patch = Row::new();
                patch.insert(
                    "properties".to_string(),
                    serde_json::to_value(&record.properties)?,
                );
                if let Some(status) = status {
                    record.status = status;
                    patch.insert("status".to_string(), Value::from(status.as_str()));
                }
                record.dirty = true;
                record.updated_at = Utc::now();
                Ok(patch)
            })
    }

    /// Replace the geometry of an existing record and queue the patch.
    ///
    /// # Errors
    /// - `Error::NotFound` if the record is not cached locally
    pub fn record_geometry(
        &self,
        entity_type: EntityType,
        entity_id: &EntityId,
        geometry: Value,
    ) -> Result<OperationId> {
        self.store
            .commit_patch(entity_type, entity_id, &mut |record| {
                let mut patch = Row::new();
                patch.insert("geometry".to_string(), geometry.clone());
                record.geometry = Some(geometry.clone());
                record.dirty = true;
                record.updated_at = Utc::now();
                Ok(patch)
            })
    }

    /// Remove a record locally and queue its delete.
    pub fn record_delete(&self, entity_type: EntityType, entity_id: &EntityId) -> Result<OperationId> {
        self.store.commit_edit(
            LocalEdit::Delete(entity_type, entity_id),
            &NewOperation::delete(entity_type, entity_id.clone()),
        )
    }
}
