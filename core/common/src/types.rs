//! Data model shared by the local store, remote boundary and sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

/// Schema-less property set attached to a record.
///
/// Ordered so that diffs and serialized payloads are deterministic.
pub type Properties = BTreeMap<String, serde_json::Value>;

/// A single row as exchanged with the remote store.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Identifier of a synchronizable entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create a new EntityId from a string.
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidInput("EntityId cannot be empty".to_string()));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random id for a locally created entity.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a queued operation. Increases with creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub i64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Kind of synchronizable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Feature,
    Correction,
    Layer,
}

impl EntityType {
    /// All entity types, in dependency order.
    pub const ALL: [EntityType; 3] = [EntityType::Layer, EntityType::Feature, EntityType::Correction];

    /// Table name used both locally and remotely.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Feature => "features",
            EntityType::Correction => "corrections",
            EntityType::Layer => "layers",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Feature => "feature",
            EntityType::Correction => "correction",
            EntityType::Layer => "layer",
        }
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "feature" => Ok(EntityType::Feature),
            "correction" => Ok(EntityType::Correction),
            "layer" => Ok(EntityType::Layer),
            other => Err(Error::InvalidInput(format!("Unknown entity type: {}", other))),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of local mutation captured in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "insert",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl FromStr for OpKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(OpKind::Insert),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            other => Err(Error::InvalidInput(format!("Unknown operation kind: {}", other))),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Pending,
    Corrected,
    Validated,
    Rejected,
    /// Held by an agent for editing.
    Locked,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Corrected => "corrected",
            RecordStatus::Validated => "validated",
            RecordStatus::Rejected => "rejected",
            RecordStatus::Locked => "locked",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "corrected" => Ok(RecordStatus::Corrected),
            "validated" => Ok(RecordStatus::Validated),
            "rejected" => Ok(RecordStatus::Rejected),
            "locked" => Ok(RecordStatus::Locked),
            other => Err(Error::InvalidInput(format!("Unknown record status: {}", other))),
        }
    }
}

/// A synchronizable entity as cached locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: EntityId,
    pub entity_type: EntityType,
    /// Owning layer (None for layers themselves).
    pub layer_id: Option<String>,
    /// Parent feature, set for corrections.
    pub feature_id: Option<EntityId>,
    /// Opaque geometry document; decoding happens outside the engine.
    pub geometry: Option<serde_json::Value>,
    pub properties: Properties,
    pub status: RecordStatus,
    /// A local edit exists that the remote has not confirmed.
    pub dirty: bool,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    /// Create a fresh, clean record.
    pub fn new(entity_type: EntityType, id: EntityId, layer_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            entity_type,
            layer_id,
            feature_id: None,
            geometry: None,
            properties: Properties::new(),
            status: RecordStatus::Pending,
            dirty: false,
            locked_by: None,
            locked_at: None,
            lock_expires: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the property map.
    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    /// Set the geometry document.
    pub fn with_geometry(mut self, geometry: serde_json::Value) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Set the parent feature.
    pub fn with_feature(mut self, feature_id: EntityId) -> Self {
        self.feature_id = Some(feature_id);
        self
    }

    /// Build the local copy of a server record. The result is clean.
    pub fn from_server(entity_type: EntityType, server: &ServerRecord) -> Self {
        Self {
            id: server.id.clone(),
            entity_type,
            layer_id: server.layer_id.clone(),
            feature_id: server.feature_id.clone(),
            geometry: server.geometry.clone(),
            properties: server.properties.clone(),
            status: server.status,
            dirty: false,
            locked_by: server.locked_by.clone(),
            locked_at: server.locked_at,
            lock_expires: None,
            created_at: server.created_at.unwrap_or(server.updated_at),
            updated_at: server.updated_at,
        }
    }

    /// Whether the record is locked and its lock outlived `ttl` at `now`.
    pub fn lock_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.status != RecordStatus::Locked {
            return false;
        }
        let Some(locked_at) = self.locked_at else {
            // A lock without a timestamp can never be renewed, release it.
            return true;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now >= locked_at + ttl,
            Err(_) => false,
        }
    }

    /// Mark the record locked by `user` at `now`.
    pub fn lock(&mut self, user: impl Into<String>, now: DateTime<Utc>, ttl: Duration) {
        self.status = RecordStatus::Locked;
        self.locked_by = Some(user.into());
        self.locked_at = Some(now);
        self.lock_expires = chrono::Duration::from_std(ttl).ok().map(|ttl| now + ttl);
    }

    /// Full row representation sent to the remote on insert.
    pub fn to_row(&self) -> Row {
        let server = ServerRecord {
            id: self.id.clone(),
            layer_id: self.layer_id.clone(),
            feature_id: self.feature_id.clone(),
            geometry: self.geometry.clone(),
            properties: self.properties.clone(),
            status: self.status,
            locked_by: self.locked_by.clone(),
            locked_at: self.locked_at,
            created_at: Some(self.created_at),
            updated_at: self.updated_at,
        };
        server.to_row()
    }
}

/// A record as returned by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: EntityId,
    #[serde(default)]
    pub layer_id: Option<String>,
    #[serde(default)]
    pub feature_id: Option<EntityId>,
    #[serde(default)]
    pub geometry: Option<serde_json::Value>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub status: RecordStatus,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ServerRecord {
    /// Parse a remote row.
    pub fn from_row(row: Row) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(row))?)
    }

    /// Convert into a remote row.
    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(row)) => row,
            // A struct always serializes to an object.
            _ => Row::new(),
        }
    }
}

/// A mutation about to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub op_kind: OpKind,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub payload: Row,
}

impl NewOperation {
    /// Insert carrying the full row of `record`.
    pub fn insert(record: &LocalRecord) -> Self {
        Self {
            op_kind: OpKind::Insert,
            entity_type: record.entity_type,
            entity_id: record.id.clone(),
            payload: record.to_row(),
        }
    }

    /// Update carrying a partial row.
    pub fn update(entity_type: EntityType, entity_id: EntityId, patch: Row) -> Self {
        Self {
            op_kind: OpKind::Update,
            entity_type,
            entity_id,
            payload: patch,
        }
    }

    pub fn delete(entity_type: EntityType, entity_id: EntityId) -> Self {
        Self {
            op_kind: OpKind::Delete,
            entity_type,
            entity_id,
            payload: Row::new(),
        }
    }
}

/// A locally-originated mutation awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: OperationId,
    pub op_kind: OpKind,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub payload: Row,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}
