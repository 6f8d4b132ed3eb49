//! Conflict detection between cached records and pulled server copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use fieldsync_common::{EntityId, EntityType, LocalRecord, Properties, RecordStatus, ServerRecord};

/// Values of one field on both sides of a conflict. `None` means the key is absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub local: Option<Value>,
    pub server: Option<Value>,
}

/// Workflow status on both sides of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDiff {
    pub local: RecordStatus,
    pub server: RecordStatus,
}

/// A record edited locally and remotely since the last checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCase {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub local: LocalRecord,
    pub server: ServerRecord,
    /// Property keys whose values differ.
    pub diffs: BTreeMap<String, FieldDiff>,
    /// Property keys equal on both sides.
    pub unchanged: Vec<String>,
    /// Set when the geometries differ.
    pub geometry: Option<FieldDiff>,
    /// Set when the workflow statuses differ.
    pub status: Option<StatusDiff>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictCase {
    pub fn new(entity_type: EntityType, local: LocalRecord, server: ServerRecord) -> Self {
        let (diffs, unchanged) = diff_properties(&local.properties, &server.properties);
        let geometry = (local.geometry != server.geometry).then(|| FieldDiff {
            local: local.geometry.clone(),
            server: server.geometry.clone(),
        });
        let status = (local.status != server.status).then_some(StatusDiff {
            local: local.status,
            server: server.status,
        });
        Self {
            entity_type,
            entity_id: server.id.clone(),
            local,
            server,
            diffs,
            unchanged,
            geometry,
            status,
            detected_at: Utc::now(),
        }
    }

    /// Whether any property, the geometry or the status differs.
    pub fn has_differences(&self) -> bool {
        !self.diffs.is_empty() || self.geometry.is_some() || self.status.is_some()
    }
}

/// Partition the union of keys of two property maps into changed and unchanged.
pub fn diff_properties(
    local: &Properties,
    server: &Properties,
) -> (BTreeMap<String, FieldDiff>, Vec<String>) {
    let mut diffs = BTreeMap::new();
    let mut unchanged = Vec::new();

    let keys = local.keys().chain(server.keys());
    for key in keys {
        if diffs.contains_key(key) || unchanged.contains(key) {
            continue;
        }
        let (l, s) = (local.get(key), server.get(key));
        if l == s {
            unchanged.push(key.clone());
        } else {
            diffs.insert(
                key.clone(),
                FieldDiff {
                    local: l.cloned(),
                    server: s.cloned(),
                },
            );
        }
    }
    unchanged.sort();
    (diffs, unchanged)
}

/// Why a pulled record was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipCause {
    /// The clean local copy already matches the server.
    UpToDate,
    /// The local copy is dirty and the server copy predates the checkpoint.
    StaleIncoming,
}

/// Classification of one pulled record.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Write the server copy locally.
    Apply(LocalRecord),
    /// Keep the local copy and surface the case for resolution.
    Conflict(Box<ConflictCase>),
    /// Nothing to do.
    Skip(SkipCause),
}

/// Decides between clean apply and conflict.
///
/// The server copy wins whenever the local copy is absent or clean. A dirty
/// local copy is never overwritten: if the server changed it at or after the
/// checkpoint it is a conflict, otherwise the local edit is simply still
/// waiting to be pushed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    pub fn classify(
        entity_type: EntityType,
        local: Option<&LocalRecord>,
        incoming: &ServerRecord,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Verdict {
        let Some(local) = local else {
            return Verdict::Apply(LocalRecord::from_server(entity_type, incoming));
        };

        if !local.dirty {
            let applied = LocalRecord::from_server(entity_type, incoming);
            if local.updated_at == incoming.updated_at && same_content(local, &applied) {
                return Verdict::Skip(SkipCause::UpToDate);
            }
            return Verdict::Apply(applied);
        }

        let concurrent = checkpoint.map_or(true, |cp| incoming.updated_at >= cp);
        if concurrent {
            Verdict::Conflict(Box::new(ConflictCase::new(
                entity_type,
                local.clone(),
                incoming.clone(),
            )))
        } else {
            Verdict::Skip(SkipCause::StaleIncoming)
        }
    }
}

fn same_content(a: &LocalRecord, b: &LocalRecord) -> bool {
    a.properties == b.properties
        && a.geometry == b.geometry
        && a.status == b.status
        && a.layer_id == b.layer_id
        && a.feature_id == b.feature_id
        && a.locked_by == b.locked_by
        && a.locked_at == b.locked_at
}
