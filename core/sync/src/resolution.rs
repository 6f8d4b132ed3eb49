//! Operator-driven resolution of a [`ConflictCase`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use fieldsync_common::{Error, LocalRecord, NewOperation, Properties, Result, Row};

use crate::conflict::ConflictCase;

/// Which side's value to keep for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Local,
    #[default]
    Server,
}

/// Per-field choices for one conflict. Every differing field starts on the server side.
#[derive(Debug, Clone)]
pub struct Resolution {
    case: ConflictCase,
    choices: BTreeMap<String, Side>,
    geometry: Side,
    status: Side,
}

impl Resolution {
    pub fn new(case: ConflictCase) -> Self {
        let choices = case.diffs.keys().map(|k| (k.clone(), Side::Server)).collect();
        Self {
            case,
            choices,
            geometry: Side::Server,
            status: Side::Server,
        }
    }

    pub fn case(&self) -> &ConflictCase {
        &self.case
    }

    /// Current choice for a differing field.
    pub fn choice(&self, key: &str) -> Option<Side> {
        self.choices.get(key).copied()
    }

    pub fn geometry_choice(&self) -> Side {
        self.geometry
    }

    pub fn status_choice(&self) -> Side {
        self.status
    }

    /// Choose a side for one differing field.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if `key` is not a differing field
    pub fn choose(&mut self, key: &str, side: Side) -> Result<()> {
        match self.choices.get_mut(key) {
            Some(choice) => {
                *choice = side;
                Ok(())
            }
            None => Err(Error::InvalidInput(format!(
                "{} is not a conflicting field of {}",
                key, self.case.entity_id
            ))),
        }
    }

    pub fn choose_local(&mut self, key: &str) -> Result<()> {
        self.choose(key, Side::Local)
    }

    pub fn choose_server(&mut self, key: &str) -> Result<()> {
        self.choose(key, Side::Server)
    }

    pub fn choose_geometry(&mut self, side: Side) {
        self.geometry = side;
    }

    pub fn choose_status(&mut self, side: Side) {
        self.status = side;
    }

    /// Keep every local value, geometry and status included.
    pub fn accept_all_local(&mut self) {
        self.set_all(Side::Local);
    }

    /// Keep every server value, geometry and status included.
    pub fn accept_all_server(&mut self) {
        self.set_all(Side::Server);
    }

    fn set_all(&mut self, side: Side) {
        for choice in self.choices.values_mut() {
            *choice = side;
        }
        self.geometry = side;
        self.status = side;
    }

    fn keeps_local_geometry(&self) -> bool {
        self.case.geometry.is_some() && self.geometry == Side::Local
    }

    fn keeps_local_status(&self) -> bool {
        self.case.status.is_some() && self.status == Side::Local
    }

    /// Whether the merge keeps any local value and therefore has to be pushed.
    pub fn uses_local(&self) -> bool {
        self.keeps_local_geometry()
            || self.keeps_local_status()
            || self.choices.values().any(|side| *side == Side::Local)
    }

    /// Server properties with the chosen local values applied on top.
    pub fn merged_properties(&self) -> Properties {
        let mut merged = self.case.server.properties.clone();
        for (key, side) in &self.choices {
            if *side != Side::Local {
                continue;
            }
            match self.case.local.properties.get(key) {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged
    }

    /// The record to store locally once the operator confirms.
    ///
    /// Starts from the server snapshot. If a local value was kept the record
    /// stays dirty until [`Resolution::operation`] is delivered.
    pub fn merged_record(&self) -> LocalRecord {
        let mut record = LocalRecord::from_server(self.case.entity_type, &self.case.server);
        record.properties = self.merged_properties();
        if self.keeps_local_geometry() {
            record.geometry = self.case.local.geometry.clone();
        }
        if self.keeps_local_status() {
            record.status = self.case.local.status;
        }
        if self.uses_local() {
            record.dirty = true;
            record.updated_at = Utc::now();
        }
        record
    }

    /// Update that carries the merge to the remote, when a local value was kept.
    pub fn operation(&self) -> Result<Option<NewOperation>> {
        if !self.uses_local() {
            return Ok(None);
        }
        let mut patch = Row::new();
        patch.insert(
            "properties".to_string(),
            serde_json::to_value(self.merged_properties())?,
        );
        if self.keeps_local_geometry() {
            patch.insert(
                "geometry".to_string(),
                self.case.local.geometry.clone().unwrap_or_default(),
            );
        }
        if self.keeps_local_status() {
            patch.insert(
                "status".to_string(),
                Value::from(self.case.local.status.as_str()),
            );
        }
        Ok(Some(NewOperation::update(
            self.case.entity_type,
            self.case.entity_id.clone(),
            patch,
        )))
    }
}
