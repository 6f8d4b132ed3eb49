//! Common types shared across the FieldSync crates.
//!
//! This module provides the error type and the synchronizable data model
//! used by the local store, the remote client boundary and the sync engine.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    EntityId, EntityType, LocalRecord, NewOperation, OpKind, OperationId, PendingOperation,
    Properties, RecordStatus, Row, ServerRecord,
};
