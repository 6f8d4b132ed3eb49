//! Remote delta client trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use fieldsync_common::{EntityId, EntityType, Error, Row};

/// Errors reported by a remote delta client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The row already exists (duplicate primary key).
    #[error("Unique violation: {0}")]
    UniqueViolation(String),

    /// The addressed row does not exist.
    #[error("Row not found: {0}")]
    NotFound(String),

    /// Connection dropped or timed out.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with an error status.
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// Any other failure.
    #[error("Remote failure: {0}")]
    Other(String),
}

impl RemoteError {
    /// Only uniqueness violations trigger the insert-to-upsert fallback.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, RemoteError::UniqueViolation(_))
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        Error::Remote(err.to_string())
    }
}

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Filter for a ranged delta query.
///
/// Results are always ordered by ascending `updated_at`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeFilter {
    /// Restrict to one layer.
    pub layer_id: Option<String>,
    /// Only rows with `updated_at >= updated_from`.
    pub updated_from: Option<DateTime<Utc>>,
    /// Only rows with `created_at >= created_from`.
    pub created_from: Option<DateTime<Utc>>,
}

impl RangeFilter {
    /// No restriction (bootstrap pull).
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_layer(mut self, layer_id: impl Into<String>) -> Self {
        self.layer_id = Some(layer_id.into());
        self
    }

    pub fn updated_since(mut self, from: Option<DateTime<Utc>>) -> Self {
        self.updated_from = from;
        self
    }

    pub fn created_since(mut self, from: Option<DateTime<Utc>>) -> Self {
        self.created_from = from;
        self
    }
}

/// Remote delta client used by the sync engine.
///
/// Implementations perform the actual network calls and must handle their
/// own authentication. The engine never assumes a call succeeded unless it
/// returned `Ok`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Get the client name (e.g., "supabase", "memory").
    fn name(&self) -> &str;

    /// Insert a new row.
    ///
    /// # Errors
    /// - `UniqueViolation` if a row with the same id already exists
    /// - Network/server errors
    async fn insert(&self, table: EntityType, row: Row) -> RemoteResult<()>;

    /// Insert a row or replace the existing one with the same id.
    async fn upsert(&self, table: EntityType, row: Row) -> RemoteResult<()>;

    /// Apply a partial row to an existing record.
    async fn update(&self, table: EntityType, id: &EntityId, patch: Row) -> RemoteResult<()>;

    /// Delete a record.
    async fn delete(&self, table: EntityType, id: &EntityId) -> RemoteResult<()>;

    /// Fetch one page of rows matching `filter`, ordered by `updated_at` ascending.
    async fn query_range(
        &self,
        table: EntityType,
        filter: &RangeFilter,
        offset: usize,
        limit: usize,
    ) -> RemoteResult<Vec<Row>>;

    /// Try to take the edit lock on an entity. Returns false if another user holds it.
    async fn lock(&self, entity: &EntityId, user: &str) -> RemoteResult<bool>;

    /// Release the edit lock on an entity.
    async fn unlock(&self, entity: &EntityId) -> RemoteResult<()>;
}
