//! Storage boundaries for the FieldSync engine.
//!
//! This module provides the two collaborators the sync engine moves data
//! between: the remote delta client (a trait plus an in-memory
//! implementation for tests and development) and the durable local store
//! (a trait plus its SQLite implementation).
//!
//! # Design Principles
//! - The engine depends only on the `RemoteClient` and `LocalStore` traits
//! - Remote errors distinguish uniqueness violations from everything else
//! - Local mutations and their queue entries are committed together

pub mod memory;
pub mod remote;
pub mod sqlite;
pub mod store;

pub use memory::{MemoryRemote, RemoteCall, RemoteMethod};
pub use remote::{RangeFilter, RemoteClient, RemoteError, RemoteResult};
pub use sqlite::SqliteStore;
pub use store::{LocalEdit, LocalStore, OpenConflict, PatchFn, META_INITIALIZED, META_LAST_SYNC};
