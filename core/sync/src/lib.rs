//! FieldSync Sync Engine
//!
//! Offline-first synchronization of locally edited parcel data:
//! - Durable operation queue with FIFO delivery and bounded retries
//! - Paginated delta pull bounded by a persisted checkpoint
//! - Conflict detection with a per-field resolution surface
//! - Expiry of stale edit locks
//! - Single-flight orchestration driven by a trigger scheduler

pub mod config;
pub mod conflict;
pub mod connectivity;
pub mod engine;
pub mod locks;
pub mod puller;
pub mod queue;
pub mod resolution;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use config::SyncConfig;
pub use conflict::{
    diff_properties, ConflictCase, ConflictDetector, FieldDiff, SkipCause, StatusDiff, Verdict,
};
pub use connectivity::{Connectivity, ConnectivityFlag};
pub use engine::{DeliveryOutcome, SyncEngine};
pub use locks::LockSweeper;
pub use puller::{DeltaPuller, PullReport};
pub use queue::OperationQueue;
pub use resolution::{Resolution, Side};
pub use retry::RetryConfig;
pub use scheduler::{SyncScheduler, SyncSchedulerHandle, SyncTrigger};
pub use state::{EngineStatus, RunOutcome, RunState, SkipReason, SyncEvent, SyncSummary};
