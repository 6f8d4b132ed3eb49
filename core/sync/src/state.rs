//! Run state, summaries and events published by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use fieldsync_common::PendingOperation;

use crate::conflict::ConflictCase;

/// Orchestrator state machine.
///
/// `Faulted` is only a record of the last run; the next trigger starts a
/// new run as usual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    #[default]
    Idle,
    Running,
    Faulted,
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSummary {
    /// Operations the remote confirmed.
    pub pushed: usize,
    /// Server records written locally.
    pub pulled: usize,
    /// Conflict cases raised.
    pub conflicts: usize,
    /// Operations dropped after exhausting their attempts.
    pub abandoned: usize,
    /// Deliveries that failed and stay queued.
    pub failed: usize,
    /// Pulled records that could not be applied locally and were skipped.
    pub record_errors: usize,
    /// Expired locks released by the sweep.
    pub released_locks: usize,
    /// Whether the checkpoint moved forward.
    pub checkpoint_advanced: bool,
    pub duration: Duration,
}

/// Why a trigger did not start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
    NotInitialized,
}

/// Result of a sync trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(SyncSummary),
    Skipped(SkipReason),
}

impl RunOutcome {
    pub fn summary(&self) -> Option<&SyncSummary> {
        match self {
            RunOutcome::Completed(summary) => Some(summary),
            RunOutcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped(_))
    }
}

/// Snapshot of the engine for status displays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStatus {
    pub state: RunState,
    pub last_summary: Option<SyncSummary>,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Notifications published while runs execute.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    RunStarted,
    /// One per open conflict in every run until it is resolved.
    Conflict(Box<ConflictCase>),
    /// An operation exceeded its attempts and was dropped.
    OperationAbandoned(PendingOperation),
    RunCompleted(SyncSummary),
    RunFaulted(String),
}
