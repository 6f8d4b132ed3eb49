//! Core sync engine that orchestrates push, pull, lock sweep and checkpoint.

use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fieldsync_common::{
    EntityId, EntityType, Error, LocalRecord, OpKind, OperationId, PendingOperation, Result,
    ServerRecord,
};
use fieldsync_storage::{LocalStore, RangeFilter, RemoteClient, RemoteError, META_LAST_SYNC};

use crate::config::SyncConfig;
use crate::conflict::{ConflictCase, ConflictDetector, Verdict};
use crate::connectivity::Connectivity;
use crate::locks::LockSweeper;
use crate::puller::DeltaPuller;
use crate::queue::OperationQueue;
use crate::resolution::Resolution;
use crate::retry::RetryConfig;
use crate::scheduler::{SyncScheduler, SyncTrigger};
use crate::state::{EngineStatus, RunOutcome, RunState, SkipReason, SyncEvent, SyncSummary};

/// Result of delivering one queued operation.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// The remote applied the operation.
    Delivered,
    /// The insert hit an existing row and was replayed as an upsert.
    Upserted,
    /// The remote rejected or never received the operation.
    RetryableFailure(RemoteError),
}

/// What happened to one pulled record.
enum Applied {
    Written,
    Conflicted,
    Unchanged,
}

/// Clears the single-flight flag when a run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Offline-first sync engine.
///
/// One instance per local store. Runs are single-flight: a run requested
/// while another executes is skipped, not queued.
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteClient>,
    connectivity: Arc<dyn Connectivity>,
    config: SyncConfig,
    retry: RetryConfig,
    queue: OperationQueue,
    puller: DeltaPuller,
    sweeper: LockSweeper,
    running: AtomicBool,
    status: RwLock<EngineStatus>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    /// Create a new sync engine.
    ///
    /// # Errors
    /// - `Error::InvalidInput` if the configuration is invalid
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteClient>,
        connectivity: Arc<dyn Connectivity>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);

        Ok(Self {
            queue: OperationQueue::new(store.clone()),
            puller: DeltaPuller::new(remote.clone(), config.page_size),
            sweeper: LockSweeper::new(store.clone()),
            retry: RetryConfig::from_sync_config(&config),
            store,
            remote,
            connectivity,
            config,
            running: AtomicBool::new(false),
            status: RwLock::new(EngineStatus::default()),
            events,
        })
    }

    /// Queue used by edit actions to record local mutations.
    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Subscribe to run events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Current engine status.
    pub async fn status(&self) -> EngineStatus {
        self.status.read().await.clone()
    }

    /// Checkpoint of the last completed pull.
    pub fn checkpoint(&self) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.store.get_meta(META_LAST_SYNC)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(checkpoint) => Ok(Some(checkpoint.with_timezone(&Utc))),
            Err(e) => {
                warn!("Ignoring unreadable checkpoint {:?}: {}", raw, e);
                Ok(None)
            }
        }
    }

    /// Start the scheduler loop on the current runtime.
    pub fn spawn_scheduler(self: Arc<Self>) -> (SyncScheduler, JoinHandle<()>) {
        let (scheduler, handle) = SyncScheduler::new(self.config.sync_interval);
        let task = tokio::spawn(handle.run(move |trigger| {
            let engine = self.clone();
            async move { engine.sync(trigger).await }
        }));
        (scheduler, task)
    }

    /// Run one synchronization: push, pull, lock sweep, checkpoint advance.
    ///
    /// Returns `Skipped` when another run is active, the device is offline
    /// or the store is not initialized. A fatal store error aborts the run
    /// and leaves the checkpoint untouched.
    pub async fn sync(&self, trigger: SyncTrigger) -> Result<RunOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync ({:?}) skipped: a run is in progress", trigger);
            return Ok(RunOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        let _guard = RunGuard(&self.running);

        if !self.connectivity.is_online() {
            debug!("Sync ({:?}) skipped: offline", trigger);
            return Ok(RunOutcome::Skipped(SkipReason::Offline));
        }
        match self.store.is_initialized() {
            Ok(true) => {}
            Ok(false) => {
                debug!("Sync ({:?}) skipped: store not initialized", trigger);
                return Ok(RunOutcome::Skipped(SkipReason::NotInitialized));
            }
            Err(e) => return Err(self.fault(e).await),
        }

        info!("Starting sync ({:?})", trigger);
        self.status.write().await.state = RunState::Running;
        self.emit(SyncEvent::RunStarted);

        match self.run().await {
            Ok(summary) => {
                info!(
                    "Sync completed: {} pushed, {} pulled, {} conflicts, {} abandoned in {:?}",
                    summary.pushed,
                    summary.pulled,
                    summary.conflicts,
                    summary.abandoned,
                    summary.duration
                );
                {
                    let mut status = self.status.write().await;
                    status.state = RunState::Idle;
                    status.last_summary = Some(summary.clone());
                    status.last_error = None;
                    status.last_run_at = Some(Utc::now());
                }
                self.emit(SyncEvent::RunCompleted(summary.clone()));
                Ok(RunOutcome::Completed(summary))
            }
            Err(e) => Err(self.fault(e).await),
        }
    }

    async fn fault(&self, e: Error) -> Error {
        error!("Sync aborted: {}", e);
        {
            let mut status = self.status.write().await;
            status.state = RunState::Faulted;
            status.last_error = Some(e.to_string());
            status.last_run_at = Some(Utc::now());
        }
        self.emit(SyncEvent::RunFaulted(e.to_string()));
        e
    }

    async fn run(&self) -> Result<SyncSummary> {
        let start = Instant::now();
        let mut summary = SyncSummary::default();

        self.push_phase(&mut summary).await?;

        let checkpoint = self.checkpoint()?;
        let pull_started = Utc::now();
        let complete = self.pull_phase(checkpoint, &mut summary).await?;
        self.raise_open_conflicts(&mut summary)?;

        summary.released_locks = self.sweeper.sweep(self.config.lock_ttl)?.len();

        if complete {
            self.advance_checkpoint(checkpoint, pull_started)?;
            summary.checkpoint_advanced = true;
        } else {
            warn!("Pull incomplete, checkpoint stays at {:?}", checkpoint);
        }

        summary.duration = start.elapsed();
        Ok(summary)
    }

    fn advance_checkpoint(
        &self,
        previous: Option<DateTime<Utc>>,
        pull_started: DateTime<Utc>,
    ) -> Result<()> {
        let next = previous.map_or(pull_started, |prev| prev.max(pull_started));
        self.store.set_meta(
            META_LAST_SYNC,
            &next.to_rfc3339_opts(SecondsFormat::Nanos, true),
        )?;
        debug!("Checkpoint advanced to {}", next);
        Ok(())
    }

    async fn push_phase(&self, summary: &mut SyncSummary) -> Result<()> {
        let pending = self.queue.list_pending()?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!("Pushing {} queued operations", pending.len());

        // Entities awaiting a conflict decision never push.
        let held: HashSet<(EntityType, EntityId)> = self
            .store
            .open_conflicts()?
            .into_iter()
            .map(|open| (open.entity_type, open.entity_id))
            .collect();
        // Entities with a failed delivery this run; their later operations wait.
        let mut blocked: HashSet<(EntityType, EntityId)> = HashSet::new();

        for op in pending {
            let key = (op.entity_type, op.entity_id.clone());
            if held.contains(&key) {
                debug!("{} {} {} held until its conflict is resolved", op.id, op.op_kind, op.entity_id);
                continue;
            }
            if blocked.contains(&key) {
                continue;
            }

            if self.retry.exhausted(op.attempts) {
                self.abandon(op, summary)?;
                continue;
            }

            match self.deliver(&op).await {
                DeliveryOutcome::Delivered | DeliveryOutcome::Upserted => {
                    self.queue.remove(op.id)?;
                    self.store.settle(op.entity_type, &op.entity_id)?;
                    summary.pushed += 1;
                }
                DeliveryOutcome::RetryableFailure(e) => {
                    summary.failed += 1;
                    blocked.insert(key);
                    match self.queue.increment_attempts(op.id) {
                        Ok(attempts) => {
                            warn!(
                                "{} {} {} failed (attempt {}): {}",
                                op.id, op.op_kind, op.entity_id, attempts, e
                            );
                            self.retry.pause(attempts).await;
                        }
                        Err(Error::NotFound(_)) => {
                            debug!("{} was superseded during delivery", op.id);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Ok(())
    }

    fn abandon(&self, op: PendingOperation, summary: &mut SyncSummary) -> Result<()> {
        warn!(
            "Abandoning {} {} {} {} after {} attempts",
            op.id, op.op_kind, op.entity_type, op.entity_id, op.attempts
        );
        self.queue.remove(op.id)?;
        self.store.settle(op.entity_type, &op.entity_id)?;
        summary.abandoned += 1;
        self.emit(SyncEvent::OperationAbandoned(op));
        Ok(())
    }

    /// Send one operation to the remote.
    pub async fn deliver(&self, op: &PendingOperation) -> DeliveryOutcome {
        let result = match op.op_kind {
            OpKind::Insert => match self.remote.insert(op.entity_type, op.payload.clone()).await {
                Err(e) if e.is_unique_violation() => {
                    debug!("{} already exists remotely, upserting", op.entity_id);
                    return match self.remote.upsert(op.entity_type, op.payload.clone()).await {
                        Ok(()) => DeliveryOutcome::Upserted,
                        Err(e) => DeliveryOutcome::RetryableFailure(e),
                    };
                }
                other => other,
            },
            OpKind::Update => {
                self.remote
                    .update(op.entity_type, &op.entity_id, op.payload.clone())
                    .await
            }
            OpKind::Delete => self.remote.delete(op.entity_type, &op.entity_id).await,
        };

        match result {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(e) => DeliveryOutcome::RetryableFailure(e),
        }
    }

    /// Pull layers, their features and new corrections. Returns whether every query succeeded.
    async fn pull_phase(
        &self,
        checkpoint: Option<DateTime<Utc>>,
        summary: &mut SyncSummary,
    ) -> Result<bool> {
        let mut complete = true;

        let layers = if self.store.count_records(EntityType::Layer, None)? == 0 {
            RangeFilter::all()
        } else {
            RangeFilter::all().updated_since(checkpoint)
        };
        complete &= self
            .pull_records(EntityType::Layer, &layers, checkpoint, summary)
            .await?;

        for layer_id in self.store.layer_ids()? {
            let cached = self.store.count_records(EntityType::Feature, Some(&layer_id))?;
            let filter = DeltaPuller::layer_filter(&layer_id, cached, checkpoint);
            complete &= self
                .pull_records(EntityType::Feature, &filter, checkpoint, summary)
                .await?;
        }

        complete &= self.pull_corrections(checkpoint, summary).await?;
        Ok(complete)
    }

    async fn pull_records(
        &self,
        table: EntityType,
        filter: &RangeFilter,
        checkpoint: Option<DateTime<Utc>>,
        summary: &mut SyncSummary,
    ) -> Result<bool> {
        let mut pulled = 0;
        let mut errors = 0;

        let report = self
            .puller
            .pull(table, filter, |incoming| {
                let id = incoming.id.clone();
                match self.apply_incoming(table, incoming, checkpoint) {
                    Ok(Applied::Written) => pulled += 1,
                    Ok(Applied::Conflicted | Applied::Unchanged) => {}
                    Err(e) if !e.is_fatal() => {
                        warn!("Could not apply {} {}: {}", table, id, e);
                        errors += 1;
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            })
            .await?;

        summary.pulled += pulled;
        summary.record_errors += errors;
        Ok(report.is_complete())
    }

    fn apply_incoming(
        &self,
        table: EntityType,
        incoming: ServerRecord,
        checkpoint: Option<DateTime<Utc>>,
    ) -> Result<Applied> {
        let local = self.store.get_record(table, &incoming.id)?;
        if local.is_none() && !self.store.pending_for(table, &incoming.id)?.is_empty() {
            debug!("{} {} has a queued local delete, not restoring", table, incoming.id);
            return Ok(Applied::Unchanged);
        }

        match ConflictDetector::classify(table, local.as_ref(), &incoming, checkpoint) {
            Verdict::Apply(record) => {
                if self.store.apply_server_record(&record)? {
                    Ok(Applied::Written)
                } else {
                    debug!("{} {} was edited during the pull", table, record.id);
                    Ok(Applied::Unchanged)
                }
            }
            Verdict::Conflict(case) => {
                info!(
                    "Conflict on {} {} ({} fields differ)",
                    table,
                    case.entity_id,
                    case.diffs.len()
                );
                self.store.record_conflict(table, &case.server)?;
                Ok(Applied::Conflicted)
            }
            Verdict::Skip(cause) => {
                debug!("Skipping {} {}: {:?}", table, incoming.id, cause);
                Ok(Applied::Unchanged)
            }
        }
    }

    /// Publish every conflict still waiting for a decision, once per run.
    fn raise_open_conflicts(&self, summary: &mut SyncSummary) -> Result<()> {
        for open in self.store.open_conflicts()? {
            let local = match self.store.get_record(open.entity_type, &open.entity_id) {
                Ok(Some(local)) => local,
                Ok(None) => {
                    debug!("{} {} is gone locally, closing its conflict", open.entity_type, open.entity_id);
                    self.store.clear_conflict(open.entity_type, &open.entity_id)?;
                    continue;
                }
                Err(e) if !e.is_fatal() => {
                    warn!("Could not load {} {}: {}", open.entity_type, open.entity_id, e);
                    summary.record_errors += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut case = ConflictCase::new(open.entity_type, local, open.server);
            case.detected_at = open.detected_at;
            summary.conflicts += 1;
            self.emit(SyncEvent::Conflict(Box::new(case)));
        }
        Ok(())
    }

    /// Corrections are append-only: new rows are inserted, known ones left alone.
    async fn pull_corrections(
        &self,
        checkpoint: Option<DateTime<Utc>>,
        summary: &mut SyncSummary,
    ) -> Result<bool> {
        let filter = if self.store.count_records(EntityType::Correction, None)? == 0 {
            RangeFilter::all()
        } else {
            RangeFilter::all().created_since(checkpoint)
        };

        let mut pulled = 0;
        let mut errors = 0;
        let report = self
            .puller
            .pull(EntityType::Correction, &filter, |incoming| {
                let record = LocalRecord::from_server(EntityType::Correction, &incoming);
                match self.store.insert_record(&record) {
                    Ok(()) => pulled += 1,
                    Err(Error::AlreadyExists(_)) => {}
                    Err(e) if !e.is_fatal() => {
                        warn!("Could not insert correction {}: {}", record.id, e);
                        errors += 1;
                    }
                    Err(e) => return Err(e),
                }
                Ok(())
            })
            .await?;

        summary.pulled += pulled;
        summary.record_errors += errors;
        Ok(report.is_complete())
    }

    /// Store the operator's merge for a conflict.
    ///
    /// Every operation queued for the entity is superseded and the conflict
    /// is closed. If the merge keeps a local value, a single update carrying
    /// the merge is queued and returned; the record stays dirty until it is
    /// delivered and goes through conflict detection again on the next run.
    ///
    /// # Errors
    /// - `Error::NotFound` if the conflict is no longer open
    /// - `Error::InvalidInput` if a newer server copy arrived since the case was raised
    pub fn resolve_conflict(&self, resolution: &Resolution) -> Result<Option<OperationId>> {
        let case = resolution.case();
        let open = self
            .store
            .open_conflict(case.entity_type, &case.entity_id)?
            .ok_or_else(|| {
                Error::NotFound(format!("open conflict on {} {}", case.entity_type, case.entity_id))
            })?;
        if open.server.updated_at != case.server.updated_at {
            return Err(Error::InvalidInput(format!(
                "{} {} changed on the server since the conflict was raised",
                case.entity_type, case.entity_id
            )));
        }

        let record = resolution.merged_record();
        let op = resolution.operation()?;
        let queued = self.store.replace_pending(&record, op.as_ref())?;
        info!(
            "Resolved conflict on {} {} ({})",
            record.entity_type,
            record.id,
            if queued.is_some() { "merge queued" } else { "server copy kept" }
        );
        Ok(queued)
    }

    /// Take the edit lock on a record for `user`.
    ///
    /// Returns false if another user holds the remote lock. When offline the
    /// lock is only recorded locally; the sweeper bounds its lifetime.
    pub async fn lock_record(
        &self,
        entity_type: EntityType,
        id: &EntityId,
        user: &str,
    ) -> Result<bool> {
        let mut record = self
            .store
            .get_record(entity_type, id)?
            .ok_or_else(|| Error::NotFound(format!("{} {}", entity_type, id)))?;

        if self.connectivity.is_online() && !self.remote.lock(id, user).await? {
            info!("{} {} is locked by another user", entity_type, id);
            return Ok(false);
        }

        record.lock(user, Utc::now(), self.config.lock_ttl);
        if !self.store.write_lock(&record)? {
            return Err(Error::NotFound(format!("{} {}", entity_type, id)));
        }
        Ok(true)
    }

    /// Release the edit lock on a record.
    pub async fn unlock_record(&self, entity_type: EntityType, id: &EntityId) -> Result<()> {
        if self.store.get_record(entity_type, id)?.is_none() {
            return Err(Error::NotFound(format!("{} {}", entity_type, id)));
        }

        if self.connectivity.is_online() {
            self.remote.unlock(id).await?;
        }

        self.store.release_lock(entity_type, id)?;
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
