//! Sync scheduling - foreground, periodic and manual triggers.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use fieldsync_common::{Error, Result};

use crate::state::{RunOutcome, SkipReason};

/// Event that asks for a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTrigger {
    /// The application came to the foreground.
    Foreground,
    /// The periodic timer fired.
    Timer,
    /// The user asked for a sync.
    Manual,
}

type Responder = oneshot::Sender<Result<RunOutcome>>;

enum SchedulerMessage {
    Trigger(SyncTrigger, Option<Responder>),
    Shutdown,
}

/// Sender side of the scheduler. Cheap to clone and hand to UI code.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SchedulerMessage>,
}

impl SyncScheduler {
    /// Create a scheduler whose timer fires every `period`.
    pub fn new(period: Duration) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let handle = SyncSchedulerHandle { period, request_rx };
        (Self { request_tx }, handle)
    }

    /// Ask for a run without waiting for it.
    ///
    /// Returns false if the request was dropped because the scheduler is
    /// stopped or already has a backlog.
    pub fn request(&self, trigger: SyncTrigger) -> bool {
        match self
            .request_tx
            .try_send(SchedulerMessage::Trigger(trigger, None))
        {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropped {:?} trigger: {}", trigger, e);
                false
            }
        }
    }

    /// Ask for a run and wait for its outcome.
    pub async fn request_and_wait(&self, trigger: SyncTrigger) -> Result<RunOutcome> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SchedulerMessage::Trigger(trigger, Some(response_tx)))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))?
    }

    /// Stop the scheduler loop.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerMessage::Shutdown).await;
    }
}

/// Receiver side of the scheduler, driven by [`SyncSchedulerHandle::run`].
pub struct SyncSchedulerHandle {
    period: Duration,
    request_rx: mpsc::Receiver<SchedulerMessage>,
}

impl SyncSchedulerHandle {
    /// Run the scheduler loop until shutdown.
    ///
    /// This should be spawned in a tokio task. `sync_fn` runs one sync;
    /// runs never overlap, and triggers that arrive while one executes are
    /// answered with [`SkipReason::AlreadyRunning`] instead of being queued.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncTrigger) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RunOutcome>> + Send,
    {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Sync scheduler started (interval {:?})", self.period);

        loop {
            let (trigger, responder) = tokio::select! {
                message = self.request_rx.recv() => match message {
                    Some(SchedulerMessage::Trigger(trigger, responder)) => (trigger, responder),
                    Some(SchedulerMessage::Shutdown) | None => break,
                },
                _ = ticker.tick() => (SyncTrigger::Timer, None),
            };

            debug!("Processing {:?} trigger", trigger);
            let result = sync_fn(trigger).await;
            if let Err(e) = &result {
                error!("Sync triggered by {:?} failed: {}", trigger, e);
            }
            if let Some(responder) = responder {
                let _ = responder.send(result);
            }

            if self.discard_backlog() {
                break;
            }
        }

        info!("Sync scheduler shutting down");
    }

    /// Answer triggers that arrived during the last run. Returns true on shutdown.
    fn discard_backlog(&mut self) -> bool {
        let mut shutdown = false;
        while let Ok(message) = self.request_rx.try_recv() {
            match message {
                SchedulerMessage::Trigger(trigger, responder) => {
                    debug!("Discarding {:?} trigger received mid-run", trigger);
                    if let Some(responder) = responder {
                        let _ = responder.send(Ok(RunOutcome::Skipped(SkipReason::AlreadyRunning)));
                    }
                }
                SchedulerMessage::Shutdown => shutdown = true,
            }
        }
        shutdown
    }
}
