//! Scheduler Engine: the control loop that claims, runs and reaps jobs.
//!
//! One loop task owns all scheduler state. Each tick it folds change-channel
//! events into the waiting estimate, releases finished jobs, claims new work
//! up to the pool's free slots, then checks the stop condition. Between ticks
//! it sleeps, waking early on a stop request or a worker completion.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use jobwarden_core::config::SchedulerConfig;
use jobwarden_core::error::Result;
use jobwarden_core::traits::{ChangeChannel, JobStore};
use jobwarden_core::types::{
    JobEventStatus, JobId, SchedulerState, SchedulerStatus, StopMode,
};

use crate::pool::{Completion, SubmitOutcome, WorkerPool};
use crate::registry::HandlerRegistry;

/// Runs once the scheduler has stopped.
pub type StopCallback = Box<dyn FnOnce() + Send + 'static>;

/// What the loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep going.
    Continue,
    /// Stop condition met; exit cleanly.
    Drained,
    /// `now` was requested; cancel in-flight work.
    Cancel,
}

/// State shared between the loop and its handles.
struct Shared {
    stop_tx: watch::Sender<StopMode>,
    status_tx: watch::Sender<SchedulerStatus>,
    /// `None` once the scheduler has stopped.
    callbacks: Mutex<Option<Vec<StopCallback>>>,
}

/// Cloneable control surface for a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Request a shutdown. Modes only ever escalate; returns the effective mode.
    ///
    /// The callback runs once the loop has fully stopped, or right away if it
    /// already has.
    pub fn stop(&self, mode: StopMode, callback: Option<StopCallback>) -> StopMode {
        self.shared.stop_tx.send_if_modified(|current| {
            let next = current.escalate(mode);
            let changed = next != *current;
            *current = next;
            changed
        });
        let effective = *self.shared.stop_tx.borrow();
        tracing::info!("🛑 Stop requested: {} (effective: {})", mode, effective);

        if let Some(callback) = callback {
            let run_now = match self.shared.callbacks.lock() {
                Ok(mut guard) => match guard.as_mut() {
                    Some(pending) => {
                        pending.push(callback);
                        None
                    }
                    None => Some(callback),
                },
                Err(_) => Some(callback),
            };
            if let Some(callback) = run_now {
                callback();
            }
        }
        effective
    }

    /// Current stop mode.
    pub fn mode(&self) -> StopMode {
        *self.shared.stop_tx.borrow()
    }

    /// Best-effort snapshot; re-read the store when certainty matters.
    pub fn status(&self) -> SchedulerStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.status().state == SchedulerState::Stopped
    }
}

/// The scheduler loop.
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    channel: Box<dyn ChangeChannel>,
    pool: WorkerPool,
    config: SchedulerConfig,
    shared: Arc<Shared>,
    stop_rx: watch::Receiver<StopMode>,
    /// In-memory estimate of jobs with `started_at` unset.
    waiting: i64,
    /// Claims made here whose `started` event has not arrived yet.
    self_claimed: HashSet<JobId>,
    /// Finished jobs whose release failed; they stay claimed in the store.
    unreleased: Vec<JobId>,
    listening: bool,
}

impl Scheduler {
    /// Create a scheduler and its control handle.
    pub fn new(
        store: Arc<dyn JobStore>,
        channel: Box<dyn ChangeChannel>,
        registry: HandlerRegistry,
        config: SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let (stop_tx, stop_rx) = watch::channel(StopMode::Never);
        let (status_tx, _) = watch::channel(SchedulerStatus::default());
        let shared = Arc::new(Shared {
            stop_tx,
            status_tx,
            callbacks: Mutex::new(Some(Vec::new())),
        });
        let pool = WorkerPool::new(config.pool_size, Arc::new(registry));
        let scheduler = Self {
            store,
            channel,
            pool,
            config,
            shared: Arc::clone(&shared),
            stop_rx,
            waiting: 0,
            self_claimed: HashSet::new(),
            unreleased: Vec::new(),
            listening: false,
        };
        (scheduler, SchedulerHandle { shared })
    }

    fn mode(&self) -> StopMode {
        *self.stop_rx.borrow()
    }

    /// Run until stopped. Store and channel failures end the loop with an error.
    pub async fn start(mut self) -> Result<()> {
        tracing::info!(
            "⏰ Scheduler started (pool {}, tick every {}ms)",
            self.pool.size(),
            self.config.tick_interval_ms
        );
        let wake = self.pool.wake_handle();
        let interval = self.config.tick_interval();

        let result = loop {
            match self.tick().await {
                Ok(TickOutcome::Continue) => {}
                Ok(TickOutcome::Drained) => {
                    tracing::info!("🏁 Stop condition met ({})", self.mode());
                    break self.reap().await;
                }
                Ok(TickOutcome::Cancel) => {
                    self.cancel_running().await;
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!("💥 Scheduler stopping: {}", e);
                    // store is unreliable; abort handlers and leave their rows as they are
                    let report = self.pool.cancel_all().await;
                    let mut stranded = std::mem::take(&mut self.unreleased);
                    stranded.extend(report.finished.iter().map(|c| c.job_id));
                    stranded.extend(report.cancelled);
                    if !stranded.is_empty() {
                        tracing::warn!(
                            "⚠️ {} job(s) left claimed after failure: {:?}",
                            stranded.len(),
                            stranded
                        );
                    }
                    break Err(e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.stop_rx.changed() => {}
                _ = wake.notified() => {}
            }
        };

        self.shutdown(result).await
    }

    /// One pass of the loop. Public so embedders can drive it step by step.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        let mode = self.mode();
        if mode == StopMode::Now {
            return Ok(TickOutcome::Cancel);
        }
        if !self.listening {
            self.subscribe().await?;
        }

        self.apply_events().await?;
        self.reap().await?;
        if mode.accepts_new_work() {
            self.start_jobs().await?;
        }
        let outcome = self.check_stop(mode).await?;
        self.publish_status(mode);
        Ok(outcome)
    }

    /// Subscribe, then take the initial count.
    ///
    /// A job inserted between the two is counted twice; the resync in
    /// `start_jobs` and `check_stop` corrects it.
    async fn subscribe(&mut self) -> Result<()> {
        self.channel.listen(&self.config.channel).await?;
        self.waiting = self.store.count_waiting().await?;
        self.listening = true;
        tracing::info!("👂 Listening on '{}' ({} waiting)", self.config.channel, self.waiting);
        Ok(())
    }

    async fn apply_events(&mut self) -> Result<()> {
        for event in self.channel.poll().await? {
            match event.status {
                JobEventStatus::Created => self.waiting += 1,
                JobEventStatus::Started => {
                    // our own claims were already counted down
                    if !self.self_claimed.remove(&event.job_id) {
                        self.waiting = (self.waiting - 1).max(0);
                    }
                }
                JobEventStatus::Completed => {
                    tracing::trace!("Job {} completed", event.job_id);
                }
            }
        }
        Ok(())
    }

    async fn reap(&mut self) -> Result<()> {
        let completions = self.pool.drain_completions();
        for (i, completion) in completions.iter().enumerate() {
            if let Err(e) = self.release(completion).await {
                self.unreleased = completions[i..].iter().map(|c| c.job_id).collect();
                tracing::error!(
                    "❌ Release failed; job(s) {:?} stay claimed: {}",
                    self.unreleased,
                    e
                );
                return Err(e);
            }
            // the claim's `started` event was polled before this reap
            self.self_claimed.remove(&completion.job_id);
        }
        Ok(())
    }

    async fn release(&self, completion: &Completion) -> Result<()> {
        match &completion.error {
            None => tracing::info!("✅ Job {} succeeded", completion.job_id),
            Some(e) => tracing::warn!(
                "❌ Job {} failed: {}",
                completion.job_id,
                e.lines().next().unwrap_or_default()
            ),
        }
        let released = self
            .store
            .release(completion.job_id, completion.error.as_deref())
            .await?;
        if !released {
            tracing::warn!(
                "⚠️ Job {} was not running; duplicate completion ignored",
                completion.job_id
            );
        }
        Ok(())
    }

    async fn start_jobs(&mut self) -> Result<()> {
        let mut lost_claims = 0;
        while self.pool.free_slots() > 0 {
            let Some((job, key)) = self.store.select_next().await? else {
                // nothing eligible: resync the estimate from the store
                self.waiting = self.store.count_waiting().await?;
                break;
            };

            if !self.store.claim(&job).await? {
                tracing::debug!("🔒 Job {} claimed elsewhere", job.id);
                lost_claims += 1;
                if lost_claims >= self.pool.size() {
                    break;
                }
                continue;
            }

            self.self_claimed.insert(job.id);
            self.waiting = (self.waiting - 1).max(0);
            match &key {
                Some(key) => tracing::info!(
                    "▶️ Claimed job {} '{}' (priority {}, key '{}')",
                    job.id,
                    job.name,
                    job.priority,
                    key.key
                ),
                None => tracing::info!(
                    "▶️ Claimed job {} '{}' (priority {})",
                    job.id,
                    job.name,
                    job.priority
                ),
            }
            if self.pool.submit(&job) == SubmitOutcome::NoHandler {
                tracing::debug!("Job {} queued for failure release", job.id);
            }
        }
        Ok(())
    }

    async fn check_stop(&mut self, mode: StopMode) -> Result<TickOutcome> {
        let outcome = match mode {
            StopMode::Never => TickOutcome::Continue,
            StopMode::WhenCurrentDone if self.pool.is_idle() => TickOutcome::Drained,
            StopMode::WhenAllDone if self.pool.is_idle() && self.waiting == 0 => {
                // never stop on a stale estimate
                self.waiting = self.store.count_waiting().await?;
                if self.waiting == 0 {
                    TickOutcome::Drained
                } else {
                    TickOutcome::Continue
                }
            }
            StopMode::Now => TickOutcome::Cancel,
            _ => TickOutcome::Continue,
        };
        Ok(outcome)
    }

    /// Abort in-flight handlers and return their jobs to the queue.
    async fn cancel_running(&mut self) {
        tracing::info!("🛑 Cancelling {} running job(s)", self.pool.running());
        let report = self.pool.cancel_all().await;

        for completion in &report.finished {
            if let Err(e) = self.release(completion).await {
                tracing::error!("❌ Failed to release job {}: {}", completion.job_id, e);
            }
        }
        for job_id in report.cancelled {
            match self.store.revert(job_id).await {
                Ok(()) => tracing::info!("↩️ Job {} returned to the queue", job_id),
                // left claimed until an operator intervenes
                Err(e) => tracing::error!(
                    "❌ Failed to revert job {}; it stays claimed: {}",
                    job_id,
                    e
                ),
            }
        }
    }

    fn publish_status(&self, mode: StopMode) {
        self.shared.status_tx.send_replace(SchedulerStatus {
            waiting: self.waiting,
            running: self.pool.running(),
            mode,
            state: SchedulerState::from_mode(mode),
        });
    }

    /// Close the subscription, drop the store, run stop callbacks.
    async fn shutdown(mut self, result: Result<()>) -> Result<()> {
        if let Err(e) = self.channel.close().await {
            tracing::warn!("⚠️ Failed to close change channel: {}", e);
        }
        let mode = self.mode();
        self.shared.status_tx.send_replace(SchedulerStatus {
            waiting: self.waiting,
            running: self.pool.running(),
            mode,
            state: SchedulerState::Stopped,
        });

        let Scheduler {
            store,
            channel,
            shared,
            ..
        } = self;
        drop(channel);
        drop(store);

        let callbacks = match shared.callbacks.lock() {
            Ok(mut guard) => guard.take().unwrap_or_default(),
            Err(poisoned) => poisoned.into_inner().take().unwrap_or_default(),
        };
        for callback in callbacks {
            callback();
        }
        tracing::info!("⏹️ Scheduler stopped ({})", mode);
        result
    }
}
