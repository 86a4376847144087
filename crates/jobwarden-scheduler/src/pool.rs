//! Worker Pool: bounded set of execution slots for job handlers.
//!
//! Handlers run as tokio tasks. Completions travel back over an internal
//! channel and are drained by the scheduler loop; workers never touch the
//! store or loop-owned state.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use jobwarden_core::types::{Job, JobId};

use crate::registry::HandlerRegistry;

/// Outcome of one handler run, reported back to the scheduler loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub job_id: JobId,
    /// Rendered failure; `None` on success.
    pub error: Option<String>,
}

/// What happened to a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Handler spawned on a slot.
    Spawned,
    /// No handler registered; a failed completion was queued without using a slot.
    NoHandler,
}

/// A job occupying a slot.
struct RunningJob {
    name: String,
    started: Instant,
    handle: JoinHandle<()>,
}

/// Jobs torn down by `cancel_all`.
#[derive(Debug, Default)]
pub struct CancelReport {
    /// Finished before the cancel landed.
    pub finished: Vec<Completion>,
    /// Aborted mid-flight.
    pub cancelled: Vec<JobId>,
}

/// Fixed-size pool of concurrent handler slots.
pub struct WorkerPool {
    size: usize,
    registry: Arc<HandlerRegistry>,
    running: HashMap<JobId, RunningJob>,
    /// Failed without a handler; reported but not drained yet.
    unhandled: HashSet<JobId>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
    wake: Arc<Notify>,
}

impl WorkerPool {
    pub fn new(size: usize, registry: Arc<HandlerRegistry>) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            size: size.max(1),
            registry,
            running: HashMap::new(),
            unhandled: HashSet::new(),
            completion_tx,
            completion_rx,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently occupying a slot.
    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn free_slots(&self) -> usize {
        self.size.saturating_sub(self.running.len())
    }

    /// No job is running and no completion is waiting to be drained.
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.unhandled.is_empty()
    }

    /// Signalled whenever a completion is queued.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Run the handler registered for `job.name` on a free slot.
    pub fn submit(&mut self, job: &Job) -> SubmitOutcome {
        let Some(handler) = self.registry.get(&job.name) else {
            tracing::warn!("⚠️ No handler registered for job {} '{}'", job.id, job.name);
            self.unhandled.insert(job.id);
            self.report(Completion {
                job_id: job.id,
                error: Some(format!("no handler registered for job name '{}'", job.name)),
            });
            return SubmitOutcome::NoHandler;
        };

        let job_id = job.id;
        let payload = job.payload.clone();
        let tx = self.completion_tx.clone();
        let wake = Arc::clone(&self.wake);

        let handle = tokio::spawn(async move {
            // The call itself may panic, so it happens inside the guarded future
            let outcome = AssertUnwindSafe(async move { handler(payload).await })
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(render_error(&e)),
                Err(panic) => Some(render_panic(panic.as_ref())),
            };
            let _ = tx.send(Completion { job_id, error });
            wake.notify_one();
        });

        tracing::debug!(
            "🚀 Job {} '{}' started ({}/{} slots)",
            job.id,
            job.name,
            self.running.len() + 1,
            self.size
        );
        self.running.insert(
            job_id,
            RunningJob {
                name: job.name.clone(),
                started: Instant::now(),
                handle,
            },
        );
        SubmitOutcome::Spawned
    }

    /// Take every queued completion and free the matching slots.
    pub fn drain_completions(&mut self) -> Vec<Completion> {
        let mut done = Vec::new();
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.unhandled.remove(&completion.job_id);
            if let Some(job) = self.running.remove(&completion.job_id) {
                tracing::debug!(
                    "🏁 Job {} '{}' finished in {:?}",
                    completion.job_id,
                    job.name,
                    job.started.elapsed()
                );
            }
            done.push(completion);
        }
        done
    }

    /// Abort every running handler and wait for the aborts to land.
    ///
    /// Cancellation is best-effort: a handler that already finished is
    /// reported in `finished` instead of `cancelled`.
    pub async fn cancel_all(&mut self) -> CancelReport {
        let running: Vec<(JobId, RunningJob)> = self.running.drain().collect();
        self.unhandled.clear();
        for (_, job) in &running {
            job.handle.abort();
        }
        let mut ids = Vec::with_capacity(running.len());
        for (id, job) in running {
            // JoinError::Cancelled is the expected outcome here
            let _ = job.handle.await;
            ids.push(id);
        }

        let mut report = CancelReport::default();
        while let Ok(completion) = self.completion_rx.try_recv() {
            report.finished.push(completion);
        }
        report.cancelled = ids
            .into_iter()
            .filter(|id| !report.finished.iter().any(|c| c.job_id == *id))
            .collect();
        report
    }

    fn report(&self, completion: Completion) {
        let _ = self.completion_tx.send(completion);
        self.wake.notify_one();
    }
}

/// Message, cause chain, and backtrace when one was captured.
fn render_error(e: &anyhow::Error) -> String {
    format!("{e:?}")
}

fn render_panic(panic: &(dyn std::any::Any + Send)) -> String {
    let msg = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("panicked: {msg}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn make_job(id: JobId, name: &str, payload: serde_json::Value) -> Job {
        Job {
            id,
            name: name.into(),
            payload,
            priority: 0,
            serialization_key_id: None,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            error_message: None,
        }
    }

    fn registry() -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register("ok", |_| async { Ok(()) }).unwrap();
        registry
            .register("fail", |payload| async move {
                anyhow::bail!("synthetic failure: {payload}")
            })
            .unwrap();
        registry
            .register("panic", |_| async { panic!("handler blew up") })
            .unwrap();
        registry
            .register("hang", |_| async {
                futures::future::pending::<()>().await;
                Ok(())
            })
            .unwrap();
        Arc::new(registry)
    }

    async fn wait_for(pool: &mut WorkerPool, n: usize) -> Vec<Completion> {
        let wake = pool.wake_handle();
        let mut done = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while done.len() < n {
                done.extend(pool.drain_completions());
                if done.len() < n {
                    wake.notified().await;
                }
            }
        })
        .await
        .expect("completions did not arrive");
        done
    }

    #[tokio::test]
    async fn test_success_and_failure() {
        let mut pool = WorkerPool::new(2, registry());
        assert_eq!(pool.submit(&make_job(1, "ok", serde_json::json!(null))), SubmitOutcome::Spawned);
        assert_eq!(
            pool.submit(&make_job(2, "fail", serde_json::json!({"x": 1}))),
            SubmitOutcome::Spawned
        );
        assert_eq!(pool.free_slots(), 0);

        let mut done = wait_for(&mut pool, 2).await;
        done.sort_by_key(|c| c.job_id);
        assert_eq!(done[0], Completion { job_id: 1, error: None });
        let err = done[1].error.as_deref().unwrap();
        assert!(err.contains("synthetic failure"));
        assert!(err.contains("\"x\":1"));
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let mut pool = WorkerPool::new(1, registry());
        pool.submit(&make_job(7, "panic", serde_json::json!(null)));
        let done = wait_for(&mut pool, 1).await;
        assert_eq!(done[0].job_id, 7);
        assert_eq!(done[0].error.as_deref(), Some("panicked: handler blew up"));
        assert_eq!(pool.free_slots(), 1);
    }

    #[tokio::test]
    async fn test_unknown_handler_does_not_take_slot() {
        let mut pool = WorkerPool::new(1, registry());
        assert_eq!(
            pool.submit(&make_job(3, "nobody", serde_json::json!(null))),
            SubmitOutcome::NoHandler
        );
        assert_eq!(pool.free_slots(), 1);
        // the queued failure still counts as outstanding work
        assert!(!pool.is_idle());
        let done = pool.drain_completions();
        assert_eq!(done.len(), 1);
        assert!(done[0].error.as_deref().unwrap().contains("no handler"));
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn test_cancel_all_aborts_running() {
        let mut pool = WorkerPool::new(2, registry());
        pool.submit(&make_job(4, "hang", serde_json::json!(null)));
        assert_eq!(pool.running(), 1);

        let report = pool.cancel_all().await;
        assert_eq!(report.cancelled, vec![4]);
        assert!(report.finished.is_empty());
        assert!(pool.is_idle());
    }

    #[tokio::test]
    async fn test_cancel_all_reports_unhandled_as_finished() {
        let mut pool = WorkerPool::new(1, registry());
        pool.submit(&make_job(5, "nobody", serde_json::json!(null)));
        pool.submit(&make_job(6, "hang", serde_json::json!(null)));

        let report = pool.cancel_all().await;
        assert_eq!(report.cancelled, vec![6]);
        assert_eq!(report.finished.len(), 1);
        assert_eq!(report.finished[0].job_id, 5);
        assert!(pool.is_idle());
    }
}
