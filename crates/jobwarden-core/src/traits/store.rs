//! Job store trait: the transactional access pattern the scheduler needs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Job, JobCounts, JobId, JobState, KeyId, NewJob, SerializationKey};

/// Durable store of jobs and serialization keys.
///
/// Every operation that touches both a job and its key (`claim`, `release`,
/// `revert`, `submit`) must commit both writes in one transaction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Number of jobs with `started_at` unset.
    async fn count_waiting(&self) -> Result<i64>;

    /// Highest-priority, oldest waiting job whose key (if any) is free.
    async fn select_next(&self) -> Result<Option<(Job, Option<SerializationKey>)>>;

    /// Mark the job started and take its key.
    ///
    /// Preconditions are re-checked inside the transaction; returns `false`
    /// without writing anything if the job was already started or its key is
    /// held by another job.
    async fn claim(&self, job: &Job) -> Result<bool>;

    /// Mark the job completed with an optional error and free its key.
    ///
    /// Returns `false` (and writes nothing) if the job is not currently
    /// running, so duplicate completions are harmless.
    async fn release(&self, job_id: JobId, error_message: Option<&str>) -> Result<bool>;

    /// Return a claimed job to the waiting state and free its key.
    async fn revert(&self, job_id: JobId) -> Result<()>;

    /// Insert a job, creating its serialization key on first use.
    async fn submit(&self, job: NewJob) -> Result<JobId>;

    async fn find_job(&self, id: JobId) -> Result<Option<Job>>;

    async fn find_key(&self, id: KeyId) -> Result<Option<SerializationKey>>;

    async fn find_key_by_name(&self, key: &str) -> Result<Option<SerializationKey>>;

    /// Jobs in `state` (or all), newest first.
    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>>;

    async fn counts(&self) -> Result<JobCounts>;

    /// Delete completed jobs and change events older than `before`.
    /// Returns the number of jobs removed.
    async fn purge(&self, before: DateTime<Utc>) -> Result<usize>;
}
