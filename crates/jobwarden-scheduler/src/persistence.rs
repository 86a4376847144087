//! SQLite-backed job store: jobs, serialization keys and change events.
//! Survives restarts; several scheduler processes may share one database file.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};

use jobwarden_core::config::StoreConfig;
pub use jobwarden_core::config::JOBS_CHANNEL;
use jobwarden_core::error::{Result, WardenError};
use jobwarden_core::traits::JobStore;
use jobwarden_core::types::{
    Job, JobCounts, JobId, JobState, KeyId, NewJob, SerializationKey,
};

use crate::notify::SqliteChangeChannel;

const JOB_COLUMNS: &str = "j.id, j.name, j.payload, j.priority, j.serialization_key_id, \
                           j.created_at, j.started_at, j.completed_at, j.error_message";

/// SQLite-backed persistence store for the scheduler.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    /// Open or create the job database.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.busy_timeout(busy_timeout).map_err(db_err)?;
        // WAL lets readers proceed while another process holds the write lock
        match conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get::<_, String>(0)) {
            Ok(mode) if mode.eq_ignore_ascii_case("wal") => {}
            Ok(mode) => tracing::warn!(
                "⚠️ {} stays in '{}' journal mode; other processes may block on reads",
                path.display(),
                mode
            ),
            Err(e) => tracing::warn!("⚠️ Failed to enable WAL on {}: {}", path.display(), e),
        }
        Self::with_connection(conn)
    }

    /// Open using the `[store]` section of the config.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        Self::open(&config.expanded_path(), config.busy_timeout())
    }

    /// Private in-memory database (one connection; not shareable across processes).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// A change channel reading this database's event table.
    pub fn channel(&self) -> SqliteChangeChannel {
        SqliteChangeChannel::new(Arc::clone(&self.conn))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WardenError::Store(format!("Lock: {e}")))
    }

    /// Run a database call on the blocking pool; `busy_timeout` may stall it.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| WardenError::Store(format!("Lock: {e}")))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| WardenError::Store(format!("Blocking task failed: {e}")))?
    }

    /// Run migrations to create tables, indexes and lifecycle triggers.
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS serialization_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL UNIQUE,
                active_job_id INTEGER            -- NULL when free
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT 'null',   -- JSON
                priority INTEGER NOT NULL DEFAULT 0,
                serialization_key_id INTEGER REFERENCES serialization_keys(id),
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_waiting
                ON jobs (priority DESC, created_at, id) WHERE started_at IS NULL;

            -- Lifecycle events, read by SqliteChangeChannel
            CREATE TABLE IF NOT EXISTS job_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                status TEXT NOT NULL,            -- created, started, completed
                job_id INTEGER NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE TRIGGER IF NOT EXISTS job_created AFTER INSERT ON jobs
            BEGIN
                INSERT INTO job_events (channel, status, job_id) VALUES ('{JOBS_CHANNEL}', 'created', NEW.id);
            END;

            CREATE TRIGGER IF NOT EXISTS job_started AFTER UPDATE OF started_at ON jobs
            WHEN OLD.started_at IS NULL AND NEW.started_at IS NOT NULL
            BEGIN
                INSERT INTO job_events (channel, status, job_id) VALUES ('{JOBS_CHANNEL}', 'started', NEW.id);
            END;

            CREATE TRIGGER IF NOT EXISTS job_requeued AFTER UPDATE OF started_at ON jobs
            WHEN OLD.started_at IS NOT NULL AND NEW.started_at IS NULL
            BEGIN
                INSERT INTO job_events (channel, status, job_id) VALUES ('{JOBS_CHANNEL}', 'created', NEW.id);
            END;

            CREATE TRIGGER IF NOT EXISTS job_completed AFTER UPDATE OF completed_at ON jobs
            WHEN OLD.completed_at IS NULL AND NEW.completed_at IS NOT NULL
            BEGIN
                INSERT INTO job_events (channel, status, job_id) VALUES ('{JOBS_CHANNEL}', 'completed', NEW.id);
            END;
            "
        ))
        .map_err(|e| WardenError::Store(format!("Migration: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn count_waiting(&self) -> Result<i64> {
        self.blocking(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE started_at IS NULL",
                [],
                |r| r.get(0),
            )
            .map_err(db_err)
        })
        .await
    }

    async fn select_next(&self) -> Result<Option<(Job, Option<SerializationKey>)>> {
        self.blocking(|conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS}, k.id, k.key, k.active_job_id
                 FROM jobs j
                 LEFT JOIN serialization_keys k ON k.id = j.serialization_key_id
                 WHERE j.started_at IS NULL
                   AND (j.serialization_key_id IS NULL OR k.active_job_id IS NULL)
                 ORDER BY j.priority DESC, j.created_at ASC, j.id ASC
                 LIMIT 1"
            );
            conn.query_row(&sql, [], |row| {
                let job = job_from_row(row)?;
                let key = match row.get::<_, Option<KeyId>>(9)? {
                    Some(id) => Some(SerializationKey {
                        id,
                        key: row.get(10)?,
                        active_job_id: row.get(11)?,
                    }),
                    None => None,
                };
                Ok((job, key))
            })
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn claim(&self, job: &Job) -> Result<bool> {
        let job_id = job.id;
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let started = tx
                .execute(
                    "UPDATE jobs SET started_at = ?1 WHERE id = ?2 AND started_at IS NULL",
                    params![timestamp(Utc::now()), job_id],
                )
                .map_err(db_err)?;
            if started == 0 {
                // claimed elsewhere; dropping the transaction rolls back
                return Ok(false);
            }

            // Re-read inside the transaction instead of trusting the selector's row
            let key_id: Option<KeyId> = tx
                .query_row(
                    "SELECT serialization_key_id FROM jobs WHERE id = ?1",
                    [job_id],
                    |r| r.get(0),
                )
                .map_err(db_err)?;
            if let Some(key_id) = key_id {
                let taken = tx
                    .execute(
                        "UPDATE serialization_keys SET active_job_id = ?1
                         WHERE id = ?2 AND active_job_id IS NULL",
                        params![job_id, key_id],
                    )
                    .map_err(db_err)?;
                if taken == 0 {
                    tracing::debug!("🔒 Key {} busy, claim of job {} rolled back", key_id, job_id);
                    return Ok(false);
                }
            }

            tx.commit().map_err(db_err)?;
            Ok(true)
        })
        .await
    }

    async fn release(&self, job_id: JobId, error_message: Option<&str>) -> Result<bool> {
        let error_message = error_message.map(str::to_owned);
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let completed = tx
                .execute(
                    "UPDATE jobs SET completed_at = ?1, error_message = ?2
                     WHERE id = ?3 AND started_at IS NOT NULL AND completed_at IS NULL",
                    params![timestamp(Utc::now()), error_message, job_id],
                )
                .map_err(db_err)?;
            if completed == 0 {
                return Ok(false);
            }

            // Only the key this job holds
            tx.execute(
                "UPDATE serialization_keys SET active_job_id = NULL WHERE active_job_id = ?1",
                [job_id],
            )
            .map_err(db_err)?;

            tx.commit().map_err(db_err)?;
            Ok(true)
        })
        .await
    }

    async fn revert(&self, job_id: JobId) -> Result<()> {
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            tx.execute(
                "UPDATE jobs SET started_at = NULL, completed_at = NULL, error_message = NULL
                 WHERE id = ?1",
                [job_id],
            )
            .map_err(db_err)?;
            tx.execute(
                "UPDATE serialization_keys SET active_job_id = NULL WHERE active_job_id = ?1",
                [job_id],
            )
            .map_err(db_err)?;
            tx.commit().map_err(db_err)?;
            Ok(())
        })
        .await
    }

    async fn submit(&self, job: NewJob) -> Result<JobId> {
        let payload = serde_json::to_string(&job.payload)?;
        self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;

            let key_id: Option<KeyId> = match &job.serialization_key {
                Some(key) => {
                    tx.execute(
                        "INSERT OR IGNORE INTO serialization_keys (key) VALUES (?1)",
                        [key],
                    )
                    .map_err(db_err)?;
                    Some(
                        tx.query_row(
                            "SELECT id FROM serialization_keys WHERE key = ?1",
                            [key],
                            |r| r.get(0),
                        )
                        .map_err(db_err)?,
                    )
                }
                None => None,
            };

            tx.execute(
                "INSERT INTO jobs (name, payload, priority, serialization_key_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![job.name, payload, job.priority, key_id, timestamp(Utc::now())],
            )
            .map_err(db_err)?;
            let id = tx.last_insert_rowid();
            tx.commit().map_err(db_err)?;

            tracing::debug!("📥 Job {} '{}' submitted (priority {})", id, job.name, job.priority);
            Ok(id)
        })
        .await
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.id = ?1"),
                [id],
                job_from_row,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn find_key(&self, id: KeyId) -> Result<Option<SerializationKey>> {
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT id, key, active_job_id FROM serialization_keys WHERE id = ?1",
                [id],
                key_from_row,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn find_key_by_name(&self, key: &str) -> Result<Option<SerializationKey>> {
        let key = key.to_owned();
        self.blocking(move |conn| {
            conn.query_row(
                "SELECT id, key, active_job_id FROM serialization_keys WHERE key = ?1",
                [key],
                key_from_row,
            )
            .optional()
            .map_err(db_err)
        })
        .await
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let filter = match state {
            None => "1 = 1",
            Some(JobState::Waiting) => "j.started_at IS NULL",
            Some(JobState::Running) => "j.started_at IS NOT NULL AND j.completed_at IS NULL",
            Some(JobState::Succeeded) => {
                "j.completed_at IS NOT NULL AND j.error_message IS NULL"
            }
            Some(JobState::Failed) => {
                "j.completed_at IS NOT NULL AND j.error_message IS NOT NULL"
            }
        };
        self.blocking(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs j WHERE {filter} ORDER BY j.id DESC LIMIT ?1"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([limit as i64], job_from_row)
                .map_err(db_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
        })
        .await
    }

    async fn counts(&self) -> Result<JobCounts> {
        self.blocking(|conn| {
            conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN started_at IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN started_at IS NOT NULL AND completed_at IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN completed_at IS NOT NULL AND error_message IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN completed_at IS NOT NULL AND error_message IS NOT NULL THEN 1 ELSE 0 END), 0)
                 FROM jobs",
                [],
                |r| {
                    Ok(JobCounts {
                        waiting: r.get(0)?,
                        running: r.get(1)?,
                        succeeded: r.get(2)?,
                        failed: r.get(3)?,
                    })
                },
            )
            .map_err(db_err)
        })
        .await
    }

    async fn purge(&self, before: DateTime<Utc>) -> Result<usize> {
        let jobs = self
            .blocking(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(db_err)?;
                let jobs = tx
                    .execute(
                        "DELETE FROM jobs WHERE completed_at IS NOT NULL AND completed_at < ?1",
                        [timestamp(before)],
                    )
                    .map_err(db_err)?;
                // event rows carry millisecond timestamps
                tx.execute(
                    "DELETE FROM job_events WHERE created_at < ?1",
                    [before.to_rfc3339_opts(SecondsFormat::Millis, true)],
                )
                .map_err(db_err)?;
                tx.commit().map_err(db_err)?;
                Ok(jobs)
            })
            .await?;
        tracing::info!("🧹 Purged {} completed job(s) older than {}", jobs, before);
        Ok(jobs)
    }
}

/// Fixed-precision RFC3339 so string order matches time order.
pub(crate) fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_timestamp(idx, &s))
        .transpose()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
        priority: row.get(3)?,
        serialization_key_id: row.get(4)?,
        created_at: parse_timestamp(5, &created_at)?,
        started_at: optional_timestamp(row, 6)?,
        completed_at: optional_timestamp(row, 7)?,
        error_message: row.get(8)?,
    })
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<SerializationKey> {
    Ok(SerializationKey {
        id: row.get(0)?,
        key: row.get(1)?,
        active_job_id: row.get(2)?,
    })
}

pub(crate) fn db_err(e: rusqlite::Error) -> WardenError {
    WardenError::Store(e.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::path::PathBuf;

    /// Unique database file under the temp dir.
    pub(crate) fn temp_db(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("jobwarden-{label}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).ok();
        dir.join("jobs.db")
    }

    pub(crate) fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }

    #[tokio::test]
    async fn test_open_and_migrate() {
        let path = temp_db("migrate");
        let store = SqliteJobStore::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(store.count_waiting().await.unwrap(), 0);
        assert!(store.select_next().await.unwrap().is_none());
        // migrations are idempotent
        drop(store);
        let store = SqliteJobStore::open(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(store.counts().await.unwrap(), JobCounts::default());
        cleanup(&path);
    }

    #[test]
    fn test_file_store_uses_wal() {
        let path = temp_db("wal");
        let store = SqliteJobStore::open(&path, Duration::from_secs(1)).unwrap();
        let mode: String = store
            .lock()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap();
        assert_eq!(mode.to_ascii_lowercase(), "wal");
        drop(store);
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_triggers_publish_on_jobs_channel() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        store.submit(NewJob::new("t", json!(1))).await.unwrap();
        let channels: Vec<String> = {
            let conn = store.lock().unwrap();
            let mut stmt = conn.prepare("SELECT DISTINCT channel FROM job_events").unwrap();
            stmt.query_map([], |r| r.get(0))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        assert_eq!(channels, vec![JOBS_CHANNEL.to_string()]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_busy_database_does_not_stall_runtime() {
        let path = temp_db("busy");
        let store = SqliteJobStore::open(&path, Duration::from_millis(300)).unwrap();
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        // a waiting writer must leave the runtime free for other tasks
        let ticker = tokio::spawn(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            std::time::Instant::now()
        });
        let started = std::time::Instant::now();
        let result = store.submit(NewJob::new("t", json!(1))).await;
        let finished = std::time::Instant::now();
        let ticked = ticker.await.unwrap();

        assert!(result.is_err(), "write should time out while the lock is held");
        assert!(ticked < finished, "timer task ran while the write waited");
        assert!(ticked.duration_since(started) < Duration::from_millis(250));
        blocker.execute_batch("ROLLBACK;").unwrap();
        drop((store, blocker));
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_submit_creates_key_lazily() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        assert!(store.find_key_by_name("account:42").await.unwrap().is_none());

        let a = store
            .submit(NewJob::new("sync", json!({"n": 1})).with_key("account:42"))
            .await
            .unwrap();
        let b = store
            .submit(NewJob::new("sync", json!({"n": 2})).with_key("account:42"))
            .await
            .unwrap();

        let key = store.find_key_by_name("account:42").await.unwrap().unwrap();
        assert!(key.is_free());
        let job_a = store.find_job(a).await.unwrap().unwrap();
        let job_b = store.find_job(b).await.unwrap().unwrap();
        assert_eq!(job_a.serialization_key_id, Some(key.id));
        assert_eq!(job_b.serialization_key_id, Some(key.id));
        assert_eq!(job_a.payload, json!({"n": 1}));
        assert!(job_a.is_waiting());
    }

    #[tokio::test]
    async fn test_select_priority_then_age() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let b = store.submit(NewJob::new("t", json!("B")).with_priority(5)).await.unwrap();
        let a = store.submit(NewJob::new("t", json!("A")).with_priority(5)).await.unwrap();
        let c = store.submit(NewJob::new("t", json!("C")).with_priority(9)).await.unwrap();

        let mut order = Vec::new();
        while let Some((job, key)) = store.select_next().await.unwrap() {
            assert!(key.is_none());
            assert!(store.claim(&job).await.unwrap());
            order.push(job.id);
        }
        assert_eq!(order, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_select_skips_busy_key() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let first = store
            .submit(NewJob::new("t", json!(null)).with_key("k").with_priority(10))
            .await
            .unwrap();
        let _second = store
            .submit(NewJob::new("t", json!(null)).with_key("k").with_priority(10))
            .await
            .unwrap();
        let free = store.submit(NewJob::new("t", json!(null))).await.unwrap();

        let (job, key) = store.select_next().await.unwrap().unwrap();
        assert_eq!(job.id, first);
        assert_eq!(key.as_ref().map(|k| k.key.as_str()), Some("k"));
        assert!(store.claim(&job).await.unwrap());

        // same-key job is blocked; the unkeyed one comes next
        let (job, key) = store.select_next().await.unwrap().unwrap();
        assert_eq!(job.id, free);
        assert!(key.is_none());
    }

    #[tokio::test]
    async fn test_claim_rejects_second_job_on_active_key() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let a = store.submit(NewJob::new("t", json!(1)).with_key("k")).await.unwrap();
        let b = store.submit(NewJob::new("t", json!(2)).with_key("k")).await.unwrap();
        let job_a = store.find_job(a).await.unwrap().unwrap();
        let job_b = store.find_job(b).await.unwrap().unwrap();

        assert!(store.claim(&job_a).await.unwrap());
        // stale read: b looked eligible before a took the key
        assert!(!store.claim(&job_b).await.unwrap());

        let job_b = store.find_job(b).await.unwrap().unwrap();
        assert!(job_b.started_at.is_none(), "rolled back claim must not leave started_at");
        let key = store.find_key_by_name("k").await.unwrap().unwrap();
        assert_eq!(key.active_job_id, Some(a));

        // a job can only be claimed once
        assert!(!store.claim(&job_a).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_race_across_connections() {
        let path = temp_db("race");
        let one = SqliteJobStore::open(&path, Duration::from_secs(5)).unwrap();
        let two = SqliteJobStore::open(&path, Duration::from_secs(5)).unwrap();
        let a = one.submit(NewJob::new("t", json!(1)).with_key("shared")).await.unwrap();
        let b = one.submit(NewJob::new("t", json!(2)).with_key("shared")).await.unwrap();

        // both instances read the key as free
        let job_a = one.find_job(a).await.unwrap().unwrap();
        let job_b = two.find_job(b).await.unwrap().unwrap();
        let (ra, rb) = tokio::join!(one.claim(&job_a), two.claim(&job_b));
        let winners = [ra.unwrap(), rb.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(winners, 1);

        let counts = two.counts().await.unwrap();
        assert_eq!(counts.running, 1);
        assert_eq!(counts.waiting, 1);
        cleanup(&path);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let a = store.submit(NewJob::new("t", json!(1)).with_key("k")).await.unwrap();
        let b = store.submit(NewJob::new("t", json!(2)).with_key("k")).await.unwrap();

        let job_a = store.find_job(a).await.unwrap().unwrap();
        assert!(store.claim(&job_a).await.unwrap());
        assert!(store.release(a, None).await.unwrap());

        let job_b = store.find_job(b).await.unwrap().unwrap();
        assert!(store.claim(&job_b).await.unwrap());

        // duplicate completion for a must not free b's key
        assert!(!store.release(a, Some("late duplicate")).await.unwrap());
        let key = store.find_key_by_name("k").await.unwrap().unwrap();
        assert_eq!(key.active_job_id, Some(b));
        let job_a = store.find_job(a).await.unwrap().unwrap();
        assert_eq!(job_a.state(), JobState::Succeeded);
        assert!(job_a.error_message.is_none());
    }

    #[tokio::test]
    async fn test_release_records_error() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let id = store.submit(NewJob::new("t", json!(1))).await.unwrap();
        let job = store.find_job(id).await.unwrap().unwrap();
        // not running yet: nothing to release
        assert!(!store.release(id, None).await.unwrap());

        assert!(store.claim(&job).await.unwrap());
        assert!(store.release(id, Some("boom")).await.unwrap());
        let job = store.find_job(id).await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Failed);
        assert_eq!(job.error_message.as_deref(), Some("boom"));
        assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_revert_returns_job_to_waiting() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let id = store.submit(NewJob::new("t", json!(1)).with_key("k")).await.unwrap();
        let job = store.find_job(id).await.unwrap().unwrap();
        assert!(store.claim(&job).await.unwrap());

        store.revert(id).await.unwrap();
        let job = store.find_job(id).await.unwrap().unwrap();
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());
        assert!(store.find_key_by_name("k").await.unwrap().unwrap().is_free());
        assert_eq!(store.count_waiting().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_and_counts() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let ok = store.submit(NewJob::new("t", json!(1))).await.unwrap();
        let bad = store.submit(NewJob::new("t", json!(2))).await.unwrap();
        let run = store.submit(NewJob::new("t", json!(3))).await.unwrap();
        let _wait = store.submit(NewJob::new("t", json!(4))).await.unwrap();
        for id in [ok, bad, run] {
            let job = store.find_job(id).await.unwrap().unwrap();
            assert!(store.claim(&job).await.unwrap());
        }
        store.release(ok, None).await.unwrap();
        store.release(bad, Some("nope")).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(
            counts,
            JobCounts { waiting: 1, running: 1, succeeded: 1, failed: 1 }
        );
        let failed = store.list_jobs(Some(JobState::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, bad);
        assert_eq!(store.list_jobs(None, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_keeps_unfinished_jobs() {
        let store = SqliteJobStore::open_in_memory().unwrap();
        let done = store.submit(NewJob::new("t", json!(1)).with_key("k")).await.unwrap();
        let waiting = store.submit(NewJob::new("t", json!(2))).await.unwrap();
        let job = store.find_job(done).await.unwrap().unwrap();
        store.claim(&job).await.unwrap();
        store.release(done, None).await.unwrap();

        let removed = store
            .purge(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_job(done).await.unwrap().is_none());
        assert!(store.find_job(waiting).await.unwrap().is_some());
        // keys are never purged
        assert!(store.find_key_by_name("k").await.unwrap().is_some());
    }
}
