//! Change channel over the `job_events` table.
//!
//! SQLite has no LISTEN/NOTIFY, so the store's triggers append a row per
//! lifecycle transition and each subscriber tails the table with its own
//! cursor. Rows live in the database file, so every process sharing it sees
//! every other process's events.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;

use jobwarden_core::error::{Result, WardenError};
use jobwarden_core::traits::ChangeChannel;
use jobwarden_core::types::{JobEvent, JobEventStatus};

use crate::persistence::db_err;

/// Cursor-based subscriber to the store's lifecycle events.
pub struct SqliteChangeChannel {
    conn: Arc<Mutex<Connection>>,
    channels: HashSet<String>,
    /// Highest event id already delivered.
    cursor: i64,
    closed: bool,
}

impl SqliteChangeChannel {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            channels: HashSet::new(),
            cursor: 0,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(WardenError::Channel("subscription closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChangeChannel for SqliteChangeChannel {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.ensure_open()?;
        if self.channels.contains(channel) {
            return Ok(());
        }
        if self.channels.is_empty() {
            // Only events from now on
            let conn = self
                .conn
                .lock()
                .map_err(|e| WardenError::Channel(format!("Lock: {e}")))?;
            self.cursor = conn
                .query_row("SELECT COALESCE(MAX(id), 0) FROM job_events", [], |r| r.get(0))
                .map_err(db_err)?;
        }
        self.channels.insert(channel.to_string());
        tracing::debug!("👂 Listening on channel '{}' from event {}", channel, self.cursor);
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<JobEvent>> {
        self.ensure_open()?;
        if self.channels.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<(i64, String, String, i64)> = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| WardenError::Channel(format!("Lock: {e}")))?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, channel, status, job_id FROM job_events WHERE id > ?1 ORDER BY id",
                )
                .map_err(db_err)?;
            let mapped = stmt
                .query_map([self.cursor], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })
                .map_err(db_err)?;
            mapped.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?
        };

        let mut events = Vec::with_capacity(rows.len());
        for (id, channel, status, job_id) in rows {
            self.cursor = self.cursor.max(id);
            if !self.channels.contains(&channel) {
                continue;
            }
            match status.parse::<JobEventStatus>() {
                Ok(status) => events.push(JobEvent { status, job_id }),
                Err(e) => tracing::warn!("⚠️ Skipping event {}: {}", id, e),
            }
        }
        Ok(events)
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.channels.clear();
            tracing::debug!("🔇 Change channel closed");
        }
        Ok(())
    }
}
