//! Data model: persisted rows, change events, stop modes and status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WardenError;

/// Store-assigned job identity.
pub type JobId = i64;
/// Store-assigned serialization key identity.
pub type KeyId = i64;

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Key into the handler registry.
    pub name: String,
    /// Opaque structured data handed to the handler.
    pub payload: serde_json::Value,
    /// Higher runs first.
    pub priority: i64,
    /// `None` means no mutual-exclusion constraint.
    pub serialization_key_id: Option<KeyId>,
    pub created_at: DateTime<Utc>,
    /// `None` while waiting; set exactly once when claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// Set exactly once when the handler returns or fails.
    pub completed_at: Option<DateTime<Utc>>,
    /// Rendered failure; `None` on success.
    pub error_message: Option<String>,
}

impl Job {
    /// Lifecycle state derived from the timestamps.
    pub fn state(&self) -> JobState {
        match (self.started_at, self.completed_at) {
            (None, _) => JobState::Waiting,
            (Some(_), None) => JobState::Running,
            (Some(_), Some(_)) if self.error_message.is_some() => JobState::Failed,
            (Some(_), Some(_)) => JobState::Succeeded,
        }
    }

    /// Eligible for selection (ignoring its key).
    pub fn is_waiting(&self) -> bool {
        self.started_at.is_none()
    }
}

/// A named mutual-exclusion token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializationKey {
    pub id: KeyId,
    /// Caller-supplied resource name, e.g. "account:42".
    pub key: String,
    /// Job currently holding the key.
    pub active_job_id: Option<JobId>,
}

impl SerializationKey {
    pub fn is_free(&self) -> bool {
        self.active_job_id.is_none()
    }
}

/// Producer-side description of a job to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub payload: serde_json::Value,
    pub serialization_key: Option<String>,
    pub priority: i64,
}

impl NewJob {
    pub fn new(name: &str, payload: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            payload,
            serialization_key: None,
            priority: 0,
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.serialization_key = Some(key.to_string());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Waiting => write!(f, "waiting"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(JobState::Waiting),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            other => Err(WardenError::Config(format!("unknown job state '{other}'"))),
        }
    }
}

/// Store-wide job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Lifecycle notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventStatus {
    Created,
    Started,
    Completed,
}

impl std::str::FromStr for JobEventStatus {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobEventStatus::Created),
            "started" => Ok(JobEventStatus::Started),
            "completed" => Ok(JobEventStatus::Completed),
            other => Err(WardenError::Channel(format!("unknown event status '{other}'"))),
        }
    }
}

/// A change-channel notification tagged with a job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    pub status: JobEventStatus,
    pub job_id: JobId,
}

/// Shutdown request, ordered by strictness.
///
/// Applying a mode that is not stricter than the current one is a no-op.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    #[default]
    Never,
    WhenAllDone,
    WhenCurrentDone,
    Now,
}

impl StopMode {
    /// Whether new jobs may be claimed under this mode.
    pub fn accepts_new_work(&self) -> bool {
        matches!(self, StopMode::Never | StopMode::WhenAllDone)
    }

    /// The stricter of two modes.
    pub fn escalate(self, requested: StopMode) -> StopMode {
        self.max(requested)
    }
}

impl std::fmt::Display for StopMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopMode::Never => write!(f, "never"),
            StopMode::WhenAllDone => write!(f, "when_all_done"),
            StopMode::WhenCurrentDone => write!(f, "when_current_done"),
            StopMode::Now => write!(f, "now"),
        }
    }
}

impl std::str::FromStr for StopMode {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "never" => Ok(StopMode::Never),
            "when_all_done" => Ok(StopMode::WhenAllDone),
            "when_current_done" => Ok(StopMode::WhenCurrentDone),
            "now" => Ok(StopMode::Now),
            _ => Err(WardenError::InvalidStopMode(s.to_string())),
        }
    }
}

/// Scheduler loop state derived from the stop mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Running,
    DrainingWhenAllDone,
    DrainingWhenCurrentDone,
    Cancelling,
    Stopped,
}

impl SchedulerState {
    pub fn from_mode(mode: StopMode) -> Self {
        match mode {
            StopMode::Never => SchedulerState::Running,
            StopMode::WhenAllDone => SchedulerState::DrainingWhenAllDone,
            StopMode::WhenCurrentDone => SchedulerState::DrainingWhenCurrentDone,
            StopMode::Now => SchedulerState::Cancelling,
        }
    }
}

/// Best-effort in-memory snapshot; the store stays authoritative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub waiting: i64,
    pub running: usize,
    pub mode: StopMode,
    pub state: SchedulerState,
}
