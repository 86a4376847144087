//! # jobwarden core
//!
//! Shared vocabulary for the jobwarden scheduler: the persisted `Job` and
//! `SerializationKey` rows, stop modes, the error type, configuration, and the
//! two seams the scheduler loop depends on:
//!
//! ```text
//! Scheduler loop
//!   ├── JobStore       select_next / claim / release / revert / submit
//!   └── ChangeChannel  listen / poll (created, started, completed)
//! ```

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use traits::{ChangeChannel, JobStore};
pub use types::{
    Job, JobCounts, JobEvent, JobEventStatus, JobId, JobState, KeyId, NewJob, SchedulerState,
    SchedulerStatus, SerializationKey, StopMode,
};
