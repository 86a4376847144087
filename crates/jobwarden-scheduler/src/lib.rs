//! # jobwarden scheduler
//!
//! Durable multi-worker job runner on top of SQLite.
//!
//! Jobs live in a shared database file, so any number of scheduler processes
//! can drain the same queue. Jobs that share a serialization key never run
//! concurrently, across the whole fleet.
//!
//! ## Architecture
//! ```text
//! Scheduler (one loop task per instance)
//!   ├── ChangeChannel: job_events rows → waiting estimate
//!   ├── JobStore: select_next → claim → release / revert
//!   └── WorkerPool: N slots, one tokio task per running job
//!         └── HandlerRegistry: job name → async handler
//! ```

pub mod engine;
pub mod handlers;
pub mod notify;
pub mod persistence;
pub mod pool;
pub mod registry;

pub use engine::{Scheduler, SchedulerHandle, StopCallback, TickOutcome};
pub use handlers::register_builtins;
pub use notify::SqliteChangeChannel;
pub use persistence::{JOBS_CHANNEL, SqliteJobStore};
pub use pool::{CancelReport, Completion, SubmitOutcome, WorkerPool};
pub use registry::{Handler, HandlerFuture, HandlerRegistry};
