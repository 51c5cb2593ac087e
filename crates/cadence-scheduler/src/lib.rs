//! `cadence-scheduler`: Tokio-based job scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Jobs live in a [`store::JobStore`] (SQLite in production). The
//! [`engine::SchedulerEngine`] keeps an in-memory [`queue::DispatchQueue`] of
//! armed jobs, sleeps until the earliest `nextRunAt` and hands due jobs to the
//! [`executor::Executor`], which calls the external
//! [`executor::ActionRuntime`] and writes the outcome back. Commands from a
//! [`engine::SchedulerHandle`] wake the loop early.
//!
//! # Schedule variants
//!
//! | Variant | Behaviour                                              |
//! |---------|--------------------------------------------------------|
//! | `At`    | Single fire at an absolute UTC instant                 |
//! | `Every` | Repeat every N milliseconds, phase kept across misses  |
//! | `Cron`  | 5-field cron expression evaluated in an IANA timezone  |

pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod queue;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{Scheduler, SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use executor::{ActionRequest, ActionResponse, ActionRuntime, Execution, SkipReason};
pub use store::{JobStore, SqliteJobStore};
pub use types::{
    Job, JobPatch, JobState, LastStatus, NewJob, Payload, RunRecord, Schedule, ScheduleInput,
};
