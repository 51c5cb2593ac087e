use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Defines when and how often a job should run.
///
/// Serialised with a `kind` discriminant and camelCase, millisecond-based
/// fields: `{"kind":"every","everyMs":60000}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run exactly once at the given UTC instant.
    At {
        #[serde(rename = "atMs", with = "chrono::serde::ts_milliseconds")]
        at: DateTime<Utc>,
    },

    /// Run repeatedly with a fixed interval in milliseconds.
    Every {
        #[serde(rename = "everyMs")]
        every_ms: u64,
    },

    /// Run at instants matching a 5-field cron expression evaluated in `tz`
    /// (UTC when absent).
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

impl Schedule {
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::At { .. } => "at",
            Schedule::Every { .. } => "every",
            Schedule::Cron { .. } => "cron",
        }
    }
}

/// A schedule as posted by clients, before validation.
///
/// Every field is optional and unknown ones are ignored: edit forms switch
/// `kind` in place and leave the previous kind's fields behind. Convert with
/// `Schedule::try_from`, which reports missing fields as `InvalidSchedule`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInput {
    pub kind: Option<String>,
    pub at_ms: Option<i64>,
    pub every_ms: Option<i64>,
    pub expr: Option<String>,
    pub tz: Option<String>,
}

fn default_payload_kind() -> String {
    "agent_turn".to_string()
}

/// What the action runtime is asked to do when the job fires.
///
/// Opaque to the scheduler apart from validation; forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default = "default_payload_kind")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
    /// Shell command whose output is attached to the message at fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Whether the runtime should deliver its response over `channel`.
    #[serde(default)]
    pub deliver: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Recipient address within `channel`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl Payload {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            kind: default_payload_kind(),
            message: message.into(),
            command: None,
            deliver: false,
            channel: None,
            to: None,
        }
    }

    /// Blank optional fields are stored as absent; forms post `""` for them.
    pub fn normalized(mut self) -> Self {
        fn blank_to_none(v: Option<String>) -> Option<String> {
            v.filter(|s| !s.trim().is_empty())
        }
        self.command = blank_to_none(self.command);
        self.channel = blank_to_none(self.channel);
        self.to = blank_to_none(self.to);
        if self.kind.trim().is_empty() {
            self.kind = default_payload_kind();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.message.trim().is_empty() {
            return Err(SchedulerError::InvalidPayload(
                "message text is required".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome recorded on the job after its most recent run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastStatus {
    /// The job has never completed a run.
    #[default]
    None,
    Ok,
    Error,
}

impl std::fmt::Display for LastStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LastStatus::None => "none",
            LastStatus::Ok => "ok",
            LastStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LastStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(LastStatus::None),
            "ok" => Ok(LastStatus::Ok),
            "error" => Ok(LastStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Status of a single completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
        }
    }
}

impl From<RunStatus> for LastStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Ok => LastStatus::Ok,
            RunStatus::Error => LastStatus::Error,
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(RunStatus::Ok),
            "error" => Ok(RunStatus::Error),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// The job's `nextRunAt` arrived; `due_at` is the intended fire time.
    Scheduled {
        #[serde(rename = "dueAtMs", with = "chrono::serde::ts_milliseconds")]
        due_at: DateTime<Utc>,
    },
    /// An operator asked for a test run.
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled { .. } => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

/// Result of one execution, written back through the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub trigger: Trigger,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    /// The instant the next occurrence is computed from: the intended fire
    /// time for scheduled runs, the start time for manual ones.
    pub fn anchor(&self) -> DateTime<Utc> {
        match self.trigger {
            Trigger::Scheduled { due_at } => due_at,
            Trigger::Manual => self.started_at,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Mutable run state of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    #[serde(
        rename = "nextRunAtMs",
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "lastRunAtMs",
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_status: LastStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(
        rename = "lastDurationMs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_duration_ms: Option<u64>,
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// UUID v7 string, assigned at creation.
    pub id: String,
    /// Human-readable label; not unique.
    pub name: String,
    pub enabled: bool,
    pub schedule: Schedule,
    pub payload: Payload,
    /// Remove the job after its first run, whatever the outcome.
    pub delete_after_run: bool,
    pub state: JobState,
    #[serde(rename = "createdAtMs", with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAtMs", with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Where a job sits in the scheduler's state machine, as far as the store
/// can tell. `Running` is only known to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Disabled,
    /// Enabled, waiting for `at`.
    Armed { at: DateTime<Utc> },
    /// Enabled with nothing left to fire (e.g. a spent `at` job).
    Idle,
}

impl Job {
    pub fn phase(&self) -> JobPhase {
        match (self.enabled, self.state.next_run_at) {
            (false, _) => JobPhase::Disabled,
            (true, Some(at)) => JobPhase::Armed { at },
            (true, None) => JobPhase::Idle,
        }
    }

    /// A one-shot job whose instant passed without it being deleted.
    pub fn is_spent(&self) -> bool {
        matches!(self.schedule, Schedule::At { .. })
            && self.enabled
            && self.state.next_run_at.is_none()
    }
}

/// Input for [`crate::store::JobStore::create`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub schedule: Schedule,
    pub payload: Payload,
    #[serde(default)]
    pub delete_after_run: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewJob {
    pub fn new(name: impl Into<String>, schedule: Schedule, payload: Payload) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            schedule,
            payload,
            delete_after_run: false,
        }
    }

    pub fn delete_after_run(mut self, delete_after_run: bool) -> Self {
        self.delete_after_run = delete_after_run;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Replacement values for a job's editable fields; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub schedule: Option<Schedule>,
    pub payload: Option<Payload>,
    pub delete_after_run: Option<bool>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.enabled.is_none()
            && self.schedule.is_none()
            && self.payload.is_none()
            && self.delete_after_run.is_none()
    }
}

/// One row of a job's run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub job_id: String,
    /// `"scheduled"` or `"manual"`.
    pub trigger: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "startedAtMs", with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "finishedAtMs", with = "chrono::serde::ts_milliseconds")]
    pub finished_at: DateTime<Utc>,
}
