//! Job execution.
//!
//! The [`Executor`] takes a job id plus a [`Trigger`], enforces the
//! one-run-per-job rule through [`RunLocks`], waits for a worker permit,
//! calls the [`ActionRuntime`] under a timeout and writes the outcome back
//! through the [`JobStore`]. Runtime failures never escape as errors; they
//! become `status = error` on the job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::SchedulerConfig;
use cadence_core::truncate::truncate_middle;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::store::JobStore;
use crate::types::{Payload, RunOutcome, RunStatus, Trigger};

/// What the action runtime receives for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub job_id: String,
    pub job_name: String,
    pub payload: Payload,
}

/// The runtime's verdict: `{ ok, error? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// The external collaborator that performs a job's payload.
///
/// Implementations report failure through [`ActionResponse`]. A panic is
/// recorded as a failed run.
#[async_trait]
pub trait ActionRuntime: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> ActionResponse;
}

/// Set of job ids with a run in flight.
#[derive(Debug, Clone, Default)]
pub struct RunLocks {
    held: Arc<DashMap<String, ()>>,
}

impl RunLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run lock for `job_id`, or `None` if it is already held.
    pub fn try_acquire(&self, job_id: &str) -> Option<RunGuard> {
        match self.held.entry(job_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(RunGuard {
                    held: Arc::clone(&self.held),
                    job_id: job_id.to_string(),
                })
            }
        }
    }

    pub fn is_held(&self, job_id: &str) -> bool {
        self.held.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// Releases the run lock when dropped, including on timeout and panic.
#[derive(Debug)]
pub struct RunGuard {
    held: Arc<DashMap<String, ()>>,
    job_id: String,
}

impl RunGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.held.remove(&self.job_id);
    }
}

/// Why a run did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another run of the job holds the lock.
    AlreadyRunning,
    Disabled,
    /// The job was re-armed after this run was queued.
    Stale,
    /// The job no longer exists.
    Missing,
    /// The worker pool has been closed.
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Completed(RunOutcome),
    Skipped(SkipReason),
}

/// Tunables for the [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub max_concurrent_runs: usize,
    pub run_timeout: Duration,
    pub max_error_chars: usize,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

impl From<&SchedulerConfig> for ExecutorOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_concurrent_runs: config.max_concurrent_runs.max(1),
            run_timeout: config.run_timeout(),
            max_error_chars: config.max_error_chars,
        }
    }
}

/// Runs jobs against the action runtime. Cheap to clone; clones share locks
/// and the worker pool.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn ActionRuntime>,
    locks: RunLocks,
    permits: Arc<Semaphore>,
    run_timeout: Duration,
    max_error_chars: usize,
}

impl Executor {
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ActionRuntime>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            store,
            runtime,
            locks: RunLocks::new(),
            permits: Arc::new(Semaphore::new(options.max_concurrent_runs.max(1))),
            run_timeout: options.run_timeout,
            max_error_chars: options.max_error_chars,
        }
    }

    pub fn locks(&self) -> &RunLocks {
        &self.locks
    }

    /// Stop handing out worker permits; queued runs are skipped.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Acquire the job's run lock and execute it.
    pub async fn run(&self, job_id: &str, trigger: Trigger) -> Result<Execution> {
        match self.locks.try_acquire(job_id) {
            Some(guard) => self.run_locked(guard, trigger).await,
            None => {
                debug!(job_id = %job_id, trigger = trigger.as_str(), "run skipped, already running");
                Ok(Execution::Skipped(SkipReason::AlreadyRunning))
            }
        }
    }

    /// Execute with a lock the caller already holds. The lock is released
    /// when this returns.
    ///
    /// Only store failures are returned as `Err`; everything the runtime does
    /// is folded into the outcome.
    pub async fn run_locked(&self, guard: RunGuard, trigger: Trigger) -> Result<Execution> {
        let job_id = guard.job_id().to_string();

        let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return Ok(Execution::Skipped(SkipReason::ShuttingDown));
        };

        let job = match self.store.get(&job_id) {
            Ok(job) => job,
            Err(SchedulerError::JobNotFound { .. }) => {
                debug!(job_id = %job_id, "run skipped, job deleted");
                return Ok(Execution::Skipped(SkipReason::Missing));
            }
            Err(e) => return Err(e),
        };
        if !job.enabled {
            debug!(job_id = %job_id, "run skipped, job disabled");
            return Ok(Execution::Skipped(SkipReason::Disabled));
        }
        if let Trigger::Scheduled { due_at } = trigger {
            if job.state.next_run_at != Some(due_at) {
                debug!(job_id = %job_id, %due_at, next_run_at = ?job.state.next_run_at, "run skipped, stale");
                return Ok(Execution::Skipped(SkipReason::Stale));
            }
        }

        let request = ActionRequest {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            payload: job.payload.clone(),
        };

        info!(job_id = %job_id, name = %job.name, trigger = trigger.as_str(), "job fired");
        let started_at = Utc::now();
        let result = self.invoke(request).await;
        let finished_at = Utc::now();

        let (status, error) = match result {
            Ok(()) => (RunStatus::Ok, None),
            Err(SchedulerError::RunFailed(reason)) => (
                RunStatus::Error,
                Some(truncate_middle(&reason, self.max_error_chars)),
            ),
            Err(e) => (
                RunStatus::Error,
                Some(truncate_middle(&e.to_string(), self.max_error_chars)),
            ),
        };

        let outcome = RunOutcome {
            trigger,
            status,
            error,
            started_at,
            finished_at,
        };
        match &outcome.error {
            Some(error) => warn!(job_id = %job_id, duration_ms = outcome.duration_ms(), %error, "job run failed"),
            None => info!(job_id = %job_id, duration_ms = outcome.duration_ms(), "job run succeeded"),
        }

        match self.store.record_run(&job_id, &outcome) {
            Ok(_) => {}
            Err(SchedulerError::JobNotFound { .. }) => {
                debug!(job_id = %job_id, "job deleted during run; outcome dropped");
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to record run outcome; re-arming from now");
                // never leave the consumed due time armed
                if let Err(e) = self.store.rearm(&job_id, Utc::now()) {
                    error!(job_id = %job_id, error = %e, "failed to re-arm job after run");
                    return Err(e);
                }
            }
        }

        drop(guard);
        Ok(Execution::Completed(outcome))
    }

    /// Call the runtime on its own task so a panic or a timeout ends up as
    /// `RunFailed` instead of unwinding through the executor.
    async fn invoke(&self, request: ActionRequest) -> Result<()> {
        let runtime = Arc::clone(&self.runtime);
        let mut task = tokio::spawn(async move { runtime.execute(&request).await });

        let response = match tokio::time::timeout(self.run_timeout, &mut task).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_panic() => {
                return Err(SchedulerError::RunFailed(format!(
                    "action runtime panicked: {}",
                    panic_message(e)
                )));
            }
            Ok(Err(e)) => {
                return Err(SchedulerError::RunFailed(format!(
                    "action runtime task failed: {e}"
                )));
            }
            Err(_) => {
                task.abort();
                return Err(SchedulerError::RunFailed(format!(
                    "timed out after {:?}",
                    self.run_timeout
                )));
            }
        };

        if response.ok {
            return Ok(());
        }
        Err(SchedulerError::RunFailed(
            response
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| "action runtime reported failure".to_string()),
        ))
    }
}

fn panic_message(e: JoinError) -> String {
    let payload = e.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteJobStore;
    use crate::types::{LastStatus, NewJob, Schedule};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct OkRuntime {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionRuntime for OkRuntime {
        async fn execute(&self, _request: &ActionRequest) -> ActionResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ActionResponse::ok()
        }
    }

    struct FailRuntime(String);

    #[async_trait]
    impl ActionRuntime for FailRuntime {
        async fn execute(&self, _request: &ActionRequest) -> ActionResponse {
            ActionResponse::failed(self.0.clone())
        }
    }

    /// Blocks every call until `release` is notified.
    struct GatedRuntime {
        started: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ActionRuntime for GatedRuntime {
        async fn execute(&self, _request: &ActionRequest) -> ActionResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            ActionResponse::ok()
        }
    }

    struct SleepyRuntime;

    #[async_trait]
    impl ActionRuntime for SleepyRuntime {
        async fn execute(&self, _request: &ActionRequest) -> ActionResponse {
            tokio::time::sleep(Duration::from_secs(30)).await;
            ActionResponse::ok()
        }
    }

    fn options() -> ExecutorOptions {
        ExecutorOptions {
            max_concurrent_runs: 4,
            run_timeout: Duration::from_secs(5),
            max_error_chars: 200,
        }
    }

    fn setup(runtime: Arc<dyn ActionRuntime>, options: ExecutorOptions) -> (Arc<SqliteJobStore>, Executor) {
        let store = Arc::new(SqliteJobStore::open_in_memory().unwrap());
        let executor = Executor::new(store.clone(), runtime, options);
        (store, executor)
    }

    fn hourly(store: &SqliteJobStore) -> crate::types::Job {
        store
            .create(
                NewJob::new("digest", Schedule::Every { every_ms: 3_600_000 }, Payload::message("ping")),
                Utc::now(),
            )
            .unwrap()
    }

    #[test]
    fn run_lock_is_exclusive_and_released_on_drop() {
        let locks = RunLocks::new();
        let guard = locks.try_acquire("a").unwrap();
        assert!(locks.try_acquire("a").is_none());
        assert!(locks.try_acquire("b").is_some());
        assert!(locks.is_held("a"));
        drop(guard);
        assert!(!locks.is_held("a"));
        assert!(locks.try_acquire("a").is_some());
    }

    #[tokio::test]
    async fn successful_scheduled_run_is_recorded() {
        let runtime = Arc::new(OkRuntime { calls: AtomicUsize::new(0) });
        let (store, executor) = setup(runtime.clone(), options());
        let job = hourly(&store);
        let due = job.state.next_run_at.unwrap();

        let execution = executor.run(&job.id, Trigger::Scheduled { due_at: due }).await.unwrap();
        let Execution::Completed(outcome) = execution else {
            panic!("expected a completed run, got {execution:?}");
        };
        assert_eq!(outcome.status, RunStatus::Ok);
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);

        let job = store.get(&job.id).unwrap();
        assert_eq!(job.state.last_status, LastStatus::Ok);
        assert_eq!(job.state.next_run_at, Some(due + chrono::Duration::hours(1)));
        assert!(executor.locks().is_empty());
    }

    #[tokio::test]
    async fn runtime_failure_is_captured_and_truncated() {
        let long = format!("{}{}", "x".repeat(1_000), "root cause");
        let (store, executor) = setup(Arc::new(FailRuntime(long)), options());
        let job = hourly(&store);

        let execution = executor.run(&job.id, Trigger::Manual).await.unwrap();
        assert!(matches!(execution, Execution::Completed(ref o) if o.status == RunStatus::Error));

        let job = store.get(&job.id).unwrap();
        assert_eq!(job.state.last_status, LastStatus::Error);
        let error = job.state.last_error.unwrap();
        assert!(error.chars().count() <= 200);
        assert!(error.ends_with("root cause"));
        assert!(job.enabled);
        assert!(job.state.next_run_at.is_some());
    }

    #[tokio::test]
    async fn timeout_becomes_an_error_outcome() {
        let opts = ExecutorOptions {
            run_timeout: Duration::from_millis(50),
            ..options()
        };
        let (store, executor) = setup(Arc::new(SleepyRuntime), opts);
        let job = hourly(&store);

        executor.run(&job.id, Trigger::Manual).await.unwrap();
        let job = store.get(&job.id).unwrap();
        assert_eq!(job.state.last_status, LastStatus::Error);
        assert!(job.state.last_error.unwrap().starts_with("timed out after"));
        assert!(executor.locks().is_empty());
    }

    #[tokio::test]
    async fn concurrent_run_of_same_job_is_skipped() {
        let runtime = Arc::new(GatedRuntime {
            started: Notify::new(),
            release: Notify::new(),
            calls: AtomicUsize::new(0),
        });
        let (store, executor) = setup(runtime.clone(), options());
        let job = hourly(&store);
        let due = job.state.next_run_at.unwrap();

        let first = {
            let executor = executor.clone();
            let id = job.id.clone();
            tokio::spawn(async move { executor.run(&id, Trigger::Scheduled { due_at: due }).await })
        };
        runtime.started.notified().await;

        let second = executor.run(&job.id, Trigger::Manual).await.unwrap();
        assert_eq!(second, Execution::Skipped(SkipReason::AlreadyRunning));

        runtime.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, Execution::Completed(_)));
        assert_eq!(runtime.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_runs(&job.id, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_missing_and_stale_runs_are_skipped() {
        let runtime = Arc::new(OkRuntime { calls: AtomicUsize::new(0) });
        let (store, executor) = setup(runtime.clone(), options());

        let job = hourly(&store);
        let due = job.state.next_run_at.unwrap();
        let stale = executor
            .run(&job.id, Trigger::Scheduled { due_at: due - chrono::Duration::minutes(1) })
            .await
            .unwrap();
        assert_eq!(stale, Execution::Skipped(SkipReason::Stale));

        store.set_enabled(&job.id, false, Utc::now()).unwrap();
        let disabled = executor.run(&job.id, Trigger::Manual).await.unwrap();
        assert_eq!(disabled, Execution::Skipped(SkipReason::Disabled));

        let missing = executor.run("no-such-job", Trigger::Manual).await.unwrap();
        assert_eq!(missing, Execution::Skipped(SkipReason::Missing));

        assert_eq!(runtime.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delete_after_run_job_is_gone_after_failure() {
        let (store, executor) = setup(Arc::new(FailRuntime("nope".to_string())), options());
        let job = store
            .create(
                NewJob::new("once", Schedule::Every { every_ms: 60_000 }, Payload::message("hi"))
                    .delete_after_run(true),
                Utc::now(),
            )
            .unwrap();

        executor.run(&job.id, Trigger::Manual).await.unwrap();
        assert_eq!(store.get(&job.id).unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn closed_pool_skips_runs() {
        let (store, executor) = setup(Arc::new(OkRuntime { calls: AtomicUsize::new(0) }), options());
        let job = hourly(&store);
        executor.close();
        let execution = executor.run(&job.id, Trigger::Manual).await.unwrap();
        assert_eq!(execution, Execution::Skipped(SkipReason::ShuttingDown));
        assert!(!executor.locks().is_held(&job.id));
    }

    struct PanicRuntime;

    #[async_trait]
    impl ActionRuntime for PanicRuntime {
        async fn execute(&self, _request: &ActionRequest) -> ActionResponse {
            panic!("runtime blew up");
        }
    }

    #[tokio::test]
    async fn panicking_runtime_is_recorded_as_error() {
        let (store, executor) = setup(Arc::new(PanicRuntime), options());
        let job = store
            .create(
                NewJob::new("overdue", Schedule::Every { every_ms: 3_600_000 }, Payload::message("ping")),
                Utc::now() - chrono::Duration::hours(2),
            )
            .unwrap();
        let due = job.state.next_run_at.unwrap();
        assert!(due < Utc::now());

        let execution = executor.run(&job.id, Trigger::Scheduled { due_at: due }).await.unwrap();
        assert!(matches!(execution, Execution::Completed(ref o) if o.status == RunStatus::Error));

        let job = store.get(&job.id).unwrap();
        assert_eq!(job.state.last_status, LastStatus::Error);
        assert_eq!(
            job.state.last_error.as_deref(),
            Some("action runtime panicked: runtime blew up")
        );
        assert_eq!(job.state.next_run_at, Some(due + chrono::Duration::hours(1)));
        assert!(executor.locks().is_empty());
    }

    /// Delegates to SQLite but refuses to record outcomes.
    struct UnwritableStore(SqliteJobStore);

    impl JobStore for UnwritableStore {
        fn create(&self, new: NewJob, now: chrono::DateTime<Utc>) -> Result<crate::types::Job> {
            self.0.create(new, now)
        }
        fn get(&self, id: &str) -> Result<crate::types::Job> {
            self.0.get(id)
        }
        fn list(&self) -> Result<Vec<crate::types::Job>> {
            self.0.list()
        }
        fn update(
            &self,
            id: &str,
            patch: crate::types::JobPatch,
            now: chrono::DateTime<Utc>,
        ) -> Result<crate::types::Job> {
            self.0.update(id, patch, now)
        }
        fn set_enabled(&self, id: &str, enabled: bool, now: chrono::DateTime<Utc>) -> Result<crate::types::Job> {
            self.0.set_enabled(id, enabled, now)
        }
        fn delete(&self, id: &str) -> Result<bool> {
            self.0.delete(id)
        }
        fn record_run(&self, _id: &str, _outcome: &RunOutcome) -> Result<Option<crate::types::Job>> {
            Err(SchedulerError::Internal("disk full".to_string()))
        }
        fn rearm(&self, id: &str, now: chrono::DateTime<Utc>) -> Result<crate::types::Job> {
            self.0.rearm(id, now)
        }
        fn list_runs(&self, id: &str, limit: usize) -> Result<Vec<crate::types::RunRecord>> {
            self.0.list_runs(id, limit)
        }
    }

    #[tokio::test]
    async fn failed_write_back_rearms_from_now() {
        let store = Arc::new(UnwritableStore(SqliteJobStore::open_in_memory().unwrap()));
        let executor = Executor::new(
            store.clone(),
            Arc::new(OkRuntime { calls: AtomicUsize::new(0) }),
            options(),
        );
        let job = store
            .create(
                NewJob::new("overdue", Schedule::Every { every_ms: 3_600_000 }, Payload::message("ping")),
                Utc::now() - chrono::Duration::hours(2),
            )
            .unwrap();
        let due = job.state.next_run_at.unwrap();

        let execution = executor.run(&job.id, Trigger::Scheduled { due_at: due }).await.unwrap();
        assert!(matches!(execution, Execution::Completed(_)));

        let job = store.get(&job.id).unwrap();
        assert!(job.state.next_run_at.unwrap() > Utc::now());
        assert_eq!(job.state.last_status, LastStatus::None);
    }
}
