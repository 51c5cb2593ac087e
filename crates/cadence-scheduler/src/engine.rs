use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    executor::{ActionRuntime, Execution, Executor, ExecutorOptions, RunGuard, RunLocks},
    queue::DispatchQueue,
    store::JobStore,
    types::{Job, JobPatch, JobPhase, NewJob, Payload, RunRecord, Schedule, Trigger},
};

/// How long `stop` waits for in-flight runs before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Messages from handles and finished runs to the scheduler loop.
#[derive(Debug)]
enum Command {
    /// Re-read one job and move or drop its queue entry.
    Sync(String),
    /// A run ended. `fired` is the due time a scheduled run consumed.
    Finished {
        job_id: String,
        fired: Option<DateTime<Utc>>,
    },
    /// Start a manual run; the caller already holds the lock.
    Run(RunGuard),
}

/// Cloneable command surface used by the HTTP layer and tests.
///
/// Every mutation goes to the store first, then nudges the loop so the
/// queue reflects the new `nextRunAt` without waiting for the next poll.
#[derive(Clone)]
pub struct SchedulerHandle {
    store: Arc<dyn JobStore>,
    locks: RunLocks,
    commands: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    pub fn list(&self) -> Result<Vec<Job>> {
        self.store.list()
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        self.store.get(id)
    }

    pub fn create(&self, new: NewJob) -> Result<Job> {
        let job = self.store.create(new, Utc::now())?;
        self.sync(&job.id);
        Ok(job)
    }

    pub fn update(&self, id: &str, patch: JobPatch) -> Result<Job> {
        let job = self.store.update(id, patch, Utc::now())?;
        self.sync(id);
        Ok(job)
    }

    pub fn rename(&self, id: &str, name: impl Into<String>) -> Result<Job> {
        self.update(
            id,
            JobPatch {
                name: Some(name.into()),
                ..JobPatch::default()
            },
        )
    }

    pub fn set_schedule(&self, id: &str, schedule: Schedule) -> Result<Job> {
        self.update(
            id,
            JobPatch {
                schedule: Some(schedule),
                ..JobPatch::default()
            },
        )
    }

    pub fn set_payload(&self, id: &str, payload: Payload) -> Result<Job> {
        self.update(
            id,
            JobPatch {
                payload: Some(payload),
                ..JobPatch::default()
            },
        )
    }

    pub fn set_delete_after_run(&self, id: &str, delete_after_run: bool) -> Result<Job> {
        self.update(
            id,
            JobPatch {
                delete_after_run: Some(delete_after_run),
                ..JobPatch::default()
            },
        )
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<Job> {
        let job = self.store.set_enabled(id, enabled, Utc::now())?;
        self.sync(id);
        Ok(job)
    }

    /// Idempotent; `Ok(false)` when the job did not exist.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = self.store.delete(id)?;
        self.sync(id);
        Ok(removed)
    }

    /// Start a manual run and return without waiting for it.
    ///
    /// The result lands on the job's state; poll [`get`](Self::get) or
    /// [`runs`](Self::runs) for it.
    pub fn test_run(&self, id: &str) -> Result<()> {
        let job = self.store.get(id)?;
        if !job.enabled {
            return Err(SchedulerError::JobDisabled { id: id.to_string() });
        }
        let guard = self
            .locks
            .try_acquire(id)
            .ok_or_else(|| SchedulerError::RunSkipped { id: id.to_string() })?;
        self.commands
            .send(Command::Run(guard))
            .map_err(|_| SchedulerError::Internal("scheduler is not running".to_string()))?;
        info!(job_id = %id, "test run requested");
        Ok(())
    }

    pub fn runs(&self, id: &str, limit: usize) -> Result<Vec<RunRecord>> {
        self.store.list_runs(id, limit)
    }

    /// Whether a run of the job is in flight.
    pub fn is_running(&self, id: &str) -> bool {
        self.locks.is_held(id)
    }

    fn sync(&self, id: &str) {
        if self.commands.send(Command::Sync(id.to_string())).is_err() {
            debug!(job_id = %id, "scheduler loop not running; change applies on next start");
        }
    }
}

/// The control loop: owns the dispatch queue, sleeps until the earliest due
/// job and hands due jobs to the executor.
pub struct SchedulerEngine {
    store: Arc<dyn JobStore>,
    executor: Executor,
    queue: DispatchQueue,
    commands: mpsc::UnboundedReceiver<Command>,
    /// Clone handed to run tasks so they can report back.
    feedback: mpsc::UnboundedSender<Command>,
    running: JoinSet<()>,
    poll_interval: Duration,
    catch_up_missed: bool,
}

impl SchedulerEngine {
    /// Build an engine and the handle that drives it.
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ActionRuntime>,
        config: &SchedulerConfig,
    ) -> (Self, SchedulerHandle) {
        let executor = Executor::new(Arc::clone(&store), runtime, ExecutorOptions::from(config));
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SchedulerHandle {
            store: Arc::clone(&store),
            locks: executor.locks().clone(),
            commands: tx.clone(),
        };
        let engine = Self {
            store,
            executor,
            queue: DispatchQueue::new(),
            commands: rx,
            feedback: tx,
            running: JoinSet::new(),
            poll_interval: config.poll_interval(),
            catch_up_missed: config.catch_up_missed,
        };
        (engine, handle)
    }

    /// Main event loop. Runs until `shutdown` broadcasts `true` or its sender
    /// is dropped, then waits briefly for in-flight runs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(catch_up_missed = self.catch_up_missed, "scheduler engine started");
        self.recover(Utc::now());

        loop {
            let wait = self.wait_duration(Utc::now());
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    self.dispatch_due(Utc::now());
                }
                Some(command) = self.commands.recv() => {
                    self.apply(command);
                }
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    if let Err(e) = joined {
                        error!("run task failed to join: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    // --- private helpers ---------------------------------------------------

    /// Load armed jobs on startup. Overdue jobs either fire once on the first
    /// pass or are re-armed from `now`, depending on `catch_up_missed`.
    fn recover(&mut self, now: DateTime<Utc>) {
        let jobs = match self.store.list() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("failed to load jobs on startup: {e}");
                return;
            }
        };

        let mut overdue = 0usize;
        for job in jobs {
            let JobPhase::Armed { at } = job.phase() else {
                continue;
            };
            if at > now {
                self.queue.upsert(&job.id, at);
                continue;
            }
            overdue += 1;
            if self.catch_up_missed {
                self.queue.upsert(&job.id, at);
                continue;
            }
            match self.store.rearm(&job.id, now) {
                Ok(rearmed) => {
                    warn!(job_id = %job.id, missed_at = %at, next_run_at = ?rearmed.state.next_run_at, "missed run skipped");
                    if let JobPhase::Armed { at } = rearmed.phase() {
                        self.queue.upsert(&rearmed.id, at);
                    }
                }
                Err(e) => error!(job_id = %job.id, "failed to re-arm missed job: {e}"),
            }
        }

        info!(queued = self.queue.len(), overdue, "scheduler queue loaded");
    }

    fn wait_duration(&self, now: DateTime<Utc>) -> Duration {
        match self.queue.peek_earliest() {
            Some((_, at)) => (at - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.poll_interval),
            None => self.poll_interval,
        }
    }

    fn dispatch_due(&mut self, now: DateTime<Utc>) {
        for entry in self.queue.pop_due(now) {
            match self.executor.locks().try_acquire(&entry.job_id) {
                Some(guard) => self.spawn_run(guard, Trigger::Scheduled { due_at: entry.due_at }),
                None => {
                    // the running task re-syncs the job when it finishes
                    debug!(job_id = %entry.job_id, "due job still running; fire skipped");
                }
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Sync(id) => self.sync_job(&id, None),
            Command::Finished { job_id, fired } => self.sync_job(&job_id, fired),
            Command::Run(guard) => self.spawn_run(guard, Trigger::Manual),
        }
    }

    /// Bring the job's queue entry in line with the store. An entry at or
    /// before `fired` is never re-queued.
    fn sync_job(&mut self, id: &str, fired: Option<DateTime<Utc>>) {
        match self.store.get(id) {
            Ok(job) => match job.phase() {
                JobPhase::Armed { at } if fired.is_some_and(|fired| at <= fired) => {
                    error!(job_id = %id, %at, "job was not advanced past its last fire; dropped from queue");
                    self.queue.remove(id);
                }
                JobPhase::Armed { at } => {
                    if self.queue.due_at(id) != Some(at) {
                        debug!(job_id = %id, %at, "queue entry armed");
                        self.queue.upsert(id, at);
                    }
                }
                JobPhase::Idle | JobPhase::Disabled => {
                    if self.queue.remove(id) {
                        debug!(job_id = %id, "queue entry dropped");
                    }
                }
            },
            Err(SchedulerError::JobNotFound { .. }) => {
                self.queue.remove(id);
            }
            Err(e) => warn!(job_id = %id, "failed to sync job: {e}"),
        }
    }

    /// Run on a worker task. The outer task survives a panicking run so the
    /// job is always re-synced afterwards.
    fn spawn_run(&mut self, guard: RunGuard, trigger: Trigger) {
        let job_id = guard.job_id().to_string();
        let fired = match trigger {
            Trigger::Scheduled { due_at } => Some(due_at),
            Trigger::Manual => None,
        };
        let executor = self.executor.clone();
        let feedback = self.feedback.clone();

        self.running.spawn(async move {
            let run = tokio::spawn(async move { executor.run_locked(guard, trigger).await });
            match run.await {
                Ok(Ok(Execution::Completed(_))) => {}
                Ok(Ok(Execution::Skipped(reason))) => {
                    debug!(job_id = %job_id, ?reason, "run skipped");
                }
                Ok(Err(e)) => error!(job_id = %job_id, "run aborted: {e}"),
                Err(e) => error!(job_id = %job_id, "run task panicked: {e}"),
            }
            let _ = feedback.send(Command::Finished { job_id, fired });
        });
    }

    async fn drain(&mut self) {
        self.executor.close();
        if self.running.is_empty() {
            return;
        }
        info!(in_flight = self.running.len(), "waiting for running jobs");
        let wait = async { while self.running.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, wait).await.is_err() {
            warn!(in_flight = self.running.len(), "abandoning runs still in flight");
            self.running.abort_all();
        }
    }
}

/// A running scheduler with an explicit lifecycle.
///
/// ```ignore
/// let scheduler = Scheduler::start(store, runtime, &config.scheduler);
/// let handle = scheduler.handle();
/// // ...
/// scheduler.stop().await;
/// ```
pub struct Scheduler {
    handle: SchedulerHandle,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the engine loop on the current Tokio runtime.
    pub fn start(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ActionRuntime>,
        config: &SchedulerConfig,
    ) -> Self {
        let (engine, handle) = SchedulerEngine::new(store, runtime, config);
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(rx));
        Self {
            handle,
            shutdown,
            task,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Signal the loop to stop and wait for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("scheduler task ended abnormally: {e}");
        }
    }
}
