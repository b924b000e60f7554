use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::types::{RunStatus, Runtime};
use crate::workflow::executor::{ExecutionEngine, RunParams};

/// When a submitted run should execute.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Synchronously on the calling task; `submit` returns after the run
    /// is sealed.
    Now,
    /// Once, at a future instant, on a background worker.
    At(DateTime<Utc>),
    /// Recurring cron schedule (seconds-resolution expression) on a
    /// background worker.
    Cron(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Scheduled,
    Paused,
    Running,
    Finished(RunStatus),
    Cancelled,
}

/// Lifecycle snapshot for one registration.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub state: JobState,
    pub last_run: Option<Runtime>,
}

struct JobEntry {
    state: JobState,
    last_run: Option<Runtime>,
    cancel: watch::Sender<bool>,
    paused: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

/// Accepts run requests, allocates run identities, and drives the
/// execution engine either synchronously or from background workers.
/// Lifecycle control (`pause`/`resume`/`cancel`) acts on the background
/// registration; repeated calls are idempotent.
pub struct Dispatcher {
    engine: Arc<ExecutionEngine>,
    jobs: Arc<Mutex<HashMap<Runtime, JobEntry>>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<ExecutionEngine>) -> Self {
        Self {
            engine,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a run request. Returns the runtime token identifying the
    /// registration: sealed for `Now`, pending for deferred triggers.
    pub async fn submit(
        &self,
        service_id: u64,
        params: RunParams,
        when: Trigger,
    ) -> Result<Runtime> {
        let token = Runtime::generate();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (paused_tx, paused_rx) = watch::channel(false);

        match when {
            Trigger::Now => {
                self.insert_entry(&token, JobState::Running, cancel_tx, paused_tx, None);
                let status = self
                    .fire(token.clone(), service_id, params, cancel_rx)
                    .await;
                self.update_entry(&token, |entry| {
                    entry.last_run = Some(token.clone());
                    entry.state = JobState::Finished(status);
                });
            }
            Trigger::At(when) => {
                let handle = self.spawn_one_shot(
                    token.clone(),
                    service_id,
                    params,
                    when,
                    cancel_rx,
                    paused_rx,
                );
                self.insert_entry(&token, JobState::Scheduled, cancel_tx, paused_tx, Some(handle));
            }
            Trigger::Cron(expression) => {
                let schedule = Schedule::from_str(&expression)
                    .with_context(|| format!("invalid cron expression '{expression}'"))?;
                let handle = self.spawn_recurring(
                    token.clone(),
                    service_id,
                    params,
                    schedule,
                    cancel_rx,
                    paused_rx,
                );
                self.insert_entry(&token, JobState::Scheduled, cancel_tx, paused_tx, Some(handle));
            }
        }
        Ok(token)
    }

    pub fn status(&self, token: &Runtime) -> Option<JobStatus> {
        self.jobs.lock().unwrap().get(token).map(|entry| JobStatus {
            state: entry.state.clone(),
            last_run: entry.last_run.clone(),
        })
    }

    /// Pause a pending registration; firings are skipped until resumed.
    /// Idempotent; a running or finished job is left as is.
    pub fn pause(&self, token: &Runtime) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs
            .get_mut(token)
            .ok_or_else(|| anyhow!("no job registered under {token}"))?;
        entry.paused.send_replace(true);
        if entry.state == JobState::Scheduled {
            entry.state = JobState::Paused;
        }
        Ok(())
    }

    /// Idempotent counterpart of `pause`.
    pub fn resume(&self, token: &Runtime) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs
            .get_mut(token)
            .ok_or_else(|| anyhow!("no job registered under {token}"))?;
        entry.paused.send_replace(false);
        if entry.state == JobState::Paused {
            entry.state = JobState::Scheduled;
        }
        Ok(())
    }

    /// Cancel a registration. A pending job is dropped outright; a running
    /// job stops scheduling further layers but the in-flight layer
    /// finishes (no hard preemption). Idempotent.
    pub fn cancel(&self, token: &Runtime) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs
            .get_mut(token)
            .ok_or_else(|| anyhow!("no job registered under {token}"))?;
        entry.cancel.send_replace(true);
        match entry.state {
            JobState::Scheduled | JobState::Paused => {
                if let Some(handle) = entry.handle.take() {
                    handle.abort();
                }
                entry.state = JobState::Cancelled;
            }
            // Running: the engine observes the signal between layers and
            // the worker records the terminal state. Terminal states stay.
            _ => {}
        }
        Ok(())
    }

    fn insert_entry(
        &self,
        token: &Runtime,
        state: JobState,
        cancel: watch::Sender<bool>,
        paused: watch::Sender<bool>,
        handle: Option<JoinHandle<()>>,
    ) {
        self.jobs.lock().unwrap().insert(
            token.clone(),
            JobEntry {
                state,
                last_run: None,
                cancel,
                paused,
                handle,
            },
        );
    }

    fn update_entry(&self, token: &Runtime, update: impl FnOnce(&mut JobEntry)) {
        if let Some(entry) = self.jobs.lock().unwrap().get_mut(token) {
            update(entry);
        }
    }

    /// One engine invocation. Faults are recorded, never propagated: a
    /// background dispatch must not crash the dispatcher.
    async fn fire(
        &self,
        runtime: Runtime,
        service_id: u64,
        params: RunParams,
        cancel: watch::Receiver<bool>,
    ) -> RunStatus {
        match self
            .engine
            .run_with_cancel(runtime.clone(), service_id, params, cancel)
            .await
        {
            Ok(run) => run.status,
            Err(err) => {
                tracing::error!("dispatch of {runtime} failed: {err}");
                RunStatus::Failure
            }
        }
    }

    fn spawn_one_shot(
        &self,
        token: Runtime,
        service_id: u64,
        params: RunParams,
        when: DateTime<Utc>,
        mut cancel: watch::Receiver<bool>,
        mut paused: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            if !wait_until(when, &mut cancel).await {
                return;
            }
            // Deferred while paused; fires on resume.
            while *paused.borrow() {
                if paused.changed().await.is_err() {
                    return;
                }
            }
            if *cancel.borrow() {
                return;
            }
            set_state(&jobs, &token, JobState::Running);
            let run_token = Runtime::generate();
            let status = match engine
                .run_with_cancel(run_token.clone(), service_id, params, cancel)
                .await
            {
                Ok(run) => run.status,
                Err(err) => {
                    tracing::error!("dispatch of {run_token} failed: {err}");
                    RunStatus::Failure
                }
            };
            if let Some(entry) = jobs.lock().unwrap().get_mut(&token) {
                entry.last_run = Some(run_token);
                entry.state = JobState::Finished(status);
            }
        })
    }

    fn spawn_recurring(
        &self,
        token: Runtime,
        service_id: u64,
        params: RunParams,
        schedule: Schedule,
        mut cancel: watch::Receiver<bool>,
        paused: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let jobs = self.jobs.clone();
        tokio::spawn(async move {
            for next in schedule.upcoming(Utc) {
                if !wait_until(next, &mut cancel).await {
                    break;
                }
                if *cancel.borrow() {
                    break;
                }
                // Paused registrations skip firings instead of queueing
                // them.
                if *paused.borrow() {
                    continue;
                }
                set_state(&jobs, &token, JobState::Running);
                let run_token = Runtime::generate();
                let status = match engine
                    .run_with_cancel(
                        run_token.clone(),
                        service_id,
                        params.clone(),
                        cancel.clone(),
                    )
                    .await
                {
                    Ok(run) => run.status,
                    Err(err) => {
                        tracing::error!("dispatch of {run_token} failed: {err}");
                        RunStatus::Failure
                    }
                };
                if let Some(entry) = jobs.lock().unwrap().get_mut(&token) {
                    entry.last_run = Some(run_token);
                    entry.state = if *paused.borrow() {
                        JobState::Paused
                    } else {
                        JobState::Scheduled
                    };
                }
                tracing::info!("recurring job {token} fired: {status:?}");
            }
            set_state(&jobs, &token, JobState::Cancelled);
        })
    }
}

fn set_state(jobs: &Mutex<HashMap<Runtime, JobEntry>>, token: &Runtime, state: JobState) {
    if let Some(entry) = jobs.lock().unwrap().get_mut(token) {
        entry.state = state;
    }
}

/// Sleep until the trigger instant, waking early on cancellation.
/// Sleeps in bounded chunks and re-checks the clock, so arbitrarily far
/// triggers are fine. Returns false when cancelled.
async fn wait_until(when: DateTime<Utc>, cancel: &mut watch::Receiver<bool>) -> bool {
    loop {
        let now = Utc::now();
        if when <= now {
            return true;
        }
        let remaining = (when - now).to_std().unwrap_or_default();
        let chunk = remaining.min(std::time::Duration::from_secs(3600));
        tokio::select! {
            _ = tokio::time::sleep(chunk) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return false;
                }
            }
        }
    }
}
