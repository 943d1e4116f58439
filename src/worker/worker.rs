//! The polling worker: claims tasks into a fixed pool of slots and drains on stop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::tasks::ClaimFilter;
use crate::worker::backoff::Backoff;
use crate::worker::executor::{TaskExecutor, TaskOutcome};
use crate::worker::heartbeat::{Heartbeat, HeartbeatSinks, StoreSink, TracingSink};
use crate::worker::state::WorkerState;

/// Worker timings and limits. Every constant is configurable so tests can run
/// the loop with millisecond timings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Parallel execution slots.
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Requeue `in_progress` tasks older than this at startup. `None` disables.
    pub stale_after: Option<Duration>,
    pub claim_filter: ClaimFilter,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            concurrency: 3,
            poll_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(300),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            stale_after: Some(Duration::from_secs(2 * 60 * 60)),
            claim_filter: ClaimFilter::any(),
        }
    }
}

/// Returned by [`Worker::run`] and emitted as the final heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub uptime_seconds: f64,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
}

impl Counters {
    fn record(&mut self, joined: Result<(String, TaskOutcome), tokio::task::JoinError>) {
        match joined {
            Ok((_, outcome)) if outcome.is_completed() => self.completed += 1,
            Ok(_) => self.failed += 1,
            Err(e) => {
                // Panics are caught inside the executor; this is a runtime abort.
                error!(error = %e, "Execution slot aborted");
                self.failed += 1;
            }
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    executor: TaskExecutor,
    sinks: HeartbeatSinks,
    state: watch::Sender<WorkerState>,
}

impl Worker {
    /// Heartbeats go to the log and to the store by default.
    pub fn new(config: WorkerConfig, executor: TaskExecutor) -> Self {
        let sinks = HeartbeatSinks::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(StoreSink::new(executor.store().clone())));
        let (state, _) = watch::channel(WorkerState::Starting);
        Self {
            config,
            executor,
            sinks,
            state,
        }
    }

    pub fn with_heartbeat_sinks(mut self, sinks: HeartbeatSinks) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Observe lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    fn transition(&self, to: WorkerState) -> Result<(), WorkerError> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(WorkerError::InvalidState {
                id: self.config.worker_id.clone(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        self.state.send_replace(to);
        info!(worker_id = %self.config.worker_id, from = %from, to = %to, "Worker state changed");
        Ok(())
    }

    fn heartbeat(&self, counters: &Counters, active: usize, started: Instant) -> Heartbeat {
        Heartbeat {
            worker_id: self.config.worker_id.clone(),
            state: self.state(),
            tasks_completed: counters.completed,
            tasks_failed: counters.failed,
            active_tasks: active,
            uptime_seconds: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        }
    }

    /// Run until `shutdown` fires, then drain in-flight executions.
    ///
    /// Fails only if the store cannot be reached at startup.
    pub async fn run(self, shutdown: CancellationToken) -> Result<WorkerSummary, WorkerError> {
        let started = Instant::now();
        let worker_id = self.config.worker_id.clone();
        let store = self.executor.store().clone();

        if let Err(e) = store.ping().await {
            error!(worker_id = %worker_id, error = %e, "Task store unreachable at startup");
            self.transition(WorkerState::Stopped)?;
            return Err(WorkerError::StoreUnavailable(e));
        }

        if let Some(older_than) = self.config.stale_after {
            match store.requeue_stale(older_than).await {
                Ok(0) => {}
                Ok(n) => info!(worker_id = %worker_id, count = n, "Requeued stale in-progress tasks"),
                Err(e) => warn!(worker_id = %worker_id, error = %e, "Stale task requeue failed"),
            }
        }

        self.transition(WorkerState::Running)?;
        info!(
            worker_id = %worker_id,
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Worker running"
        );

        let mut slots: JoinSet<(String, TaskOutcome)> = JoinSet::new();
        let mut counters = Counters::default();
        let mut backoff = Backoff::new(self.config.backoff_base, self.config.backoff_cap);
        let mut resume_at = Instant::now();

        let mut heartbeat = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let mut next_wake = Instant::now() + self.config.poll_interval;
            if Instant::now() >= resume_at {
                while self.state().accepts_work() && slots.len() < self.config.concurrency {
                    match store.claim_next(&worker_id, &self.config.claim_filter).await {
                        Ok(Some(task)) => {
                            backoff.reset();
                            info!(
                                worker_id = %worker_id,
                                task_id = %task.id,
                                priority = task.priority,
                                attempt = task.retry_count + 1,
                                "Claimed task"
                            );
                            let executor = self.executor.clone();
                            slots.spawn(async move {
                                let id = task.id.clone();
                                (id, executor.execute(task).await)
                            });
                        }
                        Ok(None) => {
                            backoff.reset();
                            break;
                        }
                        Err(e) => {
                            let delay = backoff.next_delay();
                            warn!(
                                worker_id = %worker_id,
                                error = %e,
                                consecutive_errors = backoff.consecutive_errors(),
                                delay_ms = delay.as_millis() as u64,
                                "Poll failed, backing off"
                            );
                            resume_at = Instant::now() + delay;
                            break;
                        }
                    }
                }
            }
            if resume_at > Instant::now() {
                next_wake = resume_at;
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(joined) = slots.join_next(), if !slots.is_empty() => {
                    counters.record(joined.map(|(id, outcome)| {
                        debug!(worker_id = %worker_id, task_id = %id, "Slot freed");
                        (id, outcome)
                    }));
                }

                _ = heartbeat.tick() => {
                    let hb = self.heartbeat(&counters, slots.len(), started);
                    self.sinks.emit(&hb).await;
                }

                _ = tokio::time::sleep_until(next_wake) => {}
            }
        }

        self.transition(WorkerState::Draining)?;
        info!(worker_id = %worker_id, in_flight = slots.len(), "Draining");
        while let Some(joined) = slots.join_next().await {
            counters.record(joined);
        }

        self.transition(WorkerState::Stopped)?;
        let final_hb = self.heartbeat(&counters, 0, started);
        self.sinks.emit(&final_hb).await;

        let summary = WorkerSummary {
            worker_id,
            tasks_completed: counters.completed,
            tasks_failed: counters.failed,
            uptime_seconds: final_hb.uptime_seconds,
        };
        info!(
            worker_id = %summary.worker_id,
            tasks_completed = summary.tasks_completed,
            tasks_failed = summary.tasks_failed,
            uptime_seconds = summary.uptime_seconds,
            "Worker stopped"
        );
        Ok(summary)
    }
}
