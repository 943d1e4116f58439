//! Worker heartbeats: periodic liveness and throughput reports.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::TaskStore;
use crate::worker::state::WorkerState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub state: WorkerState,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub active_tasks: usize,
    pub uptime_seconds: f64,
    pub timestamp: DateTime<Utc>,
}

/// Where heartbeats go. Sinks never fail the worker.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn emit(&self, heartbeat: &Heartbeat);
}

/// Structured log line per heartbeat.
pub struct TracingSink;

#[async_trait]
impl HeartbeatSink for TracingSink {
    async fn emit(&self, hb: &Heartbeat) {
        info!(
            worker_id = %hb.worker_id,
            state = %hb.state,
            tasks_completed = hb.tasks_completed,
            tasks_failed = hb.tasks_failed,
            active_tasks = hb.active_tasks,
            uptime_seconds = hb.uptime_seconds,
            "Heartbeat"
        );
    }
}

/// Persists heartbeats to the store's `worker_heartbeats` table.
pub struct StoreSink {
    store: Arc<dyn TaskStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HeartbeatSink for StoreSink {
    async fn emit(&self, hb: &Heartbeat) {
        if let Err(e) = self.store.record_heartbeat(hb).await {
            warn!(worker_id = %hb.worker_id, error = %e, "Failed to persist heartbeat");
        }
    }
}

/// Fan-out to several sinks in order.
#[derive(Default, Clone)]
pub struct HeartbeatSinks {
    sinks: Vec<Arc<dyn HeartbeatSink>>,
}

impl HeartbeatSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn HeartbeatSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub async fn emit(&self, heartbeat: &Heartbeat) {
        for sink in &self.sinks {
            sink.emit(heartbeat).await;
        }
    }
}
