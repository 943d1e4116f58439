//! Worker system: claims tasks from the store and runs them through the router.
//!
//! - `state`: worker lifecycle (starting → running → draining → stopped)
//! - `executor`: one task through the router, outcome written back
//! - `worker`: the polling loop with a fixed pool of slots
//! - `heartbeat`: periodic liveness reports
//! - `backoff`: poll-level error backoff

pub mod backoff;
pub mod executor;
pub mod heartbeat;
pub mod state;
pub mod worker;

pub use backoff::Backoff;
pub use executor::{RoutingOptions, TaskExecutor, TaskOutcome};
pub use heartbeat::{Heartbeat, HeartbeatSink, HeartbeatSinks, StoreSink, TracingSink};
pub use state::WorkerState;
pub use worker::{Worker, WorkerConfig, WorkerSummary};
