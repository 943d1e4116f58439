//! Backend selection, fallback chain and cost accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Backend, BackendInfo, BackendResult, ExecutionRequest};
use crate::error::{BackendError, RouterError};

/// Expected durations above this go to the most reliable backend.
const LONG_TASK_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Per-backend counters since process start.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    pub calls: u64,
    pub failures: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub cost: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    #[serde(flatten)]
    pub info: BackendInfo,
    #[serde(flatten)]
    pub stats: BackendStats,
}

/// Snapshot returned by [`BackendRouter::status`].
#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    #[serde(with = "rust_decimal::serde::float")]
    pub total_cost: Decimal,
    pub backends: Vec<BackendStatus>,
}

#[derive(Default)]
struct Ledger {
    total_cost: Decimal,
    stats: HashMap<String, BackendStats>,
}

/// Ordered set of backends with automatic fallback.
///
/// Built once at startup and shared by the worker and the gateway.
pub struct BackendRouter {
    backends: Vec<Arc<dyn Backend>>,
    ledger: RwLock<Ledger>,
}

impl BackendRouter {
    /// Backends are tried in the given order after the selected one.
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Result<Self, RouterError> {
        if backends.is_empty() {
            return Err(RouterError::NoBackends);
        }
        Ok(Self {
            backends,
            ledger: RwLock::new(Ledger::default()),
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.info().name.as_str()).collect()
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.backends.iter().position(|b| b.info().name == name)
    }

    /// Index of the backend that should run `request` first.
    ///
    /// Precedence: explicit backend (request, then the task's stored hint),
    /// urgent or long-running → most reliable, `prefer_free` → first free,
    /// otherwise the first declared.
    pub fn select(&self, request: &ExecutionRequest) -> Result<usize, RouterError> {
        if let Some(name) = &request.backend {
            return self
                .position(name)
                .ok_or_else(|| RouterError::UnknownBackend(name.clone()));
        }

        if let Some(hint) = &request.task.backend_hint {
            match self.position(hint) {
                Some(idx) => return Ok(idx),
                None => warn!(
                    task_id = %request.task.id,
                    backend = %hint,
                    "Ignoring unknown backend hint"
                ),
            }
        }

        let long_running = request.timeout.is_some_and(|t| t > LONG_TASK_THRESHOLD);
        if request.task.priority_level().is_urgent() || long_running {
            // First declared wins ties.
            let mut best = 0;
            for (idx, backend) in self.backends.iter().enumerate() {
                if backend.info().reliability > self.backends[best].info().reliability {
                    best = idx;
                }
            }
            return Ok(best);
        }

        if request.prefer_free
            && let Some(idx) = self.backends.iter().position(|b| b.info().is_free())
        {
            return Ok(idx);
        }

        Ok(0)
    }

    /// Selected backend first, then the rest in declared order, each once.
    fn chain(&self, first: usize) -> impl Iterator<Item = &Arc<dyn Backend>> {
        std::iter::once(&self.backends[first]).chain(
            self.backends
                .iter()
                .enumerate()
                .filter(move |(idx, _)| *idx != first)
                .map(|(_, b)| b),
        )
    }

    /// Run the request through the fallback chain.
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<BackendResult, RouterError> {
        let first = self.select(request)?;
        let task_id = request.task.id.as_str();
        let mut attempts = 0;
        let mut last_error = String::new();

        for backend in self.chain(first) {
            let info = backend.info();
            let timeout = request.timeout.unwrap_or(info.timeout);
            attempts += 1;
            debug!(task_id, backend = %info.name, attempt = attempts, "Dispatching to backend");

            let started = Instant::now();
            let outcome = match tokio::time::timeout(timeout, backend.execute(request)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(BackendError::Timeout {
                    backend: info.name.clone(),
                    timeout,
                }),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(result) if result.is_success() => {
                    self.record_success(&info.name, result.cost_estimate).await;
                    info!(
                        task_id,
                        backend = %info.name,
                        elapsed_ms,
                        cost = %result.cost_estimate,
                        "Backend succeeded"
                    );
                    return Ok(result);
                }
                Ok(result) => {
                    last_error = format!("{} reported failure: {}", info.name, result.summary);
                    self.record_failure(&info.name, &last_error).await;
                    warn!(task_id, backend = %info.name, elapsed_ms, "Backend reported failure, falling back");
                }
                Err(e) if e.is_terminal() => {
                    self.record_failure(&info.name, &e.to_string()).await;
                    warn!(task_id, backend = %info.name, error = %e, "Terminal backend error");
                    return Err(RouterError::Terminal(e));
                }
                Err(e) => {
                    last_error = e.to_string();
                    self.record_failure(&info.name, &last_error).await;
                    warn!(task_id, backend = %info.name, elapsed_ms, error = %e, "Backend failed, falling back");
                }
            }
        }

        Err(RouterError::AllBackendsExhausted {
            attempts,
            last_error,
        })
    }

    async fn record_success(&self, name: &str, cost: Decimal) {
        let mut ledger = self.ledger.write().await;
        ledger.total_cost += cost;
        let stats = ledger.stats.entry(name.to_string()).or_default();
        stats.calls += 1;
        stats.cost += cost;
    }

    async fn record_failure(&self, name: &str, error: &str) {
        let mut ledger = self.ledger.write().await;
        let stats = ledger.stats.entry(name.to_string()).or_default();
        stats.calls += 1;
        stats.failures += 1;
        stats.last_error = Some(error.to_string());
    }

    pub async fn total_cost(&self) -> Decimal {
        self.ledger.read().await.total_cost
    }

    /// Zero the running cost total. Per-backend counters are kept.
    pub async fn reset_cost(&self) -> Decimal {
        let mut ledger = self.ledger.write().await;
        let previous = std::mem::take(&mut ledger.total_cost);
        info!(previous = %previous, "Router cost total reset");
        previous
    }

    pub async fn status(&self) -> RouterStatus {
        let ledger = self.ledger.read().await;
        RouterStatus {
            total_cost: ledger.total_cost,
            backends: self
                .backends
                .iter()
                .map(|b| BackendStatus {
                    info: b.info().clone(),
                    stats: ledger.stats.get(&b.info().name).cloned().unwrap_or_default(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{CostTier, Findings, ResultStatus};
    use crate::error::SessionError;
    use crate::tasks::{NewTask, Task};
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    enum Behavior {
        Succeed(Decimal),
        Fail,
        Hang,
        Terminal,
    }

    struct Mock {
        info: BackendInfo,
        behavior: Behavior,
        calls: AtomicU32,
    }

    impl Mock {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                info: BackendInfo::new(name),
                behavior,
                calls: AtomicU32::new(0),
            })
        }

        fn with(name: &str, tier: CostTier, reliability: u32) -> Arc<Self> {
            Arc::new(Self {
                info: BackendInfo::new(name)
                    .with_tier(tier)
                    .with_reliability(reliability),
                behavior: Behavior::Succeed(Decimal::ZERO),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend for Mock {
        fn info(&self) -> &BackendInfo {
            &self.info
        }

        async fn execute(&self, _: &ExecutionRequest) -> Result<BackendResult, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed(cost) => Ok(BackendResult {
                    backend: self.info.name.clone(),
                    status: ResultStatus::Success,
                    summary: "ok".into(),
                    findings: Findings::Research {
                        answer: "ok".into(),
                        model: "mock".into(),
                    },
                    cost_estimate: cost,
                    duration_seconds: 0.0,
                    confidence: 1.0,
                    artifact_ref: None,
                }),
                Behavior::Fail => Err(BackendError::execution(&self.info.name, "boom")),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    unreachable!()
                }
                Behavior::Terminal => Err(BackendError::Session {
                    backend: self.info.name.clone(),
                    source: SessionError::BudgetExceeded { turns: 20 },
                }),
            }
        }
    }

    fn task(priority: i64) -> Task {
        NewTask::new("T1", "task")
            .with_priority(priority)
            .into_task(Utc::now())
    }

    fn router(backends: Vec<Arc<Mock>>) -> BackendRouter {
        BackendRouter::new(
            backends
                .into_iter()
                .map(|b| b as Arc<dyn Backend>)
                .collect(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn falls_back_in_declared_order() {
        let a = Mock::new("a", Behavior::Fail);
        let b = Mock::new("b", Behavior::Fail);
        let c = Mock::new("c", Behavior::Succeed(dec!(0.3)));
        let r = router(vec![a.clone(), b.clone(), c.clone()]);

        let result = r.execute(&ExecutionRequest::new(task(5))).await.unwrap();
        assert_eq!(result.backend, "c");
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 1));
        assert_eq!(r.total_cost().await, dec!(0.3));
    }

    #[tokio::test]
    async fn exhaustion_reports_last_error() {
        let a = Mock::new("a", Behavior::Fail);
        let b = Mock::new("b", Behavior::Fail);
        let r = router(vec![a.clone(), b.clone()]);

        let err = r.execute(&ExecutionRequest::new(task(5))).await.unwrap_err();
        match err {
            RouterError::AllBackendsExhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("Backend b failed"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(r.total_cost().await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn terminal_errors_stop_the_chain() {
        let a = Mock::new("a", Behavior::Terminal);
        let b = Mock::new("b", Behavior::Succeed(dec!(1)));
        let r = router(vec![a, b.clone()]);

        let err = r.execute(&ExecutionRequest::new(task(5))).await.unwrap_err();
        assert!(matches!(err, RouterError::Terminal(_)));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn hung_backend_is_abandoned() {
        let a = Mock::new("a", Behavior::Hang);
        let b = Mock::new("b", Behavior::Succeed(dec!(0.1)));
        let r = router(vec![a, b]);

        let request =
            ExecutionRequest::new(task(5)).with_timeout(Duration::from_millis(50));
        let result = r.execute(&request).await.unwrap();
        assert_eq!(result.backend, "b");
        let status = r.status().await;
        assert_eq!(status.backends[0].stats.failures, 1);
    }

    #[tokio::test]
    async fn explicit_backend_goes_first_then_rest_in_order() {
        let a = Mock::new("a", Behavior::Fail);
        let b = Mock::new("b", Behavior::Fail);
        let c = Mock::new("c", Behavior::Succeed(dec!(0)));
        let r = router(vec![a.clone(), b.clone(), c.clone()]);

        let request = ExecutionRequest::new(task(5)).with_backend("c");
        r.execute(&request).await.unwrap();
        assert_eq!((a.calls(), b.calls(), c.calls()), (0, 0, 1));
    }

    #[test]
    fn selection_precedence() {
        let r = router(vec![
            Mock::with("paid-low", CostTier::Paid, 1),
            Mock::with("free", CostTier::Free, 1),
            Mock::with("reliable", CostTier::Paid, 5),
        ]);

        let normal = ExecutionRequest::new(task(3));
        assert_eq!(r.select(&normal).unwrap(), 0);
        assert_eq!(r.select(&normal.clone().with_prefer_free(true)).unwrap(), 1);

        let urgent = ExecutionRequest::new(task(1)).with_prefer_free(true);
        assert_eq!(r.select(&urgent).unwrap(), 2);

        let long = ExecutionRequest::new(task(4)).with_timeout(Duration::from_secs(31 * 60));
        assert_eq!(r.select(&long).unwrap(), 2);

        let explicit = ExecutionRequest::new(task(0)).with_backend("free");
        assert_eq!(r.select(&explicit).unwrap(), 1);

        assert!(matches!(
            r.select(&ExecutionRequest::new(task(3)).with_backend("nope")),
            Err(RouterError::UnknownBackend(_))
        ));
    }

    #[test]
    fn unknown_task_hint_is_ignored() {
        let r = router(vec![
            Mock::with("a", CostTier::Paid, 1),
            Mock::with("b", CostTier::Paid, 1),
        ]);
        let mut t = task(3);
        t.backend_hint = Some("b".into());
        assert_eq!(r.select(&ExecutionRequest::new(t.clone())).unwrap(), 1);
        t.backend_hint = Some("gone".into());
        assert_eq!(r.select(&ExecutionRequest::new(t)).unwrap(), 0);
    }

    #[tokio::test]
    async fn cost_accumulates_until_reset() {
        let a = Mock::new("a", Behavior::Succeed(dec!(0.5)));
        let r = router(vec![a]);
        r.execute(&ExecutionRequest::new(task(5))).await.unwrap();
        r.execute(&ExecutionRequest::new(task(5))).await.unwrap();
        assert_eq!(r.total_cost().await, dec!(1.0));

        assert_eq!(r.reset_cost().await, dec!(1.0));
        assert_eq!(r.total_cost().await, Decimal::ZERO);
        let status = r.status().await;
        assert_eq!(status.backends[0].stats.calls, 2);
        assert_eq!(status.backends[0].stats.cost, dec!(1.0));
    }

    #[test]
    fn empty_router_is_rejected() {
        assert!(matches!(
            BackendRouter::new(Vec::new()),
            Err(RouterError::NoBackends)
        ));
    }
}
