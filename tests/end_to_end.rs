//! Full path: enqueue → claim → route with fallback → tool session → commit →
//! persisted outcome, plus delegation to a second gateway over HTTP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use ai_taskd::backends::{
    Backend, BackendInfo, BackendRouter, DelegatedBackend, ToolSessionBackend,
};
use ai_taskd::gateway::AppState;
use ai_taskd::session::{SessionConfig, ToolSession};
use ai_taskd::store::{LibSqlBackend, TaskStore};
use ai_taskd::tasks::{ClaimFilter, NewTask, TaskStatus};
use ai_taskd::worker::{TaskExecutor, TaskOutcome, Worker, WorkerConfig};

use common::{
    MockBackend, MockBehavior, RecordingCommitter, ScriptedLlm, TEST_TIMEOUT, backends,
    spawn_gateway, tool_call,
};

#[tokio::test]
async fn urgent_task_falls_back_to_tool_session_and_commits() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store
        .enqueue(
            NewTask::new("T1", "Write release notes")
                .with_description("Summarize the 0.2 changes")
                .with_priority(1)
                .with_criterion("NOTES.md exists")
                .with_criterion("mentions the router"),
        )
        .await
        .unwrap();

    let llm = ScriptedLlm::new(
        vec![
            vec![tool_call(
                "call_1",
                "write_file",
                json!({ "path": "NOTES.md", "content": "# 0.2\n\n- router fallback\n" }),
            )],
            vec![tool_call(
                "call_2",
                "complete_task",
                json!({ "summary": "Wrote NOTES.md", "commit_message": "Add release notes" }),
            )],
        ],
        (dec!(0.001), dec!(0.002)),
    );
    let committer = RecordingCommitter::new("c0ffee");
    let session = ToolSession::new(llm, committer.clone(), SessionConfig::new(dir.path()));

    // Equal reliability: the failing backend is selected first and the
    // session backend runs as its fallback.
    let flaky = MockBackend::new("flaky", MockBehavior::Fail, dec!(5));
    let chain: Vec<Arc<dyn Backend>> = vec![
        flaky.clone(),
        Arc::new(ToolSessionBackend::new(BackendInfo::new("session"), session)),
    ];
    let router = Arc::new(BackendRouter::new(chain).unwrap());

    let config = WorkerConfig {
        worker_id: "e2e".to_string(),
        concurrency: 1,
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_secs(60),
        ..WorkerConfig::default()
    };
    let worker = Worker::new(config, TaskExecutor::new(store.clone(), router.clone()));
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    let task = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            let task = store.get("T1").await.unwrap().unwrap();
            if task.status == TaskStatus::Done {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never completed");
    shutdown.cancel();
    let summary = handle.await.unwrap().unwrap();

    assert_eq!(summary.tasks_completed, 1);
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.result_ref.as_deref(), Some("c0ffee"));
    assert!(task.error_message.is_none());
    assert!(task.completed_at.is_some());

    assert_eq!(flaky.calls(), 1);
    assert_eq!(committer.messages(), vec!["Add release notes"]);
    let notes = std::fs::read_to_string(dir.path().join("NOTES.md")).unwrap();
    assert!(notes.contains("router fallback"));

    // Two turns of 100 in / 50 out; the failed attempt adds nothing.
    assert_eq!(router.total_cost().await, dec!(0.4));

    let stored = store.get_result("T1").await.unwrap().unwrap();
    assert_eq!(stored.result.backend, "session");
    assert_eq!(stored.result.artifact_ref.as_deref(), Some("c0ffee"));
}

#[tokio::test]
async fn delegated_backend_runs_task_on_remote_gateway() {
    let remote_store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let remote_mock = MockBackend::new("remote-mock", MockBehavior::Succeed, dec!(0.25));
    let remote_router = Arc::new(BackendRouter::new(backends(vec![remote_mock.clone()])).unwrap());
    let remote = spawn_gateway(AppState::new(remote_store.clone(), remote_router)).await;

    let local_store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    local_store
        .enqueue(
            NewTask::new("D1", "Investigate flaky test")
                .with_criterion("root cause identified")
                .with_backend_hint("remote-mock"),
        )
        .await
        .unwrap();
    let delegated = DelegatedBackend::new(BackendInfo::new("remote"), &remote.base_url)
        .with_poll_interval(Duration::from_millis(20));
    let router = Arc::new(BackendRouter::new(vec![Arc::new(delegated) as Arc<dyn Backend>]).unwrap());
    let executor = TaskExecutor::new(local_store.clone(), router.clone());

    let claimed = local_store
        .claim_next("local", &ClaimFilter::any())
        .await
        .unwrap()
        .unwrap();
    let outcome = tokio::time::timeout(TEST_TIMEOUT, executor.execute(claimed))
        .await
        .unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed { result_ref: Some(_) }));

    let remote_task = remote_store.get("D1").await.unwrap().unwrap();
    assert_eq!(remote_task.status, TaskStatus::Done);
    assert_eq!(remote_task.acceptance_criteria, vec!["root cause identified"]);
    assert_eq!(remote_task.backend_hint.as_deref(), Some("remote-mock"));
    assert_eq!(remote_mock.calls(), 1);

    let local_task = local_store.get("D1").await.unwrap().unwrap();
    assert_eq!(local_task.status, TaskStatus::Done);

    let stored = local_store.get_result("D1").await.unwrap().unwrap();
    assert_eq!(stored.result.backend, "remote");
    assert_eq!(stored.result.cost_estimate, dec!(0.25));
    assert_eq!(router.total_cost().await, dec!(0.25));

    remote.shutdown.cancel();
}
