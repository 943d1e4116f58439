//! Gateway integration tests: each test serves the real router on an
//! ephemeral port and talks to it over HTTP.

mod common;

use std::sync::Arc;

use reqwest::{Client, StatusCode};
use rust_decimal_macros::dec;
use serde_json::{Value, json};

use ai_taskd::backends::BackendRouter;
use ai_taskd::gateway::AppState;
use ai_taskd::store::{LibSqlBackend, TaskStore};

use common::{MockBackend, MockBehavior, UnreachableStore, backends, spawn_gateway, wait_for_execution};

async fn memory_gateway(mocks: Vec<Arc<MockBackend>>) -> (common::TestGateway, Arc<LibSqlBackend>) {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let router = Arc::new(BackendRouter::new(backends(mocks)).unwrap());
    let gw = spawn_gateway(AppState::new(store.clone(), router)).await;
    (gw, store)
}

fn default_mocks() -> Vec<Arc<MockBackend>> {
    vec![MockBackend::new("mock", MockBehavior::Succeed, dec!(0.25))]
}

#[tokio::test]
async fn task_crud_roundtrip() {
    let (gw, _store) = memory_gateway(default_mocks()).await;
    let client = Client::new();
    let base = &gw.base_url;

    let resp = client
        .post(format!("{base}/tasks"))
        .json(&json!({
            "id": "T1",
            "title": "Add login tests",
            "description": "Cover the happy path",
            "acceptance_criteria": ["tests pass", "no warnings"],
            "priority": 1,
            "backend_hint": "mock"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["status"], "todo");
    assert_eq!(created["retry_count"], 0);
    assert_eq!(created["max_retries"], 3);
    assert!(created["age_seconds"].as_f64().unwrap() >= 0.0);

    let fetched: Value = client
        .get(format!("{base}/tasks/T1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["acceptance_criteria"], json!(["tests pass", "no warnings"]));

    let resp = client
        .patch(format!("{base}/tasks/T1"))
        .json(&json!({ "priority": 4, "title": "Add more login tests" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let patched: Value = resp.json().await.unwrap();
    assert_eq!(patched["priority"], 4);
    assert_eq!(patched["title"], "Add more login tests");

    let listed: Vec<Value> = client
        .get(format!("{base}/tasks?status=todo"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);

    let resp = client.delete(format!("{base}/tasks/T1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = client.delete(format!("{base}/tasks/T1")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "not_found");

    gw.shutdown.cancel();
}

#[tokio::test]
async fn submission_errors_map_to_status_codes() {
    let (gw, _store) = memory_gateway(default_mocks()).await;
    let client = Client::new();
    let base = &gw.base_url;

    let resp = client
        .post(format!("{base}/tasks"))
        .json(&json!({ "title": "no id" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "bad_request");

    let task = json!({ "id": "T1", "title": "once" });
    let first = client.post(format!("{base}/tasks")).json(&task).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let second = client.post(format!("{base}/tasks")).json(&task).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
    let body: Value = second.json().await.unwrap();
    assert_eq!(body["kind"], "conflict");

    let resp = client.get(format!("{base}/tasks/missing")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .patch(format!("{base}/tasks/missing"))
        .json(&json!({ "priority": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = client
        .post(format!("{base}/execute"))
        .json(&json!({ "backend": "nonexistent" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = client.get(format!("{base}/executions/nope")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    gw.shutdown.cancel();
}

#[tokio::test]
async fn execution_drives_tasks_and_accounts_cost() {
    let mock = MockBackend::new("mock", MockBehavior::Succeed, dec!(0.25));
    let (gw, store) = memory_gateway(vec![mock.clone()]).await;
    let client = Client::new();
    let base = &gw.base_url;

    for (id, priority) in [("A-1", 3), ("A-2", 1), ("B-1", 0)] {
        client
            .post(format!("{base}/tasks"))
            .json(&json!({ "id": id, "title": id, "priority": priority }))
            .send()
            .await
            .unwrap();
    }

    let resp = client
        .post(format!("{base}/execute"))
        .json(&json!({ "max_tasks": 5, "id_prefix": "A-" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let started: Value = resp.json().await.unwrap();
    assert_eq!(started["status"], "started");
    let execution_id = started["execution_id"].as_str().unwrap().to_string();

    let finished = wait_for_execution(&client, base, &execution_id).await;
    assert_eq!(finished["status"], "completed");
    assert_eq!(finished["tasks_completed"], 2);
    assert_eq!(finished["tasks_failed"], 0);
    assert!(finished["completed_at"].is_string());

    // Priority order within the prefix, B-1 untouched.
    assert_eq!(mock.seen(), vec!["A-2", "A-1"]);
    assert_eq!(
        store.get("B-1").await.unwrap().unwrap().status,
        ai_taskd::tasks::TaskStatus::Todo
    );

    let a1: Value = client
        .get(format!("{base}/tasks/A-1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(a1["status"], "done");
    assert!(a1["result_ref"].is_string());
    assert!(a1["error_message"].is_null());

    let result: Value = client
        .get(format!("{base}/tasks/A-1/result"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["result"]["status"], "success");
    assert_eq!(result["result"]["cost_estimate"], 0.25);

    let status: Value = client
        .get(format!("{base}/router/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["total_cost"], 0.5);
    assert_eq!(status["backends"][0]["name"], "mock");
    assert_eq!(status["backends"][0]["calls"], 2);

    let reset: Value = client
        .post(format!("{base}/router/reset-cost"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reset["previous_total"], 0.5);
    assert_eq!(gw.state.router.total_cost().await, dec!(0));

    let executions: Vec<Value> = client
        .get(format!("{base}/executions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);

    gw.shutdown.cancel();
}

#[tokio::test]
async fn execution_with_empty_queue_completes_immediately() {
    let (gw, _store) = memory_gateway(default_mocks()).await;
    let client = Client::new();
    let base = &gw.base_url;

    let started: Value = client
        .post(format!("{base}/execute"))
        .json(&json!({}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let finished =
        wait_for_execution(&client, base, started["execution_id"].as_str().unwrap()).await;
    assert_eq!(finished["status"], "completed");
    assert_eq!(finished["tasks_completed"], 0);

    gw.shutdown.cancel();
}

#[tokio::test]
async fn failing_backend_marks_task_failed_not_execution() {
    let mock = MockBackend::new("broken", MockBehavior::Fail, dec!(1));
    let (gw, store) = memory_gateway(vec![mock]).await;
    let client = Client::new();
    let base = &gw.base_url;

    client
        .post(format!("{base}/tasks"))
        .json(&json!({ "id": "T1", "title": "doomed" }))
        .send()
        .await
        .unwrap();
    let started: Value = client
        .post(format!("{base}/execute"))
        .json(&json!({ "task_id": "T1", "max_tasks": 1 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let finished =
        wait_for_execution(&client, base, started["execution_id"].as_str().unwrap()).await;
    assert_eq!(finished["status"], "completed");
    assert_eq!(finished["tasks_failed"], 1);

    let task = store.get("T1").await.unwrap().unwrap();
    assert_eq!(task.retry_count, 1);
    assert!(task.error_message.unwrap().contains("mock failure"));
    assert_eq!(gw.state.router.total_cost().await, dec!(0));

    gw.shutdown.cancel();
}

#[tokio::test]
async fn health_reports_store_state() {
    let (gw, _store) = memory_gateway(default_mocks()).await;
    let client = Client::new();
    let resp = client.get(format!("{}/health", gw.base_url)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "connected");
    assert!(body["uptime_seconds"].is_number());
    gw.shutdown.cancel();

    let router = Arc::new(BackendRouter::new(backends(default_mocks())).unwrap());
    let down = spawn_gateway(AppState::new(Arc::new(UnreachableStore), router)).await;
    let resp = client.get(format!("{}/health", down.base_url)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["store"], "unavailable");

    let resp = client.get(format!("{}/tasks", down.base_url)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "store_unavailable");
    down.shutdown.cancel();
}

#[tokio::test]
async fn execute_during_shutdown_is_rejected() {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let router = Arc::new(BackendRouter::new(backends(default_mocks())).unwrap());
    let state = AppState::new(store, router);
    state.shutdown.cancel();

    // Serve without the graceful-shutdown hook so requests still reach the
    // handler after the token fired.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, ai_taskd::gateway::app(state)).await.unwrap();
    });

    let resp = Client::new()
        .post(format!("http://{addr}/execute"))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "shutting_down");
    server.abort();
}
