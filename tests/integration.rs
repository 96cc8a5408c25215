use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::{fs, path::PathBuf};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use stepwise::auth::UserConfig;
use stepwise::{
    parse_test_case, DefaultTestRunner, Phase, RunnerConfig, StepStatus, TestCase,
    TestRunner,
};
use tokio::task::JoinHandle;

#[derive(Clone, Default)]
struct AppState {
    flaky_calls: Arc<AtomicUsize>,
}

struct TestServer {
    base_url: String,
    state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let state = AppState::default();
        let app = Router::new()
            .route("/health", get(|| async move { Json(json!({"status": "UP"})) }))
            .route("/users", post(create_user))
            .route("/users/:id", get(get_user).delete(delete_user))
            .route("/flaky", get(flaky))
            .route("/secure", get(secure))
            .route("/echo", post(|Json(body): Json<Value>| async move { Json(body) }))
            .with_state(state.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn flaky_calls(&self) -> usize {
        self.state.flaky_calls.load(Ordering::SeqCst)
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// ── handlers ────────────────────────────────────────

async fn get_user(Path(id): Path<u64>) -> Response {
    match id {
        1 => (
            [("x-request-id", "req-1")],
            Json(json!({
                "id": 1,
                "name": "Alice",
                "email": "alice@example.com",
                "tags": ["admin", "ops"]
            })),
        )
            .into_response(),
        42 => Json(json!({"id": 42, "name": "Bob"})).into_response(),
        _ => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))).into_response(),
    }
}

async fn create_user(Json(mut body): Json<Value>) -> (StatusCode, Json<Value>) {
    body["id"] = json!(42);
    (StatusCode::CREATED, Json(body))
}

async fn delete_user(Path(_id): Path<u64>) -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Unavailable for the first two calls.
async fn flaky(State(state): State<AppState>) -> Response {
    let calls = state.flaky_calls.fetch_add(1, Ordering::SeqCst);
    if calls < 2 {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"ready": false})),
        )
            .into_response()
    } else {
        Json(json!({"ready": true})).into_response()
    }
}

async fn secure(headers: HeaderMap) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer t0k");
    if authorized {
        Json(json!({"secret": "s42"})).into_response()
    } else {
        StatusCode::UNAUTHORIZED.into_response()
    }
}

// ── helpers ─────────────────────────────────────────

fn load_case(path: &str, base_url: &str) -> TestCase {
    let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    let case_path = fixtures.join(path);
    let content = fs::read_to_string(&case_path)
        .unwrap_or_else(|e| panic!("failed to read {case_path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);

    parse_test_case(&content, Some(&fixtures))
        .unwrap_or_else(|e| panic!("failed to parse test case yaml: {e:#}"))
}

fn runner_for(server: &TestServer) -> DefaultTestRunner {
    DefaultTestRunner::from_config(RunnerConfig::default().with_base_url(&server.base_url))
        .expect("failed to build runner")
}

fn labels(steps: &[stepwise::ExecutedStep]) -> Vec<String> {
    steps.iter().map(|s| s.label()).collect()
}

// ── end to end ──────────────────────────────────────

#[tokio::test]
async fn single_step_extracts_and_asserts() {
    let server = TestServer::spawn().await;
    let case = load_case("get_user.yaml", &server.base_url);
    let runner = DefaultTestRunner::new().unwrap();

    let result = runner.run(&case).await;

    assert!(result.passed, "case should pass: {:?}", result.failure_messages);
    assert_eq!(result.status_code(), Some(200));
    assert_eq!(result.variables["userName"], json!("Alice"));
    assert_eq!(result.variables["nickname"], json!("N/A"));
    let tracked = &result.variable_tracking["userName"];
    assert_eq!(tracked.source_step, "read user");
    assert_eq!(tracked.path, "$.name");

    server.shutdown().await;
}

#[tokio::test]
async fn values_flow_between_phases() {
    let server = TestServer::spawn().await;
    let case = load_case("user_chain.yaml", &server.base_url);
    let runner = runner_for(&server);

    let result = runner.run(&case).await;

    assert!(result.passed, "case should pass: {:?}", result.failure_messages);
    assert_eq!(result.variables["userId"], json!(42));
    assert_eq!(result.variables["createdName"], json!("Bob"));
    assert_eq!(
        labels(&result.executed_steps),
        vec![
            "create user",
            "read created user",
            "only for large ids (conditionally skipped)",
            "delete user",
        ]
    );
    assert_eq!(result.executed_steps[2].status, StepStatus::Skipped);
    assert_eq!(result.executed_steps[2].attempts, 0);
    assert_eq!(result.executed_steps[3].phase, Phase::Cleanup);
    assert!(result.cleanup_warnings.is_empty());
    // cleanup is the last response seen
    assert_eq!(result.status_code(), Some(204));

    server.shutdown().await;
}

#[tokio::test]
async fn cleanup_failure_does_not_fail_the_case() {
    let server = TestServer::spawn().await;
    let case = load_case("cleanup_failure.yaml", &server.base_url);
    let runner = runner_for(&server);

    let result = runner.run(&case).await;

    assert!(result.passed);
    assert!(result.failure_messages.is_empty());
    assert_eq!(
        result.cleanup_warnings,
        vec!["Step 'delete user': Status code assertion failed: expected 200 but got 204"]
    );
    assert_eq!(result.executed_steps[1].label(), "delete user (failed)");

    server.shutdown().await;
}

#[tokio::test]
async fn failed_execution_step_still_runs_cleanup() {
    let server = TestServer::spawn().await;
    let case = load_case("execution_failure.yaml", &server.base_url);
    let runner = runner_for(&server);

    let result = runner.run(&case).await;

    assert!(!result.passed);
    assert_eq!(
        result.failure_messages,
        vec!["Step 'read user': Status code assertion failed: expected 404 but got 200"]
    );
    let phases: Vec<Phase> = result.executed_steps.iter().map(|s| s.phase).collect();
    assert_eq!(phases, vec![Phase::Execution, Phase::Execution, Phase::Cleanup]);
    assert_eq!(result.executed_steps[0].status, StepStatus::Failed);
    // later execution steps are not skipped
    assert_eq!(result.executed_steps[1].status, StepStatus::Passed);
    assert_eq!(result.executed_steps[2].status, StepStatus::Passed);
    assert!(result.cleanup_warnings.is_empty());
    assert_eq!(result.status_code(), Some(204));

    server.shutdown().await;
}

#[tokio::test]
async fn failed_precondition_skips_to_cleanup() {
    let server = TestServer::spawn().await;
    let case = load_case("precondition_abort.yaml", &server.base_url);
    let runner = runner_for(&server);

    let result = runner.run(&case).await;

    assert!(!result.passed);
    assert_eq!(result.failure_messages.len(), 1);
    assert!(result.failure_messages[0].starts_with("Step 'service is down': "));
    assert!(result.failure_messages[0].contains("expected 'DOWN' but got 'UP'"));
    let phases: Vec<Phase> = result.executed_steps.iter().map(|s| s.phase).collect();
    assert_eq!(phases, vec![Phase::Preconditions, Phase::Cleanup]);
    assert_eq!(result.executed_steps[1].status, StepStatus::Passed);

    server.shutdown().await;
}

// ── retries ─────────────────────────────────────────

#[tokio::test]
async fn flaky_endpoint_passes_after_retries() {
    let server = TestServer::spawn().await;
    let case = load_case("flaky_retry.yaml", &server.base_url);
    let runner = DefaultTestRunner::new().unwrap();

    let result = runner.run(&case).await;

    assert!(result.passed, "case should pass: {:?}", result.failure_messages);
    assert_eq!(server.flaky_calls(), 3);
    assert_eq!(result.executed_steps[0].attempts, 3);
    assert_eq!(
        result.executed_steps[0].label(),
        "poll readiness (after 2 retries)"
    );

    server.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_report_last_failure() {
    let server = TestServer::spawn().await;
    let case = load_case("flaky_exhausted.yaml", &server.base_url);
    let runner = DefaultTestRunner::new().unwrap();

    let result = runner.run(&case).await;

    assert!(!result.passed);
    assert_eq!(server.flaky_calls(), 2);
    assert_eq!(
        result.failure_messages,
        vec![
            "Step 'poll readiness': Status code assertion failed: expected 200 but got 503 after 1 retry"
        ]
    );
    assert_eq!(result.status_code(), Some(503));

    server.shutdown().await;
}

// ── request building ────────────────────────────────

#[tokio::test]
async fn payload_file_is_interpolated_and_templated() {
    let server = TestServer::spawn().await;
    let case = load_case("payload_file.yaml", &server.base_url);
    let runner = runner_for(&server);

    let result = runner.run(&case).await;

    assert!(result.passed, "case should pass: {:?}", result.failure_messages);
    let echoed = result.last_response.as_ref().unwrap().json().unwrap();
    assert_eq!(
        echoed,
        json!({
            "owner": "Alice",
            "team": "platform",
            "level": 3,
            "labels": ["first", "last"]
        })
    );

    server.shutdown().await;
}

#[tokio::test]
async fn configured_user_credentials_are_sent() {
    let server = TestServer::spawn().await;
    let case = load_case("secured.yaml", &server.base_url);
    let users = HashMap::from([(
        "service".to_string(),
        UserConfig {
            auth_type: Some("bearer".to_string()),
            token: Some("t0k".to_string()),
            ..UserConfig::default()
        },
    )]);

    let anonymous = runner_for(&server).run(&case).await;
    assert!(!anonymous.passed);
    assert_eq!(anonymous.status_code(), Some(401));

    let result = runner_for(&server).with_users(users).run(&case).await;
    assert!(result.passed, "case should pass: {:?}", result.failure_messages);

    server.shutdown().await;
}

#[tokio::test]
async fn unreachable_host_is_reported_as_exception() {
    let yaml = "name: offline\nexecution:\n  - name: ping\n    request:\n      url: http://127.0.0.1:9/ping\n      connectionTimeout: 500\n";
    let case = parse_test_case(yaml, None).unwrap();
    let runner = DefaultTestRunner::new().unwrap();

    let result = runner.run(&case).await;

    assert!(!result.passed);
    assert!(result.failure_messages[0].starts_with("Step 'ping': Exception - "));
    assert!(result.last_response.is_none());
}

// ── suites ──────────────────────────────────────────

#[tokio::test]
async fn parallel_suite_keeps_input_order() {
    let server = TestServer::spawn().await;
    let cases = vec![
        load_case("user_chain.yaml", &server.base_url),
        load_case("get_user.yaml", &server.base_url),
        load_case("precondition_abort.yaml", &server.base_url),
        load_case("cleanup_failure.yaml", &server.base_url),
    ];
    let runner = runner_for(&server);

    let results = runner.run_suite_parallel(cases, 3).await;

    let outcome: Vec<(&str, bool)> = results
        .iter()
        .map(|r| (r.name.as_str(), r.passed))
        .collect();
    assert_eq!(
        outcome,
        vec![
            ("user lifecycle", true),
            ("get user", true),
            ("failing precondition", false),
            ("cleanup failure is only a warning", true),
        ]
    );
    // contexts are never shared between cases
    assert!(!results[1].variables.contains_key("userId"));

    server.shutdown().await;
}
