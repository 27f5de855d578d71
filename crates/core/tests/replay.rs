//! Replay runs against a live demo API

mod common;

use std::collections::BTreeMap;
use std::net::SocketAddr;

use atf_core::browser::{MockElement, MockPage};
use atf_core::{
    replay, verify_run, FailureKind, MockBrowser, RunMode, RunSession, SessionOptions, Status, Trace,
};
use common::{config_in, credentials, demo_api, read_jsonl, PASSWORD, TOKEN};
use serde_json::{json, Value};
use tempfile::TempDir;

fn cart_trace(addr: SocketAddr, env: BTreeMap<String, String>) -> Trace {
    let doc = json!({
        "version": 1,
        "type": "api",
        "testName": "cart_smoke",
        "app": "shop",
        "baseUrl": "http://localhost:3010",
        "apiBaseUrl": format!("http://{addr}"),
        "inputs": { "env": env },
        "steps": [
            {
                "id": "s1",
                "action": "post",
                "selectorOrEndpoint": "/api/login",
                "input": {
                    "username": "${ENV:DEMO_USERNAME}",
                    "password": "${ENV:DEMO_PASSWORD}"
                },
                "guards": { "expectStatusCode": 200 },
                "expected": { "saveState": { "token": "token" } }
            },
            {
                "id": "s2",
                "action": "get",
                "selectorOrEndpoint": "/api/cart",
                "input": { "headers": { "Authorization": "Bearer ${STATE:token}" } },
                "guards": { "expectStatusCode": 200 },
                "expected": { "items": [{ "id": "laptop" }] }
            }
        ]
    });
    serde_json::from_value(doc).unwrap()
}

#[tokio::test]
async fn replay_passes_and_threads_state_between_steps() {
    let (addr, hits) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let outcome = replay(&cart_trace(addr, credentials(PASSWORD)), &config, SessionOptions::default())
        .await
        .unwrap();

    assert!(outcome.verdict.passed(), "{:?}", outcome.verdict);
    assert_eq!(outcome.steps.len(), 2);
    assert!(outcome.steps.iter().all(|s| s.attempts == 1));
    assert_eq!(hits.cart(), 1);
    assert!(outcome.run_id.starts_with("replay_"));

    let run_dir = &outcome.run_dir;
    assert_eq!(read_jsonl(&run_dir.join("steps.jsonl")).len(), 2);
    let verdict: Value = serde_json::from_slice(&std::fs::read(run_dir.join("verdict.json")).unwrap()).unwrap();
    assert_eq!(verdict["status"], "pass");

    // The bearer token reached the server but the stored header is masked
    let s2 = &outcome.steps[1];
    assert_eq!(s2.artifacts.len(), 1);
    let exchange = std::fs::read_to_string(run_dir.join(&s2.artifacts["api"])).unwrap();
    assert!(exchange.contains("laptop"));
    assert!(!exchange.contains(TOKEN));
    let login = std::fs::read_to_string(run_dir.join(&outcome.steps[0].artifacts["api"])).unwrap();
    assert!(!login.contains(PASSWORD));
    assert!(login.contains("[REDACTED]"));

    assert!(verify_run(run_dir).await.unwrap().is_intact());
}

#[tokio::test]
async fn replay_stops_at_first_failed_step() {
    let (addr, hits) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let outcome = replay(&cart_trace(addr, credentials("wrong-password")), &config, SessionOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.verdict.status, Status::Fail);
    assert_eq!(outcome.verdict.failed_step_id.as_deref(), Some("s1"));
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(outcome.steps[0].failure_kind, Some(FailureKind::GuardViolation));
    assert!(outcome.verdict.reasons[0].contains("401"));
    assert_eq!(hits.cart(), 0);

    let steps = read_jsonl(&outcome.run_dir.join("steps.jsonl"));
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0]["stepId"], "s1");
    assert_eq!(steps[0]["failureKind"], "guard-violation");
}

#[tokio::test]
async fn missing_binding_fails_without_attempting() {
    let (addr, hits) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let mut trace = cart_trace(addr, credentials(PASSWORD));
    trace.steps.remove(0);

    let outcome = replay(&trace, &config, SessionOptions::default()).await.unwrap();
    assert_eq!(outcome.verdict.failed_step_id.as_deref(), Some("s2"));
    assert_eq!(outcome.steps[0].attempts, 0);
    assert_eq!(outcome.steps[0].failure_kind, Some(FailureKind::MissingBinding));
    assert_eq!(hits.cart(), 0);
}

#[tokio::test]
async fn invalid_trace_is_an_error() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let (addr, _) = demo_api().await;

    let mut trace = cart_trace(addr, credentials(PASSWORD));
    trace.version = 2;
    assert!(replay(&trace, &config, SessionOptions::default()).await.is_err());
    assert!(!config.runs_dir.exists());
}

#[tokio::test]
async fn contract_violation_fails_the_step() {
    let (addr, _) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let contract_dir = config.contracts_dir.join("shop");
    std::fs::create_dir_all(&contract_dir).unwrap();
    std::fs::write(
        contract_dir.join("openapi.json"),
        serde_json::to_vec(&json!({
            "openapi": "3.0.0",
            "paths": { "/api/login": { "post": { "responses": { "200": { "content": {
                "application/json": { "schema": {
                    "type": "object",
                    "required": ["token", "expiresAt"]
                }}
            }}}}}}
        }))
        .unwrap(),
    )
    .unwrap();

    let outcome = replay(&cart_trace(addr, credentials(PASSWORD)), &config, SessionOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.verdict.failed_step_id.as_deref(), Some("s1"));
    assert_eq!(outcome.steps[0].failure_kind, Some(FailureKind::ResponseSchemaViolation));
    assert!(outcome.verdict.reasons[0].contains("expiresAt"));
}

fn login_page_browser() -> MockBrowser {
    MockBrowser::new()
        .with_page(
            "/login",
            MockPage::new("Login")
                .element(MockElement::new("#username", ""))
                .element(MockElement::test_id("login-button", "Log in").navigates_to("/dashboard")),
        )
        .with_page(
            "/dashboard",
            MockPage::new("Dashboard")
                .text("Welcome back")
                .element(MockElement::test_id("cart-count", "3")),
        )
}

fn ui_trace() -> Trace {
    serde_json::from_value(json!({
        "version": 1,
        "type": "ui",
        "testName": "login_ui",
        "app": "shop",
        "baseUrl": "http://localhost:3010",
        "apiBaseUrl": "http://localhost:3020",
        "inputs": { "env": { "DEMO_USERNAME": "alice" } },
        "steps": [
            { "id": "s1", "action": "navigate", "selectorOrEndpoint": "${baseUrl}/login" },
            { "id": "s2", "action": "input", "selectorOrEndpoint": "#username", "input": "${ENV:DEMO_USERNAME}" },
            {
                "id": "s3",
                "action": "click",
                "selectorOrEndpoint": "[data-testid=\"login-button\"]",
                "guards": { "allowRetry": true, "expectUrlIncludes": "/dashboard" }
            },
            {
                "id": "s4",
                "action": "extractText",
                "selectorOrEndpoint": "[data-testid=cart-count]",
                "input": "save:cartCount",
                "expected": { "textIncludes": ["Welcome back"] }
            },
            { "id": "s5", "action": "waitForText", "selectorOrEndpoint": "${STATE:cartCount}" }
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn ui_step_retries_once_when_allowed() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let browser = login_page_browser().fail_times("[data-testid=\"login-button\"]", 1);

    let outcome = replay(
        &ui_trace(),
        &config,
        SessionOptions {
            browser: Some(Box::new(browser.clone())),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(outcome.verdict.passed(), "{:?}", outcome.verdict);
    assert_eq!(outcome.steps[2].attempts, 2);
    assert_eq!(browser.typed_value("#username").as_deref(), Some("alice"));
    assert!(!browser.is_started(), "teardown stops the browser");

    let logs = read_jsonl(&outcome.run_dir.join("logs.jsonl"));
    assert!(logs.iter().any(|l| l["level"] == "warn" && l["stepId"] == "s3"));
}

#[tokio::test]
async fn ui_failure_without_retry_captures_screenshot() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let browser = login_page_browser().fail_times("#username", 5);

    let outcome = replay(
        &ui_trace(),
        &config,
        SessionOptions {
            browser: Some(Box::new(browser)),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(outcome.verdict.failed_step_id.as_deref(), Some("s2"));
    let failed = &outcome.steps[1];
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.failure_kind, Some(FailureKind::DriverError));
    let shot = outcome.run_dir.join(&failed.artifacts["screenshot"]);
    assert!(shot.is_file());
}

#[tokio::test]
async fn session_state_is_visible_to_later_steps_only() {
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let trace = ui_trace();

    let mut session = RunSession::open(
        &trace,
        RunMode::Compiled,
        &config,
        SessionOptions {
            browser: Some(Box::new(login_page_browser())),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // s5 reads state that s4 has not captured yet
    let early = session.execute(&trace.steps[4]).await.unwrap();
    assert_eq!(early.failure_kind, Some(FailureKind::MissingBinding));
    assert!(session.is_halted());
    assert!(session.execute(&trace.steps[0]).await.is_err());

    let outcome = session.close().await.unwrap();
    assert!(outcome.run_id.starts_with("compiled_"));
    assert_eq!(outcome.verdict.failed_step_id.as_deref(), Some("s5"));

    let mut session = RunSession::open(
        &trace,
        RunMode::Compiled,
        &config,
        SessionOptions {
            browser: Some(Box::new(login_page_browser())),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    for step in &trace.steps {
        assert!(session.execute(step).await.unwrap().passed());
    }
    assert_eq!(session.executor().context().state()["cartCount"], "3");
    assert!(session.close().await.unwrap().verdict.passed());
}

fn checkout_trace(addr: SocketAddr, env: BTreeMap<String, String>) -> Trace {
    serde_json::from_value(json!({
        "version": 1,
        "type": "api",
        "testName": "checkout",
        "app": "shop",
        "baseUrl": "http://localhost:3010",
        "apiBaseUrl": format!("http://{addr}"),
        "inputs": { "env": env },
        "steps": [
            {
                "id": "s1",
                "action": "post",
                "selectorOrEndpoint": "/api/login",
                "input": {
                    "username": "${ENV:DEMO_USERNAME}",
                    "password": "${ENV:DEMO_PASSWORD}"
                },
                "expected": { "saveState": { "authToken": "token" } }
            },
            {
                "id": "s2",
                "action": "get",
                "selectorOrEndpoint": "/api/products",
                "guards": { "expectStatusCode": 200 }
            },
            {
                "id": "s3",
                "action": "post",
                "selectorOrEndpoint": "/api/cart/items",
                "input": {
                    "body": { "productId": "laptop", "quantity": 1 },
                    "headers": { "Authorization": "Bearer ${STATE:authToken}" }
                },
                "guards": { "expectStatusCode": 200 }
            }
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn checkout_passes_with_valid_credentials() {
    let (addr, hits) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let outcome = replay(&checkout_trace(addr, credentials(PASSWORD)), &config, SessionOptions::default())
        .await
        .unwrap();

    assert!(outcome.verdict.passed(), "{:?}", outcome.verdict);
    assert_eq!(outcome.steps.len(), 3);
    assert_eq!(hits.products(), 1);
    assert_eq!(hits.cart_items(), 1);
}

#[tokio::test]
async fn rejected_login_fails_at_the_capturing_step() {
    let (addr, hits) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let outcome = replay(
        &checkout_trace(addr, credentials("wrong-password")),
        &config,
        SessionOptions::default(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.verdict.status, Status::Fail);
    assert_eq!(outcome.verdict.failed_step_id.as_deref(), Some("s1"));
    assert_eq!(outcome.steps.len(), 1);
    assert_eq!(outcome.steps[0].failure_kind, Some(FailureKind::AssertionMismatch));
    assert!(outcome.verdict.reasons[0].contains("saveState path 'token' not found"));
    assert_eq!(hits.products(), 0);
    assert_eq!(hits.cart_items(), 0);
}

fn single_step_trace(addr: SocketAddr, step: Value) -> Trace {
    serde_json::from_value(json!({
        "version": 1,
        "type": "api",
        "testName": "single",
        "app": "shop",
        "baseUrl": "http://localhost:3010",
        "apiBaseUrl": format!("http://{addr}"),
        "steps": [step]
    }))
    .unwrap()
}

#[tokio::test]
async fn retry_repeats_a_failed_status_guard() {
    let (addr, hits) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let trace = single_step_trace(
        addr,
        json!({
            "id": "s1",
            "action": "get",
            "selectorOrEndpoint": "/api/warmup",
            "guards": { "expectStatusCode": 200, "allowRetry": true }
        }),
    );
    let outcome = replay(&trace, &config, SessionOptions::default()).await.unwrap();

    assert!(outcome.verdict.passed(), "{:?}", outcome.verdict);
    assert_eq!(outcome.steps[0].attempts, 2);
    assert_eq!(hits.warmup(), 2);

    let logs = read_jsonl(&outcome.run_dir.join("logs.jsonl"));
    let retry = logs.iter().find(|l| l["level"] == "warn").unwrap();
    assert_eq!(retry["stepId"], "s1");
    assert!(retry["message"].as_str().unwrap().contains("500"));
}

#[tokio::test]
async fn retry_repeats_a_failed_assertion() {
    let (addr, hits) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let trace = single_step_trace(
        addr,
        json!({
            "id": "s1",
            "action": "get",
            "selectorOrEndpoint": "/api/warmup",
            "guards": { "allowRetry": true },
            "expected": { "ready": true }
        }),
    );
    let outcome = replay(&trace, &config, SessionOptions::default()).await.unwrap();

    assert!(outcome.verdict.passed(), "{:?}", outcome.verdict);
    assert_eq!(outcome.steps[0].attempts, 2);
    assert_eq!(hits.warmup(), 2);
}

#[tokio::test]
async fn retry_makes_at_most_two_attempts() {
    let (addr, hits) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);

    let trace = single_step_trace(
        addr,
        json!({
            "id": "s1",
            "action": "get",
            "selectorOrEndpoint": "/api/cart",
            "guards": { "expectStatusCode": 200, "allowRetry": true }
        }),
    );
    let outcome = replay(&trace, &config, SessionOptions::default()).await.unwrap();

    assert_eq!(outcome.verdict.failed_step_id.as_deref(), Some("s1"));
    assert_eq!(outcome.steps[0].attempts, 2);
    assert_eq!(outcome.steps[0].failure_kind, Some(FailureKind::GuardViolation));
    assert_eq!(hits.cart(), 2);
}

#[tokio::test]
async fn ui_run_without_browser_runtime_fails_at_setup() {
    let dir = TempDir::new().unwrap();
    let mut config = config_in(&dir);
    config.ui.node_binary = "/nonexistent/node-binary".to_string();

    let outcome = replay(&ui_trace(), &config, SessionOptions::default()).await.unwrap();

    assert_eq!(outcome.verdict.status, Status::Fail);
    assert!(outcome.verdict.failed_step_id.is_none());
    assert!(outcome.verdict.reasons[0].contains("browser automation unavailable"));
    assert!(outcome.steps.is_empty());
}

#[tokio::test]
async fn halt_is_kept_when_the_run_log_cannot_be_written() {
    let (addr, _) = demo_api().await;
    let dir = TempDir::new().unwrap();
    let config = config_in(&dir);
    let trace = cart_trace(addr, credentials(PASSWORD));

    let mut session = RunSession::open(&trace, RunMode::Compiled, &config, SessionOptions::default())
        .await
        .unwrap();
    std::fs::remove_dir_all(session.run_dir()).unwrap();

    session.halt("worker lost").await;
    assert!(session.is_halted());
    assert!(session.execute(&trace.steps[0]).await.is_err());
}
