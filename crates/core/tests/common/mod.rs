//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use atf_core::EngineConfig;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "s3cret-pass";
pub const TOKEN: &str = "tok-7f3a";

/// Request counters for the demo API
#[derive(Debug, Default)]
pub struct Hits {
    pub login: AtomicUsize,
    pub cart: AtomicUsize,
    pub products: AtomicUsize,
    pub cart_items: AtomicUsize,
    pub warmup: AtomicUsize,
}

impl Hits {
    pub fn cart(&self) -> usize {
        self.cart.load(Ordering::SeqCst)
    }

    pub fn login(&self) -> usize {
        self.login.load(Ordering::SeqCst)
    }

    pub fn products(&self) -> usize {
        self.products.load(Ordering::SeqCst)
    }

    pub fn cart_items(&self) -> usize {
        self.cart_items.load(Ordering::SeqCst)
    }

    pub fn warmup(&self) -> usize {
        self.warmup.load(Ordering::SeqCst)
    }
}

fn bearer_ok(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {TOKEN}"))
}

async fn login(State(hits): State<Arc<Hits>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    hits.login.fetch_add(1, Ordering::SeqCst);
    if body["username"] == USERNAME && body["password"] == PASSWORD {
        (
            StatusCode::OK,
            Json(json!({ "token": TOKEN, "user": { "name": USERNAME } })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
    }
}

async fn cart(State(hits): State<Arc<Hits>>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    hits.cart.fetch_add(1, Ordering::SeqCst);
    if bearer_ok(&headers) {
        (
            StatusCode::OK,
            Json(json!({ "items": [{ "id": "laptop", "qty": 1 }], "total": 999 })),
        )
    } else {
        (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing token" })))
    }
}

async fn products(State(hits): State<Arc<Hits>>) -> Json<Value> {
    hits.products.fetch_add(1, Ordering::SeqCst);
    Json(json!([{ "id": "laptop", "price": 999 }, { "id": "mouse", "price": 25 }]))
}

async fn add_cart_item(
    State(hits): State<Arc<Hits>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    hits.cart_items.fetch_add(1, Ordering::SeqCst);
    if !bearer_ok(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "missing token" })));
    }
    (
        StatusCode::OK,
        Json(json!({ "items": [{ "id": body["productId"], "qty": body["quantity"] }] })),
    )
}

/// Unavailable on the first call, ready afterwards
async fn warmup(State(hits): State<Arc<Hits>>) -> (StatusCode, Json<Value>) {
    if hits.warmup.fetch_add(1, Ordering::SeqCst) == 0 {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ready": false })),
        )
    } else {
        (StatusCode::OK, Json(json!({ "ready": true })))
    }
}

/// Start the demo API on an ephemeral port
pub async fn demo_api() -> (SocketAddr, Arc<Hits>) {
    let hits = Arc::new(Hits::default());
    let app = Router::new()
        .route("/api/login", post(login))
        .route("/api/cart", get(cart))
        .route("/api/products", get(products))
        .route("/api/cart/items", post(add_cart_item))
        .route("/api/warmup", get(warmup))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, hits)
}

/// Config with every output directory inside `dir`
pub fn config_in(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        runs_dir: dir.path().join("runs"),
        traces_dir: dir.path().join("traces"),
        contracts_dir: dir.path().join("apps"),
        compiled_dir: dir.path().join("compiled-tests"),
        ..Default::default()
    }
}

pub fn credentials(password: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("DEMO_USERNAME".to_string(), USERNAME.to_string()),
        ("DEMO_PASSWORD".to_string(), password.to_string()),
    ])
}

/// Read a JSON Lines file
pub fn read_jsonl(path: &std::path::Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}
