#![allow(dead_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use deadman_switch::config::{NotificationConfig, ServiceConfig, WebhookConfig};
use deadman_switch::notifier::Notifier;
use deadman_switch::server::{self, AppState};
use deadman_switch::store::memory::MemoryStorage;
use deadman_switch::store::Storage;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "secret";

pub struct TestApp {
    pub base_url: String,
    pub store: Arc<dyn Storage>,
    pub notifier: Arc<Notifier>,
}

/// Boots a memory-backed node on an ephemeral port.
pub async fn spawn_app(services: Vec<ServiceConfig>) -> TestApp {
    let store: Arc<dyn Storage> = Arc::new(MemoryStorage::new(services));
    let notifier = Notifier::new(store.clone(), None);
    let state = Arc::new(AppState::new(
        store.clone(),
        notifier.clone(),
        ADMIN_USER.to_string(),
        ADMIN_PASSWORD.to_string(),
    ));

    let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
        .serve(server::router(state).into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);

    TestApp {
        base_url: format!("http://{addr}"),
        store,
        notifier,
    }
}

async fn count_hit(State(hits): State<Arc<AtomicUsize>>) -> StatusCode {
    hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

/// A webhook receiver that counts how often it gets called.
pub async fn webhook_sink() -> (String, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/hook", post(count_hit))
        .with_state(hits.clone());

    let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0)))
        .serve(app.into_make_service());
    let addr = server.local_addr();
    tokio::spawn(server);

    (format!("http://{addr}/hook"), hits)
}

pub fn service(id: &str, timeout: Duration) -> ServiceConfig {
    ServiceConfig {
        id: id.to_string(),
        token: String::new(),
        timeout,
        debounce: Duration::ZERO,
        alert_notifications: vec![],
        recovery_notifications: vec![],
    }
}

pub fn webhook(url: &str) -> NotificationConfig {
    NotificationConfig::Webhook(WebhookConfig {
        url: url.to_string(),
        method: "POST".to_string(),
        body: String::new(),
        headers: HashMap::new(),
    })
}
