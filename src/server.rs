use crate::config::ServiceConfig;
use crate::notifier::Notifier;
use crate::store::{Storage, StoreError};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    headers::{authorization::Basic, Authorization},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router, RequestPartsExt, TypedHeader,
};
use chrono::Utc;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

pub struct AppState {
    store: Arc<dyn Storage>,
    notifier: Arc<Notifier>,
    username: String,
    password: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Storage>,
        notifier: Arc<Notifier>,
        username: String,
        password: String,
    ) -> Self {
        Self {
            store,
            notifier,
            username,
            password,
        }
    }
}

trait LogError<T> {
    fn log_error(self, status_code: StatusCode) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Debug> LogError<T> for Result<T, E> {
    fn log_error(self, status_code: StatusCode) -> Result<T, StatusCode> {
        match self {
            Ok(value) => Ok(value),
            Err(error) => {
                tracing::error!(?error, "HTTP request failed.");
                Err(status_code)
            }
        }
    }
}

/// Marker extractor that rejects requests without valid admin credentials.
struct AdminAuth;

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if let Ok(TypedHeader(Authorization(basic))) =
            parts.extract::<TypedHeader<Authorization<Basic>>>().await
        {
            if basic.username() == state.username && basic.password() == state.password {
                return Ok(AdminAuth);
            }
        }

        tracing::warn!("rejected admin request with missing or invalid credentials");
        Err((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"deadman-switch\"")],
            "",
        )
            .into_response())
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping/:service_id", get(handle_ping))
        .route(
            "/config",
            get(handle_list_configs).post(handle_create_config),
        )
        .route("/config/:service_id", delete(handle_delete_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Runs the frontage until the shutdown channel flips.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let server = axum::Server::try_bind(&addr)
        .with_context(|| format!("failed to bind {addr}"))?
        .serve(router(state).into_make_service());

    tracing::info!(addr = %server.local_addr(), "listening for service heartbeats");

    server
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("server stopped unexpectedly")?;

    Ok(())
}

#[derive(Deserialize)]
struct PingParams {
    token: Option<String>,
}

async fn handle_ping(
    Path(service_id): Path<String>,
    Query(params): Query<PingParams>,
    State(state): State<Arc<AppState>>,
) -> (StatusCode, String) {
    let service = match state.store.service_config(&service_id).await {
        Ok(service) => service,
        Err(StoreError::NotFound) => {
            return (
                StatusCode::NOT_FOUND,
                "nice to meet you stranger".to_string(),
            );
        }
        Err(err) => {
            tracing::error!(service = %service_id, ?err, "failed to load service config");
            return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
        }
    };

    if !service.token.is_empty() && params.token.as_deref() != Some(service.token.as_str()) {
        tracing::warn!(service = %service.id, "failed to validate ping token");
        return (
            StatusCode::UNAUTHORIZED,
            "you might wish to supply a correct token for this request".to_string(),
        );
    }

    tracing::info!(service = %service.id, "received heartbeat");
    record_heartbeat(&state, &service).await;

    (
        StatusCode::OK,
        format!("got it {}, you are still alive", service.id),
    )
}

/// Writes the heartbeat and, when an alarm was active, clears it and sends
/// recovery notifications. Failures are logged; the ping still succeeds so
/// the monitored service never starts treating us as down.
async fn record_heartbeat(state: &AppState, service: &ServiceConfig) {
    if let Err(err) = state.store.set_last_heartbeat(&service.id, Utc::now()).await {
        tracing::error!(service = %service.id, ?err, "failed to update heartbeat timestamp");
    }

    match state.store.alarm_active_since(&service.id).await {
        Ok(_) => {
            if let Err(err) = state.store.clear_alarm(&service.id).await {
                tracing::error!(service = %service.id, ?err, "failed to clear alarm timestamp");
            }
            if let Err(err) = state.notifier.send_recovery_notifications(service).await {
                tracing::error!(service = %service.id, ?err, "failed to send recovery notifications");
            }
        }
        Err(StoreError::NotFound) => {}
        Err(err) => {
            tracing::error!(service = %service.id, ?err, "failed to load alarm state");
        }
    }
}

async fn handle_list_configs(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ServiceConfig>>, StatusCode> {
    let mut stream = state.store.service_configs();
    let mut configs = Vec::new();

    loop {
        tokio::select! {
            config = stream.configs.recv() => match config {
                Some(config) => configs.push(config),
                None => break,
            },
            Some(err) = stream.errors.recv() => {
                return Err::<Json<Vec<ServiceConfig>>, StoreError>(err)
                    .log_error(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    Ok(Json(configs))
}

async fn handle_create_config(
    _auth: AdminAuth,
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ServiceConfig>, JsonRejection>,
) -> Result<StatusCode, StatusCode> {
    let Json(config) = payload.log_error(StatusCode::UNPROCESSABLE_ENTITY)?;
    if config.id.is_empty() {
        tracing::error!("rejected service config without an id");
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }

    state
        .store
        .save_service_config(config)
        .await
        .log_error(StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::CREATED)
}

async fn handle_delete_config(
    _auth: AdminAuth,
    Path(service_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<StatusCode, StatusCode> {
    match state.store.service_config(&service_id).await {
        Ok(_) => {}
        Err(StoreError::NotFound) => return Err(StatusCode::NOT_FOUND),
        Err(err) => return Err::<StatusCode, StoreError>(err).log_error(StatusCode::INTERNAL_SERVER_ERROR),
    }

    state
        .store
        .delete_service_config(&service_id)
        .await
        .log_error(StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::OK)
}
