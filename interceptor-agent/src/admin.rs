//! Admin and live observation API
//!
//! - `GET /health`, `GET /metrics`
//! - `GET /api/proxy/state`: current [`SessionState`]
//! - `GET /api/events`: server-sent events `new_request`, `new_response` and
//!   `proxy_state` (sent once on connect, then on every change)
//! - `POST /api/rules/reload`, `POST /api/blacklist/reload`

use crate::error::{AgentError, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use interceptor_core::{InterceptService, MetricsSnapshot, SessionState, TrafficEvent};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_stream::{wrappers::WatchStream, Stream, StreamExt};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct AdminState {
    service: Arc<InterceptService>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct MetricsResponse {
    #[serde(flatten)]
    traffic: MetricsSnapshot,
    events_published: u64,
    events_dropped: u64,
    trace_blocks_dropped: u64,
    observers: usize,
}

#[derive(Serialize)]
struct ReloadResponse {
    loaded: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn router(service: Arc<InterceptService>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/proxy/state", get(state_handler))
        .route("/api/events", get(events_handler))
        .route("/api/rules/reload", post(reload_rules_handler))
        .route("/api/blacklist/reload", post(reload_blacklist_handler))
        .layer(CorsLayer::permissive())
        .with_state(AdminState { service })
}

pub async fn start_admin_server(
    addr: SocketAddr,
    service: Arc<InterceptService>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!("Starting Admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        AgentError::Configuration(format!("Failed to bind admin address {}: {}", addr, e))
    })?;

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn metrics_handler(State(state): State<AdminState>) -> Json<MetricsResponse> {
    let service = &state.service;
    Json(MetricsResponse {
        traffic: service.metrics().snapshot(),
        events_published: service.bus().published_count(),
        events_dropped: service.bus().dropped_count(),
        trace_blocks_dropped: service.recorder().dropped_blocks(),
        observers: service.bus().observer_count(),
    })
}

async fn state_handler(State(state): State<AdminState>) -> Json<SessionState> {
    Json(state.service.bus().current_state())
}

async fn events_handler(
    State(state): State<AdminState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let bus = state.service.bus();
    let subscription = bus.subscribe();
    debug!("Event stream opened for observer {:?}", subscription.id());

    // WatchStream yields the current state first
    let states = WatchStream::new(bus.watch_state()).filter_map(|s| state_event(&s));
    let traffic = subscription
        .into_stream()
        .filter_map(|event| traffic_event(&event));

    Sse::new(states.merge(traffic).map(Ok::<_, Infallible>)).keep_alive(KeepAlive::default())
}

fn state_event(state: &SessionState) -> Option<Event> {
    Event::default()
        .event("proxy_state")
        .json_data(state)
        .map_err(|e| warn!("Failed to encode session state: {}", e))
        .ok()
}

fn traffic_event(event: &TrafficEvent) -> Option<Event> {
    Event::default()
        .event(event.name())
        .json_data(event)
        .map_err(|e| warn!("Failed to encode traffic event: {}", e))
        .ok()
}

async fn reload_rules_handler(
    State(state): State<AdminState>,
) -> std::result::Result<Json<ReloadResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .reload_rules()
        .map(|loaded| Json(ReloadResponse { loaded }))
        .map_err(|e| reload_error(e.to_string()))
}

async fn reload_blacklist_handler(
    State(state): State<AdminState>,
) -> std::result::Result<Json<ReloadResponse>, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .reload_blacklist()
        .map(|loaded| Json(ReloadResponse { loaded }))
        .map_err(|e| reload_error(e.to_string()))
}

fn reload_error(error: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::UNPROCESSABLE_ENTITY, Json(ErrorResponse { error }))
}
