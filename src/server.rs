//! Control server - enrollment, heartbeat, policy and event endpoints
//!
//! Each request runs on its own task. Handlers only touch the shared stores
//! through their own locking, and no handler performs I/O while holding a
//! store lock.

use crate::event_log::{EventLog, NewEvent};
use crate::policy::{ConfigResponse, PolicyService};
use crate::protocol::{
    AgentStatus, EnrollRequest, EnrollResponse, ErrorResponse, HeartbeatRequest, StatusResponse,
    TOKEN_HEADER,
};
use crate::registry::{self, AgentRegistry, AuthError, RegistryError};
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub events: Arc<EventLog>,
    pub policy: Arc<PolicyService>,
    /// Silence after which `GET /agents` reports an agent as stale
    pub stale_threshold: Duration,
}

impl AppState {
    pub fn new(policy: PolicyService, stale_threshold: Duration) -> Self {
        Self {
            registry: Arc::new(AgentRegistry::new()),
            events: Arc::new(EventLog::new()),
            policy: Arc::new(policy),
            stale_threshold,
        }
    }
}

/// Handler errors, converted to status codes at the boundary
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("invalid json: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Auth(_) | Self::Registry(RegistryError::AgentNotFound(_)) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Decode(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(status = status.as_u16(), error = %self, "request rejected");
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

/// Agent id resolved from the `X-Agent-Token` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedAgent(pub String);

impl FromRequestParts<AppState> for AuthenticatedAgent {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(TOKEN_HEADER)
            .ok_or(AuthError::MissingToken)?;
        let token = header.to_str().map_err(|_| AuthError::InvalidToken)?.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken.into());
        }
        Ok(Self(state.registry.authenticate(token)?))
    }
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents", get(list_agents))
        .route("/agents/enroll", post(enroll))
        .route("/agents/heartbeat", post(heartbeat))
        .route("/config", get(current_config))
        .route("/events", post(ingest_event).get(list_events))
        .layer(middleware::map_response(json_content_type))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn enroll(State(state): State<AppState>, body: Bytes) -> Result<Json<EnrollResponse>, ApiError> {
    let request: EnrollRequest = decode(&body)?;
    let enrollment = state
        .registry
        .enroll(&request.hostname, &request.os, &request.version);

    info!(
        agent_id = %enrollment.agent_id,
        hostname = %request.hostname,
        os = %request.os,
        version = %request.version,
        "agent enrolled"
    );

    Ok(Json(EnrollResponse {
        agent_id: enrollment.agent_id,
        token: enrollment.token,
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    AuthenticatedAgent(agent_id): AuthenticatedAgent,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    // The body is optional; anything undecodable counts as "no claim".
    let claimed = serde_json::from_slice::<HeartbeatRequest>(&body)
        .ok()
        .and_then(|request| request.agent_id)
        .filter(|id| !id.is_empty());

    if let Some(claimed) = claimed {
        if claimed != agent_id {
            warn!(agent_id = %agent_id, claimed = %claimed, "heartbeat agent mismatch");
            return Err(AuthError::AgentMismatch.into());
        }
    }

    state.registry.heartbeat(&agent_id)?;
    debug!(agent_id = %agent_id, "heartbeat");
    Ok(Json(StatusResponse::ok()))
}

async fn current_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    let policy = state.policy.current();
    Json(ConfigResponse {
        policy: policy.as_ref().clone(),
    })
}

async fn ingest_event(
    State(state): State<AppState>,
    AuthenticatedAgent(agent_id): AuthenticatedAgent,
    body: Bytes,
) -> Result<Json<StatusResponse>, ApiError> {
    let event: NewEvent = decode(&body)?;
    let stored = state.events.append(event, &agent_id);

    info!(
        event_id = %stored.id,
        agent_id = %stored.agent_id,
        kind = %stored.kind,
        "event recorded"
    );

    Ok(Json(StatusResponse::ok_with_id(stored.id)))
}

// TODO: require a token here once the dashboard authenticates.
async fn list_events(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.events.snapshot())
}

async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentStatus>> {
    let now = Utc::now();
    let agents = state
        .registry
        .agents()
        .into_iter()
        .map(|agent| AgentStatus {
            stale: registry::stale(agent.last_seen_at, state.stale_threshold, now),
            agent,
        })
        .collect();
    Json(agents)
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    Ok(serde_json::from_slice(body)?)
}

async fn json_content_type(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    info!(
        %method,
        %path,
        status = response.status().as_u16(),
        elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
        "request"
    );
    response
}
