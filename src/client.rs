//! Server Client - agent side of the control protocol
//!
//! Thin reqwest wrapper. Every call shares one client built with the
//! configured timeout, so a hung server surfaces as an ordinary error.

use crate::enforcement::{EventSink, TransientError};
use crate::event_log::NewEvent;
use crate::heartbeat::HeartbeatSender;
use crate::policy::{ConfigResponse, Policy};
use crate::protocol::{EnrollRequest, EnrollResponse, HeartbeatRequest, StatusResponse, TOKEN_HEADER};
use crate::refresh::PolicySource;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },
}

/// Agent identity plus the token that authenticates it
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub agent_id: String,
    pub token: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("agent_id", &self.agent_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

/// HTTP client for the control server
#[derive(Debug, Clone)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ServerClient {
    /// Create a client for `base_url` with a per-request timeout
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Enroll this host
    pub async fn enroll(&self, request: &EnrollRequest) -> Result<Credentials, ClientError> {
        let response = self
            .http
            .post(self.url("/agents/enroll"))
            .json(request)
            .send()
            .await?;
        let enrolled: EnrollResponse = check("enroll", response).await?.json().await?;
        Ok(Credentials {
            agent_id: enrolled.agent_id,
            token: enrolled.token,
        })
    }

    /// Assert liveness
    pub async fn heartbeat(&self, credentials: &Credentials) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/agents/heartbeat"))
            .header(TOKEN_HEADER, &credentials.token)
            .json(&HeartbeatRequest {
                agent_id: Some(credentials.agent_id.clone()),
            })
            .send()
            .await?;
        check("heartbeat", response).await?;
        Ok(())
    }

    /// Fetch the active policy
    pub async fn fetch_policy(&self) -> Result<Policy, ClientError> {
        let response = self.http.get(self.url("/config")).send().await?;
        let config: ConfigResponse = check("config", response).await?.json().await?;
        Ok(config.policy)
    }

    /// Submit an event, returning the id the server assigned
    pub async fn post_event(
        &self,
        credentials: &Credentials,
        event: &NewEvent,
    ) -> Result<Option<String>, ClientError> {
        let response = self
            .http
            .post(self.url("/events"))
            .header(TOKEN_HEADER, &credentials.token)
            .json(event)
            .send()
            .await?;
        let accepted: StatusResponse = check("events", response).await?.json().await?;
        Ok(accepted.id)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl PolicySource for ServerClient {
    async fn fetch_policy(&self) -> Result<Policy, TransientError> {
        Ok(ServerClient::fetch_policy(self).await?)
    }
}

/// An enrolled agent's view of the server
#[derive(Debug, Clone)]
pub struct AgentSession {
    client: ServerClient,
    credentials: Credentials,
}

impl AgentSession {
    pub fn new(client: ServerClient, credentials: Credentials) -> Self {
        Self { client, credentials }
    }
}

#[async_trait]
impl HeartbeatSender for AgentSession {
    async fn send_heartbeat(&self) -> Result<(), TransientError> {
        Ok(self.client.heartbeat(&self.credentials).await?)
    }
}

#[async_trait]
impl EventSink for AgentSession {
    async fn submit(&self, mut event: NewEvent) -> Result<(), TransientError> {
        event
            .agent_id
            .get_or_insert_with(|| self.credentials.agent_id.clone());
        let id = self.client.post_event(&self.credentials, &event).await?;
        debug!(kind = %event.kind, id = ?id, "event delivered");
        Ok(())
    }
}

async fn check(endpoint: &'static str, response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        endpoint,
        status,
        body: body.trim().to_string(),
    })
}
