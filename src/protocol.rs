//! Wire types shared by the server handlers and the agent client.

use crate::registry::Agent;
use serde::{Deserialize, Serialize};

/// Header carrying the agent credential
pub const TOKEN_HEADER: &str = "X-Agent-Token";

/// `POST /agents/enroll` request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrollRequest {
    pub hostname: String,
    pub os: String,
    pub version: String,
}

/// `POST /agents/enroll` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub agent_id: String,
    pub token: String,
}

/// `POST /agents/heartbeat` request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// `{"status": "ok"}`, optionally with the id of a stored event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            id: None,
        }
    }

    pub fn ok_with_id(id: String) -> Self {
        Self {
            status: "ok".to_string(),
            id: Some(id),
        }
    }
}

/// Entry of `GET /agents`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatus {
    #[serde(flatten)]
    pub agent: Agent,
    pub stale: bool,
}

/// Error body for every non-2xx response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
