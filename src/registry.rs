//! Agent Registry - enrolled hosts and their credentials
//!
//! Agents and tokens live behind one reader/writer lock. Enrollment inserts
//! both under a single write guard, so no reader ever sees an agent without
//! its token or a token pointing at a missing agent.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Token length in random bytes (hex encoded on the wire)
const TOKEN_BYTES: usize = 32;

/// Enrolled endpoint host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Agent {
    pub id: String,
    pub hostname: String,
    pub os: String,
    pub version: String,
    pub last_seen_at: DateTime<Utc>,
}

/// Identity and credential handed out by [`AgentRegistry::enroll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrollment {
    pub agent_id: String,
    pub token: String,
}

/// Authentication failures (all map to 401)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("agent mismatch")]
    AgentMismatch,
}

/// Registry lookup failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
}

#[derive(Debug, Default)]
struct Inner {
    agents: HashMap<String, Agent>,
    /// token -> agent id
    tokens: HashMap<String, String>,
}

/// Credential and agent registry
#[derive(Debug, Default)]
pub struct AgentRegistry {
    inner: RwLock<Inner>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll a new host, issuing a fresh agent id and token.
    ///
    /// Inputs are stored as given. The id and token are checked for
    /// collisions while the write guard is held.
    pub fn enroll(&self, hostname: &str, os: &str, version: &str) -> Enrollment {
        let mut inner = self.write();

        let agent_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !inner.agents.contains_key(&candidate) {
                break candidate;
            }
        };
        let token = loop {
            let candidate = generate_token();
            if !inner.tokens.contains_key(&candidate) {
                break candidate;
            }
        };

        inner.agents.insert(
            agent_id.clone(),
            Agent {
                id: agent_id.clone(),
                hostname: hostname.to_string(),
                os: os.to_string(),
                version: version.to_string(),
                last_seen_at: Utc::now(),
            },
        );
        inner.tokens.insert(token.clone(), agent_id.clone());

        Enrollment { agent_id, token }
    }

    /// Resolve a token to its agent id. No side effects.
    pub fn authenticate(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        self.read()
            .tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }

    /// Record liveness for an agent
    pub fn heartbeat(&self, agent_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let agent = inner
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;
        agent.last_seen_at = Utc::now();
        Ok(())
    }

    /// True when the agent has not been seen for longer than `threshold`.
    ///
    /// Used for reporting only; stale agents keep their credentials.
    pub fn is_stale(&self, agent_id: &str, threshold: Duration) -> Result<bool, RegistryError> {
        self.is_stale_at(agent_id, threshold, Utc::now())
    }

    /// [`Self::is_stale`] against an explicit clock reading
    pub fn is_stale_at(
        &self,
        agent_id: &str,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, RegistryError> {
        let inner = self.read();
        let agent = inner
            .agents
            .get(agent_id)
            .ok_or_else(|| RegistryError::AgentNotFound(agent_id.to_string()))?;
        Ok(stale(agent.last_seen_at, threshold, now))
    }

    /// Look up a single agent
    pub fn agent(&self, agent_id: &str) -> Option<Agent> {
        self.read().agents.get(agent_id).cloned()
    }

    /// Copy of every enrolled agent, least recently seen first
    pub fn agents(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.last_seen_at.cmp(&b.last_seen_at).then_with(|| a.id.cmp(&b.id)));
        agents
    }

    /// Number of enrolled agents
    pub fn len(&self) -> usize {
        self.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Critical sections never leave a half-written pair behind, so a
    // poisoned guard still protects consistent data.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `now - last_seen > threshold`
pub(crate) fn stale(last_seen: DateTime<Utc>, threshold: Duration, now: DateTime<Utc>) -> bool {
    match chrono::Duration::from_std(threshold) {
        Ok(threshold) => now.signed_duration_since(last_seen) > threshold,
        // Out of chrono's range: nothing can be that old.
        Err(_) => false,
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_enroll_issues_resolvable_token() {
        let registry = AgentRegistry::new();
        let enrollment = registry.enroll("lab1", "windows", "1.0");

        assert!(!enrollment.agent_id.is_empty());
        assert_eq!(enrollment.token.len(), TOKEN_BYTES * 2);
        assert_eq!(hex::decode(&enrollment.token).unwrap().len(), TOKEN_BYTES);
        assert_ne!(enrollment.agent_id, enrollment.token);
        assert_eq!(registry.authenticate(&enrollment.token), Ok(enrollment.agent_id.clone()));

        let agent = registry.agent(&enrollment.agent_id).unwrap();
        assert_eq!(agent.hostname, "lab1");
        assert_eq!(agent.os, "windows");
        assert_eq!(agent.version, "1.0");
    }

    #[test]
    fn test_authenticate_rejects_unknown_and_empty() {
        let registry = AgentRegistry::new();
        registry.enroll("lab1", "windows", "1.0");

        assert_eq!(registry.authenticate(""), Err(AuthError::InvalidToken));
        assert_eq!(registry.authenticate("deadbeef"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn test_concurrent_enrollment_is_unique() {
        let registry = Arc::new(AgentRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|i| registry.enroll(&format!("host-{worker}-{i}"), "linux", "1.0"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let enrollments: Vec<Enrollment> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let ids: HashSet<_> = enrollments.iter().map(|e| e.agent_id.clone()).collect();
        let tokens: HashSet<_> = enrollments.iter().map(|e| e.token.clone()).collect();
        assert_eq!(ids.len(), 400);
        assert_eq!(tokens.len(), 400);
        assert_eq!(registry.len(), 400);

        for enrollment in &enrollments {
            assert_eq!(
                registry.authenticate(&enrollment.token).as_deref(),
                Ok(enrollment.agent_id.as_str())
            );
        }
    }

    #[test]
    fn test_heartbeat_updates_last_seen() {
        let registry = AgentRegistry::new();
        let enrollment = registry.enroll("lab1", "windows", "1.0");
        let before = registry.agent(&enrollment.agent_id).unwrap().last_seen_at;

        std::thread::sleep(Duration::from_millis(5));
        registry.heartbeat(&enrollment.agent_id).unwrap();

        let after = registry.agent(&enrollment.agent_id).unwrap().last_seen_at;
        assert!(after > before);
    }

    #[test]
    fn test_heartbeat_unknown_agent() {
        let registry = AgentRegistry::new();
        assert_eq!(
            registry.heartbeat("nope"),
            Err(RegistryError::AgentNotFound("nope".to_string()))
        );
    }

    #[test]
    fn test_staleness_threshold() {
        let registry = AgentRegistry::new();
        let enrollment = registry.enroll("lab1", "windows", "1.0");
        let seen = registry.agent(&enrollment.agent_id).unwrap().last_seen_at;
        let threshold = Duration::from_secs(30);

        let fresh = seen + chrono::Duration::seconds(30);
        let old = seen + chrono::Duration::seconds(31);
        assert!(!registry.is_stale_at(&enrollment.agent_id, threshold, fresh).unwrap());
        assert!(registry.is_stale_at(&enrollment.agent_id, threshold, old).unwrap());
        assert!(!registry.is_stale(&enrollment.agent_id, threshold).unwrap());
    }
}
