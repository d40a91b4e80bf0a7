//! Event Log - bounded in-memory telemetry window
//!
//! Keeps the most recent enforcement/telemetry events reported by agents.
//! Ids and timestamps are assigned here, never taken from the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

/// Default retention window
pub const DEFAULT_CAPACITY: usize = 1000;

/// Free-form structured event payload
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Event as submitted by an agent, before the server stamps it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// `"payload": null` means no payload
fn null_as_empty<'de, D>(deserializer: D) -> Result<Payload, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Payload>::deserialize(deserializer)?.unwrap_or_default())
}

/// Stored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub agent_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

/// Capacity-bounded, insertion-ordered event log
pub struct EventLog {
    events: Mutex<VecDeque<Event>>,
    max_events: usize,
}

impl EventLog {
    /// Create log with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create with custom capacity
    pub fn with_capacity(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    /// Append an event on behalf of `caller`.
    ///
    /// The event keeps its own `agent_id` when one was supplied. Oldest
    /// entries are evicted until the log is back within capacity.
    pub fn append(&self, event: NewEvent, caller: &str) -> Event {
        let mut events = self.lock();

        // Never earlier than the newest entry, even if the wall clock steps back.
        let now = Utc::now();
        let created_at = match events.back() {
            Some(last) if last.created_at > now => last.created_at,
            _ => now,
        };

        let agent_id = match event.agent_id {
            Some(id) if !id.is_empty() => id,
            _ => caller.to_string(),
        };

        let stored = Event {
            id: Uuid::new_v4().to_string(),
            agent_id,
            kind: event.kind,
            payload: event.payload,
            created_at,
        };
        events.push_back(stored.clone());

        while events.len() > self.max_events {
            if let Some(evicted) = events.pop_front() {
                debug!(event_id = %evicted.id, "evicted oldest event");
            }
        }

        stored
    }

    /// Point-in-time copy, oldest first
    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().iter().cloned().collect()
    }

    /// Number of retained events
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
