//! ExamShield EDU - endpoint enrollment, policy distribution and process
//! enforcement.
//!
//! The server side is [`server`] over [`registry`], [`event_log`] and
//! [`policy`]. The agent side is [`agent`], which wires the
//! [`enforcement`], [`heartbeat`] and [`refresh`] loops to the
//! [`platform`] collaborators and the [`client`].

pub mod agent;
pub mod client;
pub mod config;
pub mod credentials;
pub mod enforcement;
pub mod event_log;
pub mod heartbeat;
pub mod logging;
pub mod notify;
pub mod platform;
pub mod policy;
pub mod policy_evaluator;
pub mod protocol;
pub mod refresh;
pub mod registry;
pub mod server;

pub use client::{AgentSession, ClientError, Credentials, ServerClient};
pub use config::{AgentConfig, ConfigError, LocalConfig, ServerConfig};
pub use enforcement::{EnforcementLoop, EnforcementStats, ProcessInfo, TransientError};
pub use event_log::{Event, EventLog, NewEvent};
pub use heartbeat::HeartbeatLoop;
pub use policy::{Policy, PolicyService};
pub use policy_evaluator::{Decision, PolicyEvaluator};
pub use registry::{Agent, AgentRegistry, AuthError, RegistryError};
pub use server::{AppState, ApiError};
