//! Configuration for the server and the agent.
//!
//! Both binaries read environment variables once at startup; values that
//! are absent fall back to defaults. Lookups go through a resolver closure
//! so tests never have to touch the process environment.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Heartbeat period shared by agent and server defaults
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;
/// Enforcement scan period
pub const DEFAULT_SCAN_SECS: u64 = 2;
/// Outbound HTTP timeout
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;
/// Agents silent for this many heartbeat periods are reported stale
pub const STALE_HEARTBEAT_MULTIPLIER: u32 = 3;
/// Consecutive heartbeat failures before the agent logs an outage
pub const DEFAULT_HEARTBEAT_ALARM_AFTER: u32 = 6;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address {0}")]
    InvalidBind(String),
}

// ── Server ──────────────────────────────────────────────────────

/// Server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Optional JSON policy document; the built-in policy otherwise
    pub policy_path: Option<PathBuf>,
    /// Expected agent heartbeat period
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            policy_path: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
        }
    }
}

impl ServerConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver
    pub fn from_env_with(env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let host = env("EXAMSHIELD_BIND").unwrap_or_else(|| config.bind.ip().to_string());
        let port = parse_or("PORT", env("PORT"), config.bind.port());
        let ip = IpAddr::from_str(host.trim()).map_err(|_| ConfigError::InvalidBind(host.clone()))?;
        config.bind = SocketAddr::new(ip, port);

        config.policy_path = env("EXAMSHIELD_POLICY_PATH")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let secs = parse_or(
            "EXAMSHIELD_HEARTBEAT_SECS",
            env("EXAMSHIELD_HEARTBEAT_SECS"),
            DEFAULT_HEARTBEAT_SECS,
        );
        config.heartbeat_interval = Duration::from_secs(secs.max(1));

        Ok(config)
    }

    /// Silence after which an agent counts as stale
    pub fn stale_threshold(&self) -> Duration {
        self.heartbeat_interval * STALE_HEARTBEAT_MULTIPLIER
    }
}

// ── Agent ───────────────────────────────────────────────────────

/// Agent daemon settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Base URL of the control server, without trailing slash
    pub server_url: String,
    /// Directory for credentials, local config and screenshots
    pub state_dir: PathBuf,
    pub heartbeat_interval: Duration,
    pub scan_interval: Duration,
    pub policy_refresh_interval: Duration,
    pub http_timeout: Duration,
    /// Consecutive heartbeat failures before an outage is logged
    pub heartbeat_alarm_after: u32,
}

impl AgentConfig {
    /// Load from the process environment
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Load using a custom env resolver
    pub fn from_env_with(env: impl Fn(&str) -> Option<String>) -> Self {
        let server_url = env("EXAMSHIELD_SERVER")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string())
            .trim()
            .trim_end_matches('/')
            .to_string();

        let state_dir = env("EXAMSHIELD_STATE_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| default_state_dir(&env));

        let secs = |key: &str, default: u64| Duration::from_secs(parse_or(key, env(key), default).max(1));

        let heartbeat_interval = secs("EXAMSHIELD_HEARTBEAT_SECS", DEFAULT_HEARTBEAT_SECS);
        let policy_refresh_interval =
            secs("EXAMSHIELD_POLICY_REFRESH_SECS", heartbeat_interval.as_secs());

        Self {
            server_url,
            state_dir,
            heartbeat_interval,
            scan_interval: secs("EXAMSHIELD_SCAN_SECS", DEFAULT_SCAN_SECS),
            policy_refresh_interval,
            http_timeout: secs("EXAMSHIELD_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS),
            heartbeat_alarm_after: parse_or(
                "EXAMSHIELD_HEARTBEAT_ALARM_AFTER",
                env("EXAMSHIELD_HEARTBEAT_ALARM_AFTER"),
                DEFAULT_HEARTBEAT_ALARM_AFTER,
            ),
        }
    }

    /// Path of the local override document
    pub fn local_config_path(&self) -> PathBuf {
        self.state_dir.join("config.json")
    }
}

/// `%ProgramData%\ExamShieldEDU` on Windows, `/var/lib/examshieldedu` elsewhere
fn default_state_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    if cfg!(windows) {
        let base = env("ProgramData")
            .or_else(|| env("LOCALAPPDATA"))
            .unwrap_or_else(|| r"C:\ProgramData".to_string());
        PathBuf::from(base).join("ExamShieldEDU")
    } else {
        PathBuf::from("/var/lib/examshieldedu")
    }
}

fn parse_or<T: FromStr + Copy>(key: &str, value: Option<String>, default: T) -> T {
    match value {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(var = key, value = %raw, "ignoring invalid env override");
                default
            }
        },
    }
}

// ── Local override document ─────────────────────────────────────

/// Agent-local configuration written by the setup tooling.
///
/// `app_whitelist` only ever adds allow exceptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub app_whitelist: Vec<String>,
}

impl LocalConfig {
    /// Load the local document. Any failure to read or parse it yields
    /// defaults after a warning; a missing file is the normal case.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no local config, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable local config, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unparsable local config");
                Self::default()
            }
        }
    }

    /// Both Telegram settings are present
    pub fn notifications_enabled(&self) -> bool {
        !self.telegram_bot_token.trim().is_empty() && !self.telegram_chat_id.trim().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolver(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::from_env_with(resolver(&[])).unwrap();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.policy_path, None);
        assert_eq!(config.stale_threshold(), Duration::from_secs(30));
    }

    #[test]
    fn test_server_overrides() {
        let config = ServerConfig::from_env_with(resolver(&[
            ("PORT", "9090"),
            ("EXAMSHIELD_BIND", "127.0.0.1"),
            ("EXAMSHIELD_POLICY_PATH", "/etc/examshield/policy.json"),
            ("EXAMSHIELD_HEARTBEAT_SECS", "5"),
        ]))
        .unwrap();

        assert_eq!(config.bind, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
        assert_eq!(config.policy_path, Some(PathBuf::from("/etc/examshield/policy.json")));
        assert_eq!(config.stale_threshold(), Duration::from_secs(15));
    }

    #[test]
    fn test_server_invalid_port_ignored() {
        let config = ServerConfig::from_env_with(resolver(&[("PORT", "eighty")])).unwrap();
        assert_eq!(config.bind.port(), 8080);
    }

    #[test]
    fn test_server_invalid_bind() {
        let result = ServerConfig::from_env_with(resolver(&[("EXAMSHIELD_BIND", "not-an-ip")]));
        assert!(matches!(result, Err(ConfigError::InvalidBind(_))));
    }

    #[test]
    fn test_agent_defaults_and_overrides() {
        let config = AgentConfig::from_env_with(resolver(&[
            ("EXAMSHIELD_SERVER", "http://exam.local:8080/"),
            ("EXAMSHIELD_STATE_DIR", "/tmp/examshield"),
            ("EXAMSHIELD_SCAN_SECS", "0"),
            ("EXAMSHIELD_HEARTBEAT_SECS", "20"),
        ]));

        assert_eq!(config.server_url, "http://exam.local:8080");
        assert_eq!(config.state_dir, PathBuf::from("/tmp/examshield"));
        assert_eq!(config.scan_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.policy_refresh_interval, Duration::from_secs(20));
        assert_eq!(config.http_timeout, Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS));
        assert_eq!(config.local_config_path(), PathBuf::from("/tmp/examshield/config.json"));
    }

    #[test]
    fn test_local_config_missing_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(LocalConfig::load(&path), LocalConfig::default());

        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(LocalConfig::load(&path), LocalConfig::default());
    }

    #[test]
    fn test_local_config_unreadable_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be
        let path = dir.path().join("config.json");
        std::fs::create_dir(&path).unwrap();

        assert_eq!(LocalConfig::load(&path), LocalConfig::default());
    }

    #[test]
    fn test_local_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"telegram_bot_token": "123:abc", "telegram_chat_id": "42", "app_whitelist": ["Code.exe"]}"#,
        )
        .unwrap();

        let config = LocalConfig::load(&path);
        assert_eq!(config.app_whitelist, vec!["Code.exe".to_string()]);
        assert!(config.notifications_enabled());

        let partial = LocalConfig {
            telegram_chat_id: String::new(),
            ..config
        };
        assert!(!partial.notifications_enabled());
    }
}
