//! Policy - typed policy document and the service that serves it

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Policy document distributed to agents.
///
/// Executable names compare case-insensitively. Keys this version does not
/// understand are carried in `extensions`. Each list may be given under its
/// canonical key or one legacy alias, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub version: u64,
    #[serde(default, alias = "app_blacklist", alias = "app_blocklist")]
    pub blocklist: BTreeSet<String>,
    #[serde(default, alias = "app_whitelist", alias = "app_allowlist")]
    pub allowlist: BTreeSet<String>,
    #[serde(default = "default_screenshot_on_block")]
    pub screenshot_on_block: bool,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

fn default_screenshot_on_block() -> bool {
    true
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            version: 0,
            blocklist: BTreeSet::new(),
            allowlist: BTreeSet::new(),
            screenshot_on_block: default_screenshot_on_block(),
            extensions: serde_json::Map::new(),
        }
    }
}

impl Policy {
    /// Policy served when no policy file is configured
    pub fn builtin() -> Self {
        let names = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();

        let mut extensions = serde_json::Map::new();
        extensions.insert("usb_block".to_string(), serde_json::Value::Bool(true));
        extensions.insert("wifi_mode".to_string(), serde_json::Value::from("off"));

        Self {
            version: 1,
            blocklist: names(&["chrome.exe", "msedge.exe", "firefox.exe", "brave.exe"]),
            allowlist: names(&["notepad.exe", "code.exe"]),
            screenshot_on_block: true,
            extensions,
        }
    }

    /// Read a policy from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| PolicyError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Wire envelope for `GET /config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub policy: Policy,
}

/// Policy loading errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read policy file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Holds the active policy.
///
/// Every caller gets an `Arc` to an immutable document; a later
/// [`PolicyService::replace`] never changes what an earlier caller holds.
pub struct PolicyService {
    current: RwLock<Arc<Policy>>,
}

impl PolicyService {
    pub fn new(policy: Policy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    /// Active policy document
    pub fn current(&self) -> Arc<Policy> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a new policy. The stored version is bumped past the previous
    /// one so agents can detect the change. Returns the installed version.
    pub fn replace(&self, mut policy: Policy) -> u64 {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        policy.version = policy.version.max(current.version.saturating_add(1));
        let version = policy.version;
        *current = Arc::new(policy);
        version
    }
}

impl Default for PolicyService {
    fn default() -> Self {
        Self::new(Policy::builtin())
    }
}
