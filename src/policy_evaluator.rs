//! Policy Evaluator - allow/block decisions for process names
//!
//! Compiles the remote policy and the local override into two lower-cased
//! name sets. Matching is exact after lower-casing; the allowlist always wins.

use crate::config::LocalConfig;
use crate::policy::Policy;
use std::collections::HashSet;

/// Enforced when the policy carries an empty blocklist
pub const DEFAULT_BLOCKLIST: &[&str] = &[
    "chrome.exe",
    "msedge.exe",
    "firefox.exe",
    "brave.exe",
    "opera.exe",
];

/// Decision for a single process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Explicitly allowed, never enforced against
    Allow,
    /// Terminate and report
    Block,
    /// Not mentioned by the policy
    Ignore,
}

/// Compiled allow/block sets for one policy version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEvaluator {
    version: u64,
    blocklist: HashSet<String>,
    allowlist: HashSet<String>,
    screenshot_on_block: bool,
}

impl PolicyEvaluator {
    /// Compile `policy` merged with the local override
    pub fn new(policy: &Policy, local: &LocalConfig) -> Self {
        Self {
            version: policy.version,
            blocklist: build_blocklist(policy),
            allowlist: build_allowlist(policy, local),
            screenshot_on_block: policy.screenshot_on_block,
        }
    }

    /// Decide what to do with a running process
    pub fn decide(&self, process_name: &str) -> Decision {
        let name = process_name.to_lowercase();
        if self.allowlist.contains(&name) {
            Decision::Allow
        } else if self.blocklist.contains(&name) {
            Decision::Block
        } else {
            Decision::Ignore
        }
    }

    /// Policy version this evaluator was compiled from
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn screenshot_on_block(&self) -> bool {
        self.screenshot_on_block
    }

    pub fn blocklist(&self) -> &HashSet<String> {
        &self.blocklist
    }

    pub fn allowlist(&self) -> &HashSet<String> {
        &self.allowlist
    }
}

/// Lower-cased policy blocklist, or [`DEFAULT_BLOCKLIST`] when it is empty
pub fn build_blocklist(policy: &Policy) -> HashSet<String> {
    let names: HashSet<String> = policy
        .blocklist
        .iter()
        .map(|name| normalize(name))
        .filter(|name| !name.is_empty())
        .collect();

    if names.is_empty() {
        DEFAULT_BLOCKLIST.iter().map(|name| name.to_string()).collect()
    } else {
        names
    }
}

/// Union of the policy allowlist and the local `app_whitelist`
pub fn build_allowlist(policy: &Policy, local: &LocalConfig) -> HashSet<String> {
    policy
        .allowlist
        .iter()
        .chain(local.app_whitelist.iter())
        .map(|name| normalize(name))
        .filter(|name| !name.is_empty())
        .collect()
}

fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}
