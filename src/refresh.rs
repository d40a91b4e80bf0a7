//! Policy refresh - keeps the agent's evaluator in step with the server
//!
//! Polls the policy endpoint and publishes a freshly compiled
//! [`PolicyEvaluator`] whenever the document changes. The enforcement loop
//! picks it up at the start of its next cycle.

use crate::config::LocalConfig;
use crate::enforcement::TransientError;
use crate::policy::Policy;
use crate::policy_evaluator::PolicyEvaluator;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Source of the remote policy document
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn fetch_policy(&self) -> Result<Policy, TransientError>;
}

/// Periodic policy poller
pub struct PolicyRefreshLoop {
    source: Arc<dyn PolicySource>,
    local: LocalConfig,
    publisher: watch::Sender<Arc<PolicyEvaluator>>,
    interval: Duration,
    current: Policy,
}

impl PolicyRefreshLoop {
    /// `current` is the policy the published evaluator was built from
    pub fn new(
        source: Arc<dyn PolicySource>,
        local: LocalConfig,
        publisher: watch::Sender<Arc<PolicyEvaluator>>,
        interval: Duration,
        current: Policy,
    ) -> Self {
        Self {
            source,
            local,
            publisher,
            interval,
            current,
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "🔄 Policy refresh started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The startup fetch already covered the immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Policy refresh stopped");
    }

    /// Fetch once; returns true when a new evaluator was published.
    ///
    /// A failed fetch keeps the current evaluator.
    pub async fn refresh(&mut self) -> bool {
        let policy = match self.source.fetch_policy().await {
            Ok(policy) => policy,
            Err(e) => {
                warn!(error = %e, "policy fetch failed, keeping current policy");
                return false;
            }
        };

        if policy == self.current {
            debug!(version = policy.version, "policy unchanged");
            return false;
        }

        let evaluator = PolicyEvaluator::new(&policy, &self.local);
        info!(
            from = self.current.version,
            to = policy.version,
            blocked = evaluator.blocklist().len(),
            allowed = evaluator.allowlist().len(),
            "📜 Policy updated"
        );
        self.publisher.send_replace(Arc::new(evaluator));
        self.current = policy;
        true
    }
}
