//! Heartbeat Loop - periodic liveness assertion
//!
//! Independent of enforcement. Failures are logged and the next tick tries
//! again; there is no backoff. A long outage is escalated in the log once.

use crate::enforcement::TransientError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Sends one heartbeat to the server
#[async_trait]
pub trait HeartbeatSender: Send + Sync {
    async fn send_heartbeat(&self) -> Result<(), TransientError>;
}

/// Periodic heartbeat task
pub struct HeartbeatLoop {
    sender: Arc<dyn HeartbeatSender>,
    interval: Duration,
    alarm_after: u32,
    consecutive_failures: u32,
}

impl HeartbeatLoop {
    pub fn new(sender: Arc<dyn HeartbeatSender>, interval: Duration) -> Self {
        Self {
            sender,
            interval,
            alarm_after: crate::config::DEFAULT_HEARTBEAT_ALARM_AFTER,
            consecutive_failures: 0,
        }
    }

    /// Consecutive failures after which the outage is logged at error level
    pub fn with_alarm_after(mut self, alarm_after: u32) -> Self {
        self.alarm_after = alarm_after.max(1);
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Run until `shutdown` flips to true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        info!(interval_secs = self.interval.as_secs(), "💓 Heartbeat loop started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.beat().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Heartbeat loop stopped");
    }

    /// Send a single heartbeat, returning whether it was accepted
    pub async fn beat(&mut self) -> bool {
        match self.sender.send_heartbeat().await {
            Ok(()) => {
                if self.consecutive_failures > 0 {
                    info!(
                        failures = self.consecutive_failures,
                        "server reachable again"
                    );
                }
                self.consecutive_failures = 0;
                debug!("heartbeat ok");
                true
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures == self.alarm_after {
                    error!(
                        failures = self.consecutive_failures,
                        error = %e,
                        "server unreachable, heartbeats keep failing"
                    );
                } else {
                    warn!(failures = self.consecutive_failures, error = %e, "heartbeat failed");
                }
                false
            }
        }
    }
}
