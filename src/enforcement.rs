//! Enforcement Loop - scan, evaluate, act, report
//!
//! Every cycle lists running processes and enforces against each one the
//! current [`PolicyEvaluator`] blocks. Acting is best-effort: each step of a
//! block (evidence, terminate, report, notify) runs regardless of the others
//! failing, and nothing is retried within a cycle.

use crate::client::ClientError;
use crate::event_log::{NewEvent, Payload};
use crate::policy_evaluator::{Decision, PolicyEvaluator};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Event type emitted for every enforced block
pub const APP_BLOCK_EVENT: &str = "app_block";

/// Running process as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
}

/// Failures of external collaborators. Always logged, never fatal.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("command failed: {0}")]
    Command(String),

    #[error("failed to terminate pid {pid}: {reason}")]
    Termination { pid: u32, reason: String },

    #[error("evidence capture failed: {0}")]
    Capture(String),

    #[error("notification failed: {0}")]
    Notification(String),

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Lists running processes
#[async_trait]
pub trait ProcessLister: Send + Sync {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, TransientError>;
}

/// Terminates a process by id
#[async_trait]
pub trait ProcessTerminator: Send + Sync {
    async fn terminate(&self, pid: u32) -> Result<(), TransientError>;
}

/// Captures evidence (a screenshot) and returns a reference to it
#[async_trait]
pub trait EvidenceCapture: Send + Sync {
    async fn capture(&self) -> Result<String, TransientError>;
}

/// Delivers events to the server
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: NewEvent) -> Result<(), TransientError>;
}

/// Out-of-band human alert channel
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str) -> Result<(), TransientError>;
}

/// Local failure counters, surfaced for telemetry
#[derive(Debug, Default)]
pub struct EnforcementStats {
    scans: AtomicU64,
    scan_failures: AtomicU64,
    blocks: AtomicU64,
    capture_failures: AtomicU64,
    termination_failures: AtomicU64,
    delivery_failures: AtomicU64,
    notification_failures: AtomicU64,
}

/// Point-in-time copy of [`EnforcementStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub scans: u64,
    pub scan_failures: u64,
    pub blocks: u64,
    pub capture_failures: u64,
    pub termination_failures: u64,
    pub delivery_failures: u64,
    pub notification_failures: u64,
}

impl EnforcementStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scans: self.scans.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            capture_failures: self.capture_failures.load(Ordering::Relaxed),
            termination_failures: self.termination_failures.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            notification_failures: self.notification_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Result of a single cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Process listing failed; nothing was evaluated
    Skipped,
    /// Scan completed; these processes were enforced against
    Completed { blocked: Vec<ProcessInfo> },
}

/// External collaborators used by the loop
#[derive(Clone)]
pub struct Collaborators {
    pub lister: Arc<dyn ProcessLister>,
    pub terminator: Arc<dyn ProcessTerminator>,
    pub evidence: Arc<dyn EvidenceCapture>,
    pub events: Arc<dyn EventSink>,
    /// `None` when no notification channel is configured
    pub notifier: Option<Arc<dyn Notifier>>,
}

/// Periodic process enforcement
pub struct EnforcementLoop {
    collaborators: Collaborators,
    policy: watch::Receiver<Arc<PolicyEvaluator>>,
    interval: Duration,
    stats: Arc<EnforcementStats>,
}

impl EnforcementLoop {
    /// Create a loop enforcing whatever evaluator `policy` currently holds
    pub fn new(
        collaborators: Collaborators,
        policy: watch::Receiver<Arc<PolicyEvaluator>>,
        interval: Duration,
    ) -> Self {
        Self {
            collaborators,
            policy,
            interval,
            stats: Arc::new(EnforcementStats::default()),
        }
    }

    /// Shared handle to the failure counters
    pub fn stats(&self) -> Arc<EnforcementStats> {
        self.stats.clone()
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    ///
    /// A cycle that has started always completes before shutdown is checked.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }
        info!(interval_ms = duration_ms(self.interval), "🔍 Enforcement loop started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Enforcement loop stopped");
    }

    /// Execute one scan-evaluate-act cycle
    pub async fn run_cycle(&self) -> CycleOutcome {
        // Hold one evaluator for the whole cycle; a policy swap applies next cycle.
        let evaluator = self.policy.borrow().clone();
        EnforcementStats::bump(&self.stats.scans);

        let processes = match self.collaborators.lister.list_processes().await {
            Ok(processes) => processes,
            Err(e) => {
                EnforcementStats::bump(&self.stats.scan_failures);
                warn!(error = %e, "process scan failed, skipping cycle");
                return CycleOutcome::Skipped;
            }
        };

        let mut blocked = Vec::new();
        for process in processes {
            if evaluator.decide(&process.name) != Decision::Block {
                continue;
            }
            self.enforce(&evaluator, &process).await;
            blocked.push(process);
        }

        CycleOutcome::Completed { blocked }
    }

    async fn enforce(&self, evaluator: &PolicyEvaluator, process: &ProcessInfo) {
        EnforcementStats::bump(&self.stats.blocks);

        let evidence = if evaluator.screenshot_on_block() {
            match self.collaborators.evidence.capture().await {
                Ok(reference) => reference,
                Err(e) => {
                    EnforcementStats::bump(&self.stats.capture_failures);
                    warn!(pid = process.pid, error = %e, "evidence capture failed");
                    String::new()
                }
            }
        } else {
            String::new()
        };

        // The process may have exited since the scan; that is expected.
        if let Err(e) = self.collaborators.terminator.terminate(process.pid).await {
            EnforcementStats::bump(&self.stats.termination_failures);
            debug!(pid = process.pid, error = %e, "termination failed");
        }

        let event = block_event(process, &evidence, Utc::now());
        if let Err(e) = self.collaborators.events.submit(event).await {
            EnforcementStats::bump(&self.stats.delivery_failures);
            warn!(pid = process.pid, error = %e, "failed to report block event");
        }

        if let Some(notifier) = &self.collaborators.notifier {
            if let Err(e) = notifier.notify(&alert_text(process)).await {
                EnforcementStats::bump(&self.stats.notification_failures);
                warn!(pid = process.pid, error = %e, "block notification failed");
            }
        }

        info!(
            process = %process.name,
            pid = process.pid,
            policy_version = evaluator.version(),
            "🚫 Blocked process"
        );
    }
}

/// `app_block` event for a terminated process
pub fn block_event(process: &ProcessInfo, evidence: &str, at: DateTime<Utc>) -> NewEvent {
    let mut payload = Payload::new();
    payload.insert("process_name".to_string(), json!(process.name));
    payload.insert("pid".to_string(), json!(process.pid));
    payload.insert("screenshot_path".to_string(), json!(evidence));
    payload.insert(
        "at".to_string(),
        json!(at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );

    NewEvent {
        kind: APP_BLOCK_EVENT.to_string(),
        payload,
        agent_id: None,
    }
}

/// Short alert line for the notification channel
pub fn alert_text(process: &ProcessInfo) -> String {
    format!("ExamShieldEDU: Blocked {} (PID {})", process.name, process.pid)
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalConfig;
    use crate::policy::Policy;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        processes: Mutex<Vec<ProcessInfo>>,
        fail_listing: bool,
        fail_termination: bool,
        fail_capture: bool,
        fail_delivery: bool,
        terminated: Mutex<Vec<u32>>,
        captures: Mutex<u32>,
        events: Mutex<Vec<NewEvent>>,
        alerts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ProcessLister for Recorder {
        async fn list_processes(&self) -> Result<Vec<ProcessInfo>, TransientError> {
            if self.fail_listing {
                return Err(TransientError::Command("tasklist exited with 1".into()));
            }
            Ok(self.processes.lock().unwrap().clone())
        }
    }

    #[async_trait]
    impl ProcessTerminator for Recorder {
        async fn terminate(&self, pid: u32) -> Result<(), TransientError> {
            self.terminated.lock().unwrap().push(pid);
            if self.fail_termination {
                return Err(TransientError::Termination {
                    pid,
                    reason: "no such process".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EvidenceCapture for Recorder {
        async fn capture(&self) -> Result<String, TransientError> {
            *self.captures.lock().unwrap() += 1;
            if self.fail_capture {
                return Err(TransientError::Unsupported("screenshot capture"));
            }
            Ok("/state/shot_1.png".to_string())
        }
    }

    #[async_trait]
    impl EventSink for Recorder {
        async fn submit(&self, event: NewEvent) -> Result<(), TransientError> {
            if self.fail_delivery {
                return Err(TransientError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "server unreachable",
                )));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, text: &str) -> Result<(), TransientError> {
            self.alerts.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn recorder(processes: &[(&str, u32)]) -> Recorder {
        Recorder {
            processes: Mutex::new(
                processes
                    .iter()
                    .map(|(name, pid)| ProcessInfo {
                        name: name.to_string(),
                        pid: *pid,
                    })
                    .collect(),
            ),
            ..Recorder::default()
        }
    }

    fn evaluator(block: &[&str], local_allow: &[&str], screenshot: bool) -> Arc<PolicyEvaluator> {
        let policy = Policy {
            blocklist: block.iter().map(|s| s.to_string()).collect(),
            screenshot_on_block: screenshot,
            ..Policy::default()
        };
        let local = LocalConfig {
            app_whitelist: local_allow.iter().map(|s| s.to_string()).collect(),
            ..LocalConfig::default()
        };
        Arc::new(PolicyEvaluator::new(&policy, &local))
    }

    fn enforcement_loop(
        recorder: Arc<Recorder>,
        evaluator: Arc<PolicyEvaluator>,
        with_notifier: bool,
    ) -> (EnforcementLoop, watch::Sender<Arc<PolicyEvaluator>>) {
        let (tx, rx) = watch::channel(evaluator);
        let collaborators = Collaborators {
            lister: recorder.clone(),
            terminator: recorder.clone(),
            evidence: recorder.clone(),
            events: recorder.clone(),
            notifier: with_notifier.then(|| recorder.clone() as Arc<dyn Notifier>),
        };
        (EnforcementLoop::new(collaborators, rx, Duration::from_secs(2)), tx)
    }

    #[tokio::test]
    async fn test_blocked_process_is_terminated_and_reported() {
        let recorder = Arc::new(recorder(&[("chrome.exe", 4321), ("notepad.exe", 77)]));
        let (enforcement, _tx) =
            enforcement_loop(recorder.clone(), evaluator(&["chrome.exe"], &[], true), false);

        let outcome = enforcement.run_cycle().await;

        assert_eq!(
            outcome,
            CycleOutcome::Completed {
                blocked: vec![ProcessInfo {
                    name: "chrome.exe".into(),
                    pid: 4321
                }]
            }
        );
        assert_eq!(*recorder.terminated.lock().unwrap(), vec![4321]);

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, APP_BLOCK_EVENT);
        assert_eq!(events[0].payload["pid"], json!(4321));
        assert_eq!(events[0].payload["process_name"], json!("chrome.exe"));
        assert_eq!(events[0].payload["screenshot_path"], json!("/state/shot_1.png"));
        assert!(events[0].payload["at"].is_string());
    }

    #[tokio::test]
    async fn test_local_override_prevents_block() {
        let recorder = Arc::new(recorder(&[("chrome.exe", 4321)]));
        let (enforcement, _tx) = enforcement_loop(
            recorder.clone(),
            evaluator(&["chrome.exe"], &["chrome.exe"], true),
            true,
        );

        let outcome = enforcement.run_cycle().await;

        assert_eq!(outcome, CycleOutcome::Completed { blocked: vec![] });
        assert!(recorder.terminated.lock().unwrap().is_empty());
        assert!(recorder.events.lock().unwrap().is_empty());
        assert!(recorder.alerts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_failure_skips_cycle() {
        let recorder = Arc::new(Recorder {
            fail_listing: true,
            ..recorder(&[("chrome.exe", 1)])
        });
        let (enforcement, _tx) =
            enforcement_loop(recorder.clone(), evaluator(&["chrome.exe"], &[], true), false);

        assert_eq!(enforcement.run_cycle().await, CycleOutcome::Skipped);
        assert!(recorder.events.lock().unwrap().is_empty());

        let stats = enforcement.stats().snapshot();
        assert_eq!(stats.scans, 1);
        assert_eq!(stats.scan_failures, 1);
    }

    #[tokio::test]
    async fn test_failed_steps_do_not_stop_the_rest() {
        let recorder = Arc::new(Recorder {
            fail_capture: true,
            fail_termination: true,
            ..recorder(&[("chrome.exe", 10), ("firefox.exe", 11)])
        });
        let (enforcement, _tx) = enforcement_loop(
            recorder.clone(),
            evaluator(&["chrome.exe", "firefox.exe"], &[], true),
            true,
        );

        enforcement.run_cycle().await;

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.payload["screenshot_path"] == json!("")));
        assert_eq!(recorder.alerts.lock().unwrap().len(), 2);
        assert_eq!(
            recorder.alerts.lock().unwrap()[0],
            "ExamShieldEDU: Blocked chrome.exe (PID 10)"
        );

        let stats = enforcement.stats().snapshot();
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.capture_failures, 2);
        assert_eq!(stats.termination_failures, 2);
    }

    #[tokio::test]
    async fn test_delivery_failure_is_counted() {
        let recorder = Arc::new(Recorder {
            fail_delivery: true,
            ..recorder(&[("chrome.exe", 10)])
        });
        let (enforcement, _tx) =
            enforcement_loop(recorder.clone(), evaluator(&["chrome.exe"], &[], false), true);

        enforcement.run_cycle().await;

        assert_eq!(*recorder.terminated.lock().unwrap(), vec![10]);
        assert_eq!(recorder.alerts.lock().unwrap().len(), 1);
        assert_eq!(enforcement.stats().snapshot().delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_screenshot_disabled_skips_capture() {
        let recorder = Arc::new(recorder(&[("chrome.exe", 10)]));
        let (enforcement, _tx) =
            enforcement_loop(recorder.clone(), evaluator(&["chrome.exe"], &[], false), false);

        enforcement.run_cycle().await;

        assert_eq!(*recorder.captures.lock().unwrap(), 0);
        assert_eq!(recorder.events.lock().unwrap()[0].payload["screenshot_path"], json!(""));
    }

    #[tokio::test]
    async fn test_respawned_process_is_blocked_every_cycle() {
        let recorder = Arc::new(recorder(&[("chrome.exe", 10)]));
        let (enforcement, _tx) =
            enforcement_loop(recorder.clone(), evaluator(&["chrome.exe"], &[], false), false);

        enforcement.run_cycle().await;
        enforcement.run_cycle().await;

        assert_eq!(recorder.events.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_policy_swap_applies_next_cycle() {
        let recorder = Arc::new(recorder(&[("steam.exe", 5)]));
        let (enforcement, tx) =
            enforcement_loop(recorder.clone(), evaluator(&["chrome.exe"], &[], false), false);

        assert_eq!(enforcement.run_cycle().await, CycleOutcome::Completed { blocked: vec![] });

        tx.send_replace(evaluator(&["steam.exe"], &[], false));
        let outcome = enforcement.run_cycle().await;
        assert!(matches!(outcome, CycleOutcome::Completed { ref blocked } if blocked.len() == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_shutdown() {
        let recorder = Arc::new(recorder(&[("chrome.exe", 10)]));
        let (enforcement, _tx) =
            enforcement_loop(recorder.clone(), evaluator(&["chrome.exe"], &[], false), false);
        let stats = enforcement.stats();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(enforcement.run(shutdown_rx));

        // Immediate tick plus two more at 2s and 4s.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(stats.snapshot().scans, 3);
    }

    #[test]
    fn test_block_event_shape() {
        let at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = block_event(
            &ProcessInfo {
                name: "chrome.exe".into(),
                pid: 4321,
            },
            "",
            at,
        );

        assert_eq!(event.kind, "app_block");
        assert_eq!(event.agent_id, None);
        assert_eq!(event.payload["at"], json!("2026-01-02T03:04:05Z"));
    }
}
