//! Agent runtime - enrollment, then the heartbeat, enforcement and policy
//! refresh loops side by side until shutdown.
//!
//! Only enrollment failure is fatal. Local state that cannot be read or
//! written is logged and the agent keeps enforcing.

use crate::client::{AgentSession, Credentials, ServerClient};
use crate::config::{AgentConfig, LocalConfig};
use crate::credentials::CredentialStore;
use crate::enforcement::{Collaborators, EnforcementLoop, Notifier};
use crate::heartbeat::HeartbeatLoop;
use crate::notify::TelegramNotifier;
use crate::platform::{ScreenCapture, SystemProcesses};
use crate::policy::Policy;
use crate::policy_evaluator::PolicyEvaluator;
use crate::protocol::EnrollRequest;
use crate::refresh::{PolicyRefreshLoop, PolicySource};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Run the agent until `shutdown` flips to true
pub async fn run(config: AgentConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    if let Err(e) = std::fs::create_dir_all(&config.state_dir) {
        warn!(
            dir = %config.state_dir.display(),
            error = %e,
            "cannot create state directory, continuing without local state"
        );
    }

    let client = ServerClient::new(&config.server_url, config.http_timeout)
        .context("failed to build HTTP client")?;
    let store = CredentialStore::new(&config.state_dir);
    let credentials = ensure_enrolled(&client, &store).await?;
    info!(agent_id = %credentials.agent_id, server = %client.base_url(), "✅ Agent enrolled");

    let local = LocalConfig::load(&config.local_config_path());

    let policy = initial_policy(&client).await;
    let evaluator = PolicyEvaluator::new(&policy, &local);
    info!(
        version = evaluator.version(),
        blocked = evaluator.blocklist().len(),
        allowed = evaluator.allowlist().len(),
        "✅ Policy loaded"
    );
    let (policy_tx, policy_rx) = watch::channel(Arc::new(evaluator));

    let notifier = TelegramNotifier::from_local(&local, config.http_timeout)
        .context("failed to build Telegram client")?
        .map(|n| Arc::new(n) as Arc<dyn Notifier>);
    if notifier.is_some() {
        info!("✅ Telegram alerts enabled");
    }

    let session = Arc::new(AgentSession::new(client.clone(), credentials));
    let processes = Arc::new(SystemProcesses);
    let enforcement = EnforcementLoop::new(
        Collaborators {
            lister: processes.clone(),
            terminator: processes,
            evidence: Arc::new(ScreenCapture::new(&config.state_dir)),
            events: session.clone(),
            notifier,
        },
        policy_rx,
        config.scan_interval,
    );
    let stats = enforcement.stats();

    let heartbeat = HeartbeatLoop::new(session, config.heartbeat_interval)
        .with_alarm_after(config.heartbeat_alarm_after);
    let refresh = PolicyRefreshLoop::new(
        Arc::new(client),
        local,
        policy_tx,
        config.policy_refresh_interval,
        policy,
    );

    info!("🚀 Agent running");

    let (enforcement_result, heartbeat_result, refresh_result) = tokio::join!(
        tokio::spawn(enforcement.run(shutdown.clone())),
        tokio::spawn(heartbeat.run(shutdown.clone())),
        tokio::spawn(refresh.run(shutdown)),
    );
    enforcement_result.context("enforcement task panicked")?;
    heartbeat_result.context("heartbeat task panicked")?;
    refresh_result.context("policy refresh task panicked")?;

    let stats = stats.snapshot();
    info!(
        scans = stats.scans,
        blocks = stats.blocks,
        scan_failures = stats.scan_failures,
        delivery_failures = stats.delivery_failures,
        "📊 Enforcement totals"
    );
    Ok(())
}

/// Stored credentials, or a fresh enrollment persisted for next time
pub async fn ensure_enrolled(client: &ServerClient, store: &CredentialStore) -> anyhow::Result<Credentials> {
    match store.load() {
        Ok(Some(credentials)) => return Ok(credentials),
        Ok(None) => {}
        Err(e) => warn!(dir = %store.dir().display(), error = %e, "unreadable credentials, enrolling again"),
    }

    let credentials = client
        .enroll(&enroll_request())
        .await
        .context("enrollment failed")?;
    if let Err(e) = store.save(&credentials) {
        warn!(
            dir = %store.dir().display(),
            error = %e,
            "failed to persist credentials, this host will enroll again on restart"
        );
    }
    Ok(credentials)
}

/// Policy to enforce before the first refresh.
///
/// Falls back to an empty policy, which enforces the default blocklist.
pub async fn initial_policy(source: &dyn PolicySource) -> Policy {
    match source.fetch_policy().await {
        Ok(policy) => policy,
        Err(e) => {
            warn!(error = %e, "policy fetch failed, enforcing the default blocklist until the next refresh");
            Policy::default()
        }
    }
}

fn enroll_request() -> EnrollRequest {
    EnrollRequest {
        hostname: hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string()),
        os: std::env::consts::OS.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}
