//! ExamShield EDU control server

use anyhow::Context;
use examshield::policy::{Policy, PolicyService};
use examshield::server::{self, AppState};
use examshield::{logging, ServerConfig};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    info!("🛡️  ExamShield server starting...");

    let config = ServerConfig::from_env()?;
    let policy = match &config.policy_path {
        Some(path) => Policy::from_file(path)?,
        None => Policy::builtin(),
    };
    info!(
        version = policy.version,
        blocked = policy.blocklist.len(),
        allowed = policy.allowlist.len(),
        source = config
            .policy_path
            .as_ref()
            .map_or_else(|| "builtin".to_string(), |p| p.display().to_string()),
        "✅ Policy loaded"
    );

    let state = AppState::new(PolicyService::new(policy), config.stale_threshold());
    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!(addr = %listener.local_addr()?, "🚀 Listening");

    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    })
    .await?;

    info!("ExamShield server stopped");
    Ok(())
}
