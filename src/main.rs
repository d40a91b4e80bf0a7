//! ExamShield EDU agent daemon
//!
//! Enrolls with the control server, then enforces the exam policy on this
//! host until Ctrl+C.

use examshield::{agent, logging, AgentConfig};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    info!("🛡️  ExamShield agent starting...");

    let config = AgentConfig::from_env();
    info!(
        server = %config.server_url,
        state_dir = %config.state_dir.display(),
        "✅ Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut agent = tokio::spawn(agent::run(config, shutdown_rx));

    tokio::select! {
        result = &mut agent => {
            // Only returns early on a startup failure
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = agent.await? {
        error!(error = %e, "agent stopped with an error");
        return Err(e);
    }

    info!("ExamShield agent stopped");
    Ok(())
}
