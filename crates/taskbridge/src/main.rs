//! Taskbridge binary
//!
//! Runs a bridge configured from `TASKBRIDGE_*` environment variables until
//! interrupted, logging every bridge event.

use anyhow::{Context, Result};
use taskbridge::{BridgeConfig, BridgeEvent, TaskBridge};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = BridgeConfig::from_env().context("invalid bridge configuration")?;
    info!("Starting task bridge {} on {}", config.name, config.socket_path.display());

    let bridge = TaskBridge::new(config);
    let mut events = bridge.subscribe();
    bridge
        .initialize()
        .await
        .context("failed to start the bridge")?;

    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::AgentRegistered { agent, capabilities } => {
                    info!("Agent {} available: {:?}", agent, capabilities);
                }
                BridgeEvent::TaskCompleted(done) => match &done.error {
                    None => info!("Task {} done by {} in {:?}", done.task_id, done.agent, done.duration),
                    Some(e) => warn!("Task {} failed on {}: {}", done.task_id, done.agent, e),
                },
                BridgeEvent::TaskExpired { task_id, agent } => {
                    warn!("Task {} on {} expired", task_id, agent);
                }
                BridgeEvent::ConnectionLost { attempts } => {
                    error!("Peer lost after {} reconnect windows", attempts);
                }
                other => info!("Event: {:?}", other),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    info!("Interrupted, shutting down");
    bridge.shutdown().await;
    logger.abort();
    Ok(())
}
