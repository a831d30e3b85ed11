use clap::Parser;
use std::sync::Arc;
use tabmux_agent::bridge::{spawn_bridge, HostOutbound};
use tabmux_agent::config::{AgentConfig, Args};
use tabmux_agent::logging::init_logging;
use tabmux_agent::{Agent, AgentError, Identity, IdentityManager};
use tabmux_core::clock::SystemClock;
use tabmux_core::sort::SortedEntry;
use tabmux_storage::{SqliteArea, StorageArea};
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    if let Err(err) = run(Args::parse()).await {
        eprintln!("tabmux-agent: {err}");
        std::process::exit(2);
    }
}

async fn run(args: Args) -> Result<(), AgentError> {
    let config = AgentConfig::load(args)?;
    // The instance id names the log file, so identity resolves before logging.
    let (identity, identity_error) = match load_identity(&config) {
        Ok(identity) => (identity, None),
        Err(err) => (Identity::ephemeral(), Some(err)),
    };
    let _log_guard = init_logging(&config.log_dir, &identity.instance_id, config.log_stderr);
    if let Some(err) = identity_error {
        warn!(event = "identity_storage_unavailable", error = %err, fallback = "ephemeral");
    }
    info!(
        event = "agent_starting",
        url = %config.url,
        instance_id = %identity.instance_id,
        runtime_session_id = %identity.runtime_session_id,
        session_marker = %config.session_marker
    );

    let bridge = spawn_bridge(tokio::io::stdin(), tokio::io::stdout(), config.bridge);
    let mut agent = Agent::new(
        &config,
        identity,
        bridge.browser.clone(),
        Arc::new(SystemClock),
    );
    let views = bridge.outbound.clone();
    agent.subscribe_view(Box::new(move |strategy, entries: &[SortedEntry]| {
        let _ = views.send(HostOutbound::View {
            strategy,
            entries: entries.to_vec(),
        });
    }));

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(event = "signal_handler_failed", error = %err);
            std::future::pending::<()>().await;
        }
    };
    agent.run(bridge.events, shutdown).await;
    info!(event = "agent_stopped");
    Ok(())
}

/// A failure here leaves the agent on a process-local identity; the
/// companion then sees a new profile, which it tolerates.
fn load_identity(config: &AgentConfig) -> Result<Identity, AgentError> {
    std::fs::create_dir_all(&config.state_dir)?;
    let durable: Arc<dyn StorageArea> =
        Arc::new(SqliteArea::open(config.state_dir.join("durable.sqlite"))?);
    let session: Arc<dyn StorageArea> = Arc::new(SqliteArea::open_session(
        config.state_dir.join("session.sqlite"),
        &config.session_marker,
    )?);
    Ok(IdentityManager::new(durable, session).load()?)
}
