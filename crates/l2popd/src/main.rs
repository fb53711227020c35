//! L2 Population Agent Entry Point

use l2pop_common::AgentConfig;
use l2popd::{Agent, ArpResponder, FdbSync, OvsFlowBackend, OvsOpenFlowApi};
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting l2popd");

    let Some(config) = AgentConfig::from_env() else {
        error!("Missing agent configuration, set L2POP_HOST and L2POP_LOCAL_IP");
        std::process::exit(1);
    };
    info!(
        host = %config.host,
        local_ip = %config.local_ip,
        bridge = %config.tunnel_bridge,
        "Agent configuration loaded"
    );

    let backend = OvsFlowBackend::new(&config.tunnel_bridge, &config.local_ip);
    let fdb = FdbSync::new(&config.host, &config.local_ip, backend);
    let responder = ArpResponder::new(OvsOpenFlowApi::new(&config.tunnel_bridge));

    let (tx, rx) = mpsc::channel(1024);
    let agent = Agent::new(fdb, responder, rx);

    // The RPC consumer and packet-in listener live outside this crate and
    // attach through this sender; holding it keeps the loop alive.
    let _tx = tx;

    if let Err(e) = agent.run().await {
        error!("Agent stopped on protocol violation: {}", e);
        std::process::exit(1);
    }
    info!("l2popd exiting");
}
