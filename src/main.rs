use clap::Parser;

use grid_manager::bus::client::BusClient;
use grid_manager::config::ManagerConfig;
use grid_manager::engine::{Collaborators, ManagerEngine};
use grid_manager::logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();
    let cfg = ManagerConfig::parse();

    log::info!("Starting manager node against bus at {}", cfg.bus_addr);
    let (bus, listener) = BusClient::connect(&cfg.bus_addr).await?;

    let engine = ManagerEngine::new(cfg, bus, Collaborators::standard());
    let handles = engine.clone().start(listener);

    let host_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "manager".to_string());
    match engine.register_manager(&host_name, &whoami()).await {
        Ok(reply) => log::info!("Manager registered: {}", reply.message.unwrap_or_default()),
        Err(e) => log::warn!("Manager registration did not complete: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    engine.shutdown();
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}
