use esspoll::{Config, PollCoordinator, RegisterSet, Topology};
use log::{debug, error, info};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    let default_filter = std::env::var("ESSPOLL_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let topology = match Topology::build(&config) {
        Ok(topology) => topology,
        Err(e) => {
            error!("Invalid device topology: {}", e);
            std::process::exit(1);
        }
    };

    let registers = match RegisterSet::load() {
        Ok(registers) => registers,
        Err(e) => {
            error!("Unable to load register tables: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting with {} devices on {} endpoints", topology.len(), topology.endpoints().len());
    let coordinator = PollCoordinator::start(&config, topology, registers);

    /* Dump every published snapshot for debugging purposes */
    let mut rx = coordinator.subscribe();
    let dumper = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            match serde_json::to_string(&snapshot) {
                Ok(json) => debug!("snapshot: {}", json),
                Err(e) => error!("Failed to serialize snapshot: {}", e),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    dumper.abort();
    coordinator.shutdown();
    return Ok(());
}
