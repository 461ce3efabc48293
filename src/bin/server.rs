use clap::{App, Arg};
use plantbus::bridge::{PubSubBridge, BRIDGE_BROADCAST_BUFFER_SIZE};
use plantbus::config::PlantConfig;
use plantbus::{logging, server, Plant, SystemClock};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("plantbus-server")
        .version("0.1.0")
        .about("Virtual plant simulator and data-access server")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (TOML)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .value_name("SEED")
                .help("Seed for the simulation random source")
                .takes_value(true)
                .validator(|v| match v.parse::<u64>() {
                    Ok(_) => Ok(()),
                    Err(_) => Err("Seed must be a valid number".into()),
                }),
        )
        .get_matches();

    let mut config = PlantConfig::load(matches.value_of("config").map(Path::new))?;
    if let Some(seed) = matches.value_of("seed") {
        config.simulation.seed = Some(seed.parse()?);
    }

    logging::init(&config.logging);
    info!(
        "Starting plant with {} devices, retention {} samples per signal",
        config.devices.len(),
        config.store.retention
    );

    let plant = Plant::from_config(&config, Arc::new(SystemClock))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (bridge_tx, _) = broadcast::channel(BRIDGE_BROADCAST_BUFFER_SIZE);

    let engine = plant.engine(config.simulation.seed);
    let engine_task = tokio::spawn(engine.run(Duration::from_millis(config.simulation.tick_ms), shutdown_rx.clone()));

    let bridge_task = if config.bridge.enabled {
        match PubSubBridge::new(plant.gateway.clone(), &config.bridge) {
            Some(bridge) => Some(tokio::spawn(bridge.run(
                Duration::from_millis(config.bridge.interval_ms),
                bridge_tx.clone(),
                shutdown_rx.clone(),
            ))),
            None => {
                warn!("Bridge signal {} is not registered, bridge disabled", config.bridge.signal);
                None
            }
        }
    } else {
        None
    };

    let hub = Arc::clone(&plant.hub);
    let reap_period = Duration::from_millis(config.subscription.reap_interval_ms.max(1));
    let mut reap_shutdown = shutdown_rx.clone();
    let reaper_task = tokio::spawn(async move {
        let mut interval = time::interval(reap_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let reaped = hub.reap_idle();
                    if !reaped.is_empty() {
                        debug!("Reaped idle subscriptions {:?}", reaped);
                    }
                }
                changed = reap_shutdown.changed() => {
                    if changed.is_err() || *reap_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    let server_task = tokio::spawn(server::serve(
        listener,
        plant.gateway.clone(),
        bridge_tx,
        config.subscription.default_queue_depth,
        shutdown_rx,
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    for task in [engine_task, reaper_task, server_task] {
        if let Err(e) = task.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    if let Some(task) = bridge_task {
        if let Err(e) = task.await {
            warn!("Bridge task ended abnormally: {}", e);
        }
    }

    info!("Plant stopped");
    Ok(())
}
