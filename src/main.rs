use std::sync::Arc;

use anyhow::{Context, Result};

use groundlink::bridge::BridgeServer;
use groundlink::config::CONFIG;
use groundlink::link::UdpLink;
use groundlink::mav_server::MavlinkServer;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    info!("Ground station starting...");
    info!("Listening for MAVLink on {}", CONFIG.mavlink.listen_addr);

    // Create a shutdown signal channel
    let (shutdown_tx, _) = broadcast::channel(1);

    let link = UdpLink::bind(&CONFIG.mavlink.listen_addr)
        .with_context(|| format!("binding {}", CONFIG.mavlink.listen_addr))?;
    let mav_server = MavlinkServer::new(Arc::new(link), CONFIG.dispatcher());

    let event_handle = spawn_event_logger(&mav_server, shutdown_tx.subscribe());
    let bridge_handle = if CONFIG.bridge.enabled {
        info!("Starting MQTT bridge...");
        let bridge = BridgeServer::new(mav_server.handle());
        spawn_bridge(bridge, shutdown_tx.subscribe())
    } else {
        info!("Bridge disabled in config, skipping...");
        tokio::spawn(async {})
    };
    let mav_handle = spawn_mav_server(mav_server, shutdown_tx.subscribe());

    let shutdown_signal = async {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping services...");
                shutdown_tx
                    .send(())
                    .expect("Failed to send shutdown signal");
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    };

    let results = tokio::join!(mav_handle, bridge_handle, event_handle, shutdown_signal);

    for (result, name) in [results.0, results.1, results.2]
        .into_iter()
        .zip(["MAVLink server", "bridge", "event logger"])
    {
        if let Err(e) = result {
            error!("{} join error: {}", name, e);
        }
    }

    info!("All services stopped, shutting down");

    Ok(())
}

fn spawn_mav_server(
    server: MavlinkServer,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let run = server.start();
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => {
                if let Err(e) = result {
                    error!("MAVLink server error: {}", e);
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down MAVLink server...");
                server.stop();
                // Let the run loop drain and emit the final disconnects.
                if let Err(e) = run.await {
                    error!("MAVLink server error: {}", e);
                }
            }
        }
    })
}

fn spawn_bridge(
    mut bridge: BridgeServer,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            result = bridge.start() => {
                if let Err(e) = result {
                    error!("Bridge error: {}", e);
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down bridge...");
                bridge.stop().await;
            }
        }
    })
}

fn spawn_event_logger(
    server: &MavlinkServer,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => info!(?event, "vehicle event"),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        error!("event logger lagged, {} events dropped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.recv() => break,
            }
        }
    })
}

fn setup_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .pretty(),
        )
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&CONFIG.general.log_level)),
        )
        .try_init()
        .expect("Failed to initialize logging");
}
