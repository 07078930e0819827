//! MQTT JSON facade over the MAVLink core.
//!
//! One broker connection carries both directions: inbound instruction
//! requests and the periodic outbound state snapshots.

pub mod instructions;
pub mod remote;
pub mod telemetry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use crate::config::CONFIG;
use crate::mav_server::MavlinkServer;
use remote::RemoteBridgeClient;

pub struct BridgeServer {
    server: MavlinkServer,
    client: Option<RemoteBridgeClient>,
    running: Arc<AtomicBool>,
}

impl BridgeServer {
    pub fn new(server: MavlinkServer) -> Self {
        Self {
            server,
            client: None,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        info!(
            "Starting bridge... broker={}:{}",
            CONFIG.bridge.host, CONFIG.bridge.port
        );

        let mut client = RemoteBridgeClient::new(self.server.handle());
        let request_handle = client.start().await?;

        let telemetry_handle = match client.mqtt_client() {
            Some(mqtt) => tokio::spawn(telemetry::telemetry_loop(
                mqtt,
                self.server.handle(),
                self.running.clone(),
            )),
            None => tokio::spawn(async {}),
        };
        self.client = Some(client);

        for handle in [request_handle, telemetry_handle] {
            if let Err(e) = handle.await {
                error!("Bridge loop error: {}", e);
            }
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(client) = &self.client {
            client.stop().await;
        }
    }
}
