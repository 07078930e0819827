//! Periodic state publisher.
//!
//! Every interval the current snapshot of each bound vehicle goes out on
//! `POSITION/{serial}` as JSON. Read-only: the publisher never touches
//! the dispatcher beyond taking snapshots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rumqttc::{AsyncClient, QoS};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, error};

use crate::config::CONFIG;
use crate::mav_server::MavlinkServer;

pub async fn telemetry_loop(client: AsyncClient, server: MavlinkServer, running: Arc<AtomicBool>) {
    let serial = CONFIG.general.station_id.clone();
    let interval_secs = CONFIG.bridge.telemetry_interval;
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let topic = format!("POSITION/{serial}");

    while running.load(Ordering::SeqCst) {
        interval.tick().await;

        let snapshots: Vec<_> = server
            .system_ids()
            .into_iter()
            .filter_map(|id| server.snapshot(id))
            .collect();
        if snapshots.is_empty() {
            continue;
        }

        let payload = match serde_json::to_string(&json!({ "vehicles": snapshots })) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Bridge - Failed to serialize snapshots: {}", e);
                continue;
            }
        };

        debug!("Bridge - Publishing telemetry: {}", payload);
        match client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            Ok(_) => debug!("Bridge - Successfully published telemetry"),
            Err(e) => error!("Bridge - Failed to publish telemetry: {}", e),
        }
    }
}
