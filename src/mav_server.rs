//! Async shell around the dispatcher.
//!
//! One blocking reader thread per link feeds an mpsc channel; a single
//! async task drains it into the dispatcher, so the dispatcher never
//! needs to be shared across writers. Events fan out on a broadcast
//! channel to whoever cares.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mavlink::common::MavMessage;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::codec::Codec;
use crate::commands::CommandEncoder;
use crate::dispatcher::{DispatchOutput, Dispatcher, DispatcherConfig, DispatchStats};
use crate::error::LinkError;
use crate::events::VehicleEvent;
use crate::link::LinkTransport;
use crate::mission::MissionItem;
use crate::vehicle::VehicleState;

/// Watchdog and mission-retry cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 256;
const READ_QUEUE: usize = 64;

struct Inner {
    link: Arc<dyn LinkTransport>,
    /// Links that receive mirrored position traffic.
    forward_links: Mutex<Vec<Arc<dyn LinkTransport>>>,
    dispatcher: Mutex<Dispatcher>,
    codec: Mutex<Codec>,
    events: broadcast::Sender<VehicleEvent>,
}

pub struct MavlinkServer {
    inner: Arc<Inner>,
}

impl MavlinkServer {
    pub fn new(link: Arc<dyn LinkTransport>, config: DispatcherConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let codec = Codec::new(config.gcs_system_id, config.gcs_component_id);
        Self {
            inner: Arc::new(Inner {
                link,
                forward_links: Mutex::new(Vec::new()),
                dispatcher: Mutex::new(Dispatcher::new(config)),
                codec: Mutex::new(codec),
                events,
            }),
        }
    }

    /// Cheap clone sharing the same link and dispatcher; hand these to
    /// the bridge and other command sources.
    pub fn handle(&self) -> MavlinkServer {
        MavlinkServer {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VehicleEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_forward_link(&self, link: Arc<dyn LinkTransport>) {
        self.inner.forward_links.lock().unwrap().push(link);
    }

    pub fn system_ids(&self) -> Vec<u8> {
        self.inner.dispatcher.lock().unwrap().system_ids()
    }

    pub fn snapshot(&self, system_id: u8) -> Option<VehicleState> {
        self.inner.dispatcher.lock().unwrap().snapshot(system_id)
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.dispatcher.lock().unwrap().stats().clone()
    }

    /// Encode and send one message on the vehicle link. The codec lock is
    /// held across the write so wire order matches sequence order.
    pub fn send(&self, msg: &MavMessage) -> Result<()> {
        let mut codec = self.inner.codec.lock().unwrap();
        let buf = codec.encode(msg).context("encoding outbound message")?;
        self.inner
            .link
            .write_frame(&buf)
            .context("writing to vehicle link")?;
        Ok(())
    }

    /// Build a command against a bound vehicle and send it once.
    pub fn send_command<F>(&self, system_id: u8, build: F) -> Result<()>
    where
        F: FnOnce(&CommandEncoder) -> MavMessage,
    {
        let encoder = self
            .inner
            .dispatcher
            .lock()
            .unwrap()
            .encoder(system_id)
            .with_context(|| format!("no session for system id {system_id}"))?;
        let msg = build(&encoder);
        let command = match &msg {
            MavMessage::COMMAND_LONG(data) => Some(data.command as u32),
            MavMessage::COMMAND_INT(data) => Some(data.command as u32),
            _ => None,
        };
        self.send(&msg)?;
        if let Some(command) = command {
            self.inner
                .dispatcher
                .lock()
                .unwrap()
                .note_command_sent(system_id, command);
        }
        Ok(())
    }

    /// Command codes sent to a vehicle that have not been acknowledged yet.
    pub fn pending_commands(&self, system_id: u8) -> Vec<u32> {
        self.inner
            .dispatcher
            .lock()
            .unwrap()
            .pending_commands(system_id)
    }

    /// Waypoints from the vehicle's last completed mission download.
    pub fn waypoints(&self, system_id: u8) -> Option<Vec<MissionItem>> {
        self.inner.dispatcher.lock().unwrap().waypoints(system_id)
    }

    pub fn start_mission_download(&self, system_id: u8) -> Result<()> {
        let msg = self
            .inner
            .dispatcher
            .lock()
            .unwrap()
            .start_mission_download(system_id)
            .with_context(|| format!("mission transfer busy or no session for {system_id}"))?;
        self.send(&msg)
    }

    pub fn start_mission_upload(&self, system_id: u8, items: Vec<MissionItem>) -> Result<()> {
        let msg = self
            .inner
            .dispatcher
            .lock()
            .unwrap()
            .start_mission_upload(system_id, items)
            .with_context(|| format!("mission transfer busy or no session for {system_id}"))?;
        self.send(&msg)
    }

    /// Run until the link closes or `stop` is called.
    pub async fn start(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(READ_QUEUE);
        let link = Arc::clone(&self.inner.link);
        let reader = tokio::task::spawn_blocking(move || loop {
            match link.read_frame() {
                Ok(buf) => {
                    if tx.blocking_send(buf).is_err() {
                        break;
                    }
                }
                Err(LinkError::Closed) => break,
                Err(e) => {
                    error!("link read failed: {e}");
                    break;
                }
            }
        });

        info!("MAVLink server started");
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                buf = rx.recv() => match buf {
                    Some(buf) => {
                        let out = self
                            .inner
                            .dispatcher
                            .lock()
                            .unwrap()
                            .handle_buffer(&buf, Instant::now());
                        self.flush(out);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let out = self.inner.dispatcher.lock().unwrap().tick(Instant::now());
                    self.flush(out);
                }
            }
        }

        reader.await.context("joining link reader")?;
        let events = self.inner.dispatcher.lock().unwrap().disconnect_all();
        self.flush(DispatchOutput {
            events,
            ..Default::default()
        });
        info!("MAVLink server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.link.close();
    }

    #[cfg(test)]
    pub(crate) fn feed_for_tests(&self, buf: &[u8]) {
        let out = self
            .inner
            .dispatcher
            .lock()
            .unwrap()
            .handle_buffer(buf, Instant::now());
        self.flush(out);
    }

    fn flush(&self, out: DispatchOutput) {
        for event in out.events {
            // No receivers is fine; broadcast drops the event.
            let _ = self.inner.events.send(event);
        }
        for msg in out.outbound {
            if let Err(e) = self.send(&msg) {
                warn!("failed to send protocol reply: {e}");
            }
        }
        if out.forward.is_empty() {
            return;
        }
        let forward_links = self.inner.forward_links.lock().unwrap().clone();
        for msg in out.forward {
            for fwd in &forward_links {
                let encoded = self.inner.codec.lock().unwrap().encode(&msg);
                match encoded {
                    Ok(buf) => {
                        if let Err(e) = fwd.write_frame(&buf) {
                            warn!("forward link write failed: {e}");
                        }
                    }
                    Err(e) => warn!("forward encode failed: {e}"),
                }
            }
        }
    }
}
