//! Frame routing and session management.
//!
//! The dispatcher is the single owner of all vehicle state. It is a
//! synchronous core: the server feeds it raw buffers and timer ticks,
//! and it returns events to broadcast plus messages to put back on the
//! wire. Keeping it free of I/O and clocks (ticks carry their own
//! `Instant`) makes the whole routing layer testable without sockets.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use mavlink::common::MavMessage;
use tracing::{debug, info, warn};

use crate::codec::{Codec, Frame, FrameBody};
use crate::commands::CommandEncoder;
use crate::events::VehicleEvent;
use crate::mission::{MissionItem, MissionTransfer, TransferResult};
use crate::vehicle::{Vehicle, VehicleOptions, VehicleState};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub gcs_system_id: u8,
    pub gcs_component_id: u8,
    /// Quiet interval after which a vehicle counts as lost.
    pub heartbeat_timeout: Duration,
    pub vehicle: VehicleOptions,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            gcs_system_id: 255,
            gcs_component_id: 190,
            heartbeat_timeout: Duration::from_millis(3500),
            vehicle: VehicleOptions::default(),
        }
    }
}

/// Link-level counters, exposed for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct DispatchStats {
    pub frames: u64,
    /// Frames implied missing by sequence-number gaps.
    pub lost: u64,
    pub decode_errors: u64,
    /// Frames dropped because no session existed for their sender.
    pub unbound: u64,
    /// Occurrences per unknown message id.
    pub unknown: HashMap<u32, u64>,
}

/// What one buffer or tick produced.
#[derive(Debug, Default)]
pub struct DispatchOutput {
    pub events: Vec<VehicleEvent>,
    /// Protocol replies to encode and send on the vehicle link.
    pub outbound: Vec<MavMessage>,
    /// Messages to mirror onto secondary links (antenna tracker etc).
    pub forward: Vec<MavMessage>,
}

impl DispatchOutput {
    fn merge(&mut self, other: DispatchOutput) {
        self.events.extend(other.events);
        self.outbound.extend(other.outbound);
        self.forward.extend(other.forward);
    }
}

struct Session {
    vehicle: Vehicle,
    mission: MissionTransfer,
    encoder: CommandEncoder,
    /// Last sequence number seen, per component; each component runs its
    /// own counter.
    last_seq: HashMap<u8, u8>,
    last_heartbeat: Instant,
    lost: bool,
    /// Command codes sent and not yet acknowledged.
    pending_commands: HashSet<u32>,
    /// Waypoints from the last completed download.
    waypoints: Vec<MissionItem>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    sessions: HashMap<u8, Session>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            stats: DispatchStats::default(),
        }
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn system_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self, system_id: u8) -> Option<VehicleState> {
        self.sessions.get(&system_id).map(|s| s.vehicle.snapshot())
    }

    pub fn encoder(&self, system_id: u8) -> Option<CommandEncoder> {
        self.sessions.get(&system_id).map(|s| s.encoder)
    }

    /// Decode and route every frame in `buf`. A framing error abandons
    /// the rest of the buffer; with datagram transports that is at most
    /// the tail of one datagram.
    pub fn handle_buffer(&mut self, buf: &[u8], now: Instant) -> DispatchOutput {
        let mut out = DispatchOutput::default();
        let mut rest = buf;
        while !rest.is_empty() {
            match Codec::decode(rest) {
                Ok((frame, used)) => {
                    rest = &rest[used..];
                    out.merge(self.handle_frame(frame, now));
                }
                Err(e) => {
                    self.stats.decode_errors += 1;
                    debug!(error = %e, "dropping undecodable tail");
                    break;
                }
            }
        }
        out
    }

    pub fn handle_frame(&mut self, frame: Frame, now: Instant) -> DispatchOutput {
        let mut out = DispatchOutput::default();
        self.stats.frames += 1;

        // Our own traffic looping back is not telemetry.
        if frame.system_id == self.config.gcs_system_id {
            return out;
        }

        if let FrameBody::Unknown { message_id } = frame.body {
            let count = self.stats.unknown.entry(message_id).or_insert(0);
            *count += 1;
            if *count == 1 {
                info!(message_id, system_id = frame.system_id, "unknown message id");
            }
            return out;
        }
        let FrameBody::Known(msg) = frame.body else {
            return out;
        };

        // Sessions bind on heartbeat only. Anything else from an unbound
        // system id is counted and dropped.
        if !self.sessions.contains_key(&frame.system_id) {
            if matches!(msg, MavMessage::HEARTBEAT(_)) {
                info!(system_id = frame.system_id, "new vehicle session");
                self.sessions.insert(
                    frame.system_id,
                    Session {
                        vehicle: Vehicle::new(frame.system_id, self.config.vehicle.clone()),
                        mission: MissionTransfer::new(frame.system_id, frame.component_id),
                        encoder: CommandEncoder::new(frame.system_id, frame.component_id),
                        last_seq: HashMap::new(),
                        last_heartbeat: now,
                        lost: false,
                        pending_commands: HashSet::new(),
                        waypoints: Vec::new(),
                    },
                );
            } else {
                self.stats.unbound += 1;
                return out;
            }
        }
        let session = self.sessions.get_mut(&frame.system_id).unwrap();

        if let Some(last) = session.last_seq.insert(frame.component_id, frame.sequence) {
            let gap = frame.sequence.wrapping_sub(last.wrapping_add(1));
            self.stats.lost += u64::from(gap);
        }

        if matches!(msg, MavMessage::HEARTBEAT(_)) {
            session.last_heartbeat = now;
        }

        // Mission traffic addressed to another station is cross-talk.
        if let Some(target) = mission_target(&msg) {
            if target != 0 && target != self.config.gcs_system_id {
                debug!(
                    system_id = frame.system_id,
                    target, "mission message for another station"
                );
                return out;
            }
            let step = session.mission.handle(&msg);
            out.outbound.extend(step.reply);
            if let Some(result) = step.completed {
                debug!(system_id = frame.system_id, ?result, "mission transfer done");
                if let TransferResult::Downloaded(items) = &result {
                    session.waypoints = items.clone();
                }
                out.events.push(VehicleEvent::MissionTransferComplete {
                    system_id: frame.system_id,
                    result,
                });
            }
        }

        let mut events = session.vehicle.apply(frame.component_id, &msg);
        if session.lost {
            for e in events.iter_mut() {
                if let VehicleEvent::Connected { system_id } = *e {
                    *e = VehicleEvent::ConnectionRegained { system_id };
                    session.lost = false;
                }
            }
        }
        for e in &events {
            if let VehicleEvent::CommandResult { command, .. } = e {
                session.pending_commands.remove(command);
            }
        }
        out.events.extend(events);

        // Position fan-out keeps antenna trackers and listening tools fed.
        if matches!(msg, MavMessage::GLOBAL_POSITION_INT(_)) {
            out.forward.push(msg);
        }

        out
    }

    /// Periodic tick: heartbeat watchdog plus mission retry timers.
    pub fn tick(&mut self, now: Instant) -> DispatchOutput {
        let mut out = DispatchOutput::default();
        for session in self.sessions.values_mut() {
            if session.vehicle.connection_alive()
                && now.duration_since(session.last_heartbeat) > self.config.heartbeat_timeout
            {
                if let Some(event) = session.vehicle.mark_connection_lost() {
                    warn!(system_id = session.vehicle.system_id(), "heartbeat lost");
                    session.lost = true;
                    out.events.push(event);
                }
            }
            let step = session.mission.on_tick();
            out.outbound.extend(step.reply);
            if let Some(result) = step.completed {
                if matches!(result, TransferResult::TimedOut) {
                    warn!(
                        system_id = session.vehicle.system_id(),
                        "mission transfer abandoned"
                    );
                }
                out.events.push(VehicleEvent::MissionTransferComplete {
                    system_id: session.vehicle.system_id(),
                    result,
                });
            }
        }
        out
    }

    /// Mark every live session lost. Called when the link shuts down so
    /// subscribers hear one final disconnect per vehicle.
    pub fn disconnect_all(&mut self) -> Vec<VehicleEvent> {
        let mut events = Vec::new();
        for session in self.sessions.values_mut() {
            if let Some(event) = session.vehicle.mark_connection_lost() {
                session.lost = true;
                events.push(event);
            }
        }
        events
    }

    /// Record a command as in flight until the matching COMMAND_ACK
    /// arrives.
    pub fn note_command_sent(&mut self, system_id: u8, command: u32) {
        if let Some(session) = self.sessions.get_mut(&system_id) {
            session.pending_commands.insert(command);
        }
    }

    /// Command codes sent to `system_id` that have not been acknowledged.
    pub fn pending_commands(&self, system_id: u8) -> Vec<u32> {
        let mut codes: Vec<u32> = self
            .sessions
            .get(&system_id)
            .map(|s| s.pending_commands.iter().copied().collect())
            .unwrap_or_default();
        codes.sort_unstable();
        codes
    }

    pub fn start_mission_download(&mut self, system_id: u8) -> Option<MavMessage> {
        self.sessions
            .get_mut(&system_id)
            .and_then(|s| s.mission.start_download())
    }

    /// Waypoints from the vehicle's last completed download, empty until
    /// one finishes.
    pub fn waypoints(&self, system_id: u8) -> Option<Vec<MissionItem>> {
        self.sessions.get(&system_id).map(|s| s.waypoints.clone())
    }

    pub fn start_mission_upload(
        &mut self,
        system_id: u8,
        items: Vec<MissionItem>,
    ) -> Option<MavMessage> {
        self.sessions
            .get_mut(&system_id)
            .and_then(|s| s.mission.start_upload(items))
    }
}

/// Target system id for mission protocol messages, `None` for everything
/// else.
fn mission_target(msg: &MavMessage) -> Option<u8> {
    match msg {
        MavMessage::MISSION_COUNT(d) => Some(d.target_system),
        MavMessage::MISSION_ITEM_INT(d) => Some(d.target_system),
        MavMessage::MISSION_ITEM(d) => Some(d.target_system),
        MavMessage::MISSION_REQUEST_INT(d) => Some(d.target_system),
        MavMessage::MISSION_REQUEST(d) => Some(d.target_system),
        MavMessage::MISSION_ACK(d) => Some(d.target_system),
        _ => None,
    }
}
