//! Notifications raised by the vehicle state model as telemetry lands.
//!
//! Events are fanned out on a `tokio::sync::broadcast` channel; slow
//! consumers lag rather than block the dispatch loop.

use mavlink::common::MavSeverity;

use crate::mission::TransferResult;
use crate::vehicle::{Attitude, Battery, Position};

/// Edge-triggered and informational events derived from inbound telemetry.
#[derive(Debug, Clone, PartialEq)]
pub enum VehicleEvent {
    /// First heartbeat from a previously unseen system id.
    Connected { system_id: u8 },
    /// Heartbeats stopped arriving for longer than the timeout.
    ConnectionLost { system_id: u8 },
    /// Heartbeats resumed after a loss.
    ConnectionRegained { system_id: u8 },
    /// Armed/disarmed flag flipped.
    ArmedChanged { system_id: u8, armed: bool },
    /// Autopilot custom mode changed.
    ModeChanged { system_id: u8, custom_mode: u32 },
    /// Filtered battery voltage dropped below the warning threshold.
    BatteryLow { system_id: u8, voltage: f64, percent: f64 },
    /// Voltage recovered above the warning threshold.
    BatteryOk { system_id: u8 },
    /// GPS fix acquired for the first time since connect.
    PositionLock { system_id: u8 },
    /// New attitude solution applied to the model.
    AttitudeChanged { system_id: u8, attitude: Attitude },
    /// Position fix applied to the model.
    PositionChanged { system_id: u8, position: Position },
    /// Battery telemetry refreshed, filtered values included.
    BatteryChanged { system_id: u8, battery: Battery },
    /// STATUSTEXT from the autopilot, severity preserved.
    StatusText {
        system_id: u8,
        severity: MavSeverity,
        text: String,
    },
    /// NAMED_VALUE_FLOAT debug channel.
    NamedValue {
        system_id: u8,
        name: String,
        value: f32,
    },
    /// Parameter value received or refreshed.
    ParamChanged {
        system_id: u8,
        component_id: u8,
        name: String,
        value: f32,
        index: u16,
        count: u16,
    },
    /// COMMAND_ACK resolved an in-flight command.
    CommandResult {
        system_id: u8,
        command: u32,
        accepted: bool,
    },
    /// Current mission sequence number changed.
    MissionCurrent { system_id: u8, seq: u16 },
    /// Vehicle reports a waypoint as reached.
    MissionItemReached { system_id: u8, seq: u16 },
    /// A mission transfer finished; the result carries the downloaded
    /// waypoints or the failure.
    MissionTransferComplete {
        system_id: u8,
        result: TransferResult,
    },
    /// Telemetry carried a value the model cannot use (NaN altitude etc).
    TelemetryError { system_id: u8, detail: String },
}

impl VehicleEvent {
    pub fn system_id(&self) -> u8 {
        match self {
            Self::Connected { system_id }
            | Self::ConnectionLost { system_id }
            | Self::ConnectionRegained { system_id }
            | Self::ArmedChanged { system_id, .. }
            | Self::ModeChanged { system_id, .. }
            | Self::BatteryLow { system_id, .. }
            | Self::BatteryOk { system_id }
            | Self::PositionLock { system_id }
            | Self::AttitudeChanged { system_id, .. }
            | Self::PositionChanged { system_id, .. }
            | Self::BatteryChanged { system_id, .. }
            | Self::StatusText { system_id, .. }
            | Self::NamedValue { system_id, .. }
            | Self::ParamChanged { system_id, .. }
            | Self::CommandResult { system_id, .. }
            | Self::MissionCurrent { system_id, .. }
            | Self::MissionItemReached { system_id, .. }
            | Self::MissionTransferComplete { system_id, .. }
            | Self::TelemetryError { system_id, .. } => *system_id,
        }
    }
}
