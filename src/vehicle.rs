//! Per-vehicle telemetry state model.
//!
//! [`Vehicle::apply`] folds decoded messages into the state snapshot and
//! returns the events the change triggered. It never touches the link or
//! any clock-driven timers; the dispatcher owns those, which keeps this
//! module deterministic enough to test message by message.

use std::collections::HashMap;
use std::f32::consts::PI;

use chrono::Utc;
use mavlink::common::{
    GpsFixType, MavAutopilot, MavMessage, MavModeFlag, MavResult, ATTITUDE_DATA, COMMAND_ACK_DATA,
    GLOBAL_POSITION_INT_DATA, GPS_RAW_INT_DATA, HEARTBEAT_DATA, NAMED_VALUE_FLOAT_DATA,
    PARAM_VALUE_DATA, STATUSTEXT_DATA, SYS_STATUS_DATA, VFR_HUD_DATA,
};
use serde::Serialize;

use crate::events::VehicleEvent;

/// Onboard timestamps below this are boot-relative, not Unix epoch.
/// Forty years in microseconds; no airframe stays up that long.
const BOOT_EPOCH_CUTOFF_US: u64 = 1_261_440_000_000_000;

const FULL_CELL_VOLTAGE: f64 = 4.2;
const EMPTY_CELL_VOLTAGE: f64 = 3.5;

/// Tuning knobs sourced from the config file.
#[derive(Debug, Clone)]
pub struct VehicleOptions {
    /// Filtered-voltage threshold for the low battery alarm.
    pub warn_voltage: f64,
    /// LiPo cell count used when the autopilot does not report percent.
    pub battery_cells: u32,
    /// Stamp derived telemetry with the last attitude time instead of
    /// each message's own timestamp.
    pub attitude_stamped: bool,
}

impl Default for VehicleOptions {
    fn default() -> Self {
        Self {
            warn_voltage: 9.5,
            battery_cells: 3,
            attitude_stamped: false,
        }
    }
}

/// Latest attitude solution, radians, wrapped into (-pi, pi].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub roll_rate: f32,
    pub pitch_rate: f32,
    pub yaw_rate: f32,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Meters above mean sea level.
    pub altitude_amsl: f64,
    /// Meters above the home position.
    pub altitude_relative: f64,
    /// Ground velocity, meters per second, NED.
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GpsStatus {
    pub fix_3d: bool,
    pub satellites_visible: u8,
    /// Horizontal dilution of precision, meters.
    pub hdop: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Battery {
    /// Raw reported pack voltage, volts.
    pub voltage: f64,
    /// Low-pass filtered voltage used for alarms.
    pub filtered_voltage: f64,
    /// Amperes, negative when unreported.
    pub current: f64,
    /// 0..=100, estimated from voltage when the autopilot reports -1.
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Airdata {
    pub airspeed: f64,
    pub groundspeed: f64,
    pub heading: i16,
    /// Percent throttle.
    pub throttle: u16,
    pub climb_rate: f64,
    pub altitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamValue {
    pub value: f32,
    pub index: u16,
    pub count: u16,
}

/// Snapshot of everything known about one vehicle. Serialized as-is onto
/// the telemetry topic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VehicleState {
    pub system_id: u8,
    pub armed: bool,
    pub custom_mode: u32,
    pub flight_mode: String,
    pub vehicle_type: u8,
    pub autopilot: u8,
    pub system_status: u8,
    pub attitude: Attitude,
    pub position: Position,
    pub gps: GpsStatus,
    pub battery: Battery,
    pub airdata: Airdata,
    pub cpu_load: f64,
    pub current_mission_seq: u16,
    pub heartbeat_count: u64,
    pub last_heartbeat_ms: i64,
}

/// One vehicle's model: public snapshot plus the private filter and
/// clock-alignment state that feeds it.
#[derive(Debug)]
pub struct Vehicle {
    state: VehicleState,
    opts: VehicleOptions,
    params: HashMap<(u8, String), ParamValue>,
    /// now_ms - boot_time_ms, fixed at the first boot-relative timestamp.
    onboard_offset_ms: Option<i64>,
    battery_warned: bool,
    position_locked: bool,
    seen_heartbeat: bool,
}

impl Vehicle {
    pub fn new(system_id: u8, opts: VehicleOptions) -> Self {
        Self {
            state: VehicleState {
                system_id,
                ..Default::default()
            },
            opts,
            params: HashMap::new(),
            onboard_offset_ms: None,
            battery_warned: false,
            position_locked: false,
            seen_heartbeat: false,
        }
    }

    pub fn system_id(&self) -> u8 {
        self.state.system_id
    }

    pub fn state(&self) -> &VehicleState {
        &self.state
    }

    pub fn snapshot(&self) -> VehicleState {
        self.state.clone()
    }

    pub fn param(&self, component_id: u8, name: &str) -> Option<&ParamValue> {
        self.params.get(&(component_id, name.to_string()))
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Fold one decoded message into the model. Returns the events the
    /// update triggered, possibly none.
    pub fn apply(&mut self, component_id: u8, msg: &MavMessage) -> Vec<VehicleEvent> {
        match msg {
            MavMessage::HEARTBEAT(data) => self.apply_heartbeat(data),
            MavMessage::SYS_STATUS(data) => self.apply_sys_status(data),
            MavMessage::ATTITUDE(data) => self.apply_attitude(data),
            MavMessage::VFR_HUD(data) => self.apply_vfr_hud(data),
            MavMessage::GLOBAL_POSITION_INT(data) => self.apply_global_position(data),
            MavMessage::GPS_RAW_INT(data) => self.apply_gps_raw(data),
            MavMessage::PARAM_VALUE(data) => self.apply_param_value(component_id, data),
            MavMessage::COMMAND_ACK(data) => self.apply_command_ack(data),
            MavMessage::STATUSTEXT(data) => self.apply_statustext(data),
            MavMessage::NAMED_VALUE_FLOAT(data) => self.apply_named_value(data),
            MavMessage::MISSION_CURRENT(data) => {
                if self.state.current_mission_seq != data.seq {
                    self.state.current_mission_seq = data.seq;
                    vec![VehicleEvent::MissionCurrent {
                        system_id: self.state.system_id,
                        seq: data.seq,
                    }]
                } else {
                    Vec::new()
                }
            }
            MavMessage::MISSION_ITEM_REACHED(data) => vec![VehicleEvent::MissionItemReached {
                system_id: self.state.system_id,
                seq: data.seq,
            }],
            _ => Vec::new(),
        }
    }

    fn apply_heartbeat(&mut self, data: &HEARTBEAT_DATA) -> Vec<VehicleEvent> {
        let mut events = Vec::new();
        let sysid = self.state.system_id;

        if !self.seen_heartbeat {
            self.seen_heartbeat = true;
            events.push(VehicleEvent::Connected { system_id: sysid });
        }

        let armed = data
            .base_mode
            .contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED);
        if armed != self.state.armed {
            self.state.armed = armed;
            events.push(VehicleEvent::ArmedChanged {
                system_id: sysid,
                armed,
            });
        }

        if data.custom_mode != self.state.custom_mode || self.state.heartbeat_count == 0 {
            self.state.custom_mode = data.custom_mode;
            self.state.flight_mode = flight_mode_name(data.autopilot, data.custom_mode);
            events.push(VehicleEvent::ModeChanged {
                system_id: sysid,
                custom_mode: data.custom_mode,
            });
        }

        self.state.vehicle_type = data.mavtype as u8;
        self.state.autopilot = data.autopilot as u8;
        self.state.system_status = data.system_status as u8;
        self.state.heartbeat_count += 1;
        self.state.last_heartbeat_ms = Utc::now().timestamp_millis();
        events
    }

    fn apply_sys_status(&mut self, data: &SYS_STATUS_DATA) -> Vec<VehicleEvent> {
        let mut events = Vec::new();
        let sysid = self.state.system_id;

        let voltage = f64::from(data.voltage_battery) / 1000.0;
        let filtered = if self.state.battery.filtered_voltage > 0.0 {
            self.state.battery.filtered_voltage * 0.7 + voltage * 0.3
        } else {
            voltage
        };

        let percent = if data.battery_remaining >= 0 {
            f64::from(data.battery_remaining)
        } else {
            self.voltage_percent(filtered)
        };

        self.state.battery = Battery {
            voltage,
            filtered_voltage: filtered,
            current: if data.current_battery >= 0 {
                f64::from(data.current_battery) / 100.0
            } else {
                -1.0
            },
            percent,
        };
        self.state.cpu_load = f64::from(data.load) / 10.0;

        if filtered < self.opts.warn_voltage && voltage > 0.1 {
            if !self.battery_warned {
                self.battery_warned = true;
                events.push(VehicleEvent::BatteryLow {
                    system_id: sysid,
                    voltage: filtered,
                    percent,
                });
            }
        } else if self.battery_warned {
            self.battery_warned = false;
            events.push(VehicleEvent::BatteryOk { system_id: sysid });
        }
        events.push(VehicleEvent::BatteryChanged {
            system_id: sysid,
            battery: self.state.battery,
        });
        events
    }

    fn apply_attitude(&mut self, data: &ATTITUDE_DATA) -> Vec<VehicleEvent> {
        self.state.attitude = Attitude {
            roll: wrap_pi(data.roll),
            pitch: wrap_pi(data.pitch),
            yaw: wrap_pi(data.yaw),
            roll_rate: data.rollspeed,
            pitch_rate: data.pitchspeed,
            yaw_rate: data.yawspeed,
            timestamp_ms: self.unix_time_ms(u64::from(data.time_boot_ms) * 1000),
        };
        vec![VehicleEvent::AttitudeChanged {
            system_id: self.state.system_id,
            attitude: self.state.attitude,
        }]
    }

    fn apply_vfr_hud(&mut self, data: &VFR_HUD_DATA) -> Vec<VehicleEvent> {
        if !data.alt.is_finite() || !data.airspeed.is_finite() || !data.climb.is_finite() {
            return vec![VehicleEvent::TelemetryError {
                system_id: self.state.system_id,
                detail: "non-finite value in VFR_HUD".to_string(),
            }];
        }
        self.state.airdata = Airdata {
            airspeed: f64::from(data.airspeed),
            groundspeed: f64::from(data.groundspeed),
            heading: data.heading,
            throttle: data.throttle,
            climb_rate: f64::from(data.climb),
            altitude: f64::from(data.alt),
        };
        // Until an attitude solution arrives, the compass heading is the
        // best yaw estimate available.
        if self.state.attitude.timestamp_ms == 0 {
            self.state.attitude.yaw = wrap_pi((f32::from(data.heading)).to_radians());
        }
        Vec::new()
    }

    fn apply_global_position(&mut self, data: &GLOBAL_POSITION_INT_DATA) -> Vec<VehicleEvent> {
        self.state.position = Position {
            latitude: f64::from(data.lat) / 1e7,
            longitude: f64::from(data.lon) / 1e7,
            altitude_amsl: f64::from(data.alt) / 1000.0,
            altitude_relative: f64::from(data.relative_alt) / 1000.0,
            vx: f64::from(data.vx) / 100.0,
            vy: f64::from(data.vy) / 100.0,
            vz: f64::from(data.vz) / 100.0,
            timestamp_ms: self.stamp(u64::from(data.time_boot_ms) * 1000),
        };
        vec![VehicleEvent::PositionChanged {
            system_id: self.state.system_id,
            position: self.state.position,
        }]
    }

    fn apply_gps_raw(&mut self, data: &GPS_RAW_INT_DATA) -> Vec<VehicleEvent> {
        let mut events = Vec::new();

        let fix_3d = matches!(
            data.fix_type,
            GpsFixType::GPS_FIX_TYPE_3D_FIX
                | GpsFixType::GPS_FIX_TYPE_DGPS
                | GpsFixType::GPS_FIX_TYPE_RTK_FLOAT
                | GpsFixType::GPS_FIX_TYPE_RTK_FIXED
                | GpsFixType::GPS_FIX_TYPE_STATIC
                | GpsFixType::GPS_FIX_TYPE_PPP
        );
        self.state.gps = GpsStatus {
            fix_3d,
            satellites_visible: data.satellites_visible,
            hdop: if data.eph == u16::MAX {
                -1.0
            } else {
                f64::from(data.eph) / 100.0
            },
        };

        let has_fix = !matches!(
            data.fix_type,
            GpsFixType::GPS_FIX_TYPE_NO_GPS | GpsFixType::GPS_FIX_TYPE_NO_FIX
        );
        if has_fix {
            let timestamp_ms = self.stamp(data.time_usec);
            self.state.position = Position {
                latitude: f64::from(data.lat) / 1e7,
                longitude: f64::from(data.lon) / 1e7,
                altitude_amsl: f64::from(data.alt) / 1000.0,
                timestamp_ms,
                ..self.state.position
            };
        }

        if fix_3d && !self.position_locked {
            self.position_locked = true;
            events.push(VehicleEvent::PositionLock {
                system_id: self.state.system_id,
            });
        }
        if has_fix {
            events.push(VehicleEvent::PositionChanged {
                system_id: self.state.system_id,
                position: self.state.position,
            });
        }
        events
    }

    fn apply_param_value(&mut self, component_id: u8, data: &PARAM_VALUE_DATA) -> Vec<VehicleEvent> {
        let name = fixed_str(&data.param_id);
        let value = ParamValue {
            value: data.param_value,
            index: data.param_index,
            count: data.param_count,
        };
        // Last write wins; refreshes overwrite silently.
        self.params.insert((component_id, name.clone()), value);
        vec![VehicleEvent::ParamChanged {
            system_id: self.state.system_id,
            component_id,
            name,
            value: data.param_value,
            index: data.param_index,
            count: data.param_count,
        }]
    }

    fn apply_command_ack(&mut self, data: &COMMAND_ACK_DATA) -> Vec<VehicleEvent> {
        vec![VehicleEvent::CommandResult {
            system_id: self.state.system_id,
            command: data.command as u32,
            accepted: data.result == MavResult::MAV_RESULT_ACCEPTED,
        }]
    }

    fn apply_statustext(&mut self, data: &STATUSTEXT_DATA) -> Vec<VehicleEvent> {
        vec![VehicleEvent::StatusText {
            system_id: self.state.system_id,
            severity: data.severity,
            text: fixed_str(&data.text),
        }]
    }

    fn apply_named_value(&mut self, data: &NAMED_VALUE_FLOAT_DATA) -> Vec<VehicleEvent> {
        vec![VehicleEvent::NamedValue {
            system_id: self.state.system_id,
            name: fixed_str(&data.name),
            value: data.value,
        }]
    }

    /// Connection watchdog hooks, driven by the dispatcher's timer.
    pub fn mark_connection_lost(&mut self) -> Option<VehicleEvent> {
        if self.seen_heartbeat {
            self.seen_heartbeat = false;
            Some(VehicleEvent::ConnectionLost {
                system_id: self.state.system_id,
            })
        } else {
            None
        }
    }

    pub fn connection_alive(&self) -> bool {
        self.seen_heartbeat
    }

    fn voltage_percent(&self, filtered: f64) -> f64 {
        let cells = f64::from(self.opts.battery_cells);
        let empty = EMPTY_CELL_VOLTAGE * cells;
        let full = FULL_CELL_VOLTAGE * cells;
        (100.0 * (filtered - empty) / (full - empty)).clamp(0.0, 100.0)
    }

    /// Timestamp for derived telemetry, honoring the attitude-stamped
    /// option when an attitude has been seen.
    fn stamp(&mut self, onboard_us: u64) -> i64 {
        if self.opts.attitude_stamped && self.state.attitude.timestamp_ms != 0 {
            self.state.attitude.timestamp_ms
        } else {
            self.unix_time_ms(onboard_us)
        }
    }

    /// Map an onboard timestamp to Unix milliseconds.
    ///
    /// Zero means the clock is unset, so we use our own. Small values are
    /// boot-relative; the boot-to-wall offset is computed from the first
    /// such timestamp and then held fixed, so a jump in the onboard clock
    /// shifts timestamps instead of silently re-aligning them. Anything
    /// past the cutoff is already Unix epoch microseconds.
    fn unix_time_ms(&mut self, onboard_us: u64) -> i64 {
        let now_ms = Utc::now().timestamp_millis();
        if onboard_us == 0 {
            now_ms
        } else if onboard_us < BOOT_EPOCH_CUTOFF_US {
            let boot_ms = (onboard_us / 1000) as i64;
            let offset = *self.onboard_offset_ms.get_or_insert(now_ms - boot_ms);
            boot_ms + offset
        } else {
            (onboard_us / 1000) as i64
        }
    }
}

/// Human-readable mode label. Only the ArduPilot copter table is mapped;
/// other stacks fall back to the numeric mode.
fn flight_mode_name(autopilot: MavAutopilot, custom_mode: u32) -> String {
    if autopilot == MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA {
        let name = match custom_mode {
            0 => Some("Stabilize"),
            1 => Some("Acro"),
            2 => Some("AltHold"),
            3 => Some("Auto"),
            4 => Some("Guided"),
            5 => Some("Loiter"),
            6 => Some("RTL"),
            7 => Some("Circle"),
            9 => Some("Land"),
            16 => Some("PosHold"),
            17 => Some("Brake"),
            _ => None,
        };
        if let Some(name) = name {
            return name.to_string();
        }
    }
    format!("Mode({custom_mode})")
}

/// Wrap an angle in radians into (-pi, pi].
pub fn wrap_pi(angle: f32) -> f32 {
    if !angle.is_finite() {
        return angle;
    }
    let mut a = angle;
    while a > PI {
        a -= 2.0 * PI;
    }
    while a <= -PI {
        a += 2.0 * PI;
    }
    a
}

/// NUL-padded fixed-size char array to owned string.
fn fixed_str(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}
