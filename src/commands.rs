//! Outbound command construction for one target vehicle.
//!
//! The wrappers send with confirmation 0; retry on a missing COMMAND_ACK
//! is the operator's call, and a resender passes its own confirmation
//! counter to [`CommandEncoder::command_long`]. Position-carrying
//! commands go out as COMMAND_INT so coordinates ride in scaled integers
//! instead of lossy floats.

use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavModeFlag, MavParamType, COMMAND_INT_DATA, COMMAND_LONG_DATA,
    MISSION_SET_CURRENT_DATA, PARAM_REQUEST_LIST_DATA, PARAM_REQUEST_READ_DATA, PARAM_SET_DATA,
    REQUEST_DATA_STREAM_DATA,
};

/// Builds every message the station sends at one vehicle.
#[derive(Debug, Clone, Copy)]
pub struct CommandEncoder {
    target_system: u8,
    target_component: u8,
}

impl CommandEncoder {
    pub fn new(target_system: u8, target_component: u8) -> Self {
        Self {
            target_system,
            target_component,
        }
    }

    pub fn target_system(&self) -> u8 {
        self.target_system
    }

    /// Generic seven-param command. `confirmation` is the resend
    /// counter; first transmissions send 0.
    pub fn command_long(&self, command: MavCmd, confirmation: u8, params: [f32; 7]) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
            command,
            target_system: self.target_system,
            target_component: self.target_component,
            confirmation,
        })
    }

    /// Generic positioned command: four floats plus scaled-int coordinates.
    pub fn command_int(
        &self,
        command: MavCmd,
        frame: MavFrame,
        params: [f32; 4],
        x: i32,
        y: i32,
        z: f32,
    ) -> MavMessage {
        MavMessage::COMMAND_INT(COMMAND_INT_DATA {
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            x,
            y,
            z,
            command,
            target_system: self.target_system,
            target_component: self.target_component,
            frame,
            current: 0,
            autocontinue: 0,
        })
    }

    pub fn arm(&self, arm: bool) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            0,
            [if arm { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn takeoff(&self, altitude_m: f32) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_NAV_TAKEOFF,
            0,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, altitude_m],
        )
    }

    pub fn land(&self) -> MavMessage {
        self.command_long(MavCmd::MAV_CMD_NAV_LAND, 0, [0.0; 7])
    }

    pub fn return_to_launch(&self) -> MavMessage {
        self.command_long(MavCmd::MAV_CMD_NAV_RETURN_TO_LAUNCH, 0, [0.0; 7])
    }

    pub fn set_mode(&self, custom_mode: u32) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_DO_SET_MODE,
            0,
            [
                MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits() as f32,
                custom_mode as f32,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
        )
    }

    /// Ground speed change, meters per second.
    pub fn set_speed(&self, speed: f32) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_DO_CHANGE_SPEED,
            0,
            [1.0, speed, -1.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    /// Fly to a point and hold, relative altitude in meters.
    pub fn reposition(&self, latitude: f64, longitude: f64, altitude_m: f32) -> MavMessage {
        self.command_int(
            MavCmd::MAV_CMD_DO_REPOSITION,
            MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            [-1.0, 0.0, 0.0, f32::NAN],
            (latitude * 1e7) as i32,
            (longitude * 1e7) as i32,
            altitude_m,
        )
    }

    pub fn set_home(&self, latitude: f64, longitude: f64, altitude_m: f32) -> MavMessage {
        self.command_int(
            MavCmd::MAV_CMD_DO_SET_HOME,
            MavFrame::MAV_FRAME_GLOBAL,
            [0.0, 0.0, 0.0, 0.0],
            (latitude * 1e7) as i32,
            (longitude * 1e7) as i32,
            altitude_m,
        )
    }

    pub fn calibrate_gyro(&self) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION,
            0,
            [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn calibrate_magnetometer(&self) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION,
            0,
            [0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn calibrate_pressure(&self) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION,
            0,
            [0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn calibrate_radio(&self) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION,
            0,
            [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn calibrate_accelerometer(&self) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_PREFLIGHT_CALIBRATION,
            0,
            [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        )
    }

    pub fn set_servo(&self, channel: u8, pwm: u16) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_DO_SET_SERVO,
            0,
            [f32::from(channel), f32::from(pwm), 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    /// Point the gimbal, degrees. Yaw is body-relative.
    pub fn move_gimbal(&self, pitch_deg: f32, yaw_deg: f32) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_DO_MOUNT_CONTROL,
            0,
            // param7 = MAV_MOUNT_MODE_MAVLINK_TARGETING
            [pitch_deg, 0.0, yaw_deg, 0.0, 0.0, 0.0, 2.0],
        )
    }

    pub fn reset_gimbal(&self) -> MavMessage {
        // param7 = MAV_MOUNT_MODE_NEUTRAL
        self.command_long(
            MavCmd::MAV_CMD_DO_MOUNT_CONTROL,
            0,
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        )
    }

    pub fn trigger_camera(&self) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_DO_DIGICAM_CONTROL,
            0,
            [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0],
        )
    }

    /// Absolute zoom level, camera-defined range.
    pub fn zoom_camera(&self, level: f32) -> MavMessage {
        // param1 = ZOOM_TYPE_RANGE
        self.command_long(
            MavCmd::MAV_CMD_SET_CAMERA_ZOOM,
            0,
            [1.0, level, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn start_recording(&self) -> MavMessage {
        self.command_long(MavCmd::MAV_CMD_VIDEO_START_CAPTURE, 0, [0.0; 7])
    }

    pub fn stop_recording(&self) -> MavMessage {
        self.command_long(MavCmd::MAV_CMD_VIDEO_STOP_CAPTURE, 0, [0.0; 7])
    }

    pub fn start_streaming(&self, stream_id: u8) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_VIDEO_START_STREAMING,
            0,
            [f32::from(stream_id), 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn stop_streaming(&self, stream_id: u8) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_VIDEO_STOP_STREAMING,
            0,
            [f32::from(stream_id), 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        )
    }

    pub fn set_mission_current(&self, seq: u16) -> MavMessage {
        MavMessage::MISSION_SET_CURRENT(MISSION_SET_CURRENT_DATA {
            seq,
            target_system: self.target_system,
            target_component: self.target_component,
        })
    }

    /// Ask for one parameter by name.
    pub fn request_param(&self, name: &str) -> MavMessage {
        MavMessage::PARAM_REQUEST_READ(PARAM_REQUEST_READ_DATA {
            param_index: -1,
            target_system: self.target_system,
            target_component: self.target_component,
            param_id: param_id(name),
        })
    }

    /// Ask for the whole parameter table.
    pub fn request_param_list(&self) -> MavMessage {
        MavMessage::PARAM_REQUEST_LIST(PARAM_REQUEST_LIST_DATA {
            target_system: self.target_system,
            target_component: self.target_component,
        })
    }

    pub fn set_param(&self, name: &str, value: f32, param_type: MavParamType) -> MavMessage {
        MavMessage::PARAM_SET(PARAM_SET_DATA {
            param_value: value,
            target_system: self.target_system,
            target_component: self.target_component,
            param_id: param_id(name),
            param_type,
        })
    }

    /// Legacy stream-rate knob, still what ArduPilot listens to.
    pub fn request_data_stream(&self, stream_id: u8, rate_hz: u16, enable: bool) -> MavMessage {
        MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            req_message_rate: rate_hz,
            target_system: self.target_system,
            target_component: self.target_component,
            req_stream_id: stream_id,
            start_stop: enable as u8,
        })
    }
}

/// Encode a parameter name into the NUL-padded wire array. Names longer
/// than 16 bytes are truncated, matching autopilot behavior.
fn param_id(name: &str) -> [u8; 16] {
    let mut id = [0u8; 16];
    let bytes = name.as_bytes();
    let n = bytes.len().min(16);
    id[..n].copy_from_slice(&bytes[..n]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_targets_the_right_vehicle() {
        let enc = CommandEncoder::new(7, 1);
        match enc.arm(true) {
            MavMessage::COMMAND_LONG(data) => {
                assert_eq!(data.command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
                assert_eq!(data.param1, 1.0);
                assert_eq!(data.target_system, 7);
                assert_eq!(data.target_component, 1);
                assert_eq!(data.confirmation, 0);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn reposition_scales_coordinates_to_1e7() {
        let enc = CommandEncoder::new(1, 1);
        match enc.reposition(47.398, 8.545, 25.0) {
            MavMessage::COMMAND_INT(data) => {
                assert_eq!(data.command, MavCmd::MAV_CMD_DO_REPOSITION);
                assert_eq!(data.x, 473_980_000);
                assert_eq!(data.y, 85_450_000);
                assert_eq!(data.z, 25.0);
                assert_eq!(data.frame, MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn set_mode_carries_the_custom_mode_flag() {
        let enc = CommandEncoder::new(1, 1);
        match enc.set_mode(4) {
            MavMessage::COMMAND_LONG(data) => {
                assert_eq!(data.command, MavCmd::MAV_CMD_DO_SET_MODE);
                assert_eq!(data.param1, 1.0);
                assert_eq!(data.param2, 4.0);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn resends_carry_the_caller_confirmation() {
        let enc = CommandEncoder::new(1, 1);
        match enc.command_long(MavCmd::MAV_CMD_NAV_TAKEOFF, 2, [0.0; 7]) {
            MavMessage::COMMAND_LONG(data) => assert_eq!(data.confirmation, 2),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn param_ids_pad_and_truncate() {
        assert_eq!(&param_id("RTL_ALT")[..8], b"RTL_ALT\0");
        let long = param_id("A_VERY_LONG_PARAMETER_NAME");
        assert_eq!(&long, b"A_VERY_LONG_PARA");
    }

    #[test]
    fn gimbal_move_uses_mavlink_targeting_mode() {
        let enc = CommandEncoder::new(1, 1);
        match enc.move_gimbal(-45.0, 10.0) {
            MavMessage::COMMAND_LONG(data) => {
                assert_eq!(data.command, MavCmd::MAV_CMD_DO_MOUNT_CONTROL);
                assert_eq!(data.param1, -45.0);
                assert_eq!(data.param3, 10.0);
                assert_eq!(data.param7, 2.0);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn set_param_encodes_name_and_value() {
        let enc = CommandEncoder::new(1, 1);
        match enc.set_param("RTL_ALT", 3000.0, MavParamType::MAV_PARAM_TYPE_REAL32) {
            MavMessage::PARAM_SET(data) => {
                assert_eq!(&data.param_id[..8], b"RTL_ALT\0");
                assert_eq!(data.param_value, 3000.0);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
