//! The fixed instruction vocabulary the bridge answers to.
//!
//! Names arrive as the second topic segment; lookup is a static table so
//! adding an instruction is one row, not another branch.

use std::collections::HashMap;

use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    OpenStream,
    StopStream,
    ResetGimbal,
    MoveGimbal,
    GetCameras,
    SetCamera,
    SetCameraIntrinsics,
    GetCamera,
    ZoomCamera,
    TakePhoto,
    StartRecording,
    StopRecording,
    SetServo,
}

pub static INSTRUCTIONS: Lazy<HashMap<&'static str, Instruction>> = Lazy::new(|| {
    HashMap::from([
        ("OPEN_STREAM", Instruction::OpenStream),
        ("STOP_STREAM", Instruction::StopStream),
        ("RESET_GIMBAL", Instruction::ResetGimbal),
        ("MOVE_GIMBAL", Instruction::MoveGimbal),
        ("GET_CAMERAS", Instruction::GetCameras),
        ("SET_CAMERA", Instruction::SetCamera),
        ("SET_CAMERA_INTRINSICS", Instruction::SetCameraIntrinsics),
        ("GET_CAMERA", Instruction::GetCamera),
        ("ZOOM_CAMERA", Instruction::ZoomCamera),
        ("TAKE_PHOTO", Instruction::TakePhoto),
        ("START_RECORDING", Instruction::StartRecording),
        ("STOP_RECORDING", Instruction::StopRecording),
        ("MAV_CMD_DO_SET_SERVO", Instruction::SetServo),
    ])
});

pub fn lookup(name: &str) -> Option<Instruction> {
    INSTRUCTIONS.get(name).copied()
}
