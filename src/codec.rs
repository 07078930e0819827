//! MAVLink v2 framing and deframing over raw byte buffers.
//!
//! Decoding is done by hand rather than through `mavlink`'s reader helpers:
//! those silently discard frames whose message id is not in the dialect,
//! while the dispatcher needs unknown ids passed through for counting.
//! Payload decode and CRC tables still come from the `mavlink` crate, so
//! encode/decode stay bit-compatible with it.

use mavlink::common::MavMessage;
use mavlink::{calculate_crc, MavHeader, MavlinkVersion, Message};

use crate::error::{DecodeError, FramingError, SendError};

const STX_V2: u8 = 0xFD;
/// Magic byte plus the nine fixed header bytes.
const HEADER_LEN: usize = 10;
const CRC_LEN: usize = 2;
const SIGNATURE_LEN: usize = 13;
const IFLAG_SIGNED: u8 = 0x01;

/// One deframed wire record. Constructed by [`Codec::decode`], consumed
/// once by the dispatcher, then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub system_id: u8,
    pub component_id: u8,
    pub sequence: u8,
    pub body: FrameBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    /// A message the dialect knows how to decode.
    Known(MavMessage),
    /// Structurally sound frame with a message id outside the dialect.
    /// Passed through so the dispatcher can count it; the signature (if
    /// any) and checksum cannot be validated without the id's CRC seed.
    Unknown { message_id: u32 },
}

impl Frame {
    pub fn message_id(&self) -> u32 {
        match &self.body {
            FrameBody::Known(msg) => msg.message_id(),
            FrameBody::Unknown { message_id } => *message_id,
        }
    }
}

/// Stateful encoder / stateless decoder for one link.
///
/// The sequence counter lives here so every outbound message on a link
/// gets a consecutive (mod 256) sequence number regardless of which
/// component produced it.
#[derive(Debug)]
pub struct Codec {
    system_id: u8,
    component_id: u8,
    sequence: u8,
}

impl Codec {
    pub fn new(system_id: u8, component_id: u8) -> Self {
        Self {
            system_id,
            component_id,
            sequence: 0,
        }
    }

    pub fn system_id(&self) -> u8 {
        self.system_id
    }

    pub fn component_id(&self) -> u8 {
        self.component_id
    }

    /// Serialize `msg` into a fresh v2 frame, advancing the sequence
    /// counter (wraps mod 256).
    pub fn encode(&mut self, msg: &MavMessage) -> Result<Vec<u8>, SendError> {
        let header = MavHeader {
            system_id: self.system_id,
            component_id: self.component_id,
            sequence: self.sequence,
        };
        self.sequence = self.sequence.wrapping_add(1);
        let mut buf = Vec::with_capacity(mavlink::MAX_FRAME_SIZE);
        mavlink::write_v2_msg(&mut buf, header, msg)?;
        Ok(buf)
    }

    /// Decode the first frame found in `buf`, returning it together with
    /// the number of bytes consumed so callers can iterate over buffers
    /// holding several frames.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), DecodeError> {
        let start = buf
            .iter()
            .position(|&b| b == STX_V2)
            .ok_or(FramingError::NoMagic(buf.len()))?;
        let b = &buf[start..];
        if b.len() < HEADER_LEN + CRC_LEN {
            return Err(FramingError::Truncated {
                needed: HEADER_LEN + CRC_LEN,
                got: b.len(),
            }
            .into());
        }

        let payload_len = b[1] as usize;
        let incompat = b[2];
        if incompat & !IFLAG_SIGNED != 0 {
            return Err(FramingError::UnsupportedFlags { flags: incompat }.into());
        }
        let signature_len = if incompat & IFLAG_SIGNED != 0 {
            SIGNATURE_LEN
        } else {
            0
        };

        let total = HEADER_LEN + payload_len + CRC_LEN + signature_len;
        if b.len() < total {
            return Err(FramingError::Truncated {
                needed: total,
                got: b.len(),
            }
            .into());
        }

        let sequence = b[4];
        let system_id = b[5];
        let component_id = b[6];
        let message_id = u32::from_le_bytes([b[7], b[8], b[9], 0]);
        let payload = &b[HEADER_LEN..HEADER_LEN + payload_len];
        let wire_crc = u16::from_le_bytes([b[HEADER_LEN + payload_len], b[HEADER_LEN + payload_len + 1]]);
        let consumed = start + total;

        let body = if MavMessage::default_message_from_id(message_id).is_ok() {
            let expected = calculate_crc(
                &b[1..HEADER_LEN + payload_len],
                MavMessage::extra_crc(message_id),
            );
            if wire_crc != expected {
                return Err(FramingError::BadCrc { message_id }.into());
            }
            let msg = MavMessage::parse(MavlinkVersion::V2, message_id, payload)
                .map_err(|source| DecodeError::Payload { message_id, source })?;
            FrameBody::Known(msg)
        } else {
            FrameBody::Unknown { message_id }
        };

        Ok((
            Frame {
                system_id,
                component_id,
                sequence,
                body,
            },
            consumed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{
        MavAutopilot, MavModeFlag, MavState, MavType, ATTITUDE_DATA, COMMAND_LONG_DATA,
        HEARTBEAT_DATA,
    };

    fn heartbeat() -> MavMessage {
        MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 4,
            mavtype: MavType::MAV_TYPE_QUADROTOR,
            autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        })
    }

    #[test]
    fn roundtrip_heartbeat() {
        let mut codec = Codec::new(255, 190);
        let msg = heartbeat();
        let buf = codec.encode(&msg).unwrap();
        let (frame, used) = Codec::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(frame.system_id, 255);
        assert_eq!(frame.component_id, 190);
        assert_eq!(frame.sequence, 0);
        assert_eq!(frame.body, FrameBody::Known(msg));
    }

    #[test]
    fn roundtrip_attitude_and_command() {
        let mut codec = Codec::new(255, 190);
        let attitude = MavMessage::ATTITUDE(ATTITUDE_DATA {
            time_boot_ms: 12_345,
            roll: 0.1,
            pitch: -0.2,
            yaw: 1.5,
            rollspeed: 0.01,
            pitchspeed: 0.02,
            yawspeed: -0.03,
        });
        let cmd = MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            param1: 1.0,
            param2: 1500.0,
            target_system: 1,
            target_component: 1,
            confirmation: 2,
            ..Default::default()
        });
        for msg in [attitude, cmd] {
            let buf = codec.encode(&msg).unwrap();
            let (frame, _) = Codec::decode(&buf).unwrap();
            assert_eq!(frame.body, FrameBody::Known(msg));
        }
    }

    #[test]
    fn sequence_wraps_mod_256() {
        let mut codec = Codec::new(255, 190);
        for _ in 0..256 {
            codec.encode(&heartbeat()).unwrap();
        }
        let buf = codec.encode(&heartbeat()).unwrap();
        let (frame, _) = Codec::decode(&buf).unwrap();
        assert_eq!(frame.sequence, 1);
    }

    #[test]
    fn corrupted_payload_is_a_crc_error() {
        let mut codec = Codec::new(255, 190);
        let mut buf = codec.encode(&heartbeat()).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        match Codec::decode(&buf) {
            Err(DecodeError::Framing(FramingError::BadCrc { .. })) => {}
            other => panic!("expected BadCrc, got {other:?}"),
        }
    }

    #[test]
    fn unknown_message_id_passes_through() {
        let mut codec = Codec::new(255, 190);
        let mut buf = codec.encode(&heartbeat()).unwrap();
        // Patch the 24-bit message id to one outside the common dialect.
        buf[7] = 0xAA;
        buf[8] = 0xFF;
        buf[9] = 0x0F;
        let (frame, used) = Codec::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(
            frame.body,
            FrameBody::Unknown {
                message_id: 0x0FFFAA
            }
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut codec = Codec::new(255, 190);
        let buf = codec.encode(&heartbeat()).unwrap();
        match Codec::decode(&buf[..buf.len() - 3]) {
            Err(DecodeError::Framing(FramingError::Truncated { .. })) => {}
            other => panic!("expected Truncated, got {other:?}"),
        }
    }

    #[test]
    fn garbage_has_no_magic() {
        let buf = [0u8, 1, 2, 3, 4, 5];
        match Codec::decode(&buf) {
            Err(DecodeError::Framing(FramingError::NoMagic(6))) => {}
            other => panic!("expected NoMagic, got {other:?}"),
        }
    }

    #[test]
    fn consecutive_frames_decode_in_order() {
        let mut codec = Codec::new(255, 190);
        let mut buf = codec.encode(&heartbeat()).unwrap();
        buf.extend(codec.encode(&heartbeat()).unwrap());
        let (first, used) = Codec::decode(&buf).unwrap();
        let (second, _) = Codec::decode(&buf[used..]).unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
    }
}
