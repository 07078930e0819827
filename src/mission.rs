//! Mission upload/download state machine.
//!
//! One transfer runs at a time per vehicle. The machine is purely
//! reactive: callers feed it inbound messages and timer ticks, and it
//! hands back the messages to put on the wire. All wall-clock behavior
//! (when to tick) lives in the dispatcher.

use mavlink::common::{
    MavCmd, MavFrame, MavMessage, MavMissionResult, MISSION_ACK_DATA,
    MISSION_COUNT_DATA, MISSION_ITEM_INT_DATA, MISSION_REQUEST_INT_DATA,
    MISSION_REQUEST_LIST_DATA,
};
use tracing::{debug, warn};

/// Ticks without progress before a transfer is abandoned.
const MAX_RETRIES: u8 = 5;

/// One waypoint, in the scaled-integer form the wire uses.
#[derive(Debug, Clone, PartialEq)]
pub struct MissionItem {
    pub seq: u16,
    pub command: MavCmd,
    pub frame: MavFrame,
    pub params: [f32; 4],
    /// Latitude, degrees * 1e7 for global frames.
    pub x: i32,
    /// Longitude, degrees * 1e7 for global frames.
    pub y: i32,
    /// Altitude, meters.
    pub z: f32,
    pub current: bool,
    pub autocontinue: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Idle,
    /// Download: MISSION_REQUEST_LIST sent, waiting on MISSION_COUNT.
    AwaitingCount,
    /// Download: requesting items one by one.
    Receiving { next: u16, total: u16 },
    /// Upload: MISSION_COUNT sent, waiting for the vehicle to request items.
    AwaitingRequest { total: u16 },
    /// Upload: items flowing, waiting for the final MISSION_ACK.
    AwaitingAck { total: u16 },
}

/// What a transfer finished with.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferResult {
    Downloaded(Vec<MissionItem>),
    Uploaded,
    Failed(MavMissionResult),
    TimedOut,
}

/// Outcome of feeding one message or tick into the machine.
#[derive(Debug, Default, PartialEq)]
pub struct Step {
    pub reply: Option<MavMessage>,
    pub completed: Option<TransferResult>,
}

impl Step {
    fn quiet() -> Self {
        Self::default()
    }

    fn reply(msg: MavMessage) -> Self {
        Self {
            reply: Some(msg),
            completed: None,
        }
    }
}

#[derive(Debug)]
pub struct MissionTransfer {
    target_system: u8,
    target_component: u8,
    state: TransferState,
    /// Items received so far (download) or queued to send (upload).
    items: Vec<MissionItem>,
    retries: u8,
}

impl MissionTransfer {
    pub fn new(target_system: u8, target_component: u8) -> Self {
        Self {
            target_system,
            target_component,
            state: TransferState::Idle,
            items: Vec::new(),
            retries: 0,
        }
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == TransferState::Idle
    }

    /// Begin pulling the mission off the vehicle. Returns the request to
    /// send, or `None` if a transfer is already running.
    pub fn start_download(&mut self) -> Option<MavMessage> {
        if !self.is_idle() {
            return None;
        }
        self.items.clear();
        self.retries = 0;
        self.state = TransferState::AwaitingCount;
        Some(MavMessage::MISSION_REQUEST_LIST(MISSION_REQUEST_LIST_DATA {
            target_system: self.target_system,
            target_component: self.target_component,
            ..Default::default()
        }))
    }

    /// Begin pushing `items` to the vehicle. Sequence numbers are
    /// rewritten to their index.
    pub fn start_upload(&mut self, mut items: Vec<MissionItem>) -> Option<MavMessage> {
        if !self.is_idle() {
            return None;
        }
        for (i, item) in items.iter_mut().enumerate() {
            item.seq = i as u16;
        }
        let total = items.len() as u16;
        self.items = items;
        self.retries = 0;
        self.state = TransferState::AwaitingRequest { total };
        Some(MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count: total,
            target_system: self.target_system,
            target_component: self.target_component,
            ..Default::default()
        }))
    }

    /// Feed one inbound message from the transfer's vehicle. Messages
    /// that do not belong to the running transfer leave it untouched.
    pub fn handle(&mut self, msg: &MavMessage) -> Step {
        match (&self.state, msg) {
            (TransferState::AwaitingCount, MavMessage::MISSION_COUNT(data)) => {
                if data.count == 0 {
                    self.state = TransferState::Idle;
                    return Step {
                        reply: Some(self.ack(MavMissionResult::MAV_MISSION_ACCEPTED)),
                        completed: Some(TransferResult::Downloaded(Vec::new())),
                    };
                }
                self.retries = 0;
                self.state = TransferState::Receiving {
                    next: 0,
                    total: data.count,
                };
                Step::reply(self.request_item(0))
            }
            (TransferState::Receiving { next, total }, MavMessage::MISSION_ITEM_INT(data)) => {
                let (next, total) = (*next, *total);
                if data.seq != next {
                    debug!(got = data.seq, want = next, "out of order mission item");
                    return Step::quiet();
                }
                self.retries = 0;
                self.items.push(MissionItem {
                    seq: data.seq,
                    command: data.command,
                    frame: data.frame,
                    params: [data.param1, data.param2, data.param3, data.param4],
                    x: data.x,
                    y: data.y,
                    z: data.z,
                    current: data.current != 0,
                    autocontinue: data.autocontinue != 0,
                });
                if next + 1 == total {
                    self.state = TransferState::Idle;
                    Step {
                        reply: Some(self.ack(MavMissionResult::MAV_MISSION_ACCEPTED)),
                        completed: Some(TransferResult::Downloaded(std::mem::take(
                            &mut self.items,
                        ))),
                    }
                } else {
                    self.state = TransferState::Receiving {
                        next: next + 1,
                        total,
                    };
                    Step::reply(self.request_item(next + 1))
                }
            }
            (
                TransferState::AwaitingRequest { total } | TransferState::AwaitingAck { total },
                MavMessage::MISSION_REQUEST_INT(data),
            ) => self.serve_item(data.seq, *total),
            (
                TransferState::AwaitingRequest { total } | TransferState::AwaitingAck { total },
                MavMessage::MISSION_REQUEST(data),
            ) => self.serve_item(data.seq, *total),
            (
                TransferState::AwaitingRequest { .. } | TransferState::AwaitingAck { .. },
                MavMessage::MISSION_ACK(data),
            ) => {
                self.state = TransferState::Idle;
                self.items.clear();
                let completed = if data.mavtype == MavMissionResult::MAV_MISSION_ACCEPTED {
                    TransferResult::Uploaded
                } else {
                    warn!(result = ?data.mavtype, "mission upload rejected");
                    TransferResult::Failed(data.mavtype)
                };
                Step {
                    reply: None,
                    completed: Some(completed),
                }
            }
            _ => Step::quiet(),
        }
    }

    /// Timer tick. Re-issues the outstanding request, or gives up after
    /// too many quiet intervals.
    pub fn on_tick(&mut self) -> Step {
        match self.state.clone() {
            TransferState::Idle => Step::quiet(),
            state => {
                self.retries += 1;
                if self.retries > MAX_RETRIES {
                    warn!(?state, "mission transfer timed out");
                    self.state = TransferState::Idle;
                    self.items.clear();
                    return Step {
                        reply: None,
                        completed: Some(TransferResult::TimedOut),
                    };
                }
                let reply = match state {
                    TransferState::AwaitingCount => MavMessage::MISSION_REQUEST_LIST(
                        MISSION_REQUEST_LIST_DATA {
                            target_system: self.target_system,
                            target_component: self.target_component,
                            ..Default::default()
                        },
                    ),
                    TransferState::Receiving { next, .. } => self.request_item(next),
                    TransferState::AwaitingRequest { total } => {
                        MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
                            count: total,
                            target_system: self.target_system,
                            target_component: self.target_component,
                            ..Default::default()
                        })
                    }
                    // Nothing to re-send; the vehicle drives this phase.
                    TransferState::AwaitingAck { .. } => return Step::quiet(),
                    TransferState::Idle => unreachable!(),
                };
                Step::reply(reply)
            }
        }
    }

    fn serve_item(&mut self, seq: u16, total: u16) -> Step {
        let Some(item) = self.items.get(seq as usize) else {
            warn!(seq, total, "vehicle requested mission item out of range");
            return Step::quiet();
        };
        self.retries = 0;
        if seq + 1 == total {
            self.state = TransferState::AwaitingAck { total };
        }
        Step::reply(MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            param1: item.params[0],
            param2: item.params[1],
            param3: item.params[2],
            param4: item.params[3],
            x: item.x,
            y: item.y,
            z: item.z,
            seq: item.seq,
            command: item.command,
            target_system: self.target_system,
            target_component: self.target_component,
            frame: item.frame,
            current: item.current as u8,
            autocontinue: item.autocontinue as u8,
            ..Default::default()
        }))
    }

    fn request_item(&self, seq: u16) -> MavMessage {
        MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
            seq,
            target_system: self.target_system,
            target_component: self.target_component,
            ..Default::default()
        })
    }

    fn ack(&self, result: MavMissionResult) -> MavMessage {
        MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            target_system: self.target_system,
            target_component: self.target_component,
            mavtype: result,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::{ATTITUDE_DATA, MISSION_REQUEST_DATA};

    fn item_int(seq: u16) -> MavMessage {
        MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
            param1: 0.0,
            x: 473_980_000 + i32::from(seq),
            y: 85_450_000,
            z: 50.0,
            seq,
            command: MavCmd::MAV_CMD_NAV_WAYPOINT,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            autocontinue: 1,
            ..Default::default()
        })
    }

    fn wp(seq: u16) -> MissionItem {
        MissionItem {
            seq,
            command: MavCmd::MAV_CMD_NAV_WAYPOINT,
            frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
            params: [0.0; 4],
            x: 473_980_000,
            y: 85_450_000,
            z: 30.0,
            current: false,
            autocontinue: true,
        }
    }

    #[test]
    fn download_five_items_with_interleaved_noise() {
        let mut t = MissionTransfer::new(1, 1);
        assert!(matches!(
            t.start_download(),
            Some(MavMessage::MISSION_REQUEST_LIST(_))
        ));

        let step = t.handle(&MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count: 5,
            ..Default::default()
        }));
        assert!(matches!(
            step.reply,
            Some(MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA { seq: 0, .. }))
        ));

        for seq in 0..5u16 {
            // Unrelated telemetry must not disturb the transfer.
            let noise = t.handle(&MavMessage::ATTITUDE(ATTITUDE_DATA::default()));
            assert_eq!(noise, Step::default());

            let step = t.handle(&item_int(seq));
            if seq < 4 {
                let want = seq + 1;
                assert!(matches!(
                    step.reply,
                    Some(MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA { seq, .. })) if seq == want
                ));
                assert!(step.completed.is_none());
            } else {
                assert!(matches!(step.reply, Some(MavMessage::MISSION_ACK(_))));
                match step.completed {
                    Some(TransferResult::Downloaded(items)) => {
                        assert_eq!(items.len(), 5);
                        assert_eq!(items[3].seq, 3);
                        assert_eq!(items[3].x, 473_980_003);
                    }
                    other => panic!("expected download completion, got {other:?}"),
                }
            }
        }
        assert!(t.is_idle());
    }

    #[test]
    fn duplicate_and_out_of_order_items_are_ignored() {
        let mut t = MissionTransfer::new(1, 1);
        t.start_download();
        t.handle(&MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count: 3,
            ..Default::default()
        }));
        t.handle(&item_int(0));
        // Re-delivery of item 0 and a premature item 2 change nothing.
        assert_eq!(t.handle(&item_int(0)), Step::default());
        assert_eq!(t.handle(&item_int(2)), Step::default());
        assert_eq!(
            t.state(),
            &TransferState::Receiving { next: 1, total: 3 }
        );
    }

    #[test]
    fn empty_mission_download_completes_immediately() {
        let mut t = MissionTransfer::new(1, 1);
        t.start_download();
        let step = t.handle(&MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count: 0,
            ..Default::default()
        }));
        assert!(matches!(step.reply, Some(MavMessage::MISSION_ACK(_))));
        assert_eq!(step.completed, Some(TransferResult::Downloaded(Vec::new())));
        assert!(t.is_idle());
    }

    #[test]
    fn upload_serves_requests_until_ack() {
        let mut t = MissionTransfer::new(1, 1);
        let count = t.start_upload(vec![wp(9), wp(9), wp(9)]).unwrap();
        // Sequence numbers are reassigned from the queue order.
        assert!(matches!(
            count,
            MavMessage::MISSION_COUNT(MISSION_COUNT_DATA { count: 3, .. })
        ));

        for seq in 0..3u16 {
            let step = t.handle(&MavMessage::MISSION_REQUEST_INT(MISSION_REQUEST_INT_DATA {
                seq,
                target_system: 255,
                target_component: 190,
                ..Default::default()
            }));
            assert!(matches!(
                step.reply,
                Some(MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA { seq: got, .. })) if got == seq
            ));
        }
        assert_eq!(t.state(), &TransferState::AwaitingAck { total: 3 });

        let step = t.handle(&MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            mavtype: MavMissionResult::MAV_MISSION_ACCEPTED,
            ..Default::default()
        }));
        assert_eq!(step.completed, Some(TransferResult::Uploaded));
        assert!(t.is_idle());
    }

    #[test]
    fn upload_answers_legacy_float_requests() {
        let mut t = MissionTransfer::new(1, 1);
        t.start_upload(vec![wp(0), wp(1)]);
        let step = t.handle(&MavMessage::MISSION_REQUEST(MISSION_REQUEST_DATA {
            seq: 0,
            ..Default::default()
        }));
        assert!(matches!(step.reply, Some(MavMessage::MISSION_ITEM_INT(_))));
    }

    #[test]
    fn rejected_upload_reports_the_result() {
        let mut t = MissionTransfer::new(1, 1);
        t.start_upload(vec![wp(0)]);
        let step = t.handle(&MavMessage::MISSION_ACK(MISSION_ACK_DATA {
            mavtype: MavMissionResult::MAV_MISSION_INVALID_SEQUENCE,
            ..Default::default()
        }));
        assert_eq!(
            step.completed,
            Some(TransferResult::Failed(
                MavMissionResult::MAV_MISSION_INVALID_SEQUENCE
            ))
        );
        assert!(t.is_idle());
    }

    #[test]
    fn ticks_retry_then_time_out() {
        let mut t = MissionTransfer::new(1, 1);
        t.start_download();
        for _ in 0..MAX_RETRIES {
            let step = t.on_tick();
            assert!(matches!(
                step.reply,
                Some(MavMessage::MISSION_REQUEST_LIST(_))
            ));
        }
        let step = t.on_tick();
        assert_eq!(step.completed, Some(TransferResult::TimedOut));
        assert!(t.is_idle());
    }

    #[test]
    fn second_transfer_cannot_start_while_busy() {
        let mut t = MissionTransfer::new(1, 1);
        assert!(t.start_download().is_some());
        assert!(t.start_download().is_none());
        assert!(t.start_upload(vec![wp(0)]).is_none());
    }
}
