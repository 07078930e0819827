//! End-to-end tests over an in-memory link: a scripted "vehicle" on one
//! side, the full server stack on the other.

use std::sync::Arc;
use std::time::Duration;

use groundlink::codec::{Codec, FrameBody};
use groundlink::dispatcher::DispatcherConfig;
use groundlink::events::VehicleEvent;
use groundlink::link::{LinkTransport, MemoryLink};
use groundlink::mav_server::MavlinkServer;
use groundlink::mission::TransferResult;
use mavlink::common::*;
use mavlink::MavHeader;

struct ScriptedVehicle {
    link: MemoryLink,
    system_id: u8,
    sequence: u8,
}

impl ScriptedVehicle {
    fn new(link: MemoryLink, system_id: u8) -> Self {
        Self {
            link,
            system_id,
            sequence: 0,
        }
    }

    fn send(&mut self, msg: &MavMessage) {
        let mut buf = Vec::new();
        mavlink::write_v2_msg(
            &mut buf,
            MavHeader {
                system_id: self.system_id,
                component_id: 1,
                sequence: self.sequence,
            },
            msg,
        )
        .unwrap();
        self.sequence = self.sequence.wrapping_add(1);
        self.link.write_frame(&buf).unwrap();
    }

    fn recv(&self) -> MavMessage {
        let raw = self.link.read_frame().unwrap();
        let (frame, _) = Codec::decode(&raw).unwrap();
        match frame.body {
            FrameBody::Known(msg) => msg,
            other => panic!("station sent undecodable frame {other:?}"),
        }
    }
}

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

async fn next_event(
    events: &mut tokio::sync::broadcast::Receiver<VehicleEvent>,
) -> VehicleEvent {
    tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn telemetry_flows_into_the_snapshot() {
    let (station_link, vehicle_link) = MemoryLink::pair();
    let server = MavlinkServer::new(Arc::new(station_link), DispatcherConfig::default());
    let mut events = server.subscribe();
    let runner = server.handle();
    let task = tokio::spawn(async move { runner.start().await });

    let mut vehicle = ScriptedVehicle::new(vehicle_link, 7);
    vehicle.send(&heartbeat());
    assert_eq!(
        next_event(&mut events).await,
        VehicleEvent::Connected { system_id: 7 }
    );
    assert_eq!(
        next_event(&mut events).await,
        VehicleEvent::ModeChanged {
            system_id: 7,
            custom_mode: 4
        }
    );

    vehicle.send(&MavMessage::GPS_RAW_INT(GPS_RAW_INT_DATA {
        lat: 473_980_000,
        lon: 85_700_000,
        alt: 120_000,
        eph: 90,
        fix_type: GpsFixType::GPS_FIX_TYPE_3D_FIX,
        satellites_visible: 11,
        ..Default::default()
    }));
    assert_eq!(
        next_event(&mut events).await,
        VehicleEvent::PositionLock { system_id: 7 }
    );
    assert!(matches!(
        next_event(&mut events).await,
        VehicleEvent::PositionChanged { system_id: 7, .. }
    ));

    // A global position fix must surface as a change notification.
    vehicle.send(&MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
        lat: 473_990_000,
        lon: 85_700_000,
        alt: 121_000,
        relative_alt: 35_000,
        vx: 120,
        ..Default::default()
    }));
    match next_event(&mut events).await {
        VehicleEvent::PositionChanged {
            system_id: 7,
            position,
        } => {
            assert!((position.latitude - 47.399).abs() < 1e-6);
            assert!((position.altitude_relative - 35.0).abs() < 1e-9);
            assert!((position.vx - 1.2).abs() < 1e-9);
        }
        other => panic!("unexpected event {other:?}"),
    }

    vehicle.send(&MavMessage::SYS_STATUS(SYS_STATUS_DATA {
        load: 420,
        voltage_battery: 12_400,
        current_battery: 800,
        battery_remaining: 76,
        ..Default::default()
    }));
    match next_event(&mut events).await {
        VehicleEvent::BatteryChanged {
            system_id: 7,
            battery,
        } => assert!((battery.voltage - 12.4).abs() < 1e-9),
        other => panic!("unexpected event {other:?}"),
    }

    vehicle.send(&MavMessage::ATTITUDE(ATTITUDE_DATA {
        time_boot_ms: 90_000,
        roll: 0.05,
        pitch: -0.02,
        yaw: 4.0,
        ..Default::default()
    }));
    match next_event(&mut events).await {
        VehicleEvent::AttitudeChanged {
            system_id: 7,
            attitude,
        } => assert!((attitude.roll - 0.05).abs() < 1e-6),
        other => panic!("unexpected event {other:?}"),
    }

    // Wait for the attitude to land in the snapshot.
    let mut snapshot = None;
    for _ in 0..50 {
        let s = server.snapshot(7).unwrap();
        if s.attitude.timestamp_ms != 0 {
            snapshot = Some(s);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let s = snapshot.expect("attitude never applied");

    assert!((s.position.latitude - 47.399).abs() < 1e-6);
    assert!((s.position.longitude - 8.57).abs() < 1e-6);
    assert!((s.position.altitude_amsl - 121.0).abs() < 1e-9);
    assert!(s.gps.fix_3d);
    assert_eq!(s.gps.satellites_visible, 11);
    assert!((s.battery.voltage - 12.4).abs() < 1e-9);
    assert!((s.battery.percent - 76.0).abs() < 1e-9);
    // Yaw of 4.0 rad wraps into (-pi, pi].
    assert!((s.attitude.yaw - (4.0 - 2.0 * std::f32::consts::PI)).abs() < 1e-6);
    assert_eq!(s.custom_mode, 4);

    server.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn mission_download_end_to_end() {
    let (station_link, vehicle_link) = MemoryLink::pair();
    let server = MavlinkServer::new(Arc::new(station_link), DispatcherConfig::default());
    let mut events = server.subscribe();
    let runner = server.handle();
    let task = tokio::spawn(async move { runner.start().await });

    let mut vehicle = ScriptedVehicle::new(vehicle_link, 1);
    vehicle.send(&heartbeat());
    assert_eq!(
        next_event(&mut events).await,
        VehicleEvent::Connected { system_id: 1 }
    );

    server.start_mission_download(1).unwrap();

    // Vehicle side of the protocol, scripted on a blocking thread.
    let script = tokio::task::spawn_blocking(move || {
        let total: u16 = 3;
        match vehicle.recv() {
            MavMessage::MISSION_REQUEST_LIST(_) => {}
            other => panic!("expected request list, got {other:?}"),
        }
        vehicle.send(&MavMessage::MISSION_COUNT(MISSION_COUNT_DATA {
            count: total,
            target_system: 255,
            target_component: 190,
            ..Default::default()
        }));
        loop {
            match vehicle.recv() {
                MavMessage::MISSION_REQUEST_INT(req) => {
                    vehicle.send(&MavMessage::MISSION_ITEM_INT(MISSION_ITEM_INT_DATA {
                        seq: req.seq,
                        command: MavCmd::MAV_CMD_NAV_WAYPOINT,
                        frame: MavFrame::MAV_FRAME_GLOBAL_RELATIVE_ALT,
                        x: 473_980_000,
                        y: 85_700_000,
                        z: 30.0,
                        target_system: 255,
                        target_component: 190,
                        autocontinue: 1,
                        ..Default::default()
                    }));
                }
                MavMessage::MISSION_ACK(ack) => {
                    assert_eq!(ack.mavtype, MavMissionResult::MAV_MISSION_ACCEPTED);
                    return;
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(5), script)
        .await
        .expect("mission script timed out")
        .unwrap();

    // The downloaded waypoints reach subscribers through the completion
    // event and stay readable afterwards.
    let result = loop {
        match next_event(&mut events).await {
            VehicleEvent::MissionTransferComplete { result, .. } => break result,
            _ => continue,
        }
    };
    match result {
        TransferResult::Downloaded(items) => {
            assert_eq!(items.len(), 3);
            assert_eq!(items[0].x, 473_980_000);
            assert!((items[2].z - 30.0).abs() < 1e-6);
        }
        other => panic!("unexpected transfer result {other:?}"),
    }
    let kept = server.waypoints(1).expect("session gone");
    assert_eq!(kept.len(), 3);

    server.stop();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn heartbeat_loss_is_reported_once_and_regained() {
    let (station_link, vehicle_link) = MemoryLink::pair();
    let config = DispatcherConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let server = MavlinkServer::new(Arc::new(station_link), config);
    let mut events = server.subscribe();
    let runner = server.handle();
    let task = tokio::spawn(async move { runner.start().await });

    let mut vehicle = ScriptedVehicle::new(vehicle_link, 3);
    vehicle.send(&heartbeat());
    assert_eq!(
        next_event(&mut events).await,
        VehicleEvent::Connected { system_id: 3 }
    );
    assert_eq!(
        next_event(&mut events).await,
        VehicleEvent::ModeChanged {
            system_id: 3,
            custom_mode: 4
        }
    );

    // Go quiet past the timeout; watchdog ticks every 500 ms.
    assert_eq!(
        next_event(&mut events).await,
        VehicleEvent::ConnectionLost { system_id: 3 }
    );

    vehicle.send(&heartbeat());
    assert_eq!(
        next_event(&mut events).await,
        VehicleEvent::ConnectionRegained { system_id: 3 }
    );

    server.stop();
    task.await.unwrap().unwrap();
}
