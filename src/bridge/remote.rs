//! MQTT request/response side of the bridge.
//!
//! Requests arrive on `REQUEST/{instruction}/{serial}/{request_id}` with a
//! JSON body; the answer goes to `RESPONSE/{instruction}/{serial}/{request_id}`
//! and always carries a status, "KO" when the instruction is unknown or
//! fails. Instructions address a vehicle by `system_id` in the body,
//! defaulting to the first bound vehicle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use rumqttc::{AsyncClient, QoS};
use serde_json::{json, Value};
use tokio::time::Duration;
use tracing::{debug, error, info};

use crate::bridge::instructions::{lookup, Instruction};
use crate::config::CONFIG;
use crate::mav_server::MavlinkServer;

/// Camera selection and intrinsics live in the bridge, not the vehicle:
/// they describe the payload rig, which the autopilot knows nothing about.
#[derive(Debug, Default)]
pub struct CameraState {
    selected: u8,
    intrinsics: Option<Value>,
}

pub struct RemoteBridgeClient {
    server: MavlinkServer,
    camera: Arc<Mutex<CameraState>>,
    client: Option<AsyncClient>,
    closing: Arc<AtomicBool>,
}

#[derive(Debug, PartialEq)]
pub struct Response {
    pub status: &'static str,
    pub payload: Value,
}

impl Response {
    fn ok(payload: Value) -> Self {
        Self {
            status: "OK",
            payload,
        }
    }

    fn ko(reason: &str) -> Self {
        Self {
            status: "KO",
            payload: json!({ "reason": reason }),
        }
    }
}

impl RemoteBridgeClient {
    pub fn new(server: MavlinkServer) -> Self {
        Self {
            server,
            camera: Arc::new(Mutex::new(CameraState::default())),
            client: None,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn start(&mut self) -> Result<tokio::task::JoinHandle<()>> {
        info!("Starting bridge client...");
        let serial = CONFIG.general.station_id.clone();
        let host = &CONFIG.bridge.host;
        let port = CONFIG.bridge.port;
        let client_id = format!("{}_{}", serial, uuid::Uuid::new_v4());
        let mut mqtt_options = rumqttc::MqttOptions::new(client_id, host, port);
        mqtt_options
            .set_keep_alive(Duration::from_secs(30))
            .set_clean_session(true);

        let (client, mut eventloop) = rumqttc::AsyncClient::new(mqtt_options, 10);
        self.client = Some(client.clone());

        client
            .subscribe(format!("REQUEST/+/{}/+", serial), QoS::AtLeastOnce)
            .await
            .context("Failed to subscribe to request topic")?;

        let server = self.server.handle();
        let camera = Arc::clone(&self.camera);
        let responder = client.clone();
        let closing = Arc::clone(&self.closing);
        let handle = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        debug!("[BRIDGE]Connected.....");
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_))) => {
                        debug!("Subscription confirmed by broker");
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Publish(p))) => {
                        debug!(
                            "[BRIDGE]Received request - Topic: {}, Payload: {:?}",
                            p.topic,
                            String::from_utf8_lossy(&p.payload)
                        );
                        if let Err(e) =
                            Self::handle_request(&server, &camera, &responder, &p.topic, &p.payload)
                                .await
                        {
                            error!("[BRIDGE]Failed to handle request: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if closing.load(Ordering::SeqCst) {
                            info!("[BRIDGE]Disconnected, request loop exiting");
                            break;
                        }
                        error!("[BRIDGE]MQTT Error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
        Ok(handle)
    }

    async fn handle_request(
        server: &MavlinkServer,
        camera: &Mutex<CameraState>,
        client: &AsyncClient,
        topic: &str,
        payload: &[u8],
    ) -> Result<()> {
        let parts: Vec<&str> = topic.split('/').collect();
        let [_, instruction_name, serial, request_id] = parts.as_slice() else {
            return Err(anyhow!("malformed request topic {topic}"));
        };

        let body: Value = if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(payload).unwrap_or(Value::Null)
        };

        let response = execute(server, camera, instruction_name, &body);
        let reply_topic = format!("RESPONSE/{instruction_name}/{serial}/{request_id}");
        let reply = json!({
            "instruction": instruction_name,
            "status": response.status,
            "payload": response.payload,
        });
        client
            .publish(
                reply_topic,
                QoS::AtLeastOnce,
                false,
                serde_json::to_string(&reply)?,
            )
            .await
            .context("Failed to publish response")?;
        Ok(())
    }

    pub fn mqtt_client(&self) -> Option<AsyncClient> {
        self.client.clone()
    }

    pub async fn stop(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if let Some(client) = &self.client {
            if let Err(e) = client
                .disconnect()
                .await
                .context("Failed to disconnect from broker")
            {
                error!("Failed to disconnect bridge client: {}", e);
            }
        }
    }
}

/// Resolve and run one instruction. Pure apart from the command sends, so
/// the vocabulary is testable without a broker.
pub fn execute(
    server: &MavlinkServer,
    camera: &Mutex<CameraState>,
    instruction_name: &str,
    body: &Value,
) -> Response {
    let Some(instruction) = lookup(instruction_name) else {
        return Response::ko("unknown instruction");
    };

    let result = match instruction {
        Instruction::GetCameras => {
            let cam = camera.lock().unwrap();
            return Response::ok(json!({ "cameras": [cam.selected] }));
        }
        Instruction::GetCamera => {
            let cam = camera.lock().unwrap();
            return Response::ok(json!({
                "camera": cam.selected,
                "intrinsics": cam.intrinsics,
            }));
        }
        Instruction::SetCamera => {
            let Some(id) = body["camera"].as_u64() else {
                return Response::ko("missing camera id");
            };
            camera.lock().unwrap().selected = id as u8;
            return Response::ok(Value::Null);
        }
        Instruction::SetCameraIntrinsics => {
            camera.lock().unwrap().intrinsics = Some(body.clone());
            return Response::ok(Value::Null);
        }
        Instruction::OpenStream => with_vehicle(server, body, |srv, sysid| {
            srv.send_command(sysid, |enc| enc.start_streaming(stream_id(body)))
        }),
        Instruction::StopStream => with_vehicle(server, body, |srv, sysid| {
            srv.send_command(sysid, |enc| enc.stop_streaming(stream_id(body)))
        }),
        Instruction::ResetGimbal => with_vehicle(server, body, |srv, sysid| {
            srv.send_command(sysid, |enc| enc.reset_gimbal())
        }),
        Instruction::MoveGimbal => {
            let pitch = body["pitch"].as_f64().unwrap_or(0.0) as f32;
            let yaw = body["yaw"].as_f64().unwrap_or(0.0) as f32;
            with_vehicle(server, body, |srv, sysid| {
                srv.send_command(sysid, |enc| enc.move_gimbal(pitch, yaw))
            })
        }
        Instruction::ZoomCamera => {
            let Some(zoom) = body["zoom"].as_f64() else {
                return Response::ko("missing zoom level");
            };
            with_vehicle(server, body, |srv, sysid| {
                srv.send_command(sysid, |enc| enc.zoom_camera(zoom as f32))
            })
        }
        Instruction::TakePhoto => with_vehicle(server, body, |srv, sysid| {
            srv.send_command(sysid, |enc| enc.trigger_camera())
        }),
        Instruction::StartRecording => with_vehicle(server, body, |srv, sysid| {
            srv.send_command(sysid, |enc| enc.start_recording())
        }),
        Instruction::StopRecording => with_vehicle(server, body, |srv, sysid| {
            srv.send_command(sysid, |enc| enc.stop_recording())
        }),
        Instruction::SetServo => {
            let (Some(channel), Some(pwm)) = (body["channel"].as_u64(), body["pwm"].as_u64())
            else {
                return Response::ko("missing channel or pwm");
            };
            with_vehicle(server, body, |srv, sysid| {
                srv.send_command(sysid, |enc| enc.set_servo(channel as u8, pwm as u16))
            })
        }
    };

    match result {
        Ok(()) => Response::ok(Value::Null),
        Err(e) => {
            error!("instruction {instruction_name} failed: {e}");
            Response::ko("command send failed")
        }
    }
}

fn stream_id(body: &Value) -> u8 {
    body["stream_id"].as_u64().unwrap_or(0) as u8
}

/// Pick the addressed vehicle, defaulting to the first bound one.
fn with_vehicle<F>(server: &MavlinkServer, body: &Value, send: F) -> Result<()>
where
    F: FnOnce(&MavlinkServer, u8) -> Result<()>,
{
    let sysid = match body["system_id"].as_u64() {
        Some(id) => id as u8,
        None => *server
            .system_ids()
            .first()
            .ok_or_else(|| anyhow!("no vehicle bound"))?,
    };
    send(server, sysid)
}
