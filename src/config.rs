use anyhow::Result;
use config;
use once_cell::sync::Lazy;
use serde::Deserialize;

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

#[derive(Debug, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub mavlink: MavlinkConfig,
    pub battery: BatteryConfig,
    pub bridge: BridgeConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
    /// Serial number the bridge answers to on the command topics.
    pub station_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MavlinkConfig {
    /// Local UDP listen address, e.g. "0.0.0.0:14550".
    pub listen_addr: String,
    pub system_id: u8,
    pub component_id: u8,
    /// Milliseconds without a heartbeat before a vehicle counts as lost.
    pub heartbeat_timeout_ms: u64,
    /// Stamp derived telemetry with the last attitude time.
    pub attitude_stamped: bool,
}

#[derive(Debug, Deserialize)]
pub struct BatteryConfig {
    pub warn_voltage: f64,
    pub cells: u32,
}

#[derive(Debug, Deserialize)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Telemetry publish interval, seconds.
    pub telemetry_interval: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env = std::env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let config_path = format!("config/{}.toml", env);
        let fallback_path = format!("/etc/groundlink/{}.toml", env);

        let config_builder = config::Config::builder();
        let config_builder = if std::path::Path::new(&config_path).exists() {
            config_builder.add_source(config::File::with_name(&config_path))
        } else {
            config_builder.add_source(config::File::with_name(&fallback_path))
        };

        let settings = config_builder.build()?;
        let config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn dispatcher(&self) -> crate::dispatcher::DispatcherConfig {
        crate::dispatcher::DispatcherConfig {
            gcs_system_id: self.mavlink.system_id,
            gcs_component_id: self.mavlink.component_id,
            heartbeat_timeout: std::time::Duration::from_millis(self.mavlink.heartbeat_timeout_ms),
            vehicle: crate::vehicle::VehicleOptions {
                warn_voltage: self.battery.warn_voltage,
                battery_cells: self.battery.cells,
                attitude_stamped: self.mavlink.attitude_stamped,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_a_full_config_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            r#"
[general]
log_level = "info"
station_id = "GCS-0001"

[mavlink]
listen_addr = "0.0.0.0:14550"
system_id = 255
component_id = 190
heartbeat_timeout_ms = 3500
attitude_stamped = false

[battery]
warn_voltage = 9.5
cells = 3

[bridge]
enabled = true
host = "localhost"
port = 1883
telemetry_interval = 2
"#
        )
        .unwrap();

        let settings = config::Config::builder()
            .add_source(config::File::from(file.path()))
            .build()
            .unwrap();
        let config: Config = settings.try_deserialize().unwrap();
        assert_eq!(config.mavlink.system_id, 255);
        assert_eq!(config.battery.cells, 3);
        assert!(config.bridge.enabled);
        assert_eq!(config.general.station_id, "GCS-0001");

        let d = config.dispatcher();
        assert_eq!(d.heartbeat_timeout.as_millis(), 3500);
        assert_eq!(d.vehicle.warn_voltage, 9.5);
    }
}
