//! TOML configuration for the tracker
//!
//! Recognized sections: `[dps]` for the certificate-provisioned path,
//! `[connection]` for the legacy symmetric-key path (either a full
//! connection string or individual fields), `[simulation]` runtime
//! parameters, and `[[route]]` / `[[geofences]]` tables. Environment
//! variables override file values when present.

use crate::connection::ConnectionSettings;
use crate::domain::Location;
use crate::sim::geo::{Geofence, RoutePoint};
use crate::transport::TlsIdentity;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("invalid id_scope {0:?}: expected 0ne followed by 8 hex digits")]
    InvalidIdScope(String),

    #[error("invalid imei {0:?}: expected 15 digits")]
    InvalidImei(String),

    #[error("{field} out of range: {value}")]
    ValueOutOfRange { field: &'static str, value: String },

    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidEnvValue { var: &'static str, value: String },

    #[error("missing connection settings: provide [dps] or [connection]")]
    MissingConnectionSettings,
}

fn default_verify_server() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DpsSection {
    id_scope: String,
    imei: String,
    device_cert_base_path: String,
    root_ca_path: String,
    #[serde(default = "default_verify_server")]
    verify_server_cert: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConnectionSection {
    connection_string: String,
    iot_hub_host: String,
    device_id: String,
    device_key_base64: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SimulationSection {
    heartbeat_seconds: Option<u32>,
    speed_limit_kph: Option<f64>,
    start_lat: Option<f64>,
    start_lon: Option<f64>,
    start_alt: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    dps: Option<DpsSection>,
    connection: Option<ConnectionSection>,
    simulation: Option<SimulationSection>,
    #[serde(default)]
    route: Vec<RoutePoint>,
    #[serde(default)]
    geofences: Vec<Geofence>,
}

/// Resolved provisioning settings with certificate paths constructed from
/// the base path and IMEI
#[derive(Debug, Clone)]
pub struct DpsSettings {
    pub id_scope: String,
    pub imei: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub chain_path: PathBuf,
    pub ca_path: PathBuf,
    pub verify_server: bool,
}

impl DpsSettings {
    /// TLS identity presented to the provisioning service and the hub. The
    /// certificate chain is what travels in the handshake.
    pub fn tls_identity(&self) -> TlsIdentity {
        TlsIdentity {
            cert_path: self.chain_path.clone(),
            key_path: self.key_path.clone(),
            ca_path: self.ca_path.clone(),
            verify_server: self.verify_server,
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub device_id: String,
    pub dps: Option<DpsSettings>,
    pub iot_hub_host: String,
    pub device_key_base64: String,
    pub heartbeat_seconds: u32,
    pub speed_limit_kph: f64,
    pub start_location: Location,
    pub route: Vec<RoutePoint>,
    pub geofences: Vec<Geofence>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            device_id: "SIM-001".to_string(),
            dps: None,
            iot_hub_host: String::new(),
            device_key_base64: String::new(),
            heartbeat_seconds: 60,
            speed_limit_kph: 90.0,
            start_location: Location {
                lat: -26.2041,
                lon: 28.0473,
                alt: 1720.0,
                accuracy: 12.5,
            },
            route: Vec::new(),
            geofences: Vec::new(),
        }
    }
}

impl SimulatorConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let file: ConfigFile = toml::from_str(&content)?;
        Self::from_file(file)
    }

    fn from_file(file: ConfigFile) -> Result<Self, ConfigError> {
        let mut config = SimulatorConfig::default();

        if let Some(dps) = file.dps {
            if !is_valid_id_scope(&dps.id_scope) {
                return Err(ConfigError::InvalidIdScope(dps.id_scope));
            }
            if !is_valid_imei(&dps.imei) {
                return Err(ConfigError::InvalidImei(dps.imei));
            }

            let device_dir = Path::new(&dps.device_cert_base_path).join(&dps.imei);
            config.dps = Some(DpsSettings {
                cert_path: device_dir.join("device.cert.pem"),
                key_path: device_dir.join("device.key.pem"),
                chain_path: device_dir.join("device.chain.pem"),
                ca_path: PathBuf::from(&dps.root_ca_path),
                id_scope: dps.id_scope,
                imei: dps.imei,
                verify_server: dps.verify_server_cert,
            });
        }

        if let Some(connection) = file.connection {
            if !connection.connection_string.is_empty() {
                let (host, device_id, key) =
                    parse_connection_string(&connection.connection_string);
                config.iot_hub_host = host;
                if !device_id.is_empty() {
                    config.device_id = device_id;
                }
                config.device_key_base64 = key;
            } else {
                config.iot_hub_host = connection.iot_hub_host;
                if !connection.device_id.is_empty() {
                    config.device_id = connection.device_id;
                }
                config.device_key_base64 = connection.device_key_base64;
            }
        }

        if let Some(simulation) = file.simulation {
            if let Some(heartbeat) = simulation.heartbeat_seconds {
                config.heartbeat_seconds = heartbeat;
            }
            if let Some(limit) = simulation.speed_limit_kph {
                config.speed_limit_kph = limit;
            }
            if let Some(lat) = simulation.start_lat {
                config.start_location.lat = lat;
            }
            if let Some(lon) = simulation.start_lon {
                config.start_location.lon = lon;
            }
            if let Some(alt) = simulation.start_alt {
                config.start_location.alt = alt;
            }
        }

        config.route = file.route;
        config.geofences = file.geofences;

        config.validate()?;
        Ok(config)
    }

    /// Fallback configuration when no file is available. Carries a sample
    /// route and geofences so an env-only setup produces events immediately.
    pub fn sample() -> Self {
        Self {
            route: vec![
                RoutePoint {
                    lat: -26.2041,
                    lon: 28.0473,
                },
                RoutePoint {
                    lat: -26.2000,
                    lon: 28.0500,
                },
                RoutePoint {
                    lat: -26.1950,
                    lon: 28.0520,
                },
                RoutePoint {
                    lat: -26.1920,
                    lon: 28.0480,
                },
            ],
            geofences: vec![
                Geofence {
                    id: "office".to_string(),
                    lat: -26.2041,
                    lon: 28.0473,
                    radius_meters: 100.0,
                },
                Geofence {
                    id: "warehouse".to_string(),
                    lat: -26.1920,
                    lon: 28.0480,
                    radius_meters: 150.0,
                },
            ],
            ..Self::default()
        }
    }

    /// Apply `IOT_HOST`, `DEVICE_ID`, `DEVICE_KEY`, `HEARTBEAT_SEC` and
    /// `SPEED_LIMIT_KPH` overrides from the environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("IOT_HOST") {
            if !host.is_empty() {
                self.iot_hub_host = host;
            }
        }
        if let Ok(device_id) = std::env::var("DEVICE_ID") {
            if !device_id.is_empty() {
                self.device_id = device_id;
            }
        }
        if let Ok(key) = std::env::var("DEVICE_KEY") {
            if !key.is_empty() {
                self.device_key_base64 = key;
            }
        }
        if let Ok(heartbeat) = std::env::var("HEARTBEAT_SEC") {
            self.heartbeat_seconds =
                heartbeat
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnvValue {
                        var: "HEARTBEAT_SEC",
                        value: heartbeat,
                    })?;
        }
        if let Ok(limit) = std::env::var("SPEED_LIMIT_KPH") {
            self.speed_limit_kph = limit.parse().map_err(|_| ConfigError::InvalidEnvValue {
                var: "SPEED_LIMIT_KPH",
                value: limit,
            })?;
        }

        self.validate()
    }

    pub fn has_dps(&self) -> bool {
        self.dps.is_some()
    }

    pub fn has_legacy(&self) -> bool {
        !self.iot_hub_host.is_empty()
            && !self.device_id.is_empty()
            && !self.device_key_base64.is_empty()
    }

    /// Connection settings for the manager; the provisioned path wins when
    /// both are configured
    pub fn connection_settings(&self) -> Result<ConnectionSettings, ConfigError> {
        if let Some(dps) = &self.dps {
            return Ok(ConnectionSettings::Provisioned {
                imei: dps.imei.clone(),
                id_scope: dps.id_scope.clone(),
                tls: dps.tls_identity(),
                timeout: Duration::from_secs(120),
            });
        }
        if self.has_legacy() {
            return Ok(ConnectionSettings::Legacy {
                host: self.iot_hub_host.clone(),
                device_id: self.device_id.clone(),
                device_key_base64: self.device_key_base64.clone(),
            });
        }
        Err(ConfigError::MissingConnectionSettings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(10..=3600).contains(&self.heartbeat_seconds) {
            return Err(ConfigError::ValueOutOfRange {
                field: "heartbeat_seconds",
                value: self.heartbeat_seconds.to_string(),
            });
        }
        if !(1.0..=300.0).contains(&self.speed_limit_kph) {
            return Err(ConfigError::ValueOutOfRange {
                field: "speed_limit_kph",
                value: self.speed_limit_kph.to_string(),
            });
        }
        Ok(())
    }
}

/// Parse a `HostName=...;DeviceId=...;SharedAccessKey=...` connection string
fn parse_connection_string(connection_string: &str) -> (String, String, String) {
    let mut host = String::new();
    let mut device_id = String::new();
    let mut key = String::new();

    for part in connection_string.split(';') {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };
        // split_once keeps any '=' padding inside the base64 key intact
        match name {
            "HostName" => host = value.to_string(),
            "DeviceId" => device_id = value.to_string(),
            "SharedAccessKey" => key = value.to_string(),
            _ => {}
        }
    }

    (host, device_id, key)
}

/// `0ne` followed by eight uppercase hex digits
fn is_valid_id_scope(id_scope: &str) -> bool {
    id_scope.len() == 11
        && id_scope.starts_with("0ne")
        && id_scope[3..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase() && c.is_ascii_hexdigit())
}

/// Exactly fifteen decimal digits
fn is_valid_imei(imei: &str) -> bool {
    imei.len() == 15 && imei.chars().all(|c| c.is_ascii_digit())
}
