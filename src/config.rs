use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::message_logger::LogMode;

#[derive(Debug, Clone)]
pub struct Config {
    pub ecoflow: EcoflowConfig,
    pub homie: Option<HomieConfig>,
    pub raw_log: RawLogConfig,
    pub heartbeat_timeout: Duration,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub tls: bool,
}

#[derive(Debug, Clone)]
pub struct EcoflowConfig {
    pub mqtt: MqttConfig,
    pub user_id: String,
}

#[derive(Debug, Clone)]
pub struct HomieConfig {
    pub mqtt: MqttConfig,
    pub topic_prefix: String,
}

#[derive(Debug, Clone)]
pub struct RawLogConfig {
    pub mode: LogMode,
    pub folder: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Powerstream,
    SmartPlug,
    DeltaMax,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub serial: String,
    pub device_type: DeviceType,
    pub name: String,
    /// Data-driven field table, keyed by quota name.
    pub properties: HashMap<String, PropertyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PropertyConfig {
    #[serde(default)]
    pub divisor: Option<u32>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub converter: Option<String>,
}

// Serde structs for parsing the devices file
#[derive(Deserialize)]
struct RawDevice {
    serial: String,
    #[serde(rename = "type")]
    device_type: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    properties_file: Option<String>,
    #[serde(default)]
    properties: Option<HashMap<String, PropertyConfig>>,
}

#[derive(Deserialize)]
struct RawPropertiesFile {
    properties: HashMap<String, PropertyConfig>,
}

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingEnv(key))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let devices_file = env_or_default("DEVICES_FILE", "devices.json".to_string());
        let devices = load_devices(&devices_file)?;

        let homie = match env_optional("HOMIE_MQTT") {
            Some(broker_host) => Some(HomieConfig {
                mqtt: MqttConfig {
                    broker_host,
                    broker_port: env_or_default("HOMIE_MQTT_PORT", 1883),
                    username: env_optional("HOMIE_MQTT_USERNAME"),
                    password: env_optional("HOMIE_MQTT_PASSWORD"),
                    client_id: env_or_default("HOMIE_CLIENT_ID", "ecoflow-to-homie".to_string()),
                    tls: env_or_default("HOMIE_MQTT_TLS", false),
                },
                topic_prefix: env_or_default("HOMIE_TOPIC_PREFIX", "homie".to_string()),
            }),
            None => None,
        };

        let raw_log_mode = env_or_default("RAW_LOG_MODE", "none".to_string());
        let config = Self {
            ecoflow: EcoflowConfig {
                mqtt: MqttConfig {
                    broker_host: env_or_default("ECOFLOW_MQTT_HOST", "mqtt.ecoflow.com".to_string()),
                    broker_port: env_or_default("ECOFLOW_MQTT_PORT", 8883),
                    username: Some(env_required("ECOFLOW_MQTT_USERNAME")?),
                    password: Some(env_required("ECOFLOW_MQTT_PASSWORD")?),
                    client_id: env_required("ECOFLOW_CLIENT_ID")?,
                    tls: env_or_default("ECOFLOW_MQTT_TLS", true),
                },
                user_id: env_required("ECOFLOW_USER_ID")?,
            },
            homie,
            raw_log: RawLogConfig {
                mode: raw_log_mode.parse().map_err(ConfigError::Invalid)?,
                folder: env_or_default("RAW_LOG_FOLDER", "raw".to_string()),
            },
            heartbeat_timeout: Duration::from_secs(env_or_default("HEARTBEAT_TIMEOUT_SECS", 120)),
            devices,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ecoflow.mqtt.broker_host.is_empty() {
            return Err(ConfigError::Invalid("ECOFLOW_MQTT_HOST must not be empty".into()));
        }
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("No enabled devices found in devices file".into()));
        }
        if self.heartbeat_timeout.is_zero() {
            return Err(ConfigError::Invalid("HEARTBEAT_TIMEOUT_SECS must be > 0".into()));
        }
        Ok(())
    }
}

fn load_devices(path: &str) -> Result<Vec<DeviceConfig>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    let base = Path::new(path).parent().unwrap_or(Path::new("."));
    parse_devices(&content, path, base)
}

fn parse_devices(content: &str, path: &str, base: &Path) -> Result<Vec<DeviceConfig>, ConfigError> {
    let raw_devices: Vec<RawDevice> =
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;

    raw_devices
        .into_iter()
        .filter(|raw| !raw.disabled)
        .map(|raw| {
            let device_type = parse_device_type(&raw.device_type).ok_or_else(|| {
                ConfigError::UnknownDeviceType {
                    serial: raw.serial.clone(),
                    device_type: raw.device_type.clone(),
                }
            })?;

            let mut properties = match &raw.properties_file {
                Some(file) => load_properties(&base.join(file))?,
                None => HashMap::new(),
            };
            // inline entries win over the file
            properties.extend(raw.properties.unwrap_or_default());

            let name = raw
                .name
                .unwrap_or_else(|| default_name(device_type).to_string());

            Ok(DeviceConfig {
                serial: raw.serial,
                device_type,
                name,
                properties,
            })
        })
        .collect()
}

fn load_properties(path: &Path) -> Result<HashMap<String, PropertyConfig>, ConfigError> {
    let display = path.display().to_string();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    let file: RawPropertiesFile =
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
    Ok(file.properties)
}

fn parse_device_type(raw: &str) -> Option<DeviceType> {
    match raw {
        "powerstream" => Some(DeviceType::Powerstream),
        "smart-plug" | "smartplug" => Some(DeviceType::SmartPlug),
        "delta-max" => Some(DeviceType::DeltaMax),
        _ => None,
    }
}

fn default_name(device_type: DeviceType) -> &'static str {
    match device_type {
        DeviceType::Powerstream => "Powerstream",
        DeviceType::SmartPlug => "Smart Plug",
        DeviceType::DeltaMax => "Delta Max",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_devices() {
        let json = r#"[
            {"serial": "HW51ABC", "type": "powerstream"},
            {"serial": "HW52DEF", "type": "smart-plug", "name": "Fridge", "disabled": true},
            {"serial": "R331XYZ", "type": "delta-max", "name": "Garage",
             "properties": {"bmsMaster.soc": {"unit": "%", "node": "bmsMaster", "name": "soc"}}}
        ]"#;
        let devices = parse_devices(json, "devices.json", Path::new(".")).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_type, DeviceType::Powerstream);
        assert_eq!(devices[0].name, "Powerstream");
        assert_eq!(devices[1].name, "Garage");
        let soc = &devices[1].properties["bmsMaster.soc"];
        assert_eq!(soc.unit.as_deref(), Some("%"));
        assert_eq!(soc.divisor, None);
    }

    #[test]
    fn test_unknown_device_type() {
        let json = r#"[{"serial": "X1", "type": "river"}]"#;
        let err = parse_devices(json, "devices.json", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDeviceType { .. }));
    }

    #[test]
    fn test_properties_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("delta-max.json"),
            r#"{"properties": {
                "pd.remainTime": {"converter": "minutes", "node": "pd", "name": "remainTime"},
                "bmsMaster.vol": {"divisor": 1000, "unit": "V", "node": "bmsMaster"}
            }}"#,
        )
        .unwrap();
        let json = r#"[{"serial": "R331XYZ", "type": "delta-max", "properties_file": "delta-max.json",
                        "properties": {"bmsMaster.vol": {"divisor": 100, "unit": "V"}}}]"#;
        let devices = parse_devices(json, "devices.json", dir.path()).unwrap();
        let properties = &devices[0].properties;
        assert_eq!(properties.len(), 2);
        assert_eq!(properties["bmsMaster.vol"].divisor, Some(100));
        assert_eq!(properties["pd.remainTime"].converter.as_deref(), Some("minutes"));
    }

    #[test]
    fn test_malformed_devices_file() {
        let err = parse_devices("{", "devices.json", Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
