//! Dashboard configuration
//!
//! Loaded from TOML, `~/.config/homedash/dashboard.toml` by default. Every
//! section is optional; missing sections fall back to the built-in
//! deployment below.
//!
//! ```toml
//! [broker]
//! url = "ws://pi:9001"
//!
//! [topics]
//! base = "zigbee2mqtt"
//!
//! [[lights]]
//! id = "study_light"
//! name = "Study Light"
//! friendly_name = "[Study] IKEA Light"
//! ```

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::bus::TopicScheme;
use crate::sync::thermostats::{DEFAULT_MAX_SETPOINT, DEFAULT_MIN_SETPOINT};
use crate::sync::OpeningKind;

const CONFIG_DIR: &str = "homedash";
const CONFIG_FILE: &str = "dashboard.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DashboardConfig {
    pub broker: BrokerConfig,
    pub topics: TopicsConfig,
    pub staleness: StalenessConfig,
    pub lights: Vec<LightConfig>,
    pub thermostats: Vec<ThermostatConfig>,
    pub contacts: Vec<ContactConfig>,
    pub climate: Vec<ClimateSensorConfig>,
    pub motion: Vec<MotionSensorConfig>,
    pub rooms: Vec<RoomConfig>,
    pub weather: Option<WeatherConfig>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub reconnect_interval_secs: u64,
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "ws://pi:9001".to_string(),
            client_id_prefix: "homedash".to_string(),
            keep_alive_secs: 30,
            reconnect_interval_secs: 5,
            channel_capacity: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct TopicsConfig {
    pub base: String,
}

impl TopicsConfig {
    pub fn scheme(&self) -> TopicScheme {
        TopicScheme::new(self.base.clone())
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            base: "zigbee2mqtt".to_string(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct StalenessConfig {
    pub threshold_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            threshold_secs: 5 * 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct LightConfig {
    pub id: String,
    pub name: String,
    pub friendly_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct ThermostatConfig {
    pub id: String,
    pub name: String,
    pub friendly_name: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default = "default_min_setpoint")]
    pub min_setpoint: f64,
    #[serde(default = "default_max_setpoint")]
    pub max_setpoint: f64,
}

fn default_min_setpoint() -> f64 {
    DEFAULT_MIN_SETPOINT
}

fn default_max_setpoint() -> f64 {
    DEFAULT_MAX_SETPOINT
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ContactConfig {
    pub id: String,
    pub name: String,
    pub friendly_name: String,
    #[serde(default)]
    pub kind: OpeningKind,
    #[serde(default)]
    pub room: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ClimateSensorConfig {
    pub id: String,
    pub name: String,
    pub friendly_name: String,
    pub room: String,
    #[serde(default)]
    pub primary: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct MotionSensorConfig {
    pub id: String,
    pub name: String,
    pub friendly_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RoomConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub outdoor: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct WeatherConfig {
    /// Home Assistant state endpoint, e.g. `http://pi:8123/api/states/weather.forecast_home`.
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_weather_interval")]
    pub poll_interval_secs: u64,
}

fn default_weather_interval() -> u64 {
    5 * 60
}

impl DashboardConfig {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_DIR)
            .join(CONFIG_FILE)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: DashboardConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        config.validate()?;

        info!("Loaded dashboard config from {}", path.display());
        Ok(config)
    }

    /// Loads `path`, falling back to the built-in deployment if it is missing
    /// or broken.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Using default dashboard config: {}", e);
                Self::default()
            }
        }
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize dashboard config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }

    /// Rejects configs the controllers cannot work with.
    pub fn validate(&self) -> Result<()> {
        let mut ids = std::collections::HashSet::new();
        let all_ids = self
            .lights
            .iter()
            .map(|l| &l.id)
            .chain(self.thermostats.iter().map(|t| &t.id))
            .chain(self.contacts.iter().map(|c| &c.id))
            .chain(self.climate.iter().map(|c| &c.id))
            .chain(self.motion.iter().map(|m| &m.id));
        for id in all_ids {
            if !ids.insert(id) {
                return Err(eyre!("Duplicate device id: {}", id));
            }
        }

        for thermostat in &self.thermostats {
            if !thermostat.min_setpoint.is_finite() || !thermostat.max_setpoint.is_finite() {
                return Err(eyre!(
                    "Thermostat {} has a non-finite setpoint bound",
                    thermostat.id
                ));
            }
            if thermostat.min_setpoint > thermostat.max_setpoint {
                return Err(eyre!(
                    "Thermostat {} has min setpoint above max setpoint",
                    thermostat.id
                ));
            }
        }

        for sensor in &self.climate {
            if !self.rooms.iter().any(|room| room.id == sensor.room) {
                return Err(eyre!(
                    "Climate sensor {} refers to unknown room {}",
                    sensor.id,
                    sensor.room
                ));
            }
        }
        Ok(())
    }
}

fn light(id: &str, name: &str, friendly_name: &str) -> LightConfig {
    LightConfig {
        id: id.to_string(),
        name: name.to_string(),
        friendly_name: friendly_name.to_string(),
    }
}

fn thermostat(id: &str, name: &str, friendly_name: &str, room: &str) -> ThermostatConfig {
    ThermostatConfig {
        id: id.to_string(),
        name: name.to_string(),
        friendly_name: friendly_name.to_string(),
        room: Some(room.to_string()),
        min_setpoint: DEFAULT_MIN_SETPOINT,
        max_setpoint: DEFAULT_MAX_SETPOINT,
    }
}

fn contact(id: &str, name: &str, friendly_name: &str, kind: OpeningKind, room: &str) -> ContactConfig {
    ContactConfig {
        id: id.to_string(),
        name: name.to_string(),
        friendly_name: friendly_name.to_string(),
        kind,
        room: Some(room.to_string()),
    }
}

fn climate(id: &str, name: &str, friendly_name: &str, room: &str, primary: bool) -> ClimateSensorConfig {
    ClimateSensorConfig {
        id: id.to_string(),
        name: name.to_string(),
        friendly_name: friendly_name.to_string(),
        room: room.to_string(),
        primary,
    }
}

fn room(id: &str, name: &str, outdoor: bool) -> RoomConfig {
    RoomConfig {
        id: id.to_string(),
        name: name.to_string(),
        outdoor,
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            topics: TopicsConfig::default(),
            staleness: StalenessConfig::default(),
            lights: vec![
                light("study_light", "Study Light", "[Study] IKEA Light"),
                light("living_light", "Living Room Light", "[Living] IKEA Light"),
            ],
            thermostats: vec![
                thermostat("study_thermostat", "Study", "[Study] Thermostat", "study"),
                thermostat("living_thermostat", "Living Room", "[Living] Thermostat", "living"),
                thermostat("bedroom_thermostat", "Bedroom", "[Bedroom] Thermostat", "bedroom"),
            ],
            contacts: vec![
                contact("front_door", "Front Door", "[Hallway] Front Door", OpeningKind::Door, "hallway"),
                contact("balcony_door", "Balcony Door", "[Living] Balcony Door", OpeningKind::Door, "living"),
                contact("study_window", "Study Window", "[Study] Window", OpeningKind::Window, "study"),
                contact("bedroom_window", "Bedroom Window", "[Bedroom] Window", OpeningKind::Window, "bedroom"),
            ],
            climate: vec![
                climate("study_climate", "Study", "[Study] Climate", "study", true),
                climate("living_climate", "Living Room", "[Living] Climate", "living", true),
                climate("bedroom_climate", "Bedroom", "[Bedroom] Climate", "bedroom", true),
                climate("bathroom_climate", "Bathroom", "[Bathroom] Climate", "bathroom", true),
                climate("hallway_co2", "Hallway CO2", "[Hallway] CO2", "hallway", false),
                climate("balcony_climate", "Balcony", "[Balcony] Climate", "balcony", true),
            ],
            motion: vec![
                MotionSensorConfig {
                    id: "mailbox".to_string(),
                    name: "Mailbox".to_string(),
                    friendly_name: "[Mailbox] Motion Sensor".to_string(),
                },
                MotionSensorConfig {
                    id: "hot_water".to_string(),
                    name: "Hot Water".to_string(),
                    friendly_name: "Vibration Sensor".to_string(),
                },
            ],
            rooms: vec![
                room("study", "Study", false),
                room("living", "Living Room", false),
                room("bedroom", "Bedroom", false),
                room("bathroom", "Bathroom", false),
                room("hallway", "Hallway", false),
                room("balcony", "Balcony", true),
            ],
            weather: Some(WeatherConfig {
                url: "http://pi:8123/api/states/weather.forecast_home".to_string(),
                token: None,
                poll_interval_secs: default_weather_interval(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        let config = DashboardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.topics.scheme().base(), "zigbee2mqtt");
        assert_eq!(config.lights.len(), 2);
    }

    #[test]
    fn missing_sections_use_defaults() {
        let config: DashboardConfig = toml::from_str(
            r#"
            [broker]
            url = "mqtt://localhost:1883"

            [[lights]]
            id = "desk"
            name = "Desk"
            friendly_name = "[Office] Desk Lamp"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.url, "mqtt://localhost:1883");
        assert_eq!(config.broker.reconnect_interval_secs, 5);
        assert_eq!(config.lights.len(), 1);
        assert_eq!(config.thermostats, DashboardConfig::default().thermostats);
        assert_eq!(config.staleness, StalenessConfig::default());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut config = DashboardConfig::default();
        config.lights.push(config.lights[0].clone());
        assert!(config.validate().is_err());
    }

    #[test]
    fn setpoint_bounds_must_be_finite() {
        let mut config = DashboardConfig::default();
        config.thermostats[0].min_setpoint = f64::NAN;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("non-finite"));

        let mut config = DashboardConfig::default();
        config.thermostats[1].max_setpoint = f64::INFINITY;
        assert!(config.validate().is_err());

        let config: DashboardConfig = toml::from_str(
            r#"
            [[thermostats]]
            id = "study_thermostat"
            name = "Study"
            friendly_name = "[Study] Thermostat"
            min_setpoint = nan
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn climate_sensors_need_a_known_room() {
        let mut config = DashboardConfig::default();
        config.climate[0].room = "attic".to_string();
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn save_and_load_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dashboard.toml");

        let mut config = DashboardConfig::default();
        config.topics.base = "z2m".to_string();
        config.thermostats[0].max_setpoint = 24.5;
        config.save(&path).await.unwrap();

        let loaded = DashboardConfig::load(&path).await.unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn broken_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dashboard.toml");
        tokio::fs::write(&path, "lights = 5").await.unwrap();

        assert!(DashboardConfig::load(&path).await.is_err());
        assert_eq!(DashboardConfig::load_or_default(&path).await, DashboardConfig::default());
        assert_eq!(
            DashboardConfig::load_or_default(dir.path().join("missing.toml")).await,
            DashboardConfig::default()
        );
    }
}
