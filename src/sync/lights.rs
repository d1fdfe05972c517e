use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::controller::{require_finite, CommandError, DeviceDomain, OutboundCommand, SyncController};
use super::entity::{lenient_level, DomainKind, Tracked};

pub const BRIGHTNESS_MIN: u8 = 1;
pub const BRIGHTNESS_MAX: u8 = 254;
/// Cool to warm, in mired.
pub const COLOR_TEMP_MIN: u16 = 250;
pub const COLOR_TEMP_MAX: u16 = 454;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    #[serde(rename = "ON")]
    On,
    #[default]
    #[serde(rename = "OFF")]
    Off,
}

impl PowerState {
    pub fn toggled(self) -> Self {
        match self {
            PowerState::On => PowerState::Off,
            PowerState::Off => PowerState::On,
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, PowerState::On)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LightFields {
    pub state: PowerState,
    pub brightness: u8,
    pub color_temp: u16,
    pub linkquality: Option<u8>,
}

impl Default for LightFields {
    fn default() -> Self {
        Self {
            state: PowerState::Off,
            brightness: BRIGHTNESS_MAX,
            color_temp: 370,
            linkquality: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LightReport {
    pub state: Option<PowerState>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub brightness: Option<u8>,
    pub color_temp: Option<u16>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub linkquality: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightPreset {
    Reading,
    Relax,
    Bright,
    Night,
}

impl LightPreset {
    pub const ALL: [LightPreset; 4] = [
        LightPreset::Reading,
        LightPreset::Relax,
        LightPreset::Bright,
        LightPreset::Night,
    ];

    /// Brightness and color temperature of the preset.
    pub fn settings(self) -> (u8, u16) {
        match self {
            LightPreset::Reading => (254, 300),
            LightPreset::Relax => (150, 400),
            LightPreset::Bright => (254, 250),
            LightPreset::Night => (30, 454),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LightScene {
    Movie,
    Work,
    Evening,
    Goodnight,
}

impl LightScene {
    pub const ALL: [LightScene; 4] = [
        LightScene::Movie,
        LightScene::Work,
        LightScene::Evening,
        LightScene::Goodnight,
    ];

    /// Target state, plus brightness and color temperature when lit.
    pub fn settings(self) -> (PowerState, Option<(u8, u16)>) {
        match self {
            LightScene::Movie => (PowerState::On, Some((50, 400))),
            LightScene::Work => (PowerState::On, Some((254, 280))),
            LightScene::Evening => (PowerState::On, Some((150, 380))),
            LightScene::Goodnight => (PowerState::Off, None),
        }
    }
}

pub fn clamp_brightness(value: f64) -> Result<u8, CommandError> {
    let value = require_finite("brightness", value)?;
    Ok(value
        .round()
        .clamp(f64::from(BRIGHTNESS_MIN), f64::from(BRIGHTNESS_MAX)) as u8)
}

pub fn clamp_color_temp(value: f64) -> Result<u16, CommandError> {
    let value = require_finite("color temperature", value)?;
    Ok(value
        .round()
        .clamp(f64::from(COLOR_TEMP_MIN), f64::from(COLOR_TEMP_MAX)) as u16)
}

#[derive(Debug, Clone, Copy)]
pub struct Lights;

impl DeviceDomain for Lights {
    const KIND: DomainKind = DomainKind::Light;
    type Fields = LightFields;
    type Report = LightReport;

    fn apply_report(fields: &mut LightFields, report: LightReport, _now: DateTime<Local>) {
        if let Some(state) = report.state {
            fields.state = state;
        }
        if let Some(brightness) = report.brightness {
            fields.brightness = brightness;
        }
        if let Some(color_temp) = report.color_temp {
            fields.color_temp = color_temp;
        }
        if let Some(linkquality) = report.linkquality {
            fields.linkquality = Some(linkquality);
        }
    }
}

impl SyncController<Lights> {
    pub fn toggle(&mut self, index: usize) -> Result<OutboundCommand, CommandError> {
        self.issue(index, |fields| {
            fields.state = fields.state.toggled();
            json!({ "state": fields.state })
        })
    }

    /// Turns every available light off if all of them are on, otherwise on.
    pub fn toggle_all(&mut self) -> Result<Vec<OutboundCommand>, CommandError> {
        let target = if all_on(self.entities()) {
            PowerState::Off
        } else {
            PowerState::On
        };

        self.issue_all(|fields| {
            fields.state = target;
            json!({ "state": target })
        })
    }

    pub fn set_brightness(
        &mut self,
        index: usize,
        value: f64,
    ) -> Result<OutboundCommand, CommandError> {
        let brightness = clamp_brightness(value)?;
        self.issue(index, |fields| {
            fields.brightness = brightness;
            json!({ "brightness": brightness })
        })
    }

    pub fn set_color_temp(
        &mut self,
        index: usize,
        value: f64,
    ) -> Result<OutboundCommand, CommandError> {
        let color_temp = clamp_color_temp(value)?;
        self.issue(index, |fields| {
            fields.color_temp = color_temp;
            json!({ "color_temp": color_temp })
        })
    }

    pub fn apply_preset(
        &mut self,
        index: usize,
        preset: LightPreset,
    ) -> Result<OutboundCommand, CommandError> {
        let (brightness, color_temp) = preset.settings();
        self.issue(index, |fields| {
            fields.brightness = brightness;
            fields.color_temp = color_temp;
            json!({ "brightness": brightness, "color_temp": color_temp })
        })
    }

    pub fn apply_scene(&mut self, scene: LightScene) -> Result<Vec<OutboundCommand>, CommandError> {
        let (state, levels) = scene.settings();
        self.issue_all(|fields| {
            let mut payload = Map::new();
            fields.state = state;
            payload.insert("state".to_string(), json!(state));
            if let Some((brightness, color_temp)) = levels {
                fields.brightness = brightness;
                fields.color_temp = color_temp;
                payload.insert("brightness".to_string(), json!(brightness));
                payload.insert("color_temp".to_string(), json!(color_temp));
            }
            Value::Object(payload)
        })
    }
}

/// True when there is at least one available light and all of them are on.
pub fn all_on(lights: &[Tracked<LightFields>]) -> bool {
    let mut available = lights.iter().filter(|light| light.available).peekable();
    available.peek().is_some() && available.all(|light| light.fields.state.is_on())
}

pub fn lights_on(lights: &[Tracked<LightFields>]) -> usize {
    lights
        .iter()
        .filter(|light| light.available && light.fields.state.is_on())
        .count()
}
