use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::controller::{require_finite, CommandError, DeviceDomain, OutboundCommand, SyncController};
use super::entity::{lenient_level, DomainKind, Tracked};

pub const DEFAULT_MIN_SETPOINT: f64 = 5.0;
pub const DEFAULT_MAX_SETPOINT: f64 = 22.0;
/// Base for relative adjustments before any setpoint was reported.
pub const FALLBACK_SETPOINT: f64 = 20.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningState {
    Heat,
    #[default]
    #[serde(other)]
    Idle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    #[default]
    Heat,
    Off,
    #[serde(other)]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThermostatFields {
    pub room: Option<String>,
    pub local_temperature: Option<f64>,
    /// Last confirmed setpoint.
    pub target: Option<f64>,
    /// Optimistic setpoint waiting for its echo.
    pub pending_target: Option<f64>,
    pub running_state: RunningState,
    pub system_mode: SystemMode,
    pub pending_mode: Option<SystemMode>,
    pub battery: Option<u8>,
    pub linkquality: Option<u8>,
    pub min_setpoint: f64,
    pub max_setpoint: f64,
}

impl ThermostatFields {
    pub fn new(room: Option<String>, min_setpoint: f64, max_setpoint: f64) -> Self {
        Self {
            room,
            local_temperature: None,
            target: None,
            pending_target: None,
            running_state: RunningState::Idle,
            system_mode: SystemMode::Heat,
            pending_mode: None,
            battery: None,
            linkquality: None,
            min_setpoint,
            max_setpoint,
        }
    }

    /// The setpoint to display: the pending one while syncing.
    pub fn display_target(&self) -> Option<f64> {
        self.pending_target.or(self.target)
    }

    pub fn display_mode(&self) -> SystemMode {
        self.pending_mode.unwrap_or(self.system_mode)
    }

    pub fn clamp_setpoint(&self, value: f64) -> f64 {
        value.clamp(self.min_setpoint, self.max_setpoint)
    }

    pub fn is_heating(&self) -> bool {
        self.running_state == RunningState::Heat
    }
}

impl Default for ThermostatFields {
    fn default() -> Self {
        Self::new(None, DEFAULT_MIN_SETPOINT, DEFAULT_MAX_SETPOINT)
    }
}

#[derive(Debug, Deserialize)]
pub struct ThermostatReport {
    pub local_temperature: Option<f64>,
    pub occupied_heating_setpoint: Option<f64>,
    pub running_state: Option<RunningState>,
    pub system_mode: Option<SystemMode>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub battery: Option<u8>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub linkquality: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct Thermostats;

impl DeviceDomain for Thermostats {
    const KIND: DomainKind = DomainKind::Thermostat;
    const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
    type Fields = ThermostatFields;
    type Report = ThermostatReport;

    fn apply_report(fields: &mut ThermostatFields, report: ThermostatReport, _now: DateTime<Local>) {
        if let Some(temperature) = report.local_temperature {
            fields.local_temperature = Some(temperature);
        }
        if let Some(setpoint) = report.occupied_heating_setpoint {
            fields.target = Some(setpoint);
        }
        if let Some(running_state) = report.running_state {
            fields.running_state = running_state;
        }
        if let Some(system_mode) = report.system_mode {
            fields.system_mode = system_mode;
        }
        if let Some(battery) = report.battery {
            fields.battery = Some(battery);
        }
        if let Some(linkquality) = report.linkquality {
            fields.linkquality = Some(linkquality);
        }
    }

    fn clear_pending(fields: &mut ThermostatFields) {
        fields.pending_target = None;
        fields.pending_mode = None;
    }
}

impl SyncController<Thermostats> {
    /// Only the pending setpoint moves; `target` keeps the confirmed value.
    pub fn set_target(&mut self, index: usize, value: f64) -> Result<OutboundCommand, CommandError> {
        let value = require_finite("setpoint", value)?;
        self.issue(index, |fields| {
            let setpoint = fields.clamp_setpoint(value);
            fields.pending_target = Some(setpoint);
            json!({ "occupied_heating_setpoint": setpoint })
        })
    }

    /// Moves the displayed setpoint by `delta`, rounded to whole degrees.
    pub fn adjust_target(
        &mut self,
        index: usize,
        delta: f64,
    ) -> Result<OutboundCommand, CommandError> {
        let delta = require_finite("setpoint adjustment", delta)?;
        let base = self
            .get(index)
            .and_then(|thermostat| thermostat.fields.display_target())
            .unwrap_or(FALLBACK_SETPOINT);
        self.set_target(index, (base + delta).round())
    }

    pub fn toggle_power(&mut self, index: usize) -> Result<OutboundCommand, CommandError> {
        self.issue(index, |fields| {
            let mode = match fields.display_mode() {
                SystemMode::Off => SystemMode::Heat,
                SystemMode::Heat | SystemMode::Auto => SystemMode::Off,
            };
            fields.pending_mode = Some(mode);
            json!({ "system_mode": mode })
        })
    }
}

pub fn heating_count(thermostats: &[Tracked<ThermostatFields>]) -> usize {
    thermostats
        .iter()
        .filter(|thermostat| thermostat.fields.is_heating())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Payload, TopicScheme};
    use pretty_assertions::assert_eq;

    fn thermostats() -> SyncController<Thermostats> {
        SyncController::new(
            TopicScheme::default(),
            vec![
                Tracked::new("study_trv", "Study", "[Study] Thermostat", ThermostatFields::default()),
                Tracked::new(
                    "bath_trv",
                    "Bathroom",
                    "[Bath] Thermostat",
                    ThermostatFields::new(Some("bath".to_string()), 5.0, 26.0),
                ),
            ],
        )
    }

    #[test]
    fn setpoint_timeout_reverts_to_confirmed_target() {
        let mut thermostats = thermostats();
        thermostats
            .apply_state(0, &Payload::decode(br#"{"occupied_heating_setpoint":19}"#), Local::now())
            .unwrap();

        let command = thermostats.set_target(0, 21.0).unwrap();
        assert_eq!(command.payload, json!({"occupied_heating_setpoint": 21.0}));
        assert_eq!(command.timeout, Duration::from_secs(5));

        let thermostat = thermostats.get(0).unwrap();
        assert_eq!(thermostat.fields.pending_target, Some(21.0));
        assert_eq!(thermostat.fields.target, Some(19.0));
        assert!(thermostat.syncing);

        assert!(thermostats.on_timeout(0));
        let thermostat = thermostats.get(0).unwrap();
        assert!(!thermostat.syncing);
        assert_eq!(thermostat.fields.pending_target, None);
        assert_eq!(thermostat.fields.display_target(), Some(19.0));
    }

    #[test]
    fn echo_confirms_the_setpoint() {
        let mut thermostats = thermostats();
        thermostats.set_target(0, 21.0).unwrap();

        let echo = br#"{"local_temperature":18.4,"occupied_heating_setpoint":21,"running_state":"heat","system_mode":"heat","battery":90}"#;
        thermostats.apply_state(0, &Payload::decode(echo), Local::now()).unwrap();

        let fields = &thermostats.get(0).unwrap().fields;
        assert_eq!(fields.target, Some(21.0));
        assert_eq!(fields.pending_target, None);
        assert_eq!(fields.local_temperature, Some(18.4));
        assert_eq!(fields.battery, Some(90));
        assert_eq!(heating_count(thermostats.entities()), 1);
    }

    #[test]
    fn fractional_battery_still_confirms() {
        let mut thermostats = thermostats();
        thermostats.set_target(0, 21.0).unwrap();

        let echo = br#"{"occupied_heating_setpoint":21,"battery":87.5,"linkquality":"n/a"}"#;
        thermostats.apply_state(0, &Payload::decode(echo), Local::now()).unwrap();

        let thermostat = thermostats.get(0).unwrap();
        assert!(!thermostat.syncing);
        assert!(thermostat.last_seen.is_some());
        assert_eq!(thermostat.fields.target, Some(21.0));
        assert_eq!(thermostat.fields.battery, Some(88));
        assert_eq!(thermostat.fields.linkquality, None);
    }

    #[test]
    fn setpoints_clamp_to_device_bounds() {
        let mut thermostats = thermostats();
        let command = thermostats.set_target(0, 30.0).unwrap();
        assert_eq!(command.payload, json!({"occupied_heating_setpoint": 22.0}));

        let command = thermostats.set_target(1, 30.0).unwrap();
        assert_eq!(command.payload, json!({"occupied_heating_setpoint": 26.0}));

        let command = thermostats.set_target(1, 1.0).unwrap();
        assert_eq!(command.payload, json!({"occupied_heating_setpoint": 5.0}));
    }

    #[test]
    fn adjustments_start_from_the_displayed_setpoint() {
        let mut thermostats = thermostats();

        // nothing reported yet
        let command = thermostats.adjust_target(0, 0.5).unwrap();
        assert_eq!(command.payload, json!({"occupied_heating_setpoint": 21.0}));

        // pending value is the base while syncing
        let command = thermostats.adjust_target(0, 1.0).unwrap();
        assert_eq!(command.payload, json!({"occupied_heating_setpoint": 22.0}));

        thermostats.on_timeout(0);
        thermostats
            .apply_state(0, &Payload::decode(br#"{"occupied_heating_setpoint":17.5}"#), Local::now())
            .unwrap();
        let command = thermostats.adjust_target(0, -1.0).unwrap();
        assert_eq!(command.payload, json!({"occupied_heating_setpoint": 17.0}));
    }

    #[test]
    fn non_finite_setpoints_are_rejected_untouched() {
        let mut thermostats = thermostats();
        thermostats
            .apply_state(0, &Payload::decode(br#"{"occupied_heating_setpoint":19}"#), Local::now())
            .unwrap();
        let before = thermostats.get(0).cloned().unwrap();

        assert_eq!(
            thermostats.set_target(0, f64::NAN),
            Err(CommandError::InvalidValue("setpoint", "NaN".to_string()))
        );
        assert!(matches!(
            thermostats.set_target(0, f64::INFINITY),
            Err(CommandError::InvalidValue("setpoint", _))
        ));
        assert!(matches!(
            thermostats.adjust_target(0, f64::NAN),
            Err(CommandError::InvalidValue("setpoint adjustment", _))
        ));
        assert!(matches!(
            thermostats.adjust_target(0, f64::NEG_INFINITY),
            Err(CommandError::InvalidValue(..))
        ));

        let after = thermostats.get(0).unwrap();
        assert_eq!(after, &before);
        assert_eq!(after.fields.pending_target, None);
        assert!(!thermostats.any_syncing());
    }

    #[test]
    fn power_toggles_between_heat_and_off() {
        let mut thermostats = thermostats();
        let command = thermostats.toggle_power(0).unwrap();
        assert_eq!(command.payload, json!({"system_mode": "off"}));
        assert_eq!(thermostats.get(0).unwrap().fields.display_mode(), SystemMode::Off);
        assert_eq!(thermostats.get(0).unwrap().fields.system_mode, SystemMode::Heat);

        thermostats
            .apply_state(0, &Payload::decode(br#"{"system_mode":"off"}"#), Local::now())
            .unwrap();
        let command = thermostats.toggle_power(0).unwrap();
        assert_eq!(command.payload, json!({"system_mode": "heat"}));
    }

    #[test]
    fn unknown_running_states_read_as_idle() {
        let mut thermostats = thermostats();
        thermostats
            .apply_state(1, &Payload::decode(br#"{"running_state":"cool","system_mode":"auto"}"#), Local::now())
            .unwrap();
        let fields = &thermostats.get(1).unwrap().fields;
        assert_eq!(fields.running_state, RunningState::Idle);
        assert_eq!(fields.system_mode, SystemMode::Auto);
    }
}
