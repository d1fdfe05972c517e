use chrono::{DateTime, Local};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::bus::Payload;

/// Device domains with their own controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainKind {
    Light,
    Thermostat,
    Contact,
    Climate,
    Motion,
}

impl fmt::Display for DomainKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            DomainKind::Light => "light",
            DomainKind::Thermostat => "thermostat",
            DomainKind::Contact => "contact",
            DomainKind::Climate => "climate",
            DomainKind::Motion => "motion",
        };
        f.write_str(name)
    }
}

/// Addresses one entity: its domain and its slot in that domain's controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: DomainKind,
    pub index: usize,
}

impl EntityKey {
    pub fn new(kind: DomainKind, index: usize) -> Self {
        Self { kind, index }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.index)
    }
}

/// One configured device as seen by the dashboard.
///
/// `fields` holds the domain payload. The rest is shared bookkeeping: the
/// optimistic `syncing` flag, explicit availability, and the time of the last
/// state message with its staleness classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tracked<F> {
    pub id: String,
    pub name: String,
    pub friendly_name: String,
    pub fields: F,
    pub syncing: bool,
    pub available: bool,
    pub last_seen: Option<DateTime<Local>>,
    pub is_stale: bool,
}

impl<F> Tracked<F> {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        friendly_name: impl Into<String>,
        fields: F,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            friendly_name: friendly_name.into(),
            fields,
            syncing: false,
            available: true,
            last_seen: None,
            is_stale: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
}

impl Availability {
    /// Reads `{"state": "online"}` or a bare `online`/`offline`, quoted or not.
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        let word = match payload.field("state") {
            Some(Value::String(state)) => state.as_str(),
            Some(_) => return None,
            None => payload.as_text()?,
        };

        match word.trim() {
            "online" => Some(Availability::Online),
            "offline" => Some(Availability::Offline),
            _ => None,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Availability::Online)
    }
}

/// Reads a 0-255 device level from any JSON number. Fractions round. Values
/// outside the range or not numeric read as absent.
pub fn lenient_level<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_f64)
        .map(f64::round)
        .filter(|level| (0.0..=f64::from(u8::MAX)).contains(level))
        .map(|level| level as u8))
}
