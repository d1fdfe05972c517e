use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::controller::DeviceDomain;
use super::entity::{lenient_level, DomainKind, Tracked};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpeningKind {
    #[default]
    Door,
    Window,
}

/// Door/window contact sensor. `contact == Some(true)` means closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContactFields {
    pub kind: OpeningKind,
    pub room: Option<String>,
    pub contact: Option<bool>,
    pub battery: Option<u8>,
    pub linkquality: Option<u8>,
    pub opened_at: Option<DateTime<Local>>,
}

impl ContactFields {
    pub fn new(kind: OpeningKind, room: Option<String>) -> Self {
        Self {
            kind,
            room,
            ..Self::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.contact == Some(false)
    }

    pub fn is_closed(&self) -> bool {
        self.contact == Some(true)
    }
}

#[derive(Debug, Deserialize)]
pub struct ContactReport {
    pub contact: Option<bool>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub battery: Option<u8>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub linkquality: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct Contacts;

impl DeviceDomain for Contacts {
    const KIND: DomainKind = DomainKind::Contact;
    type Fields = ContactFields;
    type Report = ContactReport;

    fn apply_report(fields: &mut ContactFields, report: ContactReport, now: DateTime<Local>) {
        match report.contact {
            Some(false) if !fields.is_open() => fields.opened_at = Some(now),
            Some(true) => fields.opened_at = None,
            _ => {}
        }
        if let Some(contact) = report.contact {
            fields.contact = Some(contact);
        }
        if let Some(battery) = report.battery {
            fields.battery = Some(battery);
        }
        if let Some(linkquality) = report.linkquality {
            fields.linkquality = Some(linkquality);
        }
    }
}

pub fn open_count(sensors: &[Tracked<ContactFields>], kind: OpeningKind) -> usize {
    sensors
        .iter()
        .filter(|sensor| sensor.fields.kind == kind && sensor.fields.is_open())
        .count()
}

/// At least one sensor of `kind` exists and all of them report closed.
pub fn all_secure(sensors: &[Tracked<ContactFields>], kind: OpeningKind) -> bool {
    let mut of_kind = sensors
        .iter()
        .filter(|sensor| sensor.fields.kind == kind)
        .peekable();
    of_kind.peek().is_some() && of_kind.all(|sensor| sensor.fields.is_closed())
}
