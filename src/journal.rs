//! Audit journal fed by the `{base}/#` catch-all subscription
//!
//! Keeps two bounded, newest-first buffers: a raw message log with category
//! and severity, and an activity timeline of state changes people care about
//! (motion, doors, vibration, lights, plugs).

use chrono::{DateTime, Local};
use serde::Serialize;
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::VecDeque;

use crate::bus::{Payload, TopicScheme};

pub const DEFAULT_CAPACITY: usize = 500;
const DUPLICATE_WINDOW_MS: i64 = 1000;
const UNKNOWN_ROOM: &str = "unknown";

/// Fields copied into [`LogEntry::values`] when present.
const LOGGED_FIELDS: [&str; 11] = [
    "temperature",
    "humidity",
    "co2",
    "battery",
    "contact",
    "occupancy",
    "state",
    "brightness",
    "local_temperature",
    "running_state",
    "linkquality",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Climate,
    Contact,
    Motion,
    Thermostat,
    Light,
    Plug,
    System,
}

impl LogCategory {
    pub const ALL: [LogCategory; 7] = [
        LogCategory::Climate,
        LogCategory::Contact,
        LogCategory::Motion,
        LogCategory::Thermostat,
        LogCategory::Light,
        LogCategory::Plug,
        LogCategory::System,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub topic: String,
    pub device: String,
    pub category: LogCategory,
    pub severity: Severity,
    pub values: Map<String, Value>,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    MotionDetected,
    MotionCleared,
    DoorOpened,
    DoorClosed,
    VibrationDetected,
    LightOn,
    LightOff,
    PlugOn,
    PlugOff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEvent {
    pub time: DateTime<Local>,
    pub kind: ActivityKind,
    pub device: String,
    pub room: String,
    pub value: u8,
    pub battery: Option<u64>,
    pub linkquality: Option<u64>,
}

/// Filter for [`Journal::query`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalQuery {
    pub category: Option<LogCategory>,
    pub search: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JournalView {
    pub logs: Vec<LogEntry>,
    pub timeline: Vec<ActivityEvent>,
}

/// Log counts; every category is listed, empty ones with zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JournalStats {
    pub total: usize,
    pub by_category: IndexMap<LogCategory, usize>,
}

#[derive(Debug, Clone)]
pub struct Journal {
    scheme: TopicScheme,
    capacity: usize,
    paused: bool,
    logs: VecDeque<LogEntry>,
    timeline: VecDeque<ActivityEvent>,
}

impl Journal {
    pub fn new(scheme: TopicScheme) -> Self {
        Self::with_capacity(scheme, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(scheme: TopicScheme, capacity: usize) -> Self {
        Self {
            scheme,
            capacity,
            paused: false,
            logs: VecDeque::with_capacity(capacity),
            timeline: VecDeque::with_capacity(capacity),
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn clear(&mut self) {
        self.logs.clear();
        self.timeline.clear();
    }

    /// Records one bus message. Returns true if anything was stored.
    pub fn record(&mut self, topic: &str, payload: &Payload, now: DateTime<Local>) -> bool {
        if self.paused || topic.contains("/bridge/") {
            return false;
        }

        let device = self.scheme.device_part(topic).to_string();
        let entry = LogEntry {
            timestamp: now,
            topic: topic.to_string(),
            category: detect_category(&device, payload),
            severity: detect_severity(payload),
            values: extract_values(payload),
            payload: payload_value(payload),
            device: device.clone(),
        };
        push_bounded(&mut self.logs, entry, self.capacity);

        if !topic.ends_with("/availability") {
            if let Some(event) = activity(&device, payload, now) {
                self.push_activity(event);
            }
        }
        true
    }

    fn push_activity(&mut self, event: ActivityEvent) {
        let duplicate = self.timeline.iter().any(|existing| {
            existing.kind == event.kind
                && existing.device == event.device
                && (existing.time - event.time).num_milliseconds().abs() < DUPLICATE_WINDOW_MS
        });
        if !duplicate {
            push_bounded(&mut self.timeline, event, self.capacity);
        }
    }

    pub fn logs(&self) -> impl Iterator<Item = &LogEntry> {
        self.logs.iter()
    }

    pub fn timeline(&self) -> impl Iterator<Item = &ActivityEvent> {
        self.timeline.iter()
    }

    pub fn query(&self, query: &JournalQuery) -> JournalView {
        let limit = query.limit.unwrap_or(usize::MAX);
        let search = query.search.as_ref().map(|s| s.to_lowercase());

        let logs = self
            .logs
            .iter()
            .filter(|entry| query.category.map_or(true, |c| entry.category == c))
            .filter(|entry| {
                search.as_ref().map_or(true, |needle| {
                    entry.device.to_lowercase().contains(needle)
                        || entry.topic.to_lowercase().contains(needle)
                        || values_match(&entry.values, needle)
                })
            })
            .take(limit)
            .cloned()
            .collect();

        let timeline = self
            .timeline
            .iter()
            .filter(|event| {
                search.as_ref().map_or(true, |needle| {
                    event.device.to_lowercase().contains(needle) || event.room.contains(needle)
                })
            })
            .take(limit)
            .cloned()
            .collect();

        JournalView { logs, timeline }
    }

    pub fn stats(&self) -> JournalStats {
        let mut by_category: IndexMap<LogCategory, usize> =
            LogCategory::ALL.iter().map(|&category| (category, 0)).collect();
        for entry in &self.logs {
            *by_category.entry(entry.category).or_default() += 1;
        }
        JournalStats {
            total: self.logs.len(),
            by_category,
        }
    }
}

/// Matches against the JSON text of the values, keys included.
fn values_match(values: &Map<String, Value>, needle: &str) -> bool {
    serde_json::to_string(values)
        .map(|text| text.to_lowercase().contains(needle))
        .unwrap_or(false)
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    buffer.push_front(item);
    buffer.truncate(capacity);
}

fn payload_value(payload: &Payload) -> Value {
    match payload {
        Payload::Json(value) => value.clone(),
        Payload::Text(text) => Value::String(text.clone()),
    }
}

fn has(payload: &Payload, field: &str) -> bool {
    payload.field(field).is_some()
}

fn number(payload: &Payload, field: &str) -> Option<f64> {
    payload.field(field).and_then(Value::as_f64)
}

fn state_word<'p>(payload: &'p Payload) -> Option<&'p str> {
    match payload.field("state") {
        Some(state) => state.as_str(),
        None => payload.as_text(),
    }
}

fn detect_category(device: &str, payload: &Payload) -> LogCategory {
    let device = device.to_lowercase();
    if has(payload, "local_temperature") || has(payload, "running_state") {
        LogCategory::Thermostat
    } else if has(payload, "contact") {
        LogCategory::Contact
    } else if has(payload, "occupancy") {
        LogCategory::Motion
    } else if has(payload, "brightness") || device.contains("light") {
        LogCategory::Light
    } else if device.contains("plug") {
        LogCategory::Plug
    } else if has(payload, "temperature") || has(payload, "humidity") || has(payload, "co2") {
        LogCategory::Climate
    } else {
        LogCategory::System
    }
}

fn detect_severity(payload: &Payload) -> Severity {
    let state = state_word(payload);
    let battery = number(payload, "battery");
    let co2 = number(payload, "co2");

    if state == Some("offline") {
        return Severity::Error;
    }
    match battery {
        Some(level) if level < 10.0 => return Severity::Error,
        Some(level) if level < 20.0 => return Severity::Warning,
        _ => {}
    }
    match co2 {
        Some(ppm) if ppm >= 1500.0 => return Severity::Error,
        Some(ppm) if ppm >= 1200.0 => return Severity::Warning,
        _ => {}
    }
    if payload.field("contact") == Some(&Value::Bool(false)) {
        return Severity::Warning;
    }
    if state == Some("online") {
        return Severity::Success;
    }
    Severity::Info
}

fn extract_values(payload: &Payload) -> Map<String, Value> {
    LOGGED_FIELDS
        .iter()
        .filter_map(|field| {
            payload
                .field(field)
                .map(|value| (field.to_string(), value.clone()))
        })
        .collect()
}

/// `[Study] Light` → `study`
pub fn room_of(device: &str) -> String {
    device
        .strip_prefix('[')
        .and_then(|rest| rest.split_once(']'))
        .map(|(room, _)| room.to_lowercase())
        .filter(|room| !room.is_empty())
        .unwrap_or_else(|| UNKNOWN_ROOM.to_string())
}

fn activity(device: &str, payload: &Payload, now: DateTime<Local>) -> Option<ActivityEvent> {
    let flag = |field: &str| payload.field(field).and_then(Value::as_bool);
    let make = |kind: ActivityKind, value: u8| ActivityEvent {
        time: now,
        kind,
        device: device.to_string(),
        room: room_of(device),
        value,
        battery: payload.field("battery").and_then(Value::as_u64),
        linkquality: payload.field("linkquality").and_then(Value::as_u64),
    };

    if let Some(occupied) = flag("occupancy") {
        let kind = if occupied {
            ActivityKind::MotionDetected
        } else {
            ActivityKind::MotionCleared
        };
        return Some(make(kind, u8::from(occupied)));
    }

    if let Some(closed) = flag("contact") {
        let kind = if closed {
            ActivityKind::DoorClosed
        } else {
            ActivityKind::DoorOpened
        };
        return Some(make(kind, u8::from(!closed)));
    }

    if flag("vibration") == Some(true) {
        return Some(make(ActivityKind::VibrationDetected, 1));
    }

    let state = payload.field("state")?.as_str()?;
    let is_light = has(payload, "brightness") || device.to_lowercase().contains("light");
    let on = state == "ON";
    let kind = match (is_light, on) {
        (true, true) => ActivityKind::LightOn,
        (true, false) => ActivityKind::LightOff,
        (false, true) => ActivityKind::PlugOn,
        (false, false) => ActivityKind::PlugOff,
    };
    let mut event = make(kind, u8::from(on));
    event.battery = None;
    event.linkquality = None;
    Some(event)
}
