use chrono::{DateTime, Local, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::controller::DeviceDomain;
use super::entity::{lenient_level, DomainKind, Tracked};

pub const HISTORY_LIMIT: usize = 200;
const DUPLICATE_WINDOW_MS: i64 = 1000;
const OFFLINE_AFTER_MINUTES: i64 = 30;
const WEAK_LINKQUALITY: u8 = 50;
/// Two reports an hour keep a sensor at full uptime.
const EXPECTED_DAILY_EVENTS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionEventKind {
    Detected,
    Cleared,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotionEvent {
    pub time: DateTime<Local>,
    pub kind: MotionEventKind,
}

/// Occupancy and vibration sensors, e.g. the mailbox or the hot-water pipe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MotionFields {
    pub occupancy: Option<bool>,
    pub vibration: Option<bool>,
    pub tamper: Option<bool>,
    pub battery: Option<u8>,
    pub battery_low: Option<bool>,
    pub linkquality: Option<u8>,
    pub last_activity: Option<DateTime<Local>>,
    /// Rising edges seen this session.
    pub activations: u32,
    /// Occupancy reports, newest first.
    pub history: VecDeque<MotionEvent>,
}

impl MotionFields {
    pub fn is_active(&self) -> bool {
        self.occupancy == Some(true) || self.vibration == Some(true)
    }

    fn remember(&mut self, kind: MotionEventKind, now: DateTime<Local>) {
        let duplicate = self.history.iter().any(|event| {
            event.kind == kind
                && (now - event.time).num_milliseconds().abs() < DUPLICATE_WINDOW_MS
        });
        if duplicate {
            return;
        }
        self.history.push_front(MotionEvent { time: now, kind });
        self.history.truncate(HISTORY_LIMIT);
    }

    /// Each detection counts as a delivery, e.g. on the mailbox flap.
    pub fn deliveries(&self) -> impl Iterator<Item = &MotionEvent> {
        self.history
            .iter()
            .filter(|event| event.kind == MotionEventKind::Detected)
    }

    pub fn delivery_stats(&self, now: DateTime<Local>) -> DeliveryStats {
        let week_start = now - TimeDelta::days(7);
        let today = self
            .deliveries()
            .filter(|event| event.time.date_naive() == now.date_naive())
            .count();
        let week_hours: Vec<u32> = self
            .deliveries()
            .filter(|event| event.time >= week_start)
            .map(|event| event.time.hour())
            .collect();
        let average_hour = (!week_hours.is_empty()).then(|| {
            let sum: u32 = week_hours.iter().sum();
            (f64::from(sum) / week_hours.len() as f64).round() as u32
        });

        DeliveryStats {
            today,
            week: week_hours.len(),
            total: self.deliveries().count(),
            average_hour,
            last_delivery: self.deliveries().next().map(|event| event.time),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub today: usize,
    /// Last seven days, today included.
    pub week: usize,
    pub total: usize,
    /// Mean hour of this week's deliveries.
    pub average_hour: Option<u32>,
    pub last_delivery: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

impl SignalStatus {
    pub fn label(self) -> &'static str {
        match self {
            SignalStatus::Healthy => "Healthy",
            SignalStatus::Warning => "Weak Signal",
            SignalStatus::Critical => "Offline",
            SignalStatus::Unknown => "No Data",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalHealth {
    pub status: SignalStatus,
    pub uptime_percent: u8,
}

/// Offline beats weak signal, which beats missing data.
pub fn signal_health(sensor: &Tracked<MotionFields>, now: DateTime<Local>) -> SignalHealth {
    let silent = sensor
        .last_seen
        .map_or(true, |seen| now - seen > TimeDelta::minutes(OFFLINE_AFTER_MINUTES));
    let recent = sensor
        .fields
        .history
        .iter()
        .filter(|event| now - event.time < TimeDelta::days(1))
        .count();

    let (status, uptime_percent) = if !sensor.available || silent {
        (SignalStatus::Critical, 0)
    } else if sensor.fields.linkquality.is_some_and(|lqi| lqi < WEAK_LINKQUALITY) {
        (SignalStatus::Warning, 50)
    } else if recent == 0 {
        (SignalStatus::Unknown, 0)
    } else {
        let percent = (recent * 100 + EXPECTED_DAILY_EVENTS / 2) / EXPECTED_DAILY_EVENTS;
        (SignalStatus::Healthy, percent.min(100) as u8)
    };

    SignalHealth {
        status,
        uptime_percent,
    }
}

#[derive(Debug, Deserialize)]
pub struct MotionReport {
    pub occupancy: Option<bool>,
    pub vibration: Option<bool>,
    pub tamper: Option<bool>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub battery: Option<u8>,
    pub battery_low: Option<bool>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub linkquality: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct Motion;

impl DeviceDomain for Motion {
    const KIND: DomainKind = DomainKind::Motion;
    type Fields = MotionFields;
    type Report = MotionReport;

    fn apply_report(fields: &mut MotionFields, report: MotionReport, now: DateTime<Local>) {
        let was_active = fields.is_active();
        if let Some(occupied) = report.occupancy {
            let kind = if occupied {
                MotionEventKind::Detected
            } else {
                MotionEventKind::Cleared
            };
            fields.remember(kind, now);
        }

        fields.occupancy = report.occupancy.or(fields.occupancy);
        fields.vibration = report.vibration.or(fields.vibration);
        fields.tamper = report.tamper.or(fields.tamper);
        fields.battery = report.battery.or(fields.battery);
        fields.battery_low = report.battery_low.or(fields.battery_low);
        fields.linkquality = report.linkquality.or(fields.linkquality);

        if fields.is_active() {
            fields.last_activity = Some(now);
            if !was_active {
                fields.activations += 1;
            }
        }
    }
}
