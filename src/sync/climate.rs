//! Climate sensors and the per-room view built from them
//!
//! Room values are plain averages over the room's sensors that are not
//! stale. Stale sensors keep their last reading but stop counting.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::controller::DeviceDomain;
use super::entity::{lenient_level, DomainKind, Tracked};
use crate::config::RoomConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComfortLevel {
    Cold,
    Cool,
    Comfortable,
    Warm,
    Hot,
}

impl ComfortLevel {
    pub fn from_temperature(temperature: f64) -> Self {
        if temperature < 18.0 {
            ComfortLevel::Cold
        } else if temperature < 20.0 {
            ComfortLevel::Cool
        } else if temperature < 23.0 {
            ComfortLevel::Comfortable
        } else if temperature < 26.0 {
            ComfortLevel::Warm
        } else {
            ComfortLevel::Hot
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AirQuality {
    Excellent,
    Good,
    Moderate,
    Poor,
    Bad,
}

impl AirQuality {
    /// CO2 bands in ppm: <600, <1000, <1500, <2000, above.
    pub fn from_co2(ppm: f64) -> Self {
        if ppm < 600.0 {
            AirQuality::Excellent
        } else if ppm < 1000.0 {
            AirQuality::Good
        } else if ppm < 1500.0 {
            AirQuality::Moderate
        } else if ppm < 2000.0 {
            AirQuality::Poor
        } else {
            AirQuality::Bad
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClimateFields {
    pub room: String,
    pub primary: bool,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    pub battery: Option<u8>,
    pub linkquality: Option<u8>,
    /// Air quality as rated by the device itself, if it reports one.
    pub device_air_quality: Option<String>,
}

impl ClimateFields {
    pub fn new(room: impl Into<String>, primary: bool) -> Self {
        Self {
            room: room.into(),
            primary,
            ..Self::default()
        }
    }

    pub fn air_quality(&self) -> Option<AirQuality> {
        self.co2.map(AirQuality::from_co2)
    }
}

#[derive(Debug, Deserialize)]
pub struct ClimateReport {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub battery: Option<u8>,
    #[serde(default, deserialize_with = "lenient_level")]
    pub linkquality: Option<u8>,
    pub air_quality: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct Climate;

impl DeviceDomain for Climate {
    const KIND: DomainKind = DomainKind::Climate;
    type Fields = ClimateFields;
    type Report = ClimateReport;

    fn apply_report(fields: &mut ClimateFields, report: ClimateReport, _now: DateTime<Local>) {
        fields.temperature = report.temperature.or(fields.temperature);
        fields.humidity = report.humidity.or(fields.humidity);
        fields.co2 = report.co2.or(fields.co2);
        fields.battery = report.battery.or(fields.battery);
        fields.linkquality = report.linkquality.or(fields.linkquality);
        if report.air_quality.is_some() {
            fields.device_air_quality = report.air_quality;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    pub outdoor: bool,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    pub comfort: Option<ComfortLevel>,
    pub air_quality: Option<AirQuality>,
    pub sensor_count: usize,
    /// Fresh sensors with a temperature reading.
    pub active_sensor_count: usize,
}

impl RoomSummary {
    pub fn has_data(&self) -> bool {
        self.temperature.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HomeAverage {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

fn average(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn fresh_readings<'a>(
    sensors: &'a [&'a Tracked<ClimateFields>],
    reading: fn(&ClimateFields) -> Option<f64>,
) -> impl Iterator<Item = f64> + 'a {
    sensors
        .iter()
        .filter(|sensor| !sensor.is_stale)
        .filter_map(move |sensor| reading(&sensor.fields))
}

pub fn summarize_room(room: &RoomConfig, sensors: &[Tracked<ClimateFields>]) -> RoomSummary {
    let members: Vec<&Tracked<ClimateFields>> = sensors
        .iter()
        .filter(|sensor| sensor.fields.room == room.id)
        .collect();

    let temperature = average(fresh_readings(&members, |f| f.temperature));
    let humidity = average(fresh_readings(&members, |f| f.humidity));
    let co2 = average(fresh_readings(&members, |f| f.co2));

    RoomSummary {
        id: room.id.clone(),
        name: room.name.clone(),
        outdoor: room.outdoor,
        temperature,
        humidity,
        co2,
        comfort: temperature.map(ComfortLevel::from_temperature),
        air_quality: co2.map(AirQuality::from_co2),
        sensor_count: members.len(),
        active_sensor_count: fresh_readings(&members, |f| f.temperature).count(),
    }
}

pub fn summarize_rooms(rooms: &[RoomConfig], sensors: &[Tracked<ClimateFields>]) -> Vec<RoomSummary> {
    rooms
        .iter()
        .map(|room| summarize_room(room, sensors))
        .collect()
}

/// Averages over indoor rooms that have a value.
pub fn home_average(rooms: &[RoomSummary]) -> HomeAverage {
    let indoor = || rooms.iter().filter(|room| !room.outdoor);
    HomeAverage {
        temperature: average(indoor().filter_map(|room| room.temperature)),
        humidity: average(indoor().filter_map(|room| room.humidity)),
    }
}
