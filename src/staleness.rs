//! Staleness Classifier
//!
//! Flags entities that went quiet without announcing themselves offline.
//! Classification is driven by the sweep timer only. A new state message
//! moves `last_seen` forward and the next sweep clears the flag.

use chrono::{DateTime, Local, TimeDelta};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::StalenessConfig;
use crate::sync::Tracked;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessClassifier {
    threshold: TimeDelta,
    interval: Duration,
}

impl StalenessClassifier {
    pub fn new(threshold: Duration, interval: Duration) -> Self {
        Self {
            threshold: TimeDelta::from_std(threshold).unwrap_or(TimeDelta::MAX),
            interval,
        }
    }

    pub fn from_config(config: &StalenessConfig) -> Self {
        Self::new(
            Duration::from_secs(config.threshold_secs),
            Duration::from_secs(config.sweep_interval_secs),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_stale(&self, last_seen: DateTime<Local>, now: DateTime<Local>) -> bool {
        now.signed_duration_since(last_seen) > self.threshold
    }

    /// Re-classifies one entity. Returns true if the flag flipped.
    pub fn classify<F>(&self, entity: &mut Tracked<F>, now: DateTime<Local>) -> bool {
        let Some(last_seen) = entity.last_seen else {
            return false;
        };

        let stale = self.is_stale(last_seen, now);
        if stale == entity.is_stale {
            return false;
        }
        entity.is_stale = stale;
        true
    }

    /// Returns how many entities changed classification.
    pub fn sweep<F>(&self, entities: &mut [Tracked<F>], now: DateTime<Local>) -> usize {
        entities
            .iter_mut()
            .filter_map(|entity| self.classify(entity, now).then_some(()))
            .count()
    }

    /// Sweep timer. The first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let period = self.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

impl Default for StalenessClassifier {
    fn default() -> Self {
        Self::from_config(&StalenessConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn entity(last_seen: Option<DateTime<Local>>) -> Tracked<()> {
        let mut entity = Tracked::new("sensor", "Sensor", "[Room] Sensor", ());
        entity.last_seen = last_seen;
        entity
    }

    #[test]
    fn quiet_entities_turn_stale_and_recover() {
        let classifier = StalenessClassifier::default();
        let now = Local::now();
        let mut sensor = entity(Some(now - ChronoDuration::minutes(6)));

        assert!(classifier.classify(&mut sensor, now));
        assert!(sensor.is_stale);

        // a message only moves last_seen
        sensor.last_seen = Some(now);
        assert!(sensor.is_stale);

        assert!(classifier.classify(&mut sensor, now));
        assert!(!sensor.is_stale);
    }

    #[test]
    fn never_seen_entities_are_left_alone() {
        let classifier = StalenessClassifier::default();
        let mut sensor = entity(None);
        assert!(!classifier.classify(&mut sensor, Local::now()));
        assert!(!sensor.is_stale);
    }

    #[test]
    fn threshold_is_exclusive() {
        let classifier = StalenessClassifier::new(Duration::from_secs(300), Duration::from_secs(60));
        let now = Local::now();
        assert!(!classifier.is_stale(now - ChronoDuration::seconds(300), now));
        assert!(classifier.is_stale(now - ChronoDuration::seconds(301), now));
    }

    #[test]
    fn sweep_counts_only_flips() {
        let classifier = StalenessClassifier::default();
        let now = Local::now();
        let mut sensors = vec![
            entity(Some(now - ChronoDuration::minutes(10))),
            entity(Some(now - ChronoDuration::minutes(1))),
            entity(None),
        ];

        assert_eq!(classifier.sweep(&mut sensors, now), 1);
        assert_eq!(classifier.sweep(&mut sensors, now), 0);
        assert!(sensors[0].is_stale);
        assert!(!sensors[1].is_stale);
    }
}
