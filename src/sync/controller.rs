//! Device Synchronization Controller
//!
//! One [`SyncController`] per device domain. Every entity moves through the
//! same protocol, whatever its payload:
//!
//! ```text
//! Idle ──user action──► Optimistic Pending ──state message──► Idle (confirmed)
//!                               │
//!                               └────────timeout────────────► Idle (reverted)
//! ```
//!
//! A user action mutates the entity immediately, sets `syncing` and yields an
//! [`OutboundCommand`]. The caller publishes it and arms the timeout. A state
//! message applies the authoritative report and clears `syncing` together
//! with any pending scratch fields. A timeout only clears them, so the entity
//! falls back to its last confirmed values.

use chrono::{DateTime, Local};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::time::Duration;
use tracing::{debug, warn};

use super::entity::{Availability, DomainKind, EntityKey, Tracked};
use crate::bus::{HandlerError, Payload, TopicScheme};
use crate::staleness::StalenessClassifier;

/// Per-domain behavior plugged into [`SyncController`].
pub trait DeviceDomain {
    const KIND: DomainKind;

    /// How long an optimistic write waits for its echo.
    const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

    type Fields: Debug + Clone + Serialize + Send;

    /// Typed form of the state payload, decoded once per message.
    type Report: DeserializeOwned;

    fn apply_report(fields: &mut Self::Fields, report: Self::Report, now: DateTime<Local>);

    /// Drops optimistic scratch values on confirmation or timeout.
    fn clear_pending(_fields: &mut Self::Fields) {}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Unknown {0} entity: {1}")]
    UnknownEntity(DomainKind, String),

    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error("No available {0} entities")]
    NoneAvailable(DomainKind),

    #[error("Invalid {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Rejects NaN and infinities before any clamping happens.
pub fn require_finite(field: &'static str, value: f64) -> Result<f64, CommandError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(CommandError::InvalidValue(field, value.to_string()))
    }
}

/// A command ready to go out on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundCommand {
    pub key: EntityKey,
    pub topic: String,
    pub payload: Value,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SyncController<D: DeviceDomain> {
    scheme: TopicScheme,
    entities: Vec<Tracked<D::Fields>>,
}

impl<D: DeviceDomain> SyncController<D> {
    pub fn new(scheme: TopicScheme, entities: Vec<Tracked<D::Fields>>) -> Self {
        Self { scheme, entities }
    }

    pub fn entities(&self) -> &[Tracked<D::Fields>] {
        &self.entities
    }

    pub fn get(&self, index: usize) -> Option<&Tracked<D::Fields>> {
        self.entities.get(index)
    }

    pub fn position(&self, id: &str) -> Result<usize, CommandError> {
        self.entities
            .iter()
            .position(|entity| entity.id == id)
            .ok_or_else(|| CommandError::UnknownEntity(D::KIND, id.to_string()))
    }

    pub fn find(&self, id: &str) -> Option<&Tracked<D::Fields>> {
        self.entities.iter().find(|entity| entity.id == id)
    }

    pub fn scheme(&self) -> &TopicScheme {
        &self.scheme
    }

    /// Applies a state message. Any state message confirms the entity.
    pub fn apply_state(
        &mut self,
        index: usize,
        payload: &Payload,
        now: DateTime<Local>,
    ) -> Result<(), HandlerError> {
        let report: D::Report = payload.parse()?;
        let entity = self
            .entities
            .get_mut(index)
            .ok_or(HandlerError::UnknownEntity(index))?;

        D::apply_report(&mut entity.fields, report, now);
        D::clear_pending(&mut entity.fields);
        entity.syncing = false;
        entity.last_seen = Some(now);
        Ok(())
    }

    /// Applies an availability message. Returns the new availability.
    pub fn apply_availability(
        &mut self,
        index: usize,
        payload: &Payload,
    ) -> Result<Availability, HandlerError> {
        let availability = Availability::from_payload(payload)
            .ok_or_else(|| HandlerError::UnexpectedMessage(payload.to_string()))?;
        let entity = self
            .entities
            .get_mut(index)
            .ok_or(HandlerError::UnknownEntity(index))?;

        if entity.available != availability.is_online() {
            debug!("{} is now {:?}", entity.friendly_name, availability);
        }
        entity.available = availability.is_online();
        Ok(availability)
    }

    /// Optimistically mutates one entity and builds its command.
    ///
    /// `mutate` returns the command payload. It is not called for an
    /// unavailable entity.
    pub fn issue<M>(&mut self, index: usize, mutate: M) -> Result<OutboundCommand, CommandError>
    where
        M: FnOnce(&mut D::Fields) -> Value,
    {
        let entity = self
            .entities
            .get_mut(index)
            .ok_or_else(|| CommandError::UnknownEntity(D::KIND, index.to_string()))?;

        if !entity.available {
            warn!("Rejecting command for unavailable {}", entity.friendly_name);
            return Err(CommandError::Unavailable(entity.id.clone()));
        }

        let payload = mutate(&mut entity.fields);
        entity.syncing = true;

        Ok(OutboundCommand {
            key: EntityKey::new(D::KIND, index),
            topic: self.scheme.command(&entity.friendly_name),
            payload,
            timeout: D::COMMAND_TIMEOUT,
        })
    }

    /// Issues the same command to every available entity.
    pub fn issue_all<M>(&mut self, mut mutate: M) -> Result<Vec<OutboundCommand>, CommandError>
    where
        M: FnMut(&mut D::Fields) -> Value,
    {
        let eligible: Vec<usize> = self
            .entities
            .iter()
            .enumerate()
            .filter(|(_, entity)| entity.available)
            .map(|(index, _)| index)
            .collect();

        if eligible.is_empty() {
            return Err(CommandError::NoneAvailable(D::KIND));
        }

        eligible
            .into_iter()
            .map(|index| self.issue(index, &mut mutate))
            .collect()
    }

    /// The command's echo never arrived. Returns true if the entity was
    /// still syncing.
    pub fn on_timeout(&mut self, index: usize) -> bool {
        let Some(entity) = self.entities.get_mut(index) else {
            return false;
        };
        if !entity.syncing {
            return false;
        }

        debug!("Command for {} timed out", entity.friendly_name);
        entity.syncing = false;
        D::clear_pending(&mut entity.fields);
        true
    }

    pub fn sweep(&mut self, classifier: &StalenessClassifier, now: DateTime<Local>) -> usize {
        classifier.sweep(&mut self.entities, now)
    }

    pub fn any_syncing(&self) -> bool {
        self.entities.iter().any(|entity| entity.syncing)
    }

    pub fn offline_count(&self) -> usize {
        self.entities.iter().filter(|entity| !entity.available).count()
    }

    #[cfg(test)]
    pub(crate) fn entity_mut(&mut self, index: usize) -> Option<&mut Tracked<D::Fields>> {
        self.entities.get_mut(index)
    }
}
