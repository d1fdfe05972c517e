//! Optimistic device-state synchronization
//!
//! [`SyncController`] carries the protocol, each domain module plugs in its
//! payload shape and actions through [`DeviceDomain`].

pub mod climate;
pub mod contacts;
pub mod controller;
pub mod entity;
pub mod lights;
pub mod motion;
pub mod pending;
pub mod thermostats;

pub use climate::{Climate, ClimateFields, HomeAverage, RoomSummary};
pub use contacts::{ContactFields, Contacts, OpeningKind};
pub use controller::{CommandError, DeviceDomain, OutboundCommand, SyncController};
pub use entity::{Availability, DomainKind, EntityKey, Tracked};
pub use lights::{LightFields, LightPreset, LightScene, Lights, PowerState};
pub use motion::{DeliveryStats, Motion, MotionEvent, MotionEventKind, MotionFields, SignalHealth, SignalStatus};
pub use pending::{PendingCommand, PendingCommands};
pub use thermostats::{SystemMode, ThermostatFields, Thermostats};
