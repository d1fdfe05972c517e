//! Device context shared by every bus handler
//!
//! [`Devices`] owns the domain controllers, the pending-command registry and
//! the journal. The hub hands it to the dispatcher as the handler context, so
//! confirmations, user actions, timeouts and sweeps all mutate entities from
//! the same task, one complete read-modify-write at a time.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bus::{to_wire, BrokerLink, Dispatcher, HandlerResult, Payload, TopicScheme};
use crate::config::{DashboardConfig, RoomConfig};
use crate::journal::Journal;
use crate::staleness::StalenessClassifier;
use crate::sync::climate::{home_average, summarize_rooms};
use crate::sync::contacts::{all_secure, open_count};
use crate::sync::lights::{lights_on, LightPreset, LightScene};
use crate::sync::thermostats::heating_count;
use crate::sync::{
    Climate, ClimateFields, CommandError, ContactFields, Contacts, DeviceDomain, DomainKind,
    EntityKey, HomeAverage, LightFields, Lights, Motion, MotionFields, OpeningKind,
    OutboundCommand, PendingCommands, RoomSummary, SyncController, ThermostatFields, Thermostats,
    Tracked,
};

/// User intents the dashboard can turn into bus commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeviceAction {
    ToggleLight { id: String },
    ToggleAllLights,
    SetBrightness { id: String, value: f64 },
    SetColorTemp { id: String, value: f64 },
    ApplyPreset { id: String, preset: LightPreset },
    ApplyScene { scene: LightScene },
    SetTargetTemp { id: String, value: f64 },
    AdjustTargetTemp { id: String, delta: f64 },
    ToggleThermostatPower { id: String },
}

/// Read-only copy of every entity, published after each change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub revision: u64,
    pub lights: Vec<Tracked<LightFields>>,
    pub thermostats: Vec<Tracked<ThermostatFields>>,
    pub contacts: Vec<Tracked<ContactFields>>,
    pub climate: Vec<Tracked<ClimateFields>>,
    pub motion: Vec<Tracked<MotionFields>>,
    pub rooms: Vec<RoomSummary>,
    pub home: HomeAverage,
}

impl DeviceSnapshot {
    pub fn light(&self, id: &str) -> Option<&Tracked<LightFields>> {
        self.lights.iter().find(|light| light.id == id)
    }

    pub fn thermostat(&self, id: &str) -> Option<&Tracked<ThermostatFields>> {
        self.thermostats.iter().find(|thermostat| thermostat.id == id)
    }

    pub fn contact(&self, id: &str) -> Option<&Tracked<ContactFields>> {
        self.contacts.iter().find(|contact| contact.id == id)
    }

    pub fn motion_sensor(&self, id: &str) -> Option<&Tracked<MotionFields>> {
        self.motion.iter().find(|sensor| sensor.id == id)
    }

    pub fn room(&self, id: &str) -> Option<&RoomSummary> {
        self.rooms.iter().find(|room| room.id == id)
    }

    pub fn lights_on(&self) -> usize {
        lights_on(&self.lights)
    }

    pub fn any_light_syncing(&self) -> bool {
        self.lights.iter().any(|light| light.syncing)
    }

    pub fn heating_count(&self) -> usize {
        heating_count(&self.thermostats)
    }

    pub fn thermostats_offline(&self) -> usize {
        self.thermostats.iter().filter(|t| !t.available).count()
    }

    pub fn open_doors(&self) -> usize {
        open_count(&self.contacts, OpeningKind::Door)
    }

    pub fn open_windows(&self) -> usize {
        open_count(&self.contacts, OpeningKind::Window)
    }

    pub fn all_doors_secure(&self) -> bool {
        all_secure(&self.contacts, OpeningKind::Door)
    }

    pub fn all_windows_secure(&self) -> bool {
        all_secure(&self.contacts, OpeningKind::Window)
    }
}

/// Domains whose entities get state and availability routes.
pub trait Routed: DeviceDomain + Sized + 'static {
    fn controller(devices: &mut Devices) -> &mut SyncController<Self>;
}

impl Routed for Lights {
    fn controller(devices: &mut Devices) -> &mut SyncController<Self> {
        &mut devices.lights
    }
}

impl Routed for Thermostats {
    fn controller(devices: &mut Devices) -> &mut SyncController<Self> {
        &mut devices.thermostats
    }
}

impl Routed for Contacts {
    fn controller(devices: &mut Devices) -> &mut SyncController<Self> {
        &mut devices.contacts
    }
}

impl Routed for Climate {
    fn controller(devices: &mut Devices) -> &mut SyncController<Self> {
        &mut devices.climate
    }
}

impl Routed for Motion {
    fn controller(devices: &mut Devices) -> &mut SyncController<Self> {
        &mut devices.motion
    }
}

pub struct Devices {
    scheme: TopicScheme,
    link: Arc<dyn BrokerLink>,
    rooms: Vec<RoomConfig>,
    lights: SyncController<Lights>,
    thermostats: SyncController<Thermostats>,
    contacts: SyncController<Contacts>,
    climate: SyncController<Climate>,
    motion: SyncController<Motion>,
    pending: PendingCommands,
    journal: Journal,
    revision: u64,
    dirty: bool,
}

impl Devices {
    /// One entity per configured device, all in their initial state.
    pub fn from_config(config: &DashboardConfig, link: Arc<dyn BrokerLink>) -> Self {
        let scheme = config.topics.scheme();

        let lights = config
            .lights
            .iter()
            .map(|c| Tracked::new(&c.id, &c.name, &c.friendly_name, LightFields::default()))
            .collect();
        let thermostats = config
            .thermostats
            .iter()
            .map(|c| {
                let fields = ThermostatFields::new(c.room.clone(), c.min_setpoint, c.max_setpoint);
                Tracked::new(&c.id, &c.name, &c.friendly_name, fields)
            })
            .collect();
        let contacts = config
            .contacts
            .iter()
            .map(|c| {
                let fields = ContactFields::new(c.kind, c.room.clone());
                Tracked::new(&c.id, &c.name, &c.friendly_name, fields)
            })
            .collect();
        let climate = config
            .climate
            .iter()
            .map(|c| {
                let fields = ClimateFields::new(&c.room, c.primary);
                Tracked::new(&c.id, &c.name, &c.friendly_name, fields)
            })
            .collect();
        let motion = config
            .motion
            .iter()
            .map(|c| Tracked::new(&c.id, &c.name, &c.friendly_name, MotionFields::default()))
            .collect();

        Self {
            lights: SyncController::new(scheme.clone(), lights),
            thermostats: SyncController::new(scheme.clone(), thermostats),
            contacts: SyncController::new(scheme.clone(), contacts),
            climate: SyncController::new(scheme.clone(), climate),
            motion: SyncController::new(scheme.clone(), motion),
            journal: Journal::new(scheme.clone()),
            rooms: config.rooms.clone(),
            pending: PendingCommands::new(),
            scheme,
            link,
            revision: 0,
            dirty: true,
        }
    }

    /// Subscribes the state and availability topic of every entity, plus the
    /// journal's catch-all.
    pub fn install_routes(&self, dispatcher: &mut Dispatcher<Devices>) {
        route::<Lights>(dispatcher, &self.scheme, self.lights.entities());
        route::<Thermostats>(dispatcher, &self.scheme, self.thermostats.entities());
        route::<Contacts>(dispatcher, &self.scheme, self.contacts.entities());
        route::<Climate>(dispatcher, &self.scheme, self.climate.entities());
        route::<Motion>(dispatcher, &self.scheme, self.motion.entities());

        dispatcher.subscribe(
            self.scheme.catch_all(),
            |devices: &mut Devices, topic: &str, payload: &Payload| -> HandlerResult {
                devices.journal.record(topic, payload, Local::now());
                Ok(())
            },
        );
        info!("Installed device routes below {}", self.scheme.base());
    }

    fn on_state<D: Routed>(&mut self, index: usize, payload: &Payload) -> HandlerResult {
        D::controller(self).apply_state(index, payload, Local::now())?;
        if self.pending.confirm(EntityKey::new(D::KIND, index)).is_some() {
            debug!("Confirmed pending command for {}#{}", D::KIND, index);
        }
        self.touch();
        Ok(())
    }

    fn on_availability<D: Routed>(&mut self, index: usize, payload: &Payload) -> HandlerResult {
        D::controller(self).apply_availability(index, payload)?;
        self.touch();
        Ok(())
    }

    /// Applies a user action optimistically and sends its commands. Returns
    /// the number of commands sent.
    pub fn execute(&mut self, action: DeviceAction) -> Result<usize, CommandError> {
        debug!("Executing {:?}", action);
        let commands = match action {
            DeviceAction::ToggleLight { id } => {
                let index = self.lights.position(&id)?;
                vec![self.lights.toggle(index)?]
            }
            DeviceAction::ToggleAllLights => self.lights.toggle_all()?,
            DeviceAction::SetBrightness { id, value } => {
                let index = self.lights.position(&id)?;
                vec![self.lights.set_brightness(index, value)?]
            }
            DeviceAction::SetColorTemp { id, value } => {
                let index = self.lights.position(&id)?;
                vec![self.lights.set_color_temp(index, value)?]
            }
            DeviceAction::ApplyPreset { id, preset } => {
                let index = self.lights.position(&id)?;
                vec![self.lights.apply_preset(index, preset)?]
            }
            DeviceAction::ApplyScene { scene } => self.lights.apply_scene(scene)?,
            DeviceAction::SetTargetTemp { id, value } => {
                let index = self.thermostats.position(&id)?;
                vec![self.thermostats.set_target(index, value)?]
            }
            DeviceAction::AdjustTargetTemp { id, delta } => {
                let index = self.thermostats.position(&id)?;
                vec![self.thermostats.adjust_target(index, delta)?]
            }
            DeviceAction::ToggleThermostatPower { id } => {
                let index = self.thermostats.position(&id)?;
                vec![self.thermostats.toggle_power(index)?]
            }
        };

        let sent = commands.len();
        for command in commands {
            self.send(command);
        }
        self.touch();
        Ok(sent)
    }

    /// Publishes and arms the timeout. A failed publish stays pending until
    /// the timeout reverts it.
    fn send(&mut self, command: OutboundCommand) {
        if let Err(e) = self
            .link
            .publish(&command.topic, to_wire(&command.payload))
        {
            warn!("Command to {} not sent: {}", command.topic, e);
        }
        self.pending
            .arm(command.key, command.payload, command.timeout);
    }

    /// Handles an expired pending command.
    pub fn expire(&mut self, key: EntityKey) -> bool {
        let reverted = match key.kind {
            DomainKind::Light => self.lights.on_timeout(key.index),
            DomainKind::Thermostat => self.thermostats.on_timeout(key.index),
            DomainKind::Contact => self.contacts.on_timeout(key.index),
            DomainKind::Climate => self.climate.on_timeout(key.index),
            DomainKind::Motion => self.motion.on_timeout(key.index),
        };
        if reverted {
            self.touch();
        }
        reverted
    }

    /// Re-classifies staleness of every entity. Returns the number of flips.
    pub fn sweep(&mut self, classifier: &StalenessClassifier, now: DateTime<Local>) -> usize {
        let flipped = self.lights.sweep(classifier, now)
            + self.thermostats.sweep(classifier, now)
            + self.contacts.sweep(classifier, now)
            + self.climate.sweep(classifier, now)
            + self.motion.sweep(classifier, now);
        if flipped > 0 {
            debug!("Staleness changed for {} entities", flipped);
            self.touch();
        }
        flipped
    }

    pub async fn next_expired(&mut self) -> EntityKey {
        self.pending.next_expired().await
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let rooms = summarize_rooms(&self.rooms, self.climate.entities());
        DeviceSnapshot {
            revision: self.revision,
            lights: self.lights.entities().to_vec(),
            thermostats: self.thermostats.entities().to_vec(),
            contacts: self.contacts.entities().to_vec(),
            climate: self.climate.entities().to_vec(),
            motion: self.motion.entities().to_vec(),
            home: home_average(&rooms),
            rooms,
        }
    }

    /// True once after any entity changed.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    fn touch(&mut self) {
        self.revision += 1;
        self.dirty = true;
    }

    pub fn pending(&self) -> &PendingCommands {
        &self.pending
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut Journal {
        &mut self.journal
    }

    pub fn lights(&self) -> &SyncController<Lights> {
        &self.lights
    }

    pub fn thermostats(&self) -> &SyncController<Thermostats> {
        &self.thermostats
    }

    pub fn contacts(&self) -> &SyncController<Contacts> {
        &self.contacts
    }

    pub fn climate(&self) -> &SyncController<Climate> {
        &self.climate
    }

    pub fn motion(&self) -> &SyncController<Motion> {
        &self.motion
    }
}

fn route<D: Routed>(
    dispatcher: &mut Dispatcher<Devices>,
    scheme: &TopicScheme,
    entities: &[Tracked<D::Fields>],
) {
    for (index, entity) in entities.iter().enumerate() {
        dispatcher.subscribe(
            scheme.state(&entity.friendly_name),
            move |devices: &mut Devices, _topic: &str, payload: &Payload| {
                devices.on_state::<D>(index, payload)
            },
        );
        dispatcher.subscribe(
            scheme.availability(&entity.friendly_name),
            move |devices: &mut Devices, _topic: &str, payload: &Payload| {
                devices.on_availability::<D>(index, payload)
            },
        );
    }
}
