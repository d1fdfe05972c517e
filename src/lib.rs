//! homedash - live dashboard core for a zigbee2mqtt home
//!
//! Multiplexes one MQTT connection across many topic subscribers, keeps
//! optimistic device state in sync with QoS-0 echoes, and classifies every
//! tracked entity fresh or stale on a timer.
//!
//! ```text
//! Connector ──BusEvent──► Hub ──► Dispatcher ──► Devices (controllers, journal)
//!     ▲                    │                          │
//!     └── MqttLink ◄───────┴──── HubHandle ◄── watch<DeviceSnapshot>
//! ```
//!
//! Start with [`Dashboard::create`], then [`Dashboard::start`] and talk to
//! the running hub through its [`HubHandle`].

pub mod bus;
pub mod config;
pub mod dashboard;
pub mod devices;
pub mod hub;
pub mod journal;
pub mod staleness;
pub mod sync;
pub mod telemetry;
pub mod weather;

pub use config::DashboardConfig;
pub use dashboard::{Configured, Dashboard, DashboardError, Disposed, Running};
pub use devices::{DeviceAction, DeviceSnapshot, Devices};
pub use hub::{Hub, HubError, HubHandle, HubTask, Subscription};
pub use staleness::StalenessClassifier;
pub use weather::{WeatherPoller, WeatherReport};
