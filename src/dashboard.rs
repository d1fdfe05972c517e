//! Dashboard lifecycle with a statum state machine
//!
//! ```text
//! Configured ──start──► Running ──dispose──► Disposed
//! ```
//!
//! `start` connects the transport, spawns the hub and, when configured, the
//! weather poller. `dispose` stops all three and leaves the connection
//! status at `Disconnected`.

use statum::{machine, state};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use url::Url;

use crate::bus::connector::BrokerEndpoint;
use crate::bus::{ConnectionStatus, Connector, ConnectorError};
use crate::config::DashboardConfig;
use crate::hub::{Hub, HubHandle, HubTask};
use crate::weather::{WeatherPoller, WeatherReport};

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

#[state]
#[derive(Debug, Clone)]
pub enum DashboardState {
    Configured, // config validated, nothing running
    Running,    // connector, hub and weather tasks alive
    Disposed,   // every task stopped
}

#[machine]
pub struct Dashboard<S: DashboardState> {
    config: DashboardConfig,
    connector: Connector,
    hub: Option<HubHandle>,
    hub_task: Option<HubTask>,
    weather: Option<WeatherPoller>,
}

impl<S: DashboardState> Dashboard<S> {
    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    /// Transport status, valid in every state.
    pub fn connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connector.status()
    }
}

impl Dashboard<Configured> {
    /// Validates `config` without touching the network.
    pub fn create(config: DashboardConfig) -> Result<Self, DashboardError> {
        config
            .validate()
            .map_err(|e| DashboardError::InvalidConfig(e.to_string()))?;
        BrokerEndpoint::parse(&config.broker.url)?;
        if let Some(weather) = &config.weather {
            Url::parse(&weather.url).map_err(|e| {
                DashboardError::InvalidConfig(format!("weather url {}: {}", weather.url, e))
            })?;
        }

        info!("Dashboard configured for {}", config.broker.url);
        let connector = Connector::new(config.broker.clone());
        Ok(Self::new(config, connector, None, None, None))
    }

    pub fn start(mut self) -> Result<Dashboard<Running>, DashboardError> {
        let (bus_tx, bus_rx) = mpsc::channel(self.config.broker.channel_capacity);
        let link = self.connector.connect(bus_tx)?;

        let (handle, task) = Hub::new(&self.config, link).start(bus_rx);
        self.hub = Some(handle);
        self.hub_task = Some(task);

        if let Some(weather) = &self.config.weather {
            match WeatherPoller::start(weather) {
                Ok(poller) => self.weather = Some(poller),
                Err(e) => warn!("Weather polling disabled: {}", e),
            }
        }

        info!("Dashboard running");
        Ok(self.transition())
    }
}

impl Dashboard<Running> {
    pub fn hub(&self) -> Option<&HubHandle> {
        self.hub.as_ref()
    }

    pub fn weather(&self) -> Option<watch::Receiver<WeatherReport>> {
        self.weather.as_ref().map(WeatherPoller::report)
    }

    pub fn refresh_weather(&self) {
        if let Some(weather) = &self.weather {
            weather.refresh();
        }
    }

    pub async fn dispose(mut self) -> Dashboard<Disposed> {
        info!("Disposing dashboard");

        if let Some(mut weather) = self.weather.take() {
            weather.shutdown().await;
        }
        if let Some(mut task) = self.hub_task.take() {
            task.shutdown().await;
        }
        self.hub = None;
        self.connector.disconnect().await;

        info!("Dashboard disposed");
        self.transition()
    }
}

impl Dashboard<Disposed> {}
