//! Transport Connector - owner of the single broker connection
//!
//! Wraps a rumqttc [`EventLoop`] in a tokio task and turns its packets into
//! [`BusEvent`]s for the hub. Connectivity is published on a
//! `watch::Receiver<ConnectionStatus>`:
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──ConnAck──► Connected
//!                                                      │    ▲
//!                                        transport loss│    │ConnAck
//!                                                      ▼    │
//!                                                   Reconnecting
//! any ──refused / no ConnAck──► Errored          disconnect() ──► Disconnected
//! ```
//!
//! The poll loop never exits on a transport error. It records the error,
//! waits a fixed interval and polls again, which makes rumqttc redial.

use chrono::{DateTime, Local};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use super::link::MqttLink;
use crate::config::BrokerConfig;

const DEFAULT_TCP_PORT: u16 = 1883;
const DEFAULT_WS_PORT: u16 = 9001;

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, serde::Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Errored,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl ConnectionStatus {
    fn begin(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    fn established(&mut self) {
        self.state = ConnectionState::Connected;
        self.last_error = None;
        self.last_activity = Some(Local::now());
    }

    fn lost(&mut self, error: String) {
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            self.state = ConnectionState::Reconnecting;
        }
        self.last_error = Some(error);
    }

    fn failed(&mut self, error: String) {
        self.state = ConnectionState::Errored;
        self.last_error = Some(error);
    }

    fn closed(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    fn received(&mut self) {
        self.messages_received += 1;
        self.last_activity = Some(Local::now());
    }

    fn sent(&mut self) {
        self.messages_sent += 1;
        self.last_activity = Some(Local::now());
    }
}

/// What the connector hands to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Connected,
    ConnectionLost,
    Message { topic: String, payload: Vec<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("Invalid broker URL {0}: {1}")]
    InvalidUrl(String, String),

    #[error("Unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerTransport {
    Tcp,
    WebSocket,
}

/// Where to dial, parsed from the configured broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub transport: BrokerTransport,
    url: String,
}

impl BrokerEndpoint {
    /// Accepts `mqtt://host[:port]`, `tcp://host[:port]`, bare `host[:port]`
    /// and `ws://host[:port][/path]`.
    pub fn parse(raw: &str) -> Result<Self, ConnectorError> {
        let raw = raw.trim();
        let normalized = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("mqtt://{}", raw)
        };

        let url = Url::parse(&normalized)
            .map_err(|e| ConnectorError::InvalidUrl(raw.to_string(), e.to_string()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConnectorError::InvalidUrl(raw.to_string(), "missing host".into()))?
            .to_string();

        let (transport, default_port) = match url.scheme() {
            "mqtt" | "tcp" => (BrokerTransport::Tcp, DEFAULT_TCP_PORT),
            "ws" => (BrokerTransport::WebSocket, DEFAULT_WS_PORT),
            other => return Err(ConnectorError::UnsupportedScheme(other.to_string())),
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            transport,
            url: normalized,
        })
    }

    fn options(&self, client_id: String) -> MqttOptions {
        match self.transport {
            BrokerTransport::Tcp => MqttOptions::new(client_id, self.host.clone(), self.port),
            BrokerTransport::WebSocket => {
                // rumqttc dials websockets from the full URL
                let mut options = MqttOptions::new(client_id, self.url.clone(), self.port);
                options.set_transport(Transport::Ws);
                options
            }
        }
    }
}

/// Refused or unanswered connects are reported as errors rather than drops.
fn is_fatal(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::ConnectionRefused(_) | ConnectionError::NotConnAck(_)
    )
}

pub struct Connector {
    config: BrokerConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    link: Option<Arc<MqttLink>>,
    task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Connector {
    pub fn new(config: BrokerConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::default());
        Self {
            config,
            status_tx,
            link: None,
            task: None,
            shutdown_tx: None,
        }
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Builds the client and starts polling. Calling it again returns the
    /// link of the running connection.
    pub fn connect(
        &mut self,
        events: mpsc::Sender<BusEvent>,
    ) -> Result<Arc<MqttLink>, ConnectorError> {
        if let Some(link) = &self.link {
            debug!("Connector already running, reusing link");
            return Ok(link.clone());
        }

        let endpoint = BrokerEndpoint::parse(&self.config.url)?;
        let client_id = format!(
            "{}-{}",
            self.config.client_id_prefix,
            Local::now().timestamp_millis()
        );
        let mut options = endpoint.options(client_id.clone());
        options
            .set_keep_alive(Duration::from_secs(self.config.keep_alive_secs))
            .set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, self.config.channel_capacity);

        info!(
            "Connecting to {}:{} as {} ({:?})",
            endpoint.host, endpoint.port, client_id, endpoint.transport
        );
        self.status_tx.send_modify(ConnectionStatus::begin);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_event_loop(
            eventloop,
            self.status_tx.clone(),
            events,
            shutdown_rx,
            Duration::from_secs(self.config.reconnect_interval_secs),
        ));

        let link = Arc::new(MqttLink::new(client, self.status_tx.subscribe()));
        self.link = Some(link.clone());
        self.task = Some(task);
        self.shutdown_tx = Some(shutdown_tx);
        Ok(link)
    }

    /// Stops the poll task and reports `Disconnected`.
    pub async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.client().try_disconnect() {
                debug!("Disconnect request not delivered: {}", e);
            }
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("MQTT event loop task failed: {}", e);
            }
        }

        self.status_tx.send_modify(ConnectionStatus::closed);
        info!("Disconnected from broker");
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    status: watch::Sender<ConnectionStatus>,
    events: mpsc::Sender<BusEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    retry_interval: Duration,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("MQTT event loop received shutdown");
                break;
            }
            polled = eventloop.poll() => match polled {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to broker");
                    status.send_modify(ConnectionStatus::established);
                    if events.send(BusEvent::Connected).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    status.send_modify(ConnectionStatus::received);
                    let event = BusEvent::Message {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                    status.send_modify(ConnectionStatus::sent);
                }
                Ok(_) => {}
                Err(e) => {
                    if !on_poll_error(&status, &events, &e).await {
                        break;
                    }

                    tokio::select! {
                        _ = &mut shutdown_rx => break,
                        _ = tokio::time::sleep(retry_interval) => {
                            debug!("Retrying broker connection");
                        }
                    }
                }
            }
        }
    }

    status.send_modify(ConnectionStatus::closed);
}

/// Records a poll failure and tells the hub when an established session
/// dropped. Returns false once the hub is gone.
async fn on_poll_error(
    status: &watch::Sender<ConnectionStatus>,
    events: &mpsc::Sender<BusEvent>,
    error: &ConnectionError,
) -> bool {
    let was_connected = status.borrow().state.is_connected();
    if is_fatal(error) {
        error!("Broker rejected connection: {}", error);
        status.send_modify(|s| s.failed(error.to_string()));
    } else {
        warn!("MQTT connection error: {}", error);
        status.send_modify(|s| s.lost(error.to_string()));
    }

    !was_connected || events.send(BusEvent::ConnectionLost).await.is_ok()
}
