//! Broker-facing primitives shared by the dispatcher and the controllers
//!
//! [`BrokerLink`] is the seam between the synchronous core and the transport.
//! [`MqttLink`] is the rumqttc implementation; tests plug in a recorder.

use rumqttc::{AsyncClient, ClientError, QoS};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::connector::ConnectionStatus;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Client request failed: {0}")]
    ClientError(String),
}

impl From<ClientError> for LinkError {
    fn from(e: ClientError) -> Self {
        LinkError::ClientError(e.to_string())
    }
}

/// Subscribe/publish primitives of one broker connection.
///
/// Both calls are non-blocking and fire-and-forget (QoS 0). They only queue
/// the request with the transport.
pub trait BrokerLink: Send + Sync {
    fn is_connected(&self) -> bool;

    fn subscribe(&self, pattern: &str) -> Result<(), LinkError>;

    fn publish(&self, topic: &str, payload: String) -> Result<(), LinkError>;
}

/// [`BrokerLink`] backed by a rumqttc client.
pub struct MqttLink {
    client: AsyncClient,
    status: watch::Receiver<ConnectionStatus>,
}

impl MqttLink {
    pub fn new(client: AsyncClient, status: watch::Receiver<ConnectionStatus>) -> Self {
        Self { client, status }
    }

    pub(crate) fn client(&self) -> &AsyncClient {
        &self.client
    }
}

impl BrokerLink for MqttLink {
    fn is_connected(&self) -> bool {
        self.status.borrow().state.is_connected()
    }

    fn subscribe(&self, pattern: &str) -> Result<(), LinkError> {
        debug!("Requesting broker subscription for {}", pattern);
        self.client.try_subscribe(pattern, QoS::AtMostOnce)?;
        Ok(())
    }

    fn publish(&self, topic: &str, payload: String) -> Result<(), LinkError> {
        if !self.is_connected() {
            warn!("Dropping publish to {}: not connected", topic);
            return Err(LinkError::NotConnected);
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.into_bytes())?;
        Ok(())
    }
}
