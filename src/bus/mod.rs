//! Message-bus plumbing: topic grammar, payload decoding, the broker
//! connection and the topic dispatcher.

pub mod connector;
pub mod dispatcher;
pub mod link;
pub mod payload;
pub mod topic;

pub use connector::{BusEvent, ConnectionState, ConnectionStatus, Connector, ConnectorError};
pub use dispatcher::{DispatchReport, Dispatcher, HandlerError, HandlerResult, SubscriptionId};
pub use link::{BrokerLink, LinkError, MqttLink};
pub use payload::{to_wire, Payload, PayloadError};
pub use topic::{topic_matches, TopicScheme};
