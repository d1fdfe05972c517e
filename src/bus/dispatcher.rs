//! Topic Dispatcher - one inbound stream, many logical subscribers
//!
//! Maps topic patterns to ordered sets of handler records and keeps the
//! broker-level subscription set minimal: one broker subscribe per unique
//! pattern string per connection, no matter how many handlers come and go.
//!
//! ```text
//! raw frame ──► decode once ──► for each pattern (registration order)
//!                                   └─ matches? ──► every handler (registration order)
//! ```
//!
//! Removing the last handler of a pattern drops the registry entry but leaves
//! the broker subscription in place. The broker set only shrinks when the
//! connection is lost, and is rebuilt from the registry on reconnect.
//!
//! Handlers receive a mutable context `C` owned by the caller of
//! [`Dispatcher::dispatch`], so controllers can be mutated without shared
//! ownership.

use indexmap::IndexMap;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::link::BrokerLink;
use super::payload::{Payload, PayloadError};
use super::topic::topic_matches;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Payload error: {0}")]
    PayloadError(#[from] PayloadError),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Unknown entity index {0}")]
    UnknownEntity(usize),
}

pub type HandlerResult = Result<(), HandlerError>;

pub type Handler<C> = Box<dyn FnMut(&mut C, &str, &Payload) -> HandlerResult + Send>;

/// Identity of one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of dispatching one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub matched_patterns: usize,
    pub invoked: usize,
    pub failed: usize,
}

pub struct Dispatcher<C> {
    link: Arc<dyn BrokerLink>,
    patterns: IndexMap<String, IndexMap<SubscriptionId, Handler<C>>>,
    owners: HashMap<SubscriptionId, String>,
    broker_subscriptions: HashSet<String>,
    next_id: u64,
}

impl<C> Dispatcher<C> {
    pub fn new(link: Arc<dyn BrokerLink>) -> Self {
        Self {
            link,
            patterns: IndexMap::new(),
            owners: HashMap::new(),
            broker_subscriptions: HashSet::new(),
            next_id: 0,
        }
    }

    /// Registers `handler` under `pattern`.
    ///
    /// Issues a broker subscribe only if the pattern is not yet subscribed on
    /// the current connection and the link is connected.
    pub fn subscribe<F>(&mut self, pattern: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: FnMut(&mut C, &str, &Payload) -> HandlerResult + Send + 'static,
    {
        let pattern = pattern.into();
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        self.patterns
            .entry(pattern.clone())
            .or_default()
            .insert(id, Box::new(handler));
        self.owners.insert(id, pattern.clone());
        debug!("Registered {} for pattern {}", id, pattern);

        if self.link.is_connected() {
            self.ensure_broker_subscription(&pattern);
        }

        id
    }

    /// Removes exactly one handler. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(pattern) = self.owners.remove(&id) else {
            return false;
        };

        if let Some(handlers) = self.patterns.get_mut(&pattern) {
            handlers.shift_remove(&id);
            if handlers.is_empty() {
                // broker subscription intentionally stays active
                self.patterns.shift_remove(&pattern);
                debug!("Pattern {} has no handlers left", pattern);
            }
        }
        true
    }

    /// Decodes `raw` once and fans it out to every matching handler.
    pub fn dispatch(&mut self, ctx: &mut C, topic: &str, raw: &[u8]) -> DispatchReport {
        let payload = Payload::decode(raw);
        let mut report = DispatchReport::default();

        for (pattern, handlers) in self.patterns.iter_mut() {
            if !topic_matches(pattern, topic) {
                continue;
            }
            report.matched_patterns += 1;

            for (id, handler) in handlers.iter_mut() {
                report.invoked += 1;
                let outcome = catch_unwind(AssertUnwindSafe(|| handler(ctx, topic, &payload)));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        report.failed += 1;
                        warn!("Handler {} failed for {}: {}", id, topic, e);
                    }
                    Err(panic) => {
                        report.failed += 1;
                        error!(
                            "Handler {} panicked for {}: {}",
                            id,
                            topic,
                            panic_message(panic.as_ref())
                        );
                    }
                }
            }
        }

        if report.matched_patterns == 0 {
            debug!("No handler registered for {}", topic);
        }
        report
    }

    /// Re-issues broker subscriptions for every registered pattern after a
    /// (re)connect.
    pub fn connection_established(&mut self) {
        let pending: Vec<String> = self
            .patterns
            .keys()
            .filter(|pattern| !self.broker_subscriptions.contains(*pattern))
            .cloned()
            .collect();

        info!("Restoring {} broker subscriptions", pending.len());
        for pattern in pending {
            self.ensure_broker_subscription(&pattern);
        }
    }

    /// The broker forgets subscriptions with the connection.
    pub fn connection_lost(&mut self) {
        debug!(
            "Clearing {} broker subscriptions",
            self.broker_subscriptions.len()
        );
        self.broker_subscriptions.clear();
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.keys().map(String::as_str)
    }

    pub fn handler_count(&self, pattern: &str) -> usize {
        self.patterns.get(pattern).map_or(0, IndexMap::len)
    }

    pub fn is_broker_subscribed(&self, pattern: &str) -> bool {
        self.broker_subscriptions.contains(pattern)
    }

    fn ensure_broker_subscription(&mut self, pattern: &str) {
        if self.broker_subscriptions.contains(pattern) {
            return;
        }
        match self.link.subscribe(pattern) {
            Ok(()) => {
                self.broker_subscriptions.insert(pattern.to_string());
            }
            Err(e) => {
                // left out of the set so the next reconnect retries it
                error!("Failed to subscribe to {}: {}", pattern, e);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
