//! Registry of in-flight optimistic commands
//!
//! Each entity has at most one live [`PendingCommand`]. Arming a second
//! command for the same entity cancels the first timer and replaces the
//! record, so only the most recent command can time out.

use chrono::{DateTime, Local};
use serde_json::Value;
use std::collections::HashMap;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::debug;

use super::entity::EntityKey;

#[derive(Debug)]
pub struct PendingCommand {
    pub desired: Value,
    pub issued_at: DateTime<Local>,
    timer: delay_queue::Key,
}

#[derive(Debug, Default)]
pub struct PendingCommands {
    queue: DelayQueue<EntityKey>,
    live: HashMap<EntityKey, PendingCommand>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the timeout for `key`. Returns true if an older command was
    /// replaced.
    pub fn arm(&mut self, key: EntityKey, desired: Value, timeout: Duration) -> bool {
        let replaced = match self.live.remove(&key) {
            Some(previous) => {
                self.queue.remove(&previous.timer);
                debug!("Replacing pending command for {}", key);
                true
            }
            None => false,
        };

        let timer = self.queue.insert(key, timeout);
        self.live.insert(
            key,
            PendingCommand {
                desired,
                issued_at: Local::now(),
                timer,
            },
        );
        replaced
    }

    /// Cancels the timer of a confirmed command.
    pub fn confirm(&mut self, key: EntityKey) -> Option<PendingCommand> {
        let pending = self.live.remove(&key)?;
        self.queue.remove(&pending.timer);
        Some(pending)
    }

    pub fn get(&self, key: EntityKey) -> Option<&PendingCommand> {
        self.live.get(&key)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Yields the key of the next command whose timeout elapsed.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Option<EntityKey>> {
        match self.queue.poll_expired(cx) {
            Poll::Ready(Some(expired)) => {
                let key = expired.into_inner();
                self.live.remove(&key);
                Poll::Ready(Some(key))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Resolves with the next expired key. Never resolves while empty.
    pub async fn next_expired(&mut self) -> EntityKey {
        std::future::poll_fn(|cx| match self.poll_expired(cx) {
            Poll::Ready(Some(key)) => Poll::Ready(key),
            Poll::Ready(None) | Poll::Pending => Poll::Pending,
        })
        .await
    }
}
