//! Hub task: the single owner of dispatcher and device state
//!
//! The hub runs in its own tokio task and multiplexes four inputs:
//!
//! ```text
//! BusEvent (connector) ──┐
//! HubCommand (handles) ──┤
//! expired pending timer ─┼──► [Hub] ──► watch<DeviceSnapshot>
//! staleness tick ────────┘
//! ```
//!
//! Every input is handled to completion before the next one is polled, so
//! entity state needs no locking. Consumers talk to the hub through a
//! cloneable [`HubHandle`].

use chrono::Local;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{
    to_wire, BrokerLink, BusEvent, Dispatcher, HandlerResult, LinkError, Payload, SubscriptionId,
};
use crate::config::DashboardConfig;
use crate::devices::{DeviceAction, DeviceSnapshot, Devices};
use crate::journal::{JournalQuery, JournalStats, JournalView};
use crate::staleness::StalenessClassifier;
use crate::sync::{CommandError, LightPreset, LightScene};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Hub is not running")]
    Closed,

    #[error("Command rejected: {0}")]
    Command(#[from] CommandError),

    #[error("Publish failed: {0}")]
    Link(#[from] LinkError),
}

/// Handler registered by a consumer outside the device context.
pub type ConsumerHandler = Box<dyn FnMut(&str, &Payload) -> HandlerResult + Send>;

pub enum HubCommand {
    Subscribe {
        pattern: String,
        handler: ConsumerHandler,
        response_tx: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
    },
    Publish {
        topic: String,
        payload: Value,
        response_tx: oneshot::Sender<Result<(), LinkError>>,
    },
    Device {
        action: DeviceAction,
        response_tx: oneshot::Sender<Result<usize, CommandError>>,
    },
    Journal {
        query: JournalQuery,
        response_tx: oneshot::Sender<JournalView>,
    },
    JournalStats {
        response_tx: oneshot::Sender<JournalStats>,
    },
    PauseJournal {
        paused: bool,
    },
    ClearJournal,
}

pub struct Hub {
    dispatcher: Dispatcher<Devices>,
    devices: Devices,
    link: Arc<dyn BrokerLink>,
    classifier: StalenessClassifier,
    snapshot_tx: watch::Sender<DeviceSnapshot>,
}

impl Hub {
    /// Builds the device context and installs every device route.
    pub fn new(config: &DashboardConfig, link: Arc<dyn BrokerLink>) -> Self {
        let devices = Devices::from_config(config, link.clone());
        let mut dispatcher = Dispatcher::new(link.clone());
        devices.install_routes(&mut dispatcher);
        let (snapshot_tx, _) = watch::channel(devices.snapshot());

        Self {
            dispatcher,
            devices,
            link,
            classifier: StalenessClassifier::from_config(&config.staleness),
            snapshot_tx,
        }
    }

    /// Spawns the hub loop fed by `bus_rx`.
    pub fn start(self, bus_rx: mpsc::Receiver<BusEvent>) -> (HubHandle, HubTask) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = HubHandle {
            command_tx,
            snapshot_rx: self.snapshot_tx.subscribe(),
        };

        let task_handle = tokio::spawn(async move {
            info!("Spawning hub task");
            self.run_until_shutdown(bus_rx, command_rx, shutdown_rx)
                .await;
        });

        let task = HubTask {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        };
        (handle, task)
    }

    async fn run_until_shutdown(
        mut self,
        mut bus_rx: mpsc::Receiver<BusEvent>,
        mut command_rx: mpsc::Receiver<HubCommand>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let mut ticker = self.classifier.ticker();
        let mut bus_open = true;

        loop {
            tokio::select! {
                // inbound frames before consumer commands
                biased;

                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received for hub");
                    break;
                }

                event = bus_rx.recv(), if bus_open => match event {
                    Some(event) => self.on_bus_event(event),
                    None => {
                        warn!("Bus event channel closed, hub keeps serving commands");
                        bus_open = false;
                    }
                },

                command = command_rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All hub handles dropped");
                        break;
                    }
                },

                key = self.devices.next_expired() => {
                    if self.devices.expire(key) {
                        debug!("Reverted {} after command timeout", key);
                    }
                }

                _ = ticker.tick() => {
                    self.devices.sweep(&self.classifier, Local::now());
                }
            }

            if self.devices.take_dirty() {
                self.publish_snapshot();
            }
        }

        info!("Hub stopped");
    }

    fn on_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::Connected => self.dispatcher.connection_established(),
            BusEvent::ConnectionLost => self.dispatcher.connection_lost(),
            BusEvent::Message { topic, payload } => {
                let report = self.dispatcher.dispatch(&mut self.devices, &topic, &payload);
                if report.failed > 0 {
                    debug!("{} of {} handlers failed for {}", report.failed, report.invoked, topic);
                }
            }
        }
    }

    fn on_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Subscribe {
                pattern,
                mut handler,
                response_tx,
            } => {
                let id = self.dispatcher.subscribe(
                    pattern,
                    move |_: &mut Devices, topic: &str, payload: &Payload| handler(topic, payload),
                );
                if response_tx.send(id).is_err() {
                    // caller is gone, nobody can dispose the handler
                    self.dispatcher.unsubscribe(id);
                }
            }
            HubCommand::Unsubscribe { id } => {
                if !self.dispatcher.unsubscribe(id) {
                    debug!("Subscription {} already removed", id);
                }
            }
            HubCommand::Publish {
                topic,
                payload,
                response_tx,
            } => {
                let result = self.link.publish(&topic, to_wire(&payload));
                if let Err(e) = &result {
                    warn!("Publish to {} failed: {}", topic, e);
                }
                let _ = response_tx.send(result);
            }
            HubCommand::Device {
                action,
                response_tx,
            } => {
                let result = self.devices.execute(action);
                if let Err(e) = &result {
                    warn!("Device action rejected: {}", e);
                }
                let _ = response_tx.send(result);
            }
            HubCommand::Journal { query, response_tx } => {
                let _ = response_tx.send(self.devices.journal().query(&query));
            }
            HubCommand::JournalStats { response_tx } => {
                let _ = response_tx.send(self.devices.journal().stats());
            }
            HubCommand::PauseJournal { paused } => {
                self.devices.journal_mut().set_paused(paused);
            }
            HubCommand::ClearJournal => self.devices.journal_mut().clear(),
        }
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(self.devices.snapshot());
    }
}

/// Cloneable consumer side of a running hub.
#[derive(Clone)]
pub struct HubHandle {
    command_tx: mpsc::Sender<HubCommand>,
    snapshot_rx: watch::Receiver<DeviceSnapshot>,
}

impl HubHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> HubCommand,
    ) -> Result<T, HubError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(make(response_tx))
            .await
            .map_err(|_| HubError::Closed)?;
        response_rx.await.map_err(|_| HubError::Closed)
    }

    async fn notify(&self, command: HubCommand) -> Result<(), HubError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| HubError::Closed)
    }

    /// Registers `handler` for every topic matching `pattern`.
    pub async fn subscribe<F>(
        &self,
        pattern: impl Into<String>,
        handler: F,
    ) -> Result<Subscription, HubError>
    where
        F: FnMut(&str, &Payload) -> HandlerResult + Send + 'static,
    {
        let pattern = pattern.into();
        let id = self
            .request(|response_tx| HubCommand::Subscribe {
                pattern,
                handler: Box::new(handler),
                response_tx,
            })
            .await?;
        Ok(Subscription {
            id,
            command_tx: self.command_tx.clone(),
        })
    }

    /// Publishes a raw payload. Fails with [`LinkError::NotConnected`] while
    /// the broker is unreachable; nothing is queued.
    pub async fn publish(&self, topic: impl Into<String>, payload: Value) -> Result<(), HubError> {
        let topic = topic.into();
        self.request(|response_tx| HubCommand::Publish {
            topic,
            payload,
            response_tx,
        })
        .await??;
        Ok(())
    }

    /// Runs a device action. Returns the number of commands sent.
    pub async fn execute(&self, action: DeviceAction) -> Result<usize, HubError> {
        let sent = self
            .request(|response_tx| HubCommand::Device {
                action,
                response_tx,
            })
            .await??;
        Ok(sent)
    }

    pub async fn toggle_light(&self, id: impl Into<String>) -> Result<usize, HubError> {
        self.execute(DeviceAction::ToggleLight { id: id.into() }).await
    }

    pub async fn toggle_all_lights(&self) -> Result<usize, HubError> {
        self.execute(DeviceAction::ToggleAllLights).await
    }

    pub async fn set_brightness(&self, id: impl Into<String>, value: f64) -> Result<usize, HubError> {
        self.execute(DeviceAction::SetBrightness { id: id.into(), value })
            .await
    }

    pub async fn set_color_temp(&self, id: impl Into<String>, value: f64) -> Result<usize, HubError> {
        self.execute(DeviceAction::SetColorTemp { id: id.into(), value })
            .await
    }

    pub async fn apply_preset(
        &self,
        id: impl Into<String>,
        preset: LightPreset,
    ) -> Result<usize, HubError> {
        self.execute(DeviceAction::ApplyPreset { id: id.into(), preset })
            .await
    }

    pub async fn apply_scene(&self, scene: LightScene) -> Result<usize, HubError> {
        self.execute(DeviceAction::ApplyScene { scene }).await
    }

    pub async fn set_target_temp(&self, id: impl Into<String>, value: f64) -> Result<usize, HubError> {
        self.execute(DeviceAction::SetTargetTemp { id: id.into(), value })
            .await
    }

    pub async fn adjust_target_temp(
        &self,
        id: impl Into<String>,
        delta: f64,
    ) -> Result<usize, HubError> {
        self.execute(DeviceAction::AdjustTargetTemp { id: id.into(), delta })
            .await
    }

    pub async fn toggle_thermostat_power(&self, id: impl Into<String>) -> Result<usize, HubError> {
        self.execute(DeviceAction::ToggleThermostatPower { id: id.into() })
            .await
    }

    pub async fn journal(&self, query: JournalQuery) -> Result<JournalView, HubError> {
        self.request(|response_tx| HubCommand::Journal { query, response_tx })
            .await
    }

    pub async fn journal_stats(&self) -> Result<JournalStats, HubError> {
        self.request(|response_tx| HubCommand::JournalStats { response_tx })
            .await
    }

    pub async fn pause_journal(&self, paused: bool) -> Result<(), HubError> {
        self.notify(HubCommand::PauseJournal { paused }).await
    }

    pub async fn clear_journal(&self) -> Result<(), HubError> {
        self.notify(HubCommand::ClearJournal).await
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Receiver that wakes on every snapshot change.
    pub fn watch(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot_rx.clone()
    }
}

/// Disposer for one consumer handler.
///
/// Dropping it leaves the handler registered.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    command_tx: mpsc::Sender<HubCommand>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Removes exactly this handler. Other handlers on the same pattern, and
    /// the broker subscription, stay in place.
    pub async fn unsubscribe(self) -> Result<(), HubError> {
        self.command_tx
            .send(HubCommand::Unsubscribe { id: self.id })
            .await
            .map_err(|_| HubError::Closed)
    }
}

/// Owner of the spawned hub task.
#[derive(Debug)]
pub struct HubTask {
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl HubTask {
    /// Signals the hub loop and waits for it to finish.
    pub async fn shutdown(&mut self) {
        debug!("Sending shutdown signal to hub");

        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Hub task already terminated");
            }
        }

        if let Some(handle) = self.task_handle.take() {
            match handle.await {
                Ok(()) => debug!("Hub task completed"),
                Err(e) => error!("Hub task panicked: {}", e),
            }
        } else {
            debug!("Hub already shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::link::testing::RecordingLink;
    use crate::journal::LogCategory;
    use crate::sync::PowerState;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn start(link: &Arc<RecordingLink>) -> (mpsc::Sender<BusEvent>, HubHandle, HubTask) {
        let (bus_tx, bus_rx) = mpsc::channel(16);
        let hub = Hub::new(&DashboardConfig::default(), link.clone());
        let (handle, task) = hub.start(bus_rx);
        (bus_tx, handle, task)
    }

    fn message(topic: &str, payload: &str) -> BusEvent {
        BusEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    /// Round-trips a request so every earlier command has been handled.
    async fn settle(handle: &HubHandle) {
        handle.journal(JournalQuery::default()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn consumer_subscriptions_share_one_broker_subscribe() {
        let link = Arc::new(RecordingLink::connected());
        let (bus_tx, handle, mut task) = start(&link);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut subscriptions = Vec::new();
        for name in ["first", "second"] {
            let seen = seen.clone();
            let subscription = handle
                .subscribe("garden/+/state", move |topic: &str, _: &Payload| {
                    seen.lock().unwrap().push(format!("{name}:{topic}"));
                    Ok(())
                })
                .await
                .unwrap();
            subscriptions.push(subscription);
        }
        assert_eq!(link.subscribe_count("garden/+/state"), 1);

        bus_tx.send(message("garden/pump/state", "on")).await.unwrap();
        settle(&handle).await;
        subscriptions.remove(0).unsubscribe().await.unwrap();
        settle(&handle).await;
        bus_tx.send(message("garden/valve/state", "off")).await.unwrap();
        settle(&handle).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "first:garden/pump/state".to_string(),
                "second:garden/pump/state".to_string(),
                "second:garden/valve/state".to_string(),
            ]
        );
        assert_eq!(link.subscribe_count("garden/+/state"), 1);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn routes_subscribe_once_connected() {
        let link = Arc::new(RecordingLink::default());
        let (bus_tx, handle, mut task) = start(&link);
        settle(&handle).await;
        assert!(link.subscribes().is_empty());

        link.set_connected(true);
        bus_tx.send(BusEvent::Connected).await.unwrap();
        settle(&handle).await;
        assert_eq!(link.subscribe_count("zigbee2mqtt/[Study] IKEA Light"), 1);
        assert_eq!(link.subscribe_count("zigbee2mqtt/#"), 1);

        link.set_connected(false);
        bus_tx.send(BusEvent::ConnectionLost).await.unwrap();
        link.set_connected(true);
        bus_tx.send(BusEvent::Connected).await.unwrap();
        settle(&handle).await;
        assert_eq!(link.subscribe_count("zigbee2mqtt/[Study] IKEA Light"), 2);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_follows_optimistic_toggle_and_timeout() {
        let link = Arc::new(RecordingLink::connected());
        let (_bus_tx, handle, mut task) = start(&link);
        let mut snapshots = handle.watch();

        assert_eq!(handle.toggle_light("living_light").await.unwrap(), 1);
        snapshots.changed().await.unwrap();
        let light = snapshots.borrow_and_update().light("living_light").cloned().unwrap();
        assert_eq!(light.fields.state, PowerState::On);
        assert!(light.syncing);

        tokio::time::sleep(Duration::from_secs(4)).await;
        settle(&handle).await;
        let light = handle.snapshot().light("living_light").cloned().unwrap();
        assert_eq!(light.fields.state, PowerState::On);
        assert!(!light.syncing);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn publish_and_actions_report_failures() {
        let link = Arc::new(RecordingLink::default());
        let (_bus_tx, handle, mut task) = start(&link);

        let result = handle.publish("zigbee2mqtt/bridge/request", json!("ping")).await;
        assert!(matches!(result, Err(HubError::Link(LinkError::NotConnected))));

        let result = handle.toggle_light("garage").await;
        assert!(matches!(result, Err(HubError::Command(CommandError::UnknownEntity(..)))));

        link.set_connected(true);
        handle
            .publish("zigbee2mqtt/bridge/request", json!("ping"))
            .await
            .unwrap();
        assert_eq!(
            link.publishes(),
            vec![("zigbee2mqtt/bridge/request".to_string(), "ping".to_string())]
        );
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn journal_is_queryable_and_clearable() {
        let link = Arc::new(RecordingLink::connected());
        let (bus_tx, handle, mut task) = start(&link);

        bus_tx
            .send(message("zigbee2mqtt/[Mailbox] Motion Sensor", r#"{"occupancy":true}"#))
            .await
            .unwrap();
        settle(&handle).await;
        let view = handle.journal(JournalQuery::default()).await.unwrap();
        assert_eq!(view.logs.len(), 1);
        assert_eq!(view.timeline.len(), 1);
        let stats = handle.journal_stats().await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_category[&LogCategory::Motion], 1);

        handle.clear_journal().await.unwrap();
        let view = handle.journal(JournalQuery::default()).await.unwrap();
        assert!(view.logs.is_empty());
        assert_eq!(handle.journal_stats().await.unwrap().total, 0);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_handles() {
        let link = Arc::new(RecordingLink::connected());
        let (_bus_tx, handle, mut task) = start(&link);
        assert!(task.is_running());

        task.shutdown().await;
        assert!(!task.is_running());
        assert!(matches!(handle.toggle_all_lights().await, Err(HubError::Closed)));
        task.shutdown().await;
    }
}
