use homedash::bus::{BrokerLink, BusEvent, HandlerError, LinkError, Payload};
use homedash::sync::motion::signal_health;
use homedash::sync::{CommandError, PowerState, SignalStatus, SystemMode};
use homedash::{DashboardConfig, DeviceSnapshot, Hub, HubError, HubHandle, HubTask};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct MockLink {
    connected: AtomicBool,
    subscribes: Mutex<Vec<String>>,
    publishes: Mutex<Vec<(String, String)>>,
}

impl MockLink {
    fn subscribe_count(&self, pattern: &str) -> usize {
        self.subscribes
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == pattern)
            .count()
    }

    fn published(&self) -> Vec<(String, String)> {
        self.publishes.lock().unwrap().clone()
    }
}

impl BrokerLink for MockLink {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self, pattern: &str) -> Result<(), LinkError> {
        self.subscribes.lock().unwrap().push(pattern.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: String) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        self.publishes
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

struct Harness {
    link: Arc<MockLink>,
    bus_tx: mpsc::Sender<BusEvent>,
    hub: HubHandle,
    task: HubTask,
}

impl Harness {
    fn start() -> Self {
        let link = Arc::new(MockLink::default());
        let (bus_tx, bus_rx) = mpsc::channel(32);
        let (hub, task) = Hub::new(&DashboardConfig::default(), link.clone()).start(bus_rx);
        Self {
            link,
            bus_tx,
            hub,
            task,
        }
    }

    async fn connect(&self) {
        self.link.connected.store(true, Ordering::SeqCst);
        self.bus_tx.send(BusEvent::Connected).await.unwrap();
        self.settle().await;
    }

    async fn drop_connection(&self) {
        self.link.connected.store(false, Ordering::SeqCst);
        self.bus_tx.send(BusEvent::ConnectionLost).await.unwrap();
        self.settle().await;
    }

    async fn receive(&self, topic: &str, payload: &str) {
        let event = BusEvent::Message {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        };
        self.bus_tx.send(event).await.unwrap();
        self.settle().await;
    }

    /// A request/response round trip, after which every earlier event has
    /// been handled.
    async fn settle(&self) {
        self.hub.journal(Default::default()).await.unwrap();
    }

    fn snapshot(&self) -> DeviceSnapshot {
        self.hub.snapshot()
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_each_pattern_once() {
    let mut harness = Harness::start();
    let _garden = harness
        .hub
        .subscribe("garden/#", |_: &str, _: &Payload| Ok(()))
        .await
        .unwrap();
    assert_eq!(harness.link.subscribe_count("garden/#"), 0);

    harness.connect().await;
    assert_eq!(harness.link.subscribe_count("garden/#"), 1);
    assert_eq!(harness.link.subscribe_count("zigbee2mqtt/#"), 1);
    assert_eq!(
        harness.link.subscribe_count("zigbee2mqtt/[Bedroom] Thermostat/availability"),
        1
    );

    // a second handler on a known pattern does not hit the broker
    let _again = harness
        .hub
        .subscribe("garden/#", |_: &str, _: &Payload| Ok(()))
        .await
        .unwrap();
    assert_eq!(harness.link.subscribe_count("garden/#"), 1);

    harness.drop_connection().await;
    harness.connect().await;
    assert_eq!(harness.link.subscribe_count("garden/#"), 2);
    assert_eq!(harness.link.subscribe_count("zigbee2mqtt/#"), 2);

    harness.task.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn brightness_is_clamped_and_confirmed_by_echo() {
    let mut harness = Harness::start();
    harness.connect().await;

    harness.hub.set_brightness("study_light", 300.0).await.unwrap();
    assert_eq!(
        harness.link.published(),
        vec![(
            "zigbee2mqtt/[Study] IKEA Light/set".to_string(),
            r#"{"brightness":254}"#.to_string()
        )]
    );
    let light = harness.snapshot().light("study_light").cloned().unwrap();
    assert_eq!(light.fields.brightness, 254);
    assert!(light.syncing);

    harness
        .receive(
            "zigbee2mqtt/[Study] IKEA Light",
            r#"{"state":"ON","brightness":254,"color_temp":370,"linkquality":96}"#,
        )
        .await;
    let light = harness.snapshot().light("study_light").cloned().unwrap();
    assert!(!light.syncing);
    assert_eq!(light.fields.state, PowerState::On);
    assert_eq!(light.fields.linkquality, Some(96));
    assert!(light.last_seen.is_some());

    // no timeout fires for a confirmed command
    tokio::time::sleep(Duration::from_secs(10)).await;
    harness.settle().await;
    assert_eq!(harness.snapshot().light("study_light"), Some(&light));

    harness.task.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_setpoint_reverts_after_timeout() {
    let mut harness = Harness::start();
    harness.connect().await;
    harness
        .receive(
            "zigbee2mqtt/[Living] Thermostat",
            r#"{"local_temperature":18.5,"occupied_heating_setpoint":19,"system_mode":"heat","running_state":"heat"}"#,
        )
        .await;
    assert_eq!(harness.snapshot().heating_count(), 1);

    harness.hub.adjust_target_temp("living_thermostat", 1.4).await.unwrap();
    let thermostat = harness.snapshot().thermostat("living_thermostat").cloned().unwrap();
    assert_eq!(thermostat.fields.display_target(), Some(20.0));
    assert!(thermostat.syncing);

    tokio::time::sleep(Duration::from_secs(4)).await;
    harness.settle().await;
    assert!(harness.snapshot().thermostat("living_thermostat").unwrap().syncing);

    tokio::time::sleep(Duration::from_secs(2)).await;
    harness.settle().await;
    let thermostat = harness.snapshot().thermostat("living_thermostat").cloned().unwrap();
    assert!(!thermostat.syncing);
    assert_eq!(thermostat.fields.display_target(), Some(19.0));
    assert_eq!(thermostat.fields.display_mode(), SystemMode::Heat);

    harness.task.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_consumer_does_not_starve_others() {
    let mut harness = Harness::start();
    harness.connect().await;
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let _panicking = harness
        .hub
        .subscribe("zigbee2mqtt/+", |_: &str, _: &Payload| -> Result<(), HandlerError> {
            panic!("consumer bug")
        })
        .await
        .unwrap();
    let _failing = harness
        .hub
        .subscribe("zigbee2mqtt/+", |topic: &str, _: &Payload| {
            Err(HandlerError::UnexpectedMessage(topic.to_string()))
        })
        .await
        .unwrap();
    let sink = delivered.clone();
    let _recording = harness
        .hub
        .subscribe("zigbee2mqtt/+", move |_: &str, payload: &Payload| {
            sink.lock().unwrap().push(payload.to_string());
            Ok(())
        })
        .await
        .unwrap();

    harness
        .receive("zigbee2mqtt/[Living] Balcony Door", r#"{"contact":false}"#)
        .await;
    harness.receive("zigbee2mqtt/[Living] Balcony Door", "not json").await;

    assert_eq!(delivered.lock().unwrap().len(), 2);
    assert_eq!(harness.snapshot().open_doors(), 1);

    harness.task.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn offline_devices_reject_commands() {
    let mut harness = Harness::start();
    harness.connect().await;
    harness
        .receive("zigbee2mqtt/[Study] Thermostat/availability", "offline")
        .await;
    assert_eq!(harness.snapshot().thermostats_offline(), 1);

    let result = harness.hub.toggle_thermostat_power("study_thermostat").await;
    assert!(result.is_err());
    assert!(harness.link.published().is_empty());

    harness
        .receive(
            "zigbee2mqtt/[Study] Thermostat/availability",
            r#"{"state":"online"}"#,
        )
        .await;
    assert_eq!(harness.hub.toggle_thermostat_power("study_thermostat").await.unwrap(), 1);
    assert_eq!(harness.link.published().len(), 1);

    harness.task.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn non_finite_levels_never_reach_the_broker() {
    let mut harness = Harness::start();
    harness.connect().await;
    let before = harness.snapshot();

    let results = vec![
        harness.hub.set_brightness("study_light", f64::NAN).await,
        harness.hub.set_color_temp("living_light", f64::INFINITY).await,
        harness.hub.set_target_temp("study_thermostat", f64::NAN).await,
        harness.hub.adjust_target_temp("living_thermostat", f64::NEG_INFINITY).await,
    ];
    for result in results {
        assert!(matches!(
            result,
            Err(HubError::Command(CommandError::InvalidValue(..)))
        ));
    }

    harness.settle().await;
    assert!(harness.link.published().is_empty());
    let after = harness.snapshot();
    assert_eq!(after.lights, before.lights);
    assert_eq!(after.thermostats, before.thermostats);

    harness.task.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn mailbox_deliveries_show_up_in_snapshots() {
    let mut harness = Harness::start();
    harness.connect().await;
    harness
        .receive(
            "zigbee2mqtt/[Mailbox] Motion Sensor",
            r#"{"occupancy":true,"battery":97.5,"linkquality":140}"#,
        )
        .await;

    let snapshot = harness.snapshot();
    let mailbox = snapshot.motion_sensor("mailbox").unwrap();
    assert_eq!(mailbox.fields.battery, Some(98));
    let stats = mailbox.fields.delivery_stats(chrono::Local::now());
    assert_eq!(stats.total, 1);
    assert!(stats.last_delivery.is_some());
    assert_eq!(
        signal_health(mailbox, chrono::Local::now()).status,
        SignalStatus::Healthy
    );

    harness.task.shutdown().await;
}
