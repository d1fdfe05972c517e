//! Weather polling against a Home Assistant state endpoint
//!
//! The poller runs as its own task and publishes [`WeatherReport`] on a
//! watch channel. It fetches once at start, then every poll interval. Ticks
//! and refresh requests that arrive while a fetch is in flight are skipped.

use chrono::{DateTime, Local};
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::WeatherConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const FALLBACK_ICON: &str = "🌡️";

#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("Invalid weather URL {0}: {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("Unexpected response body: {0}")]
    Decode(String),
}

/// Entity state as returned by `GET /api/states/<entity_id>`.
#[derive(Debug, Deserialize)]
struct EntityState {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    attributes: WeatherAttributes,
}

#[derive(Debug, Default, Deserialize)]
struct WeatherAttributes {
    temperature: Option<f64>,
    humidity: Option<f64>,
}

/// One successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub condition: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherReport {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub condition: Option<String>,
    pub icon: &'static str,
    pub loading: bool,
    pub error: Option<String>,
    pub last_fetched: Option<DateTime<Local>>,
}

impl Default for WeatherReport {
    fn default() -> Self {
        Self {
            temperature: None,
            humidity: None,
            condition: None,
            icon: FALLBACK_ICON,
            loading: false,
            error: None,
            last_fetched: None,
        }
    }
}

impl WeatherReport {
    fn begin(&mut self) {
        self.loading = true;
        self.error = None;
    }

    /// A failed fetch keeps the last good values.
    fn finish(&mut self, fetched: Result<WeatherReading, WeatherError>, now: DateTime<Local>) {
        self.loading = false;
        match fetched {
            Ok(reading) => {
                self.icon = icon_for(&reading.condition);
                self.temperature = reading.temperature;
                self.humidity = reading.humidity;
                self.condition = Some(reading.condition);
                self.last_fetched = Some(now);
            }
            Err(e) => self.error = Some(e.to_string()),
        }
    }
}

/// Display icon for a Home Assistant weather condition.
pub fn icon_for(condition: &str) -> &'static str {
    match condition {
        "clear-night" => "🌙",
        "cloudy" => "☁️",
        "fog" => "🌫️",
        "hail" => "🌨️",
        "lightning" => "⚡",
        "lightning-rainy" => "⛈️",
        "partlycloudy" => "⛅",
        "pouring" | "rainy" => "🌧️",
        "snowy" => "❄️",
        "snowy-rainy" => "🌨️",
        "sunny" => "☀️",
        "windy" | "windy-variant" => "💨",
        "exceptional" => "⚠️",
        _ => FALLBACK_ICON,
    }
}

pub struct WeatherClient {
    http: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl WeatherClient {
    pub fn new(config: &WeatherConfig) -> Result<Self, WeatherError> {
        let url = Url::parse(&config.url)
            .map_err(|e| WeatherError::InvalidUrl(config.url.clone(), e))?;
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            url,
            token: config.token.clone(),
        })
    }

    pub async fn fetch(&self) -> Result<WeatherReading, WeatherError> {
        let mut request = self
            .http
            .get(self.url.clone())
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(WeatherError::Status(status.as_u16()));
        }

        let body: EntityState = response
            .json()
            .await
            .map_err(|e| WeatherError::Decode(e.to_string()))?;
        let condition = body
            .state
            .filter(|state| !state.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        Ok(WeatherReading {
            temperature: body.attributes.temperature,
            humidity: body.attributes.humidity,
            condition,
        })
    }
}

/// Handle of the background weather task.
pub struct WeatherPoller {
    report_rx: watch::Receiver<WeatherReport>,
    refresh_tx: mpsc::Sender<()>,
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl WeatherPoller {
    pub fn start(config: &WeatherConfig) -> Result<Self, WeatherError> {
        let client = WeatherClient::new(config)?;
        let interval = Duration::from_secs(config.poll_interval_secs.max(1));
        let (report_tx, report_rx) = watch::channel(WeatherReport::default());
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!("Polling weather from {} every {:?}", client.url, interval);
        let task_handle = tokio::spawn(poll_loop(
            client,
            interval,
            report_tx,
            refresh_rx,
            shutdown_rx,
        ));

        Ok(Self {
            report_rx,
            refresh_tx,
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn report(&self) -> watch::Receiver<WeatherReport> {
        self.report_rx.clone()
    }

    /// Requests an immediate fetch. Ignored while one is already queued or
    /// running.
    pub fn refresh(&self) {
        if self.refresh_tx.try_send(()).is_err() {
            debug!("Weather refresh already pending");
        }
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Weather task already terminated");
            }
        }
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Weather task panicked: {}", e);
            }
        }
    }
}

async fn poll_loop(
    client: WeatherClient,
    interval: Duration,
    report_tx: watch::Sender<WeatherReport>,
    mut refresh_rx: mpsc::Receiver<()>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {}
            Some(()) = refresh_rx.recv() => {}
        }

        report_tx.send_modify(WeatherReport::begin);
        let fetched = tokio::select! {
            _ = &mut shutdown_rx => break,
            fetched = client.fetch() => fetched,
        };
        if let Err(e) = &fetched {
            warn!("Weather fetch failed: {}", e);
        }
        report_tx.send_modify(|report| report.finish(fetched, Local::now()));

        while refresh_rx.try_recv().is_ok() {}
    }

    debug!("Weather poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ENTITY_PATH: &str = "/api/states/weather.forecast_home";

    fn config(server: &MockServer, token: Option<&str>) -> WeatherConfig {
        WeatherConfig {
            url: format!("{}{}", server.uri(), ENTITY_PATH),
            token: token.map(str::to_string),
            poll_interval_secs: 300,
        }
    }

    #[tokio::test]
    async fn fetch_reads_home_assistant_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ENTITY_PATH))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "entity_id": "weather.forecast_home",
                "state": "partlycloudy",
                "attributes": {"temperature": 12.4, "humidity": 71, "wind_speed": 9.3}
            })))
            .mount(&server)
            .await;

        let client = WeatherClient::new(&config(&server, Some("secret"))).unwrap();
        let reading = client.fetch().await.unwrap();
        assert_eq!(
            reading,
            WeatherReading {
                temperature: Some(12.4),
                humidity: Some(71.0),
                condition: "partlycloudy".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn http_errors_are_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = WeatherClient::new(&config(&server, None)).unwrap();
        assert!(matches!(client.fetch().await, Err(WeatherError::Status(401))));
    }

    #[tokio::test]
    async fn poller_publishes_first_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(ENTITY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "sunny"})))
            .mount(&server)
            .await;

        let mut poller = WeatherPoller::start(&config(&server, None)).unwrap();
        let mut reports = poller.report();
        let report = reports
            .wait_for(|report| report.last_fetched.is_some())
            .await
            .unwrap()
            .clone();

        assert_eq!(report.condition.as_deref(), Some("sunny"));
        assert_eq!(report.icon, "☀️");
        assert_eq!(report.temperature, None);
        assert!(!report.loading);
        assert_eq!(report.error, None);
        poller.shutdown().await;
    }

    #[test]
    fn failed_fetch_keeps_last_values() {
        let mut report = WeatherReport::default();
        let now = Local::now();
        report.begin();
        report.finish(
            Ok(WeatherReading {
                temperature: Some(3.0),
                humidity: None,
                condition: "snowy".to_string(),
            }),
            now,
        );
        report.begin();
        assert!(report.loading);
        report.finish(Err(WeatherError::Status(502)), Local::now());

        assert!(!report.loading);
        assert_eq!(report.error.as_deref(), Some("HTTP 502"));
        assert_eq!(report.temperature, Some(3.0));
        assert_eq!(report.icon, "❄️");
        assert_eq!(report.last_fetched, Some(now));
    }

    #[test]
    fn unknown_conditions_use_fallback_icon() {
        assert_eq!(icon_for("rainy"), "🌧️");
        assert_eq!(icon_for("unknown"), FALLBACK_ICON);
        assert!(WeatherClient::new(&WeatherConfig {
            url: "not a url".to_string(),
            token: None,
            poll_interval_secs: 300,
        })
        .is_err());
    }
}
