use crate::config::Config;
use crate::model::{StatusReport, WifiStatus};
use crate::notify::Category;
use crate::session::SessionHandle;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::{fmt, time::Duration};
use tokio::sync::watch;

const FETCH_FAILED_NOTICE_MS: u64 = 2000;

#[derive(Debug)]
pub enum StatusError {
    Url(String),
    Http(reqwest::Error),
    Json(serde_json::Error),
    Api { status: StatusCode, body: String },
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(err) => write!(f, "url error: {err}"),
            Self::Http(err) => write!(f, "http error: {err}"),
            Self::Json(err) => write!(f, "json error: {err}"),
            Self::Api { status, body } => {
                write!(f, "device returned {}: {}", status.as_u16(), body)
            }
        }
    }
}

impl std::error::Error for StatusError {}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceStatus {
    pub status: StatusReport,
    pub wifi: WifiStatus,
}

#[derive(Clone, Debug)]
pub struct StatusClient {
    http: Client,
    status_url: Url,
    wifi_url: Url,
}

impl StatusClient {
    pub fn new(
        base_url: &str,
        status_path: &str,
        wifi_path: &str,
        timeout: Duration,
    ) -> Result<Self, StatusError> {
        let base = Url::parse(base_url.trim()).map_err(|err| StatusError::Url(err.to_string()))?;
        let status_url = base
            .join(status_path)
            .map_err(|err| StatusError::Url(err.to_string()))?;
        let wifi_url = base
            .join(wifi_path)
            .map_err(|err| StatusError::Url(err.to_string()))?;
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(StatusError::Http)?;
        Ok(Self {
            http,
            status_url,
            wifi_url,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, StatusError> {
        Self::new(
            &config.device_base_url(),
            &config.status.status_path,
            &config.status.wifi_path,
            Duration::from_millis(config.status.request_timeout_ms),
        )
    }

    pub async fn status(&self) -> Result<StatusReport, StatusError> {
        self.get_json(self.status_url.clone()).await
    }

    pub async fn wifi(&self) -> Result<WifiStatus, StatusError> {
        self.get_json(self.wifi_url.clone()).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, StatusError> {
        let resp = self.http.get(url).send().await.map_err(StatusError::Http)?;
        let status = resp.status();
        let body = resp.text().await.map_err(StatusError::Http)?;
        parse_json_response(status, &body)
    }

    /// Fetch both documents. Non-success responses raise an error notice;
    /// anything else that goes wrong leaves that half of the report empty.
    pub async fn poll(&self, notices: &SessionHandle) -> DeviceStatus {
        let (status, wifi) = tokio::join!(self.status(), self.wifi());
        DeviceStatus {
            status: settle(status, "Failed to fetch status", notices),
            wifi: settle(wifi, "Failed to fetch WiFi status", notices),
        }
    }
}

fn settle<T: Default>(result: Result<T, StatusError>, failure: &str, notices: &SessionHandle) -> T {
    match result {
        Ok(value) => value,
        Err(StatusError::Api { status, .. }) => {
            tracing::warn!(status = status.as_u16(), "{failure}");
            notices.notify(
                Category::Error,
                failure,
                Some(Duration::from_millis(FETCH_FAILED_NOTICE_MS)),
            );
            T::default()
        }
        Err(err) => {
            tracing::debug!(error = %err, "status fetch failed");
            T::default()
        }
    }
}

pub fn parse_json_response<T: DeserializeOwned>(
    status: StatusCode,
    body: &str,
) -> Result<T, StatusError> {
    if !status.is_success() {
        return Err(StatusError::Api {
            status,
            body: body.to_string(),
        });
    }
    serde_json::from_str(body).map_err(StatusError::Json)
}

/// `H:MM:SS`, hours unbounded.
pub fn format_uptime(ms: u64) -> String {
    let total = ms / 1000;
    format!("{}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60)
}

/// One-line summary of a [`DeviceStatus`].
pub struct StatusFooter<'a> {
    pub status: &'a DeviceStatus,
    /// Seconds since the Unix epoch when the report was taken.
    pub taken_at: u64,
}

impl StatusFooter<'_> {
    pub fn render(&self) -> String {
        let wifi = &self.status.wifi;
        let report = &self.status.status;
        let na = || "N/A".to_string();

        let wifi_state = if wifi.connected.unwrap_or(false) {
            "Connected"
        } else {
            "Disconnected"
        };
        let used = match (report.total_heap, report.free_heap) {
            (Some(total), Some(free)) if total > free => (total - free).to_string(),
            _ => na(),
        };
        let total = report.total_heap.filter(|t| *t > 0).map_or_else(na, |t| t.to_string());
        let uptime = report.uptime.map_or_else(na, format_uptime);
        let version = report
            .version
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(na);
        let ip = wifi.ip.clone().filter(|ip| !ip.is_empty()).unwrap_or_else(na);
        let secs = self.taken_at % 86_400;

        format!(
            "WiFi: {wifi_state} | IP: {ip} | Heap: {used}/{total} bytes | \
             Uptime: {uptime} | FW: {version} | Last update: {:02}:{:02}:{:02}",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        )
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Poll the device on a fixed interval until `shutdown_rx` flips.
pub async fn run_poller(
    client: StatusClient,
    interval: Duration,
    notices: SessionHandle,
    latest: watch::Sender<Option<DeviceStatus>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = client.poll(&notices).await;
                let footer = StatusFooter { status: &status, taken_at: unix_now() };
                tracing::info!("{}", footer.render());
                let _ = latest.send(Some(status));
            }
            _ = shutdown_rx.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_formats_as_hours_minutes_seconds() {
        assert_eq!(format_uptime(0), "0:00:00");
        assert_eq!(format_uptime(61_999), "0:01:01");
        assert_eq!(format_uptime(3_600_000 * 27 + 5_000), "27:00:05");
    }

    #[test]
    fn parses_partial_status_documents() {
        let report: StatusReport =
            parse_json_response(StatusCode::OK, r#"{"totalHeap":1000,"uptime":5000}"#).unwrap();
        assert_eq!(report.total_heap, Some(1000));
        assert_eq!(report.free_heap, None);
        assert_eq!(report.version, None);

        let wifi: WifiStatus = parse_json_response(StatusCode::OK, "{}").unwrap();
        assert_eq!(wifi, WifiStatus::default());
    }

    #[test]
    fn non_success_status_is_api_error() {
        let err = parse_json_response::<StatusReport>(StatusCode::NOT_FOUND, "nope").unwrap_err();
        assert!(matches!(err, StatusError::Api { status, .. } if status == StatusCode::NOT_FOUND));
    }

    #[test]
    fn footer_renders_known_and_missing_fields() {
        let status = DeviceStatus {
            status: StatusReport {
                total_heap: Some(4000),
                free_heap: Some(1000),
                uptime: Some(3_723_000),
                version: Some("0.4.1".to_string()),
            },
            wifi: WifiStatus {
                connected: Some(true),
                ip: Some("192.168.4.1".to_string()),
            },
        };
        let line = StatusFooter {
            status: &status,
            taken_at: 3600 * 13 + 60 * 5 + 9,
        }
        .render();
        assert_eq!(
            line,
            "WiFi: Connected | IP: 192.168.4.1 | Heap: 3000/4000 bytes | \
             Uptime: 1:02:03 | FW: 0.4.1 | Last update: 13:05:09"
        );

        let empty = DeviceStatus::default();
        let line = StatusFooter {
            status: &empty,
            taken_at: 0,
        }
        .render();
        assert_eq!(
            line,
            "WiFi: Disconnected | IP: N/A | Heap: N/A/N/A bytes | \
             Uptime: N/A | FW: N/A | Last update: 00:00:00"
        );
    }

    #[test]
    fn client_joins_paths_onto_base() {
        let client = StatusClient::new(
            "http://rover.local",
            "/status.json",
            "/wifi-status.json",
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.status_url.as_str(), "http://rover.local/status.json");
        assert_eq!(client.wifi_url.as_str(), "http://rover.local/wifi-status.json");
        assert!(StatusClient::new("not a url", "/a", "/b", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn poll_reads_simulator_and_reports_missing_endpoint() {
        use crate::channel::ControlChannel;
        use crate::handlers::HandlerRegistry;
        use crate::notify::{DetachedSurface, NotificationQueue, NotificationTimings};
        use crate::server::{self, DeviceState};
        use crate::session::{self, Session};
        use std::sync::Arc;

        let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let device = Arc::new(DeviceState::new("9.9.9"));
        let server = tokio::spawn(server::start(listener, device, stop_rx));

        let (handle, task) = session::spawn(Session::new(
            ControlChannel::new(format!("ws://{addr}/ws"), Duration::from_secs(10)),
            NotificationQueue::new(Box::new(DetachedSurface), NotificationTimings::default()),
            HandlerRegistry::new(),
        ));

        let base = format!("http://{addr}");
        let timeout = Duration::from_secs(2);
        let client =
            StatusClient::new(&base, "/status.json", "/wifi-status.json", timeout).unwrap();
        let polled = client.poll(&handle).await;
        assert_eq!(polled.status.version.as_deref(), Some("9.9.9"));
        assert_eq!(polled.wifi.connected, Some(true));
        assert!(handle.snapshot().await.unwrap().notification.is_none());

        let client =
            StatusClient::new(&base, "/missing.json", "/wifi-status.json", timeout).unwrap();
        let polled = client.poll(&handle).await;
        assert_eq!(polled.status, StatusReport::default());
        let snap = handle.snapshot().await.unwrap();
        let shown = snap.notification.unwrap();
        assert_eq!(shown.category, Category::Error);
        assert_eq!(shown.text, "Failed to fetch status");
        assert_eq!(shown.duration, Duration::from_millis(2000));

        handle.shutdown();
        task.await.unwrap();
        let _ = stop_tx.send(true);
        let _ = server.await;
    }
}
