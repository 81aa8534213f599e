//! Local stand-in for the vehicle firmware: the `/ws` control endpoint plus the
//! JSON status endpoints the console polls.

use crate::model::{StatusReport, WifiStatus};
use crate::protocol::{self, DriveCommand, EventCode, Frame, ValueCode};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::net::TcpListener;
use tokio::sync::watch;

const WATCHDOG_TICK: Duration = Duration::from_millis(100);
const SIM_TOTAL_HEAP: u64 = 320 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Debug)]
struct DeviceValues {
    live: BTreeMap<u8, i16>,
    saved: BTreeMap<u8, i16>,
}

pub struct DeviceState {
    values: Mutex<DeviceValues>,
    booted_at: Instant,
    version: String,
}

fn default_values() -> BTreeMap<u8, i16> {
    [
        (ValueCode::Speed, 0),
        (ValueCode::Steering, 0),
        (ValueCode::TopServo, 0),
        (ValueCode::SteeringMaxPulse, 2000),
        (ValueCode::SteeringMinPulse, 1000),
        (ValueCode::TopMaxPulse, 2000),
        (ValueCode::TopMinPulse, 1000),
        (ValueCode::WsTimeout, 1000),
        (ValueCode::PidSpeedKp, 120),
        (ValueCode::PidSpeedKi, 15),
        (ValueCode::PidSpeedKd, 4),
        (ValueCode::PidSpeedDAlpha, 50),
        (ValueCode::PidSpeedIDeadband, 2),
        (ValueCode::PidAngleKp, 90),
        (ValueCode::PidAngleKi, 8),
        (ValueCode::PidAngleKd, 3),
        (ValueCode::PidAngleDAlpha, 50),
        (ValueCode::PidAngleIDeadband, 1),
    ]
    .into_iter()
    .map(|(code, value)| (u8::from(code), value))
    .collect()
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

impl DeviceState {
    pub fn new(version: impl Into<String>) -> Self {
        let values = default_values();
        Self {
            values: Mutex::new(DeviceValues {
                live: values.clone(),
                saved: values,
            }),
            booted_at: Instant::now(),
            version: version.into(),
        }
    }

    pub fn value(&self, code: ValueCode) -> Option<i16> {
        self.lock().live.get(&u8::from(code)).copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DeviceValues> {
        // A poisoned lock only means a handler panicked mid-update; the map is still usable.
        self.values.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set(&self, code: u8, value: i16) {
        self.lock().live.insert(code, value);
    }

    fn stop_motion(&self) {
        let mut values = self.lock();
        values.live.insert(ValueCode::Speed.into(), 0);
    }

    fn moving(&self) -> bool {
        self.value(ValueCode::Speed).unwrap_or(0) != 0
    }

    fn watchdog_timeout(&self) -> Option<Duration> {
        match self.value(ValueCode::WsTimeout) {
            Some(ms) if ms > 0 => Some(Duration::from_millis(ms as u64)),
            _ => None,
        }
    }

    /// Apply one binary frame from the console and return what the device answers.
    pub fn handle_binary(&self, bytes: &[u8]) -> Vec<Reply> {
        let frame = match protocol::decode(bytes) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "simulator dropped undecodable frame");
                return Vec::new();
            }
        };
        match frame {
            Frame::Value(v) => {
                if v.kind().is_none() {
                    tracing::warn!(code = v.code, "simulator ignoring unknown value code");
                    return Vec::new();
                }
                self.set(v.code, v.value);
                vec![Reply::Binary(frame.encode())]
            }
            Frame::Event(ev) => match ev.kind() {
                Some(EventCode::Estop) | Some(EventCode::Timeout) => {
                    self.stop_motion();
                    vec![Reply::Binary(frame.encode())]
                }
                Some(EventCode::SaveSettings) => {
                    let mut values = self.lock();
                    values.saved = values.live.clone();
                    vec![Reply::Text("settings saved".to_string())]
                }
                Some(EventCode::RevertSettings) => {
                    let mut values = self.lock();
                    values.live = values.saved.clone();
                    let replies = values
                        .live
                        .iter()
                        .filter(|(code, _)| {
                            ValueCode::try_from(**code)
                                .map(ValueCode::is_setting)
                                .unwrap_or(false)
                        })
                        .map(|(code, value)| Reply::Binary(Frame::value(*code, *value).encode()))
                        .collect();
                    replies
                }
                Some(EventCode::None) => Vec::new(),
                None => {
                    tracing::warn!(code = ev.code, "simulator ignoring unknown event code");
                    Vec::new()
                }
            },
        }
    }

    /// Text path: legacy JSON drive commands, anything else is echoed.
    pub fn handle_text(&self, text: &str) -> Vec<Reply> {
        match serde_json::from_str::<DriveCommand>(text) {
            Ok(cmd) => {
                if cmd.estop == Some(true) {
                    self.stop_motion();
                } else {
                    if let Some(speed) = cmd.speed {
                        self.set(ValueCode::Speed.into(), speed);
                    }
                    if let Some(steering) = cmd.steering {
                        self.set(ValueCode::Steering.into(), steering);
                    }
                    if let Some(top) = cmd.top {
                        self.set(ValueCode::TopServo.into(), top);
                    }
                }
                vec![Reply::Text("ok".to_string())]
            }
            Err(_) => vec![Reply::Text(text.to_string())],
        }
    }

    pub fn status_report(&self) -> StatusReport {
        let uptime_ms = self.booted_at.elapsed().as_millis() as u64;
        let used = 48 * 1024 + (self.lock().live.len() as u64) * 64;
        StatusReport {
            total_heap: Some(SIM_TOTAL_HEAP),
            free_heap: Some(SIM_TOTAL_HEAP - used),
            uptime: Some(uptime_ms),
            version: Some(self.version.clone()),
        }
    }
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

pub fn router(state: Arc<DeviceState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/status.json", get(status_json))
        .route("/wifi-status.json", get(wifi_status_json))
        .with_state(state)
}

pub async fn start(
    listener: TcpListener,
    state: Arc<DeviceState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "device simulator listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;
    tracing::info!("device simulator stopped");
    Ok(())
}

async fn ws_handler(
    State(state): State<Arc<DeviceState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<DeviceState>) {
    tracing::info!("simulator: console connected");
    let mut ticker = tokio::time::interval(WATCHDOG_TICK);
    let mut last_control = Instant::now();
    let mut timed_out = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(limit) = state.watchdog_timeout() else { continue };
                if timed_out || !state.moving() || last_control.elapsed() < limit {
                    continue;
                }
                timed_out = true;
                state.stop_motion();
                tracing::warn!(
                    limit_ms = limit.as_millis() as u64,
                    "simulator: control watchdog expired"
                );
                let frame = protocol::encode_event(EventCode::Timeout.into());
                if socket.send(Message::Binary(frame.to_vec())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let replies = match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        if is_control_frame(&bytes) {
                            last_control = Instant::now();
                            timed_out = false;
                        }
                        state.handle_binary(&bytes)
                    }
                    Some(Ok(Message::Text(text))) => {
                        last_control = Instant::now();
                        timed_out = false;
                        state.handle_text(&text)
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "simulator: socket error");
                        break;
                    }
                };
                for reply in replies {
                    let msg = match reply {
                        Reply::Binary(bytes) => Message::Binary(bytes),
                        Reply::Text(text) => Message::Text(text),
                    };
                    if socket.send(msg).await.is_err() {
                        tracing::info!("simulator: console disconnected");
                        return;
                    }
                }
            }
        }
    }
    tracing::info!("simulator: console disconnected");
}

fn is_control_frame(bytes: &[u8]) -> bool {
    matches!(
        protocol::decode(bytes),
        Ok(Frame::Value(v)) if matches!(
            v.kind(),
            Some(ValueCode::Speed | ValueCode::Steering | ValueCode::TopServo)
        )
    )
}

async fn status_json(State(state): State<Arc<DeviceState>>) -> impl IntoResponse {
    Json(state.status_report())
}

async fn wifi_status_json() -> impl IntoResponse {
    Json(WifiStatus {
        connected: Some(true),
        ip: Some("127.0.0.1".to_string()),
    })
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}
