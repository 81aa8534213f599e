//! Connection lifecycle for the control channel.
//!
//! `ControlChannel` holds no socket. Transport signals are fed in through
//! [`ControlChannel::handle`] and the socket work it wants done is queued as
//! [`ChannelCommand`]s for the driver to pick up with
//! [`ControlChannel::poll_command`].

use crate::handlers::HandlerRegistry;
use crate::notify::{Category, NotificationQueue};
use crate::protocol::{self, Frame, ProtocolError};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::time::{Duration, Instant};

pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 10_000;

const CONNECTING_NOTICE_MS: u64 = 5000;
const OPEN_NOTICE_MS: u64 = 3000;
const ERROR_NOTICE_MS: u64 = 5000;
const CLOSED_NOTICE_MS: u64 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    /// Torn down; no further reconnects.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Message(Inbound),
    Error(String),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Open { url: String },
    Write(Outbound),
    Close,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_received: u64,
    pub decode_errors: u64,
    pub connect_attempts: u64,
}

pub struct ControlChannel {
    url: String,
    reconnect_delay: Duration,
    state: ConnectionState,
    reconnect_at: Option<Instant>,
    outbox: VecDeque<ChannelCommand>,
    stats: ChannelStats,
}

impl ControlChannel {
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        Self {
            url: url.into(),
            reconnect_delay,
            state: ConnectionState::Disconnected,
            reconnect_at: None,
            outbox: VecDeque::new(),
            stats: ChannelStats::default(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn stats(&self) -> ChannelStats {
        self.stats
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn poll_command(&mut self) -> Option<ChannelCommand> {
        self.outbox.pop_front()
    }

    pub fn connect(&mut self, now: Instant, notices: &mut NotificationQueue) {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                tracing::warn!(state = ?self.state, "control channel already connected");
            }
            ConnectionState::Closed => {
                tracing::warn!("control channel torn down; connect ignored");
            }
            ConnectionState::Disconnected => {
                self.reconnect_at = None;
                self.state = ConnectionState::Connecting;
                self.stats.connect_attempts += 1;
                tracing::info!(
                    url = %self.url,
                    attempt = self.stats.connect_attempts,
                    "opening control channel"
                );
                notices.enqueue(
                    now,
                    Category::Info,
                    "Setting up WebSocket connection...",
                    Some(Duration::from_millis(CONNECTING_NOTICE_MS)),
                );
                self.outbox.push_back(ChannelCommand::Open {
                    url: self.url.clone(),
                });
            }
        }
    }

    /// Feed one transport signal into the state machine.
    pub fn handle(
        &mut self,
        now: Instant,
        event: TransportEvent,
        notices: &mut NotificationQueue,
        handlers: &mut HandlerRegistry,
    ) {
        match event {
            TransportEvent::Opened => self.on_open(now, notices),
            TransportEvent::Error(detail) => self.on_error(now, detail, notices),
            TransportEvent::Closed => self.on_close(now, notices),
            TransportEvent::Message(inbound) => self.on_message(inbound, handlers),
        }
    }

    /// Fire the reconnect timer if it is due.
    pub fn on_timer(&mut self, now: Instant, notices: &mut NotificationQueue) {
        match self.reconnect_at {
            Some(at) if at <= now => {
                self.reconnect_at = None;
                tracing::info!("reconnect delay elapsed");
                self.connect(now, notices);
            }
            _ => {}
        }
    }

    /// Stop retrying and release the connection. Terminal.
    pub fn shutdown(&mut self) {
        self.reconnect_at = None;
        if matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        ) {
            self.outbox.push_back(ChannelCommand::Close);
        }
        if self.state != ConnectionState::Closed {
            tracing::info!(state = ?self.state, "control channel shut down");
        }
        self.state = ConnectionState::Closed;
    }

    pub fn send_frame(&mut self, frame: Frame) -> bool {
        self.write(Outbound::Binary(frame.encode()))
    }

    pub fn send_event(&mut self, code: impl Into<u8>) -> bool {
        self.send_frame(Frame::event(code))
    }

    /// Fails only when `value` does not fit the wire format. A closed channel
    /// drops the frame and returns `Ok(false)`.
    pub fn send_value(&mut self, code: impl Into<u8>, value: i64) -> Result<bool, ProtocolError> {
        let bytes = protocol::encode_value(code.into(), value)?;
        Ok(self.write(Outbound::Binary(bytes.to_vec())))
    }

    pub fn send_text(&mut self, text: impl Into<String>) -> bool {
        self.write(Outbound::Text(text.into()))
    }

    pub fn send_json<T: Serialize>(&mut self, payload: &T) -> Result<bool, serde_json::Error> {
        let text = serde_json::to_string(payload)?;
        Ok(self.send_text(text))
    }

    fn write(&mut self, message: Outbound) -> bool {
        if self.state != ConnectionState::Open {
            self.stats.frames_dropped += 1;
            tracing::debug!(
                state = ?self.state,
                message = ?message,
                "control channel not open, message not sent"
            );
            return false;
        }
        self.stats.frames_sent += 1;
        self.outbox.push_back(ChannelCommand::Write(message));
        true
    }

    fn on_open(&mut self, now: Instant, notices: &mut NotificationQueue) {
        match self.state {
            ConnectionState::Connecting => {
                self.state = ConnectionState::Open;
                tracing::info!(url = %self.url, "control channel connected");
                notices.enqueue(
                    now,
                    Category::Info,
                    "WebSocket connected",
                    Some(Duration::from_millis(OPEN_NOTICE_MS)),
                );
            }
            ConnectionState::Closed => {
                tracing::debug!("transport opened after shutdown; closing it");
                self.outbox.push_back(ChannelCommand::Close);
            }
            state => {
                tracing::warn!(state = ?state, "unexpected transport open signal ignored");
            }
        }
    }

    fn on_error(&mut self, now: Instant, detail: String, notices: &mut NotificationQueue) {
        if self.state == ConnectionState::Closed {
            tracing::debug!(error = %detail, "transport error after shutdown");
            return;
        }
        tracing::error!(state = ?self.state, error = %detail, "control channel transport error");
        notices.enqueue(
            now,
            Category::Error,
            format!("WebSocket error: {detail}"),
            Some(Duration::from_millis(ERROR_NOTICE_MS)),
        );
    }

    fn on_close(&mut self, now: Instant, notices: &mut NotificationQueue) {
        match self.state {
            ConnectionState::Open | ConnectionState::Connecting => {
                self.state = ConnectionState::Disconnected;
                let at = now + self.reconnect_delay;
                self.reconnect_at = Some(at);
                tracing::warn!(
                    retry_in_ms = self.reconnect_delay.as_millis() as u64,
                    "control channel closed"
                );
                notices.enqueue(
                    now,
                    Category::Warn,
                    "WebSocket closed",
                    Some(Duration::from_millis(CLOSED_NOTICE_MS)),
                );
            }
            ConnectionState::Closed => tracing::debug!("transport closed after shutdown"),
            ConnectionState::Disconnected => {
                tracing::debug!("duplicate transport close ignored");
            }
        }
    }

    fn on_message(&mut self, inbound: Inbound, handlers: &mut HandlerRegistry) {
        self.stats.frames_received += 1;
        match inbound {
            Inbound::Text(text) => handlers.dispatch_text(&text),
            Inbound::Binary(bytes) => match protocol::decode(&bytes) {
                Ok(Frame::Event(ev)) => handlers.dispatch_event(ev),
                Ok(Frame::Value(v)) => handlers.dispatch_value(v),
                Err(err) => {
                    self.stats.decode_errors += 1;
                    tracing::warn!(error = %err, bytes = ?bytes, "dropping undecodable frame");
                }
            },
        }
    }
}
