//! Owns the control channel, notification queue and handler registry and
//! drives them from one task.
//!
//! The socket runs in its own task and reports back over an mpsc channel.
//! Each connection attempt gets an id so that events from a link that was
//! already replaced are dropped.

use crate::channel::{
    ChannelCommand, ChannelStats, ConnectionState, ControlChannel, TransportEvent,
};
use crate::config::Config;
use crate::handlers::{HandlerCounts, HandlerRegistry};
use crate::notify::{Category, Notification, NotificationQueue, NotificationSurface};
use crate::protocol::{self, ProtocolError};
use crate::transport::{self, WsWriter};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug)]
pub enum SessionCommand {
    Connect,
    SendEvent(u8),
    SendValue { code: u8, value: i64 },
    SendText(String),
    SendJson(serde_json::Value),
    Notify {
        category: Category,
        text: String,
        duration: Option<Duration>,
    },
    ClearNotifications,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub url: String,
    pub state: ConnectionState,
    pub stats: ChannelStats,
    pub notification: Option<Notification>,
    pub pending_notifications: usize,
    pub handlers: HandlerCounts,
}

pub struct Session {
    channel: ControlChannel,
    notices: NotificationQueue,
    handlers: HandlerRegistry,
}

impl Session {
    pub fn new(
        channel: ControlChannel,
        notices: NotificationQueue,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            channel,
            notices,
            handlers,
        }
    }

    pub fn from_config(
        config: &Config,
        surface: Box<dyn NotificationSurface>,
        handlers: HandlerRegistry,
    ) -> Self {
        let channel = ControlChannel::new(config.control_url(), config.channel.reconnect_delay());
        let notices = NotificationQueue::new(surface, config.notifications.timings());
        Self::new(channel, notices, handlers)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            url: self.channel.url().to_string(),
            state: self.channel.state(),
            stats: self.channel.stats(),
            notification: self.notices.active().cloned(),
            pending_notifications: self.notices.pending_len(),
            handlers: self.handlers.counts(),
        }
    }

    /// Earliest of the reconnect and notification deadlines.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.channel.next_deadline(), self.notices.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now: Instant) {
        self.notices.on_timer(now);
        self.channel.on_timer(now, &mut self.notices);
    }

    pub fn shutdown(&mut self) {
        self.channel.shutdown();
    }

    fn handle_transport(&mut self, now: Instant, event: TransportEvent) {
        self.channel
            .handle(now, event, &mut self.notices, &mut self.handlers);
    }

    /// Returns false once the session should stop.
    fn apply(&mut self, now: Instant, command: SessionCommand) -> bool {
        match command {
            SessionCommand::Connect => self.channel.connect(now, &mut self.notices),
            SessionCommand::SendEvent(code) => {
                self.channel.send_event(code);
            }
            SessionCommand::SendValue { code, value } => {
                if let Err(err) = self.channel.send_value(code, value) {
                    tracing::warn!(code, value, error = %err, "value not sent");
                }
            }
            SessionCommand::SendText(text) => {
                self.channel.send_text(text);
            }
            SessionCommand::SendJson(payload) => {
                if let Err(err) = self.channel.send_json(&payload) {
                    tracing::warn!(error = %err, "json payload not sent");
                }
            }
            SessionCommand::Notify {
                category,
                text,
                duration,
            } => self.notices.enqueue(now, category, text, duration),
            SessionCommand::ClearNotifications => self.notices.clear(now),
            SessionCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            SessionCommand::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }
}

/// Cloneable front door to a running session. Methods return false once the
/// session task has exited.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    fn submit(&self, command: SessionCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn connect(&self) -> bool {
        self.submit(SessionCommand::Connect)
    }

    pub fn send_event(&self, code: impl Into<u8>) -> bool {
        self.submit(SessionCommand::SendEvent(code.into()))
    }

    /// Range is checked here so the caller sees the error.
    pub fn send_value(&self, code: impl Into<u8>, value: i64) -> Result<bool, ProtocolError> {
        let code = code.into();
        protocol::encode_value(code, value)?;
        Ok(self.submit(SessionCommand::SendValue { code, value }))
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.submit(SessionCommand::SendText(text.into()))
    }

    pub fn send_json<T: Serialize>(&self, payload: &T) -> Result<bool, serde_json::Error> {
        let value = serde_json::to_value(payload)?;
        Ok(self.submit(SessionCommand::SendJson(value)))
    }

    pub fn notify(
        &self,
        category: Category,
        text: impl Into<String>,
        duration: Option<Duration>,
    ) -> bool {
        self.submit(SessionCommand::Notify {
            category,
            text: text.into(),
            duration,
        })
    }

    pub fn clear_notifications(&self) -> bool {
        self.submit(SessionCommand::ClearNotifications)
    }

    pub async fn snapshot(&self) -> Option<SessionSnapshot> {
        let (tx, rx) = oneshot::channel();
        if !self.submit(SessionCommand::Snapshot(tx)) {
            return None;
        }
        rx.await.ok()
    }

    pub fn shutdown(&self) -> bool {
        self.submit(SessionCommand::Shutdown)
    }
}

pub fn spawn(session: Session) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(session, rx));
    (SessionHandle { tx }, task)
}

enum LinkEvent {
    Connected { id: u64, writer: WsWriter },
    Transport { id: u64, event: TransportEvent },
}

struct Link {
    id: u64,
    writer: Option<WsWriter>,
    task: JoinHandle<()>,
}

impl Link {
    fn abort(self) {
        self.task.abort();
    }
}

async fn run(mut session: Session, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
    let (link_tx, mut link_rx) = mpsc::unbounded_channel::<LinkEvent>();
    let mut link: Option<Link> = None;
    let mut next_link_id: u64 = 0;
    let mut running = true;

    loop {
        while let Some(cmd) = session.channel.poll_command() {
            match cmd {
                ChannelCommand::Open { url } => {
                    if let Some(old) = link.take() {
                        old.abort();
                    }
                    next_link_id += 1;
                    let id = next_link_id;
                    let task = tokio::spawn(drive_link(id, url, link_tx.clone()));
                    link = Some(Link {
                        id,
                        writer: None,
                        task,
                    });
                }
                ChannelCommand::Write(message) => {
                    let result = match link.as_mut().and_then(|l| l.writer.as_mut()) {
                        Some(writer) => writer.send(message).await.map_err(|e| e.to_string()),
                        None => Err("no transport attached".to_string()),
                    };
                    if let Err(detail) = result {
                        session.handle_transport(Instant::now(), TransportEvent::Error(detail));
                    }
                }
                ChannelCommand::Close => {
                    if let Some(mut old) = link.take() {
                        if let Some(writer) = old.writer.as_mut() {
                            if let Err(err) = writer.close().await {
                                tracing::debug!(error = %err, "close frame not sent");
                            }
                        }
                        old.abort();
                    }
                }
            }
        }

        if !running {
            break;
        }

        let deadline = session.next_deadline();
        tokio::select! {
            cmd = commands.recv() => {
                let now = Instant::now();
                match cmd {
                    Some(cmd) => running = session.apply(now, cmd),
                    None => {
                        session.shutdown();
                        running = false;
                    }
                }
            }
            Some(event) = link_rx.recv() => {
                let now = Instant::now();
                match event {
                    LinkEvent::Connected { id, writer } => {
                        if let Some(current) = link.as_mut().filter(|l| l.id == id) {
                            current.writer = Some(writer);
                            session.handle_transport(now, TransportEvent::Opened);
                        } else {
                            tracing::debug!(link = id, "stale link connected; dropping");
                        }
                    }
                    LinkEvent::Transport { id, event } => {
                        if link.as_ref().is_some_and(|l| l.id == id) {
                            if event == TransportEvent::Closed {
                                link = None;
                            }
                            session.handle_transport(now, event);
                        } else {
                            tracing::debug!(link = id, "event from stale link ignored");
                        }
                    }
                }
            }
            _ = sleep_until_opt(deadline), if deadline.is_some() => {
                session.on_timer(Instant::now());
            }
        }
    }

    if let Some(old) = link.take() {
        old.abort();
    }
    tracing::info!("session stopped");
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn drive_link(id: u64, url: String, events: mpsc::UnboundedSender<LinkEvent>) {
    let send = |event: TransportEvent| {
        let _ = events.send(LinkEvent::Transport { id, event });
    };

    let (writer, mut reader) = match transport::connect(&url).await {
        Ok(halves) => halves,
        Err(err) => {
            send(TransportEvent::Error(err.to_string()));
            send(TransportEvent::Closed);
            return;
        }
    };
    if events.send(LinkEvent::Connected { id, writer }).is_err() {
        return;
    }

    while let Some(result) = reader.recv().await {
        match result {
            Ok(inbound) => send(TransportEvent::Message(inbound)),
            Err(err) => {
                send(TransportEvent::Error(err.to_string()));
                break;
            }
        }
    }
    send(TransportEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::RecordingSurface;
    use crate::notify::NotificationTimings;
    use crate::protocol::{EventCode, ValueCode};
    use crate::server::{self, DeviceState};
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    async fn wait_for_state(handle: &SessionHandle, want: ConnectionState) -> SessionSnapshot {
        for _ in 0..200 {
            let snap = handle.snapshot().await.unwrap();
            if snap.state == want {
                return snap;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session never reached {want:?}");
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn session_for(url: String, reconnect_ms: u64, seen: Arc<Mutex<Vec<String>>>) -> Session {
        let mut handlers = HandlerRegistry::new();
        {
            let seen = seen.clone();
            handlers.on_value(move |v| {
                seen.lock()
                    .unwrap()
                    .push(format!("value {} {}", v.code, v.value))
            });
        }
        {
            let seen = seen.clone();
            handlers.on_event(move |ev| {
                seen.lock().unwrap().push(format!("event {}", ev.code))
            });
        }
        handlers.on_text(move |t| seen.lock().unwrap().push(format!("text {t}")));
        Session::new(
            ControlChannel::new(url, Duration::from_millis(reconnect_ms)),
            NotificationQueue::new(
                Box::new(RecordingSurface::default()),
                NotificationTimings::default(),
            ),
            handlers,
        )
    }

    #[tokio::test]
    async fn talks_to_the_simulator() {
        let listener = server::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let device = Arc::new(DeviceState::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(server::start(listener, device.clone(), stop_rx));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handle, task) = spawn(session_for(format!("ws://{addr}/ws"), 10_000, seen.clone()));
        assert!(handle.connect());
        let snap = wait_for_state(&handle, ConnectionState::Open).await;
        assert_eq!(snap.url, format!("ws://{addr}/ws"));
        assert_eq!(snap.handlers.value, 1);
        assert_eq!(snap.handlers.text, 1);

        assert_eq!(handle.send_value(ValueCode::Speed, -100), Ok(true));
        assert!(handle.send_event(EventCode::SaveSettings));
        wait_until(|| seen.lock().unwrap().len() >= 2).await;
        assert_eq!(
            seen.lock().unwrap().clone(),
            vec!["value 1 -100".to_string(), "text settings saved".to_string()]
        );
        assert_eq!(device.value(ValueCode::Speed), Some(-100));

        assert_eq!(
            handle.send_value(ValueCode::Speed, 70_000),
            Err(ProtocolError::ValueOutOfRange(70_000))
        );

        assert!(handle.shutdown());
        task.await.unwrap();
        assert!(!handle.connect());
        assert!(handle.snapshot().await.is_none());

        let _ = stop_tx.send(true);
        let _ = server.await;
    }

    #[tokio::test]
    async fn reconnects_after_peer_drops_the_socket() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(Mutex::new(0u32));
        let counter = accepted.clone();
        let server = tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else { return };
                *counter.lock().unwrap() += 1;
                if let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await {
                    let _ = ws.close(None).await;
                }
            }
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (handle, task) = spawn(session_for(format!("ws://{addr}/ws"), 50, seen));
        handle.connect();
        wait_until(|| *accepted.lock().unwrap() >= 3).await;

        let snap = handle.snapshot().await.unwrap();
        assert!(snap.stats.connect_attempts >= 3);

        handle.shutdown();
        task.await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn refused_connection_surfaces_error_then_retries() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let (handle, task) = spawn(session_for(
            format!("ws://{addr}/ws"),
            60_000,
            Arc::new(Mutex::new(Vec::new())),
        ));
        handle.connect();
        let snap = wait_for_state(&handle, ConnectionState::Disconnected).await;
        assert_eq!(snap.stats.connect_attempts, 1);
        assert_eq!(snap.stats.frames_received, 0);

        // The error arrives within the connect notice's first second, so it
        // waits behind that notice until the one-second mark.
        let active = snap.notification.clone().unwrap();
        assert_eq!(active.category, Category::Info);
        assert_eq!(active.text, "Setting up WebSocket connection...");
        assert!(snap.pending_notifications >= 1);

        assert!(handle.send_event(EventCode::Estop));
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.stats.frames_dropped, 1);

        let mut shown = None;
        for _ in 0..300 {
            let snap = handle.snapshot().await.unwrap();
            if let Some(n) = snap.notification.filter(|n| n.category == Category::Error) {
                shown = Some(n);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let shown = shown.expect("error notice never displayed");
        assert!(shown.text.starts_with("WebSocket error: "));

        handle.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_expire_on_their_own() {
        let (handle, task) = spawn(session_for(
            "ws://127.0.0.1:9/ws".to_string(),
            10_000,
            Arc::new(Mutex::new(Vec::new())),
        ));
        handle.notify(Category::Info, "hello", Some(Duration::from_millis(3000)));
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.notification.unwrap().text, "hello");

        tokio::time::sleep(Duration::from_millis(3001)).await;
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.notification.is_none());

        handle.notify(Category::Warn, "one", None);
        handle.notify(Category::Warn, "two", None);
        handle.clear_notifications();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.notification.unwrap().text, "two");
        assert_eq!(snap.pending_notifications, 0);

        handle.shutdown();
        task.await.unwrap();
    }
}
