use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::{fmt, str::FromStr};
use tokio::time::{Duration, Instant};

pub const DEFAULT_DISPLAY_MS: u64 = 2000;
pub const FAST_DISPLAY_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Info,
    Warn,
    Error,
}

impl Category {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown notification category: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub category: Category,
    pub text: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationTimings {
    pub default_duration: Duration,
    /// Upper bound on how long a newly queued entry waits behind the active one.
    pub fast_duration: Duration,
}

impl Default for NotificationTimings {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_millis(DEFAULT_DISPLAY_MS),
            fast_duration: Duration::from_millis(FAST_DISPLAY_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentationError {
    SurfaceUnavailable,
    Io(String),
}

impl fmt::Display for PresentationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SurfaceUnavailable => write!(f, "notification surface unavailable"),
            Self::Io(err) => write!(f, "notification surface write failed: {err}"),
        }
    }
}

impl std::error::Error for PresentationError {}

/// Where notifications are rendered.
pub trait NotificationSurface: Send {
    fn show(&mut self, notification: &Notification) -> Result<(), PresentationError>;
    fn blank(&mut self) -> Result<(), PresentationError>;
}

/// Renders notifications as a status line on a terminal stream.
///
/// With `status_line` enabled the line is rewritten in place and erased on
/// dismissal; otherwise each notification is printed on its own line.
pub struct TerminalSurface<W: Write + Send> {
    out: W,
    status_line: bool,
}

impl<W: Write + Send> TerminalSurface<W> {
    pub fn new(out: W, status_line: bool) -> Self {
        Self { out, status_line }
    }
}

impl TerminalSurface<std::io::Stdout> {
    pub fn stdout(status_line: bool) -> Self {
        Self::new(std::io::stdout(), status_line)
    }
}

impl<W: Write + Send> NotificationSurface for TerminalSurface<W> {
    fn show(&mut self, notification: &Notification) -> Result<(), PresentationError> {
        let line = format!("[{}] {}", notification.category, notification.text);
        let res = if self.status_line {
            write!(self.out, "\r\x1b[2K{line}").and_then(|_| self.out.flush())
        } else {
            writeln!(self.out, "{line}").and_then(|_| self.out.flush())
        };
        res.map_err(|err| PresentationError::Io(err.to_string()))
    }

    fn blank(&mut self) -> Result<(), PresentationError> {
        if !self.status_line {
            return Ok(());
        }
        write!(self.out, "\r\x1b[2K")
            .and_then(|_| self.out.flush())
            .map_err(|err| PresentationError::Io(err.to_string()))
    }
}

/// A surface that is never available; every call fails.
pub struct DetachedSurface;

impl NotificationSurface for DetachedSurface {
    fn show(&mut self, _notification: &Notification) -> Result<(), PresentationError> {
        Err(PresentationError::SurfaceUnavailable)
    }

    fn blank(&mut self) -> Result<(), PresentationError> {
        Err(PresentationError::SurfaceUnavailable)
    }
}

#[derive(Debug, Clone)]
struct ActiveEntry {
    notification: Notification,
    started_at: Instant,
    deadline: Instant,
}

/// FIFO of transient notifications with at most one entry on display.
///
/// Time is passed in by the caller; the owner is expected to call
/// [`NotificationQueue::on_timer`] once [`NotificationQueue::next_deadline`] passes.
pub struct NotificationQueue {
    surface: Box<dyn NotificationSurface>,
    timings: NotificationTimings,
    pending: VecDeque<Notification>,
    active: Option<ActiveEntry>,
}

impl NotificationQueue {
    pub fn new(surface: Box<dyn NotificationSurface>, timings: NotificationTimings) -> Self {
        Self {
            surface,
            timings,
            pending: VecDeque::new(),
            active: None,
        }
    }

    pub fn enqueue(
        &mut self,
        now: Instant,
        category: Category,
        text: impl Into<String>,
        duration: Option<Duration>,
    ) {
        let notification = Notification {
            category,
            text: text.into(),
            duration: duration.unwrap_or(self.timings.default_duration),
        };
        tracing::debug!(
            category = %notification.category,
            text = %notification.text,
            "notification queued"
        );
        self.pending.push_back(notification);

        let fast = self.timings.fast_duration;
        let elapsed = match self.active.as_ref() {
            None => {
                self.drain(now);
                return;
            }
            Some(active) => now.saturating_duration_since(active.started_at),
        };

        if elapsed < fast {
            // The active entry ends exactly `fast` after it started, whatever
            // its own duration was.
            if let Some(active) = self.active.as_mut() {
                active.deadline = active.started_at + fast;
            }
        } else {
            self.dismiss();
            self.drain(now);
        }
    }

    /// Blank the display, drop the active entry and present the next pending one.
    pub fn clear(&mut self, now: Instant) {
        self.dismiss();
        self.drain(now);
    }

    /// Dismiss the active entry if its display time is over.
    pub fn on_timer(&mut self, now: Instant) {
        while let Some(deadline) = self.next_deadline() {
            if deadline > now {
                break;
            }
            self.dismiss();
            self.drain(now);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.active.as_ref().map(|a| a.deadline)
    }

    pub fn active(&self) -> Option<&Notification> {
        self.active.as_ref().map(|a| &a.notification)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.pending.is_empty()
    }

    fn dismiss(&mut self) {
        self.active = None;
        match self.surface.blank() {
            Ok(()) => {}
            Err(PresentationError::SurfaceUnavailable) => {
                tracing::debug!("no notification surface to blank");
            }
            Err(err) => tracing::warn!(error = %err, "failed to blank notification surface"),
        }
    }

    fn drain(&mut self, now: Instant) {
        if self.active.is_some() {
            return;
        }
        let Some(notification) = self.pending.pop_front() else {
            return;
        };
        let show_for = if self.pending.is_empty() {
            notification.duration
        } else {
            self.timings.fast_duration
        };
        match self.surface.show(&notification) {
            Ok(()) => {}
            Err(PresentationError::SurfaceUnavailable) => tracing::debug!(
                category = %notification.category,
                text = %notification.text,
                "notification not displayed: no surface"
            ),
            Err(err) => tracing::warn!(
                error = %err,
                category = %notification.category,
                text = %notification.text,
                "failed to display notification"
            ),
        }
        self.active = Some(ActiveEntry {
            notification,
            started_at: now,
            deadline: now + show_for,
        });
    }
}
