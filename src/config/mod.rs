use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "ROVER_";
const APP_DIR: &str = "rover-console";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub channel: ChannelConfig,
    pub notifications: NotificationConfig,
    pub status: StatusConfig,
    pub simulator: SimulatorConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Host (and optional port) of the vehicle controller.
    pub host: String,
    pub ws_path: String,
    pub use_tls: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".to_string(),
            ws_path: "/ws".to_string(),
            use_tls: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub reconnect_delay_ms: u64,
    pub connect_on_start: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: crate::channel::DEFAULT_RECONNECT_DELAY_MS,
            connect_on_start: true,
        }
    }
}

/// Where console notifications go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    /// One printed line per notification.
    Lines,
    /// A single terminal line rewritten in place.
    StatusLine,
    /// Not displayed; the queue still runs.
    Off,
}

impl SurfaceKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "lines" => Some(Self::Lines),
            "status_line" | "status-line" => Some(Self::StatusLine),
            "off" | "none" | "quiet" => Some(Self::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub surface: SurfaceKind,
    pub default_duration_ms: u64,
    pub fast_duration_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            surface: SurfaceKind::Lines,
            default_duration_ms: crate::notify::DEFAULT_DISPLAY_MS,
            fast_duration_ms: crate::notify::FAST_DISPLAY_MS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub status_path: String,
    pub wifi_path: String,
    pub request_timeout_ms: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 5000,
            status_path: "/status.json".to_string(),
            wifi_path: "/wifi-status.json".to_string(),
            request_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub bind_host: String,
    pub port: u16,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ChannelConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl NotificationConfig {
    pub fn timings(&self) -> crate::notify::NotificationTimings {
        crate::notify::NotificationTimings {
            default_duration: Duration::from_millis(self.default_duration_ms),
            fast_duration: Duration::from_millis(self.fast_duration_ms),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)
                .map_err(|e| format!("{}: {e}", config_path.display()))?;
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Device
        if let Ok(val) = env::var(format!("{}DEVICE_HOST", ENV_PREFIX)) {
            self.device.host = val;
        }
        if let Ok(val) = env::var(format!("{}DEVICE_WS_PATH", ENV_PREFIX)) {
            self.device.ws_path = val;
        }
        if let Ok(val) = env::var(format!("{}DEVICE_USE_TLS", ENV_PREFIX)) {
            self.device.use_tls = val.parse().unwrap_or(false);
        }

        // Channel
        if let Ok(val) = env::var(format!("{}RECONNECT_DELAY_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.channel.reconnect_delay_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}CONNECT_ON_START", ENV_PREFIX)) {
            self.channel.connect_on_start = val.parse().unwrap_or(true);
        }

        // Notifications
        if let Ok(val) = env::var(format!("{}NOTIFY_SURFACE", ENV_PREFIX)) {
            if let Some(kind) = SurfaceKind::parse(&val) {
                self.notifications.surface = kind;
            }
        }
        if let Ok(val) = env::var(format!("{}NOTIFY_DEFAULT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.notifications.default_duration_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}NOTIFY_FAST_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.notifications.fast_duration_ms = ms;
            }
        }

        // Status polling
        if let Ok(val) = env::var(format!("{}STATUS_ENABLED", ENV_PREFIX)) {
            self.status.enabled = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}STATUS_POLL_INTERVAL_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.status.poll_interval_ms = ms;
            }
        }

        // Simulator
        if let Ok(val) = env::var(format!("{}SIMULATOR_BIND_HOST", ENV_PREFIX)) {
            self.simulator.bind_host = val;
        }
        if let Ok(val) = env::var(format!("{}SIMULATOR_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.simulator.port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.device.host.trim().is_empty() {
            return Err("device.host must be set".into());
        }
        if self.device.ws_path.trim().is_empty() {
            return Err("device.ws_path must be set".into());
        }
        if self.channel.reconnect_delay_ms == 0 {
            return Err("channel.reconnect_delay_ms must be > 0".into());
        }
        if self.notifications.default_duration_ms == 0
            || self.notifications.fast_duration_ms == 0
        {
            return Err("notification durations must be > 0".into());
        }
        if self.status.enabled {
            if self.status.poll_interval_ms < 250 {
                return Err("status.poll_interval_ms must be >= 250".into());
            }
            if self.status.request_timeout_ms == 0 {
                return Err("status.request_timeout_ms must be > 0".into());
            }
        }
        if self.simulator.port == 0 {
            return Err("simulator.port must be non-zero".into());
        }
        Ok(())
    }

    pub fn control_url(&self) -> String {
        crate::transport::control_url(&self.device.host, &self.device.ws_path, self.device.use_tls)
    }

    /// `http(s)://host` for the JSON status endpoints.
    pub fn device_base_url(&self) -> String {
        let scheme = if self.device.use_tls { "https" } else { "http" };
        let host = self
            .device
            .host
            .trim()
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_start_matches("ws://")
            .trim_start_matches("wss://")
            .trim_end_matches('/');
        format!("{scheme}://{host}")
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{} already exists", path.as_ref().display()).into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".config").join(APP_DIR).join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.channel.reconnect_delay_ms, 10_000);
        assert_eq!(parsed.notifications.default_duration_ms, 2000);
        assert_eq!(parsed.notifications.fast_duration_ms, 1000);
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [device]
            host = "rover.local"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.device.host, "rover.local");
        assert_eq!(cfg.device.ws_path, "/ws");
        assert!(cfg.channel.connect_on_start);
        assert_eq!(cfg.control_url(), "ws://rover.local/ws");
        assert_eq!(cfg.device_base_url(), "http://rover.local");
    }

    #[test]
    fn notification_surface_can_be_switched_off() {
        let cfg: Config = toml::from_str(
            r#"
            [notifications]
            surface = "off"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.notifications.surface, SurfaceKind::Off);
        assert_eq!(Config::default().notifications.surface, SurfaceKind::Lines);
        assert_eq!(SurfaceKind::parse("status-line"), Some(SurfaceKind::StatusLine));
        assert_eq!(SurfaceKind::parse("quiet"), Some(SurfaceKind::Off));
        assert_eq!(SurfaceKind::parse("loud"), None);
    }

    #[test]
    fn validate_rejects_zero_durations() {
        let mut cfg = Config::default();
        cfg.channel.reconnect_delay_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.notifications.fast_duration_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_checks_status_only_when_enabled() {
        let mut cfg = Config::default();
        cfg.status.poll_interval_ms = 10;
        assert!(cfg.validate().is_err());
        cfg.status.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_blank_host_and_zero_port() {
        let mut cfg = Config::default();
        cfg.device.host = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.simulator.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tls_switches_both_schemes() {
        let mut cfg = Config::default();
        cfg.device.host = "https://rover.example/".to_string();
        cfg.device.use_tls = true;
        assert_eq!(cfg.control_url(), "wss://rover.example/ws");
        assert_eq!(cfg.device_base_url(), "https://rover.example");
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = std::env::temp_dir().join(format!("rover-console-cfg-{}", std::process::id()));
        let path = dir.join("config.toml");
        let _ = fs::remove_file(&path);
        Config::write_default(&path).unwrap();
        assert!(Config::write_default(&path).is_err());
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("[device]"));
        let _ = fs::remove_dir_all(&dir);
    }
}
