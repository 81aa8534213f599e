use crate::channel::ConnectionState;
use crate::config::{Config, SurfaceKind};
use crate::handlers::HandlerRegistry;
use crate::notify::{Category, DetachedSurface, NotificationSurface, TerminalSurface};
use crate::protocol::{EventCode, ValueCode};
use crate::server::{self, DeviceState};
use crate::session::{self, Session, SessionHandle};
use crate::status::{self, StatusClient, StatusFooter};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::Duration;

const ONE_SHOT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const HELP: &str = "\
commands:
  estop | timeout | save | revert
  event <name>
  set <value-name> <n>
  drive <speed> <steering>
  text <payload>
  json <object>
  notify <info|warn|error> <text>
  connect | clear | status | help | quit";

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let mut args = std::env::args().skip(1);
    if let Some(command) = args.next() {
        return match command.as_str() {
            "config-init" => handle_config_init(),
            "simulate" => handle_simulate(&config).await,
            "send-event" => {
                let name = args.next().ok_or("usage: send-event <name>")?;
                let code: EventCode = name.parse()?;
                handle_one_shot(&config, |h| Ok(h.send_event(code))).await
            }
            "send-value" => {
                let name = args.next().ok_or("usage: send-value <name> <value>")?;
                let raw = args.next().ok_or("usage: send-value <name> <value>")?;
                let code: ValueCode = name.parse()?;
                let value: i64 = raw.parse().map_err(|_| format!("not a number: {raw}"))?;
                handle_one_shot(&config, |h| Ok(h.send_value(code, value)?)).await
            }
            other => Err(format!("unknown command: {other}").into()),
        };
    }

    run_console(config).await
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Event(EventCode),
    SetValue { code: ValueCode, value: i64 },
    Drive { speed: i64, steering: i64 },
    Text(String),
    Json(serde_json::Value),
    Notify { category: Category, text: String },
    Connect,
    Clear,
    Status,
    Help,
    Quit,
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_console_line(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let cmd = match word.to_ascii_lowercase().as_str() {
        "estop" => ConsoleCommand::Event(EventCode::Estop),
        "timeout" => ConsoleCommand::Event(EventCode::Timeout),
        "save" => ConsoleCommand::Event(EventCode::SaveSettings),
        "revert" => ConsoleCommand::Event(EventCode::RevertSettings),
        "event" => {
            let code = rest.parse::<EventCode>().map_err(|e| e.to_string())?;
            ConsoleCommand::Event(code)
        }
        "set" => {
            let mut parts = rest.split_whitespace();
            let (Some(name), Some(raw), None) = (parts.next(), parts.next(), parts.next()) else {
                return Err("usage: set <value-name> <n>".to_string());
            };
            let code = name.parse::<ValueCode>().map_err(|e| e.to_string())?;
            ConsoleCommand::SetValue {
                code,
                value: parse_number(raw)?,
            }
        }
        "drive" => {
            let mut parts = rest.split_whitespace();
            let (Some(speed), Some(steering), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err("usage: drive <speed> <steering>".to_string());
            };
            ConsoleCommand::Drive {
                speed: parse_number(speed)?,
                steering: parse_number(steering)?,
            }
        }
        "text" => {
            if rest.is_empty() {
                return Err("usage: text <payload>".to_string());
            }
            ConsoleCommand::Text(rest.to_string())
        }
        "json" => {
            let value: serde_json::Value =
                serde_json::from_str(rest).map_err(|e| format!("invalid json: {e}"))?;
            if !value.is_object() {
                return Err("json payload must be an object".to_string());
            }
            ConsoleCommand::Json(value)
        }
        "notify" => {
            let (cat, text) = rest
                .split_once(char::is_whitespace)
                .ok_or("usage: notify <category> <text>")?;
            ConsoleCommand::Notify {
                category: cat.parse()?,
                text: text.trim().to_string(),
            }
        }
        "connect" => ConsoleCommand::Connect,
        "clear" => ConsoleCommand::Clear,
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command: {other} (try `help`)")),
    };
    Ok(Some(cmd))
}

fn parse_number(raw: &str) -> Result<i64, String> {
    raw.parse().map_err(|_| format!("not a number: {raw}"))
}

fn notification_surface(kind: SurfaceKind) -> Box<dyn NotificationSurface> {
    match kind {
        SurfaceKind::Lines => Box::new(TerminalSurface::stdout(false)),
        SurfaceKind::StatusLine => Box::new(TerminalSurface::stdout(true)),
        SurfaceKind::Off => Box::new(DetachedSurface),
    }
}

fn printing_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.on_event(|ev| match ev.kind() {
        Some(code) => println!("<- event {code}"),
        None => println!("<- event #{}", ev.code),
    });
    handlers.on_value(|v| match v.kind() {
        Some(code) => println!("<- {code} = {}", v.value),
        None => println!("<- value #{} = {}", v.code, v.value),
    });
    handlers.on_text(|t| println!("<- text {t}"));
    handlers
}

async fn run_console(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let session = Session::from_config(
        &config,
        notification_surface(config.notifications.surface),
        printing_handlers(),
    );
    let (handle, mut session_task) = session::spawn(session);
    tracing::info!(url = %config.control_url(), "rover console started");

    if config.channel.connect_on_start {
        handle.connect();
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (latest_tx, latest_rx) = watch::channel(None);
    let poller = if config.status.enabled {
        let client = StatusClient::from_config(&config)?;
        Some(tokio::spawn(status::run_poller(
            client,
            Duration::from_millis(config.status.poll_interval_ms),
            handle.clone(),
            latest_tx,
            shutdown_rx,
        )))
    } else {
        None
    };

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("stdin closed");
                    break;
                };
                match parse_console_line(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(cmd)) => execute(&handle, cmd, &latest_rx).await,
                    Ok(None) => {}
                    Err(err) => println!("error: {err}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown: ctrl-c");
                break;
            }
            _ = &mut session_task => {
                tracing::warn!("session task ended unexpectedly");
                let _ = shutdown_tx.send(true);
                return Err("session stopped".into());
            }
        }
    }

    let _ = shutdown_tx.send(true);
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    handle.shutdown();
    let _ = session_task.await;
    Ok(())
}

async fn execute(
    handle: &SessionHandle,
    cmd: ConsoleCommand,
    latest: &watch::Receiver<Option<status::DeviceStatus>>,
) {
    match cmd {
        ConsoleCommand::Event(code) => {
            handle.send_event(code);
        }
        ConsoleCommand::SetValue { code, value } => {
            if let Err(err) = handle.send_value(code, value) {
                println!("error: {err}");
            }
        }
        ConsoleCommand::Drive { speed, steering } => {
            for (code, value) in [(ValueCode::Speed, speed), (ValueCode::Steering, steering)] {
                if let Err(err) = handle.send_value(code, value) {
                    println!("error: {code}: {err}");
                }
            }
        }
        ConsoleCommand::Text(text) => {
            handle.send_text(text);
        }
        ConsoleCommand::Json(value) => {
            if let Err(err) = handle.send_json(&value) {
                println!("error: {err}");
            }
        }
        ConsoleCommand::Notify { category, text } => {
            handle.notify(category, text, None);
        }
        ConsoleCommand::Connect => {
            handle.connect();
        }
        ConsoleCommand::Clear => {
            handle.clear_notifications();
        }
        ConsoleCommand::Status => {
            if let Some(snapshot) = handle.snapshot().await {
                match serde_json::to_string_pretty(&snapshot) {
                    Ok(json) => println!("{json}"),
                    Err(err) => println!("error: {err}"),
                }
            }
            if let Some(device) = latest.borrow().as_ref() {
                let taken_at = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                println!("{}", StatusFooter { status: device, taken_at }.render());
            }
        }
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Quit => {}
    }
}

async fn handle_one_shot<F>(config: &Config, send: F) -> Result<(), Box<dyn std::error::Error>>
where
    F: FnOnce(&SessionHandle) -> Result<bool, Box<dyn std::error::Error>>,
{
    let session = Session::from_config(
        config,
        notification_surface(config.notifications.surface),
        printing_handlers(),
    );
    let (handle, task) = session::spawn(session);
    handle.connect();

    let opened = tokio::time::timeout(ONE_SHOT_CONNECT_TIMEOUT, async {
        loop {
            match handle.snapshot().await {
                Some(snap) if snap.state == ConnectionState::Open => return true,
                Some(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                None => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    let result = if opened {
        send(&handle).map(|_| ())
    } else {
        let url = match handle.snapshot().await {
            Some(snap) => snap.url,
            None => config.control_url(),
        };
        Err(format!("could not connect to {url}").into())
    };

    handle.shutdown();
    let _ = task.await;
    result
}

async fn handle_simulate(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr =
        format!("{}:{}", config.simulator.bind_host, config.simulator.port).parse()?;
    let listener = server::bind(addr).await?;
    println!("device simulator: ws://{}/ws", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server_task = tokio::spawn(server::start(
        listener,
        Arc::new(DeviceState::default()),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown: ctrl-c");
    let _ = shutdown_tx.send(true);
    server_task.await??;
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
