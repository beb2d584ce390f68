use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::{
    domain::NoticeLevel,
    error::ChannelError,
    protocol::{Command, InboundFrame},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::CommandChannel;

const SIMULATED_RESPONSE_DELAY: Duration = Duration::from_millis(500);
const STATUS_REFRESH_DELAY: Duration = Duration::from_millis(500);

/// What a [`CommandDispatcher`] does when the channel is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    None,
    #[default]
    Http,
    HttpThenSimulate,
}

#[derive(Debug, Error)]
#[error("unknown fallback mode `{0}` (expected none, http or http_then_simulate)")]
pub struct UnknownFallbackMode(String);

impl FromStr for FallbackMode {
    type Err = UnknownFallbackMode;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(Self::None),
            "http" => Ok(Self::Http),
            "http_then_simulate" | "mock" => Ok(Self::HttpThenSimulate),
            _ => Err(UnknownFallbackMode(s.to_string())),
        }
    }
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Http => "http",
            Self::HttpThenSimulate => "http_then_simulate",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Channel,
    Http,
    Simulated,
}

/// Request/response transport used when the socket is down.
#[async_trait]
pub trait FallbackTransport: Send + Sync {
    async fn post_command(&self, command: &str) -> Result<()>;
    async fn shutdown_system(&self) -> Result<()>;
    async fn stow_servos(&self) -> Result<()>;
}

pub struct MissingFallbackTransport;

#[async_trait]
impl FallbackTransport for MissingFallbackTransport {
    async fn post_command(&self, command: &str) -> Result<()> {
        Err(anyhow!("no fallback transport configured for `{command}`"))
    }

    async fn shutdown_system(&self) -> Result<()> {
        Err(anyhow!("no fallback transport configured for shutdown"))
    }

    async fn stow_servos(&self) -> Result<()> {
        Err(anyhow!("no fallback transport configured for servo stow"))
    }
}

#[derive(Debug, Serialize)]
struct SystemActionBody {
    action: &'static str,
}

#[derive(Debug, Serialize)]
struct StowBody {
    action: &'static str,
    positions: StowPositions,
}

#[derive(Debug, Serialize)]
struct StowPositions {
    servo1: u8,
    servo2: u8,
    servo3: u8,
    servo4: u8,
}

impl Default for StowPositions {
    fn default() -> Self {
        // Legs neutral, arms folded.
        Self {
            servo1: 90,
            servo2: 90,
            servo3: 0,
            servo4: 0,
        }
    }
}

pub struct HttpFallback {
    http: Client,
    base_url: Url,
}

impl HttpFallback {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).with_context(|| format!("invalid fallback url: {base_url}"))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("fallback url cannot be a base: {base_url}"));
        }
        Ok(Self {
            http: Client::new(),
            base_url,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("fallback url cannot be a base: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: Url, body: &T) -> Result<()> {
        self.http
            .post(url.clone())
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?
            .error_for_status()
            .with_context(|| format!("POST {url} rejected"))?;
        Ok(())
    }
}

#[async_trait]
impl FallbackTransport for HttpFallback {
    async fn post_command(&self, command: &str) -> Result<()> {
        let url = self.endpoint(&["command", command])?;
        self.post_json(url, &json!({})).await
    }

    async fn shutdown_system(&self) -> Result<()> {
        let url = self.endpoint(&["system", "shutdown"])?;
        self.post_json(url, &SystemActionBody { action: "shutdown" })
            .await
    }

    async fn stow_servos(&self) -> Result<()> {
        let url = self.endpoint(&["servos", "stow"])?;
        self.post_json(
            url,
            &StowBody {
                action: "stow",
                positions: StowPositions::default(),
            },
        )
        .await
    }
}

/// Fabricates backend replies while mock mode is on.
pub struct Simulator {
    delay: Duration,
    bollios_active: AtomicBool,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(SIMULATED_RESPONSE_DELAY)
    }
}

impl Simulator {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            bollios_active: AtomicBool::new(false),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// The frame the backend would plausibly answer with, if any.
    pub fn respond(&self, command: &Command) -> Option<InboundFrame> {
        let name = command.name();
        let mut frame = match name {
            "bolliOs" => {
                self.bollios_active.store(true, Ordering::SeqCst);
                InboundFrame::titled("bolliOs", json!("activated"))
            }
            "bolliOsOff" => {
                self.bollios_active.store(false, Ordering::SeqCst);
                InboundFrame::titled("bolliOs", json!("deactivated"))
            }
            "bolliOsStatus" => InboundFrame::titled(
                "bolliOsStatus",
                json!({
                    "active": self.bollios_active.load(Ordering::SeqCst),
                    "running": false,
                }),
            ),
            "motionTracking" => InboundFrame::titled("motionTracking", json!("activated")),
            "motionTrackingOff" => InboundFrame::titled("motionTracking", json!("deactivated")),
            "system_shutdown" | "stow_servos" => InboundFrame::titled(name, json!("simulated")),
            _ => return None,
        };
        frame.status = Some("simulated".to_string());
        Some(frame)
    }
}

/// Follow-up status request sent shortly after a trigger command goes out.
#[derive(Debug, Clone)]
pub struct StatusRefresh {
    triggers: Vec<&'static str>,
    command: Command,
    delay: Duration,
}

impl StatusRefresh {
    pub fn new(triggers: Vec<&'static str>, command: Command, delay: Duration) -> Self {
        Self {
            triggers,
            command,
            delay,
        }
    }

    pub fn bollios() -> Self {
        Self::new(
            vec!["bolliOs", "bolliOsOff"],
            Command::raw("bolliOsStatus"),
            STATUS_REFRESH_DELAY,
        )
    }

    fn matches(&self, command: &Command) -> bool {
        self.triggers.iter().any(|trigger| *trigger == command.name())
    }
}

/// Sends through the channel and applies one fallback policy when it is down.
pub struct CommandDispatcher {
    channel: Arc<CommandChannel>,
    mode: FallbackMode,
    transport: Arc<dyn FallbackTransport>,
    simulator: Simulator,
    mock_mode: AtomicBool,
    refreshes: Vec<StatusRefresh>,
    // Serializes mock-mode activation with the HTTP attempt that triggers it.
    fallback_lock: Mutex<()>,
}

impl CommandDispatcher {
    pub fn new(channel: Arc<CommandChannel>, mode: FallbackMode) -> Self {
        Self::new_with_transport(channel, mode, Arc::new(MissingFallbackTransport))
    }

    pub fn new_with_transport(
        channel: Arc<CommandChannel>,
        mode: FallbackMode,
        transport: Arc<dyn FallbackTransport>,
    ) -> Self {
        Self {
            channel,
            mode,
            transport,
            simulator: Simulator::default(),
            mock_mode: AtomicBool::new(false),
            refreshes: Vec::new(),
            fallback_lock: Mutex::new(()),
        }
    }

    pub fn with_simulator(mut self, simulator: Simulator) -> Self {
        self.simulator = simulator;
        self
    }

    pub fn with_status_refresh(mut self, refresh: StatusRefresh) -> Self {
        self.refreshes.push(refresh);
        self
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn mode(&self) -> FallbackMode {
        self.mode
    }

    pub fn is_mock_mode(&self) -> bool {
        self.mock_mode.load(Ordering::SeqCst)
    }

    pub async fn send(&self, command: impl Into<Command>) -> Result<Delivery, ChannelError> {
        let command = command.into();
        let name = command.name().to_string();
        self.deliver(command, move |transport| async move {
            transport.post_command(&name).await
        })
        .await
    }

    pub async fn shutdown_system(&self) -> Result<Delivery, ChannelError> {
        self.deliver(Command::action("system_shutdown"), |transport| async move {
            transport.shutdown_system().await
        })
        .await
    }

    pub async fn stow_servos(&self) -> Result<Delivery, ChannelError> {
        self.deliver(Command::action("stow_servos"), |transport| async move {
            transport.stow_servos().await
        })
        .await
    }

    async fn deliver<F, Fut>(&self, command: Command, http: F) -> Result<Delivery, ChannelError>
    where
        F: FnOnce(Arc<dyn FallbackTransport>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        if self.is_mock_mode() {
            self.simulate(&command).await;
            return Ok(Delivery::Simulated);
        }

        let err = match self.channel.send(command.clone()).await {
            Ok(()) => {
                self.schedule_refreshes(&command);
                return Ok(Delivery::Channel);
            }
            Err(err) if err.is_unavailable() => err,
            Err(err) => return Err(err),
        };

        if self.mode == FallbackMode::None {
            return Err(err);
        }

        let guard = self.fallback_lock.lock().await;
        if self.is_mock_mode() {
            drop(guard);
            self.simulate(&command).await;
            return Ok(Delivery::Simulated);
        }

        match http(Arc::clone(&self.transport)).await {
            Ok(()) => {
                info!(command = command.name(), "fallback: delivered over http");
                self.channel.notify(
                    NoticeLevel::Success,
                    format!("command delivered over http: {}", command.name()),
                );
                Ok(Delivery::Http)
            }
            Err(http_err) if self.mode == FallbackMode::HttpThenSimulate => {
                warn!(
                    command = command.name(),
                    "fallback: http failed, enabling mock mode: {http_err:#}"
                );
                self.mock_mode.store(true, Ordering::SeqCst);
                self.channel.notify(
                    NoticeLevel::Warning,
                    "connection failed, mock mode enabled",
                );
                drop(guard);
                self.simulate(&command).await;
                Ok(Delivery::Simulated)
            }
            Err(http_err) => {
                warn!(command = command.name(), "fallback: http failed: {http_err:#}");
                self.channel.notify(
                    NoticeLevel::Error,
                    format!("command failed: {}", command.name()),
                );
                Err(ChannelError::FallbackExhausted {
                    command: command.name().to_string(),
                    reason: format!("{err}; http: {http_err:#}"),
                })
            }
        }
    }

    fn schedule_refreshes(&self, command: &Command) {
        for refresh in self.refreshes.iter().filter(|r| r.matches(command)) {
            let channel = Arc::clone(&self.channel);
            let refresh = refresh.clone();
            tokio::spawn(async move {
                tokio::time::sleep(refresh.delay).await;
                if let Err(err) = channel.send(refresh.command.clone()).await {
                    debug!(command = refresh.command.name(), "status refresh: {err}");
                }
            });
        }
    }

    async fn simulate(&self, command: &Command) {
        let Some(frame) = self.simulator.respond(command) else {
            info!(command = command.name(), "mock: no simulated response");
            return;
        };
        if !self.simulator.delay().is_zero() {
            tokio::time::sleep(self.simulator.delay()).await;
        }
        info!(command = command.name(), "mock: simulated response");
        self.channel.dispatch(frame).await;
    }
}

#[cfg(test)]
#[path = "tests/fallback_tests.rs"]
mod tests;
