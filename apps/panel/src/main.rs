use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings, load_settings_from, Settings},
    fallback::{CommandDispatcher, FallbackMode, HttpFallback, StatusRefresh},
    retry::retry,
    status::{attach, spawn_status_poll, CvModeMirror, ToggleMirror},
    ChannelEvent, CommandChannel, RetryPolicy,
};
use shared::protocol::Command;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod shortcuts;

use shortcuts::KeyboardDispatcher;

const INITIAL_CONNECT_ATTEMPTS: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "panel", about = "Command channel client for the robot control panel")]
struct Args {
    /// Settings file; defaults to panel.toml in the working directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    http_base_url: Option<String>,
    /// none, http or http_then_simulate
    #[arg(long, global = true)]
    fallback: Option<FallbackMode>,
    #[command(subcommand)]
    command: PanelCommand,
}

#[derive(Subcommand, Debug)]
enum PanelCommand {
    /// Send a single command.
    Send {
        name: String,
        /// Wrap as {"action": name}.
        #[arg(long, conflicts_with = "envelope")]
        action: bool,
        /// Wrap as {"command": name}.
        #[arg(long)]
        envelope: bool,
        /// JSON payload attached as `data`.
        #[arg(long)]
        data: Option<String>,
        #[arg(long = "type")]
        variant: Option<String>,
    },
    /// Print channel events and feature status until interrupted.
    Watch,
    /// Read keys from stdin, one per line; prefix with '-' to release.
    Keys,
    /// List the keyboard shortcut table.
    Shortcuts,
    /// Ask the robot to shut down.
    Shutdown,
    /// Move the servos to their stowed positions.
    Stow,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    if let PanelCommand::Shortcuts = args.command {
        for (key, action) in KeyboardDispatcher::default().bindings() {
            println!("{key:>10}  {action}");
        }
        return Ok(());
    }

    let settings = resolve_settings(&args)?;
    info!(url = %settings.ws_url(), fallback = %settings.fallback, "panel: starting");

    let channel = CommandChannel::new(settings.channel_options());
    let dispatcher = build_dispatcher(&settings, Arc::clone(&channel))?;

    let outcome = run(args.command, &settings, &channel, &dispatcher).await;

    channel.shutdown().await;
    outcome
}

async fn run(
    command: PanelCommand,
    settings: &Settings,
    channel: &Arc<CommandChannel>,
    dispatcher: &CommandDispatcher,
) -> Result<()> {
    match command {
        PanelCommand::Send {
            name,
            action,
            envelope,
            data,
            variant,
        } => {
            let command = build_command(name, action, envelope, data, variant)?;
            let delivery = dispatcher.send(command).await?;
            println!("sent via {delivery:?}");
        }
        PanelCommand::Watch => watch(settings, channel).await?,
        PanelCommand::Keys => keys(dispatcher).await?,
        PanelCommand::Shutdown => {
            let delivery = dispatcher.shutdown_system().await?;
            println!("shutdown requested via {delivery:?}");
        }
        PanelCommand::Stow => {
            let delivery = dispatcher.stow_servos().await?;
            println!("stow requested via {delivery:?}");
        }
        PanelCommand::Shortcuts => {}
    }
    Ok(())
}

fn resolve_settings(args: &Args) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(host) = &args.host {
        settings.host = host.clone();
    }
    if let Some(port) = args.port {
        settings.ws_port = port;
    }
    if let Some(url) = &args.http_base_url {
        settings.http_base_url = Some(url.clone());
    }
    if let Some(mode) = args.fallback {
        settings.fallback = mode;
    }
    Ok(settings)
}

fn build_dispatcher(settings: &Settings, channel: Arc<CommandChannel>) -> Result<CommandDispatcher> {
    let dispatcher = if settings.fallback == FallbackMode::None {
        CommandDispatcher::new(channel, FallbackMode::None)
    } else {
        let transport = HttpFallback::new(&settings.http_base_url())
            .context("failed to configure http fallback")?;
        CommandDispatcher::new_with_transport(channel, settings.fallback, Arc::new(transport))
    };
    Ok(dispatcher.with_status_refresh(StatusRefresh::bollios()))
}

fn build_command(
    name: String,
    action: bool,
    envelope: bool,
    data: Option<String>,
    variant: Option<String>,
) -> Result<Command> {
    let mut command = if action {
        Command::action(name)
    } else if envelope {
        Command::command(name)
    } else {
        Command::raw(name)
    };
    if let Some(data) = data {
        let data = serde_json::from_str(&data).context("--data must be valid JSON")?;
        command = command.with_data(data);
    }
    if let Some(variant) = variant {
        command = command.with_variant(variant);
    }
    Ok(command)
}

async fn watch(settings: &Settings, channel: &Arc<CommandChannel>) -> Result<()> {
    let mut bollios = attach(channel, ToggleMirror::bollios()).await;
    let mut motion = attach(channel, ToggleMirror::motion_tracking()).await;
    let mut cv = attach(channel, CvModeMirror::default()).await;
    let mut events = channel.subscribe_events();

    let policy = RetryPolicy::fixed(Duration::from_millis(settings.reconnect_delay_ms))
        .with_max_attempts(INITIAL_CONNECT_ATTEMPTS);
    if let Err(err) = retry(&policy, |_| channel.connect()).await {
        warn!("panel: initial connect failed, retrying in background: {err}");
    }
    let poll = spawn_status_poll(
        Arc::clone(channel),
        Command::raw("bolliOsStatus"),
        settings.status_poll_interval(),
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(ChannelEvent::StatusChanged(status)) => println!("channel: {status}"),
                Ok(ChannelEvent::Notice { level, message }) => println!("[{level}] {message}"),
                Ok(ChannelEvent::Frame(frame)) => {
                    println!("frame: {}", serde_json::to_string(&frame)?);
                }
                Err(err) => warn!("panel: event stream: {err}"),
            },
            Some(mirror) = bollios.changed() => {
                let flag = mirror.flag();
                println!("bolliOs: active={} running={}", flag.active, flag.running);
            }
            Some(mirror) = motion.changed() => {
                println!("motionTracking: active={}", mirror.flag().active);
            }
            Some(mirror) = cv.changed() => {
                println!("cvMode: {}", mirror.mode().unwrap_or("none"));
            }
        }
    }

    poll.abort();
    Ok(())
}

async fn keys(dispatcher: &CommandDispatcher) -> Result<()> {
    let mut keyboard = KeyboardDispatcher::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let commands = match line.strip_prefix('-') {
            Some(key) if !key.is_empty() => keyboard.release(key),
            _ => keyboard.press(line),
        };
        for command in commands {
            match dispatcher.send(command.as_str()).await {
                Ok(delivery) => println!("{command} -> {delivery:?}"),
                Err(err) => warn!(command = %command, "panel: {err}"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use shared::domain::ChannelStatus;

    use super::*;

    #[test]
    fn send_flags_select_envelope_shape() {
        let command = build_command("photo".into(), false, true, None, Some("hd".into()))
            .expect("command");
        assert_eq!(
            command.to_frame().expect("frame"),
            r#"{"command":"photo","type":"hd"}"#
        );
        assert!(build_command("wsB".into(), false, false, Some("{".into()), None).is_err());
    }

    #[tokio::test]
    async fn failed_command_returns_error_and_channel_still_shuts_down() {
        let settings = Settings {
            ws_port: 1,
            fallback: FallbackMode::None,
            ..Settings::default()
        };
        let channel = CommandChannel::new(settings.channel_options());
        let dispatcher = build_dispatcher(&settings, Arc::clone(&channel)).expect("dispatcher");

        let outcome = run(PanelCommand::Stow, &settings, &channel, &dispatcher).await;
        assert!(outcome.is_err());
        assert!(channel.state().await.reconnect_pending);

        channel.shutdown().await;
        let state = channel.state().await;
        assert_eq!(state.status, ChannelStatus::Disconnected);
        assert!(!state.reconnect_pending);
    }
}
