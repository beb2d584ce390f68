use std::{collections::HashMap, fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

use crate::{fallback::FallbackMode, retry::RetryPolicy, ChannelOptions};

pub const DEFAULT_CONFIG_FILE: &str = "panel.toml";

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Settings {
    pub host: String,
    pub ws_port: u16,
    /// Plaintext handshake expected by the backend. Not a security boundary.
    pub credential: String,
    pub reconnect_delay_ms: u64,
    pub http_base_url: Option<String>,
    pub fallback: FallbackMode,
    pub status_poll_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            ws_port: 8888,
            credential: "admin:123456".into(),
            reconnect_delay_ms: 3000,
            http_base_url: None,
            fallback: FallbackMode::Http,
            status_poll_secs: 5,
        }
    }
}

impl Settings {
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.ws_port)
    }

    /// Explicit base URL, or the web server on the robot's default port.
    pub fn http_base_url(&self) -> String {
        self.http_base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:5000", self.host))
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_secs.max(1))
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            url: self.ws_url(),
            credential: self.credential.clone(),
            reconnect: RetryPolicy::fixed(Duration::from_millis(self.reconnect_delay_ms)),
        }
    }
}

/// Defaults, then `panel.toml` in the working directory, then the environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(DEFAULT_CONFIG_FILE) {
        if let Err(err) = apply_file_overrides(&mut settings, &raw) {
            warn!("ignoring {DEFAULT_CONFIG_FILE}: {err:#}");
        }
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    let mut settings = Settings::default();
    apply_file_overrides(&mut settings, &raw)
        .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn apply_file_overrides(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg = toml::from_str::<HashMap<String, toml::Value>>(raw)?;
    for (key, value) in file_cfg {
        let value = match value {
            toml::Value::String(v) => v,
            other => other.to_string(),
        };
        apply_key(settings, &key, &value);
    }
    Ok(())
}

pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    for key in [
        "host",
        "ws_port",
        "credential",
        "reconnect_delay_ms",
        "http_base_url",
        "fallback",
        "status_poll_secs",
    ] {
        let upper = key.to_ascii_uppercase();
        if let Some(v) = lookup(&format!("PANEL_{upper}")) {
            apply_key(settings, key, &v);
        }
        if let Some(v) = lookup(&format!("APP__{upper}")) {
            apply_key(settings, key, &v);
        }
    }
}

fn apply_key(settings: &mut Settings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "host" => settings.host = value.to_string(),
        "ws_port" => {
            if let Ok(parsed) = value.parse() {
                settings.ws_port = parsed;
            }
        }
        "credential" => settings.credential = value.to_string(),
        "reconnect_delay_ms" => {
            if let Ok(parsed) = value.parse() {
                settings.reconnect_delay_ms = parsed;
            }
        }
        "http_base_url" => {
            settings.http_base_url = (!value.is_empty()).then(|| value.to_string());
        }
        "fallback" => {
            if let Ok(parsed) = value.parse() {
                settings.fallback = parsed;
            }
        }
        "status_poll_secs" => {
            if let Ok(parsed) = value.parse() {
                settings.status_poll_secs = parsed;
            }
        }
        _ => {}
    }
}
