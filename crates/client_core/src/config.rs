use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;
use url::Url;

use crate::error::SyncError;

pub const DEFAULT_SETTINGS_FILE: &str = "sync.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub server_url: String,
    pub api_url: Option<String>,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub history_page_size: u32,
    pub max_message_length: usize,
    pub persist_sent_messages: bool,
    pub auto_mark_read: bool,
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".into(),
            api_url: None,
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            connect_timeout_ms: 20_000,
            history_page_size: 50,
            max_message_length: 5_000,
            persist_sent_messages: false,
            auto_mark_read: true,
            event_buffer: 1024,
        }
    }
}

impl SyncSettings {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid sync settings")
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn api_base_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| self.server_url.clone())
            .trim_end_matches('/')
            .to_string()
    }

    /// Push endpoint for the configured HTTP server (`http` -> `ws`, `https` -> `wss`).
    pub fn websocket_url(&self) -> Result<String, SyncError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|err| SyncError::Connection(format!("invalid server_url: {err}")))?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => url.scheme(),
            other => {
                return Err(SyncError::Connection(format!(
                    "server_url must use http or https, got {other}"
                )))
            }
        }
        .to_string();
        url.set_scheme(&scheme)
            .map_err(|_| SyncError::Connection("failed to derive websocket scheme".into()))?;
        let path = format!("{}/ws", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url.to_string())
    }
}

/// Defaults, then the TOML file (if present), then `APP__*` environment overrides.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<SyncSettings> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_FILE));
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => SyncSettings::from_toml_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        Err(_) => SyncSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_env_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = lookup("APP__API_URL") {
        settings.api_url = Some(v);
    }
    if let Some(v) = parse_env(&lookup, "APP__RECONNECT_ATTEMPTS") {
        settings.reconnect_attempts = v;
    }
    if let Some(v) = parse_env(&lookup, "APP__RECONNECT_DELAY_MS") {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = parse_env(&lookup, "APP__CONNECT_TIMEOUT_MS") {
        settings.connect_timeout_ms = v;
    }
    if let Some(v) = parse_env(&lookup, "APP__HISTORY_PAGE_SIZE") {
        settings.history_page_size = v;
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring malformed numeric setting");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
