use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Max distance between an optimistic entry and its echo for promotion.
    pub promotion_window_ms: u64,
    /// Idle time after the last keystroke before `stop_typing` is sent.
    pub typing_idle_ms: u64,
    /// Forced expiry of a remote typing claim that is not refreshed.
    pub typing_expiry_ms: u64,
    pub presence_freshness_secs: u64,
    pub presence_channel: String,
    pub legacy_channel_name: String,
    pub announcements_channel_id: String,
    /// Capacity of the client event channel; slow subscribers past it see a lag.
    pub realtime_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            promotion_window_ms: 10_000,
            typing_idle_ms: 2_000,
            typing_expiry_ms: 3_000,
            presence_freshness_secs: 300,
            presence_channel: "online-users".into(),
            legacy_channel_name: "General".into(),
            announcements_channel_id: "announcements".into(),
            realtime_buffer: 256,
        }
    }
}

impl ClientSettings {
    pub fn promotion_window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.promotion_window_ms as i64)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn typing_expiry(&self) -> Duration {
        Duration::from_millis(self.typing_expiry_ms)
    }

    pub fn presence_freshness(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.presence_freshness_secs as i64)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    promotion_window_ms: Option<u64>,
    typing_idle_ms: Option<u64>,
    typing_expiry_ms: Option<u64>,
    presence_freshness_secs: Option<u64>,
    presence_channel: Option<String>,
    legacy_channel_name: Option<String>,
    realtime_buffer: Option<usize>,
}

/// Defaults, then `chat.toml` in the working directory, then `APP__*` environment overrides.
pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    match load_file_settings(Path::new("chat.toml")) {
        Ok(Some(file_cfg)) => apply_file_settings(&mut settings, file_cfg),
        Ok(None) => {}
        Err(error) => tracing::warn!(%error, "ignoring unreadable chat.toml"),
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn load_settings_from(path: &Path) -> anyhow::Result<ClientSettings> {
    let mut settings = ClientSettings::default();
    let file_cfg = load_file_settings(path)?
        .with_context(|| format!("settings file '{}' does not exist", path.display()))?;
    apply_file_settings(&mut settings, file_cfg);
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn load_file_settings(path: &Path) -> anyhow::Result<Option<FileSettings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    let parsed = toml::from_str::<FileSettings>(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
    Ok(Some(parsed))
}

fn apply_file_settings(settings: &mut ClientSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.promotion_window_ms {
        settings.promotion_window_ms = v;
    }
    if let Some(v) = file_cfg.typing_idle_ms {
        settings.typing_idle_ms = v;
    }
    if let Some(v) = file_cfg.typing_expiry_ms {
        settings.typing_expiry_ms = v;
    }
    if let Some(v) = file_cfg.presence_freshness_secs {
        settings.presence_freshness_secs = v;
    }
    if let Some(v) = file_cfg.presence_channel {
        settings.presence_channel = v;
    }
    if let Some(v) = file_cfg.legacy_channel_name {
        settings.legacy_channel_name = v;
    }
    if let Some(v) = file_cfg.realtime_buffer {
        settings.realtime_buffer = v;
    }
}

fn apply_env_overrides(settings: &mut ClientSettings, env: impl Fn(&str) -> Option<String>) {
    let number = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(v) = number("APP__PROMOTION_WINDOW_MS") {
        settings.promotion_window_ms = v;
    }
    if let Some(v) = number("APP__TYPING_IDLE_MS") {
        settings.typing_idle_ms = v;
    }
    if let Some(v) = number("APP__TYPING_EXPIRY_MS") {
        settings.typing_expiry_ms = v;
    }
    if let Some(v) = number("APP__PRESENCE_FRESHNESS_SECS") {
        settings.presence_freshness_secs = v;
    }
    if let Some(v) = env("APP__PRESENCE_CHANNEL").filter(|v| !v.trim().is_empty()) {
        settings.presence_channel = v;
    }
    if let Some(v) = env("APP__LEGACY_CHANNEL_NAME").filter(|v| !v.trim().is_empty()) {
        settings.legacy_channel_name = v;
    }
}
