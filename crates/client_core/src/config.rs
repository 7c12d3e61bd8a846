use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use chrono::FixedOffset;
use serde::Deserialize;
use tracing::warn;

use crate::view::DayBoundary;

pub const DEFAULT_CONFIG_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_url: String,
    /// SSE endpoint; derived from `server_url` when unset.
    pub events_url: Option<String>,
    pub database_url: String,
    pub fetch_timeout: Duration,
    pub resubscribe_delay: Duration,
    pub update_buffer: usize,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub utc_offset_minutes: Option<i32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            events_url: None,
            database_url: "sqlite://./data/cache.db".into(),
            fetch_timeout: Duration::from_secs(15),
            resubscribe_delay: Duration::from_secs(3),
            update_buffer: 256,
            user_id: None,
            user_name: None,
            utc_offset_minutes: None,
        }
    }
}

impl Settings {
    pub fn events_url(&self) -> String {
        self.events_url
            .clone()
            .unwrap_or_else(|| format!("{}/events", self.server_url.trim_end_matches('/')))
    }

    pub fn day_boundary(&self) -> DayBoundary {
        self.utc_offset_minutes
            .and_then(|minutes| FixedOffset::east_opt(minutes.saturating_mul(60)))
            .map(DayBoundary::Fixed)
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    server_url: Option<String>,
    events_url: Option<String>,
    database_url: Option<String>,
    fetch_timeout_ms: Option<u64>,
    resubscribe_delay_ms: Option<u64>,
    update_buffer: Option<usize>,
    user_id: Option<String>,
    user_name: Option<String>,
    utc_offset_minutes: Option<i32>,
}

/// Defaults, then `client.toml` (or `path`), then `APP__*` environment variables.
pub fn load_settings(path: Option<&Path>) -> Settings {
    let mut settings = Settings::default();

    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    if let Ok(raw) = fs::read_to_string(path) {
        match parse_file_settings(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(err) => warn!("config: ignoring {}: {err:#}", path.display()),
        }
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn parse_file_settings(raw: &str) -> anyhow::Result<FileSettings> {
    toml::from_str::<FileSettings>(raw).context("invalid client settings file")
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file_cfg.events_url {
        settings.events_url = Some(v);
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.fetch_timeout_ms {
        settings.fetch_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.resubscribe_delay_ms {
        settings.resubscribe_delay = Duration::from_millis(v);
    }
    if let Some(v) = file_cfg.update_buffer {
        settings.update_buffer = v.max(1);
    }
    if let Some(v) = file_cfg.user_id {
        settings.user_id = Some(v);
    }
    if let Some(v) = file_cfg.user_name {
        settings.user_name = Some(v);
    }
    if let Some(v) = file_cfg.utc_offset_minutes {
        settings.utc_offset_minutes = Some(v);
    }
}

fn apply_env_overrides(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("APP__SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = var("APP__EVENTS_URL") {
        settings.events_url = Some(v);
    }
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__FETCH_TIMEOUT_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.fetch_timeout = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = var("APP__RESUBSCRIBE_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.resubscribe_delay = Duration::from_millis(parsed);
        }
    }
    if let Some(v) = var("APP__UPDATE_BUFFER") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.update_buffer = parsed.max(1);
        }
    }
    if let Some(v) = var("APP__USER_ID") {
        settings.user_id = Some(v);
    }
    if let Some(v) = var("APP__USER_NAME") {
        settings.user_name = Some(v);
    }
    if let Some(v) = var("APP__UTC_OFFSET_MINUTES") {
        if let Ok(parsed) = v.parse::<i32>() {
            settings.utc_offset_minutes = Some(parsed);
        }
    }
}

/// Turns a bare file path into a `sqlite://` url; other urls pass through.
pub fn prepare_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}
