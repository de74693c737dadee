use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use client_core::{ClientConfig, ClientIdentity};
use serde::Deserialize;
use shared::domain::{DeviceId, UserId};

const DEFAULT_CONFIG_FILE: &str = "chat.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub user_id: i64,
    pub device_id: i64,
    pub username: String,
    pub device_name: String,
    pub max_attempts: u32,
    pub max_text_length: usize,
    pub outbox_expiry_secs: u64,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/chat.db".into(),
            user_id: 1,
            device_id: 1,
            username: "me".into(),
            device_name: "cli".into(),
            max_attempts: 10,
            max_text_length: 10_000,
            outbox_expiry_secs: 600,
            log_filter: "info".into(),
        }
    }
}

/// Keys accepted in the config file. Everything is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    database_url: Option<String>,
    user_id: Option<i64>,
    device_id: Option<i64>,
    username: Option<String>,
    device_name: Option<String>,
    max_attempts: Option<u32>,
    max_text_length: Option<usize>,
    outbox_expiry_secs: Option<u64>,
    log_filter: Option<String>,
}

impl Settings {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            max_attempts: self.max_attempts,
            max_text_length: self.max_text_length,
            outbox_expiry: Duration::from_secs(self.outbox_expiry_secs),
            ..ClientConfig::default()
        }
    }

    pub fn identity(&self) -> ClientIdentity {
        ClientIdentity {
            user_id: UserId(self.user_id),
            device_id: DeviceId(self.device_id),
            username: self.username.clone(),
            device_name: self.device_name.clone(),
        }
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.database_url {
            self.database_url = v;
        }
        if let Some(v) = file.user_id {
            self.user_id = v;
        }
        if let Some(v) = file.device_id {
            self.device_id = v;
        }
        if let Some(v) = file.username {
            self.username = v;
        }
        if let Some(v) = file.device_name {
            self.device_name = v;
        }
        if let Some(v) = file.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = file.max_text_length {
            self.max_text_length = v;
        }
        if let Some(v) = file.outbox_expiry_secs {
            self.outbox_expiry_secs = v;
        }
        if let Some(v) = file.log_filter {
            self.log_filter = v;
        }
    }

    /// `APP__*` variables win over the file. Unparseable numbers are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("APP__DATABASE_URL").or_else(|| var("DATABASE_URL")) {
            self.database_url = v;
        }
        if let Some(v) = var("APP__USER_ID").and_then(|v| v.parse().ok()) {
            self.user_id = v;
        }
        if let Some(v) = var("APP__DEVICE_ID").and_then(|v| v.parse().ok()) {
            self.device_id = v;
        }
        if let Some(v) = var("APP__USERNAME") {
            self.username = v;
        }
        if let Some(v) = var("APP__DEVICE_NAME") {
            self.device_name = v;
        }
        if let Some(v) = var("APP__MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.max_attempts = v;
        }
        if let Some(v) = var("APP__MAX_TEXT_LENGTH").and_then(|v| v.parse().ok()) {
            self.max_text_length = v;
        }
        if let Some(v) = var("APP__OUTBOX_EXPIRY_SECS").and_then(|v| v.parse().ok()) {
            self.outbox_expiry_secs = v;
        }
        if let Some(v) = var("RUST_LOG").or_else(|| var("APP__LOG")) {
            self.log_filter = v;
        }
    }
}

/// Defaults, then the TOML file, then the environment.
///
/// An explicit `path` must exist; the default `chat.toml` may be absent.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let (path, required) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_FILE), false),
    };
    match fs::read_to_string(path) {
        Ok(raw) => {
            let file: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid config file '{}'", path.display()))?;
            settings.apply_file(file);
        }
        Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()))
        }
    }

    settings.apply_env(|key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
