use std::{fs, io, path::Path, time::Duration};

use anyhow::{Context, Result};
use tracing::debug;

use crate::fetch::RetryPolicy;

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 100;
pub const DEFAULT_DECRYPT_PLACEHOLDER: &str = "[Unable to decrypt message]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub page_limit: u32,
    pub max_fetch_retries: u32,
    pub retry_backoff_step: Duration,
    pub request_timeout: Duration,
    pub decrypt_placeholder: String,
    pub event_buffer: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            max_fetch_retries: 2,
            retry_backoff_step: Duration::from_millis(400),
            request_timeout: Duration::from_millis(5_000),
            decrypt_placeholder: DEFAULT_DECRYPT_PLACEHOLDER.into(),
            event_buffer: 1024,
        }
    }
}

impl EngineSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_fetch_retries,
            backoff_step: self.retry_backoff_step,
            attempt_timeout: self.request_timeout,
        }
    }

    fn normalized(mut self) -> Self {
        self.page_limit = self.page_limit.clamp(1, MAX_PAGE_LIMIT);
        self.event_buffer = self.event_buffer.max(16);
        if self.decrypt_placeholder.trim().is_empty() {
            self.decrypt_placeholder = DEFAULT_DECRYPT_PLACEHOLDER.into();
        }
        self
    }
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> Result<EngineSettings> {
    load_settings_from(Path::new("client.toml"), |key| std::env::var(key).ok())
}

/// A missing file means defaults; an unreadable or malformed one is an error.
pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<EngineSettings> {
    let mut settings = EngineSettings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg = toml::from_str::<toml::Table>(&raw)
                .with_context(|| format!("invalid client settings file {}", path.display()))?;
            for (key, value) in &file_cfg {
                let value = match value {
                    toml::Value::String(v) => v.clone(),
                    other => other.to_string(),
                };
                apply_setting(&mut settings, key, &value);
            }
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no client settings file, using defaults");
        }
        Err(error) => {
            return Err(error)
                .with_context(|| format!("failed to read client settings file {}", path.display()));
        }
    }

    for (key, env_names) in ENV_KEYS {
        for name in *env_names {
            if let Some(value) = env(name) {
                apply_setting(&mut settings, key, &value);
            }
        }
    }

    Ok(settings.normalized())
}

const ENV_KEYS: &[(&str, &[&str])] = &[
    ("page_limit", &["PAGE_LIMIT", "APP__PAGE_LIMIT"]),
    ("max_fetch_retries", &["APP__MAX_FETCH_RETRIES"]),
    ("retry_backoff_ms", &["APP__RETRY_BACKOFF_MS"]),
    ("request_timeout_ms", &["REQUEST_TIMEOUT_MS", "APP__REQUEST_TIMEOUT_MS"]),
    ("decrypt_placeholder", &["APP__DECRYPT_PLACEHOLDER"]),
    ("event_buffer", &["APP__EVENT_BUFFER"]),
];

fn apply_setting(settings: &mut EngineSettings, key: &str, value: &str) {
    let value = value.trim();
    match key {
        "page_limit" => {
            if let Ok(parsed) = value.parse() {
                settings.page_limit = parsed;
            }
        }
        "max_fetch_retries" => {
            if let Ok(parsed) = value.parse() {
                settings.max_fetch_retries = parsed;
            }
        }
        "retry_backoff_ms" => {
            if let Ok(parsed) = value.parse() {
                settings.retry_backoff_step = Duration::from_millis(parsed);
            }
        }
        "request_timeout_ms" => {
            if let Ok(parsed) = value.parse() {
                settings.request_timeout = Duration::from_millis(parsed);
            }
        }
        "decrypt_placeholder" => settings.decrypt_placeholder = value.to_string(),
        "event_buffer" => {
            if let Ok(parsed) = value.parse() {
                settings.event_buffer = parsed;
            }
        }
        _ => {}
    }
}
