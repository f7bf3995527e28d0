use std::collections::HashMap;

use thiserror::Error;

use crate::static_config::{SettingItem, SETTINGS_TABLE};

#[derive(Clone)]
pub struct Settings {
    pub database_url: String,
    pub admin_key: String,
    pub token_pepper: String,
    pub max_body_bytes_default: usize,
    pub max_body_bytes_device_reports: usize,
    pub max_report_items: usize,
    pub max_report_log_events: usize,
    pub rate_limit: RateLimitSettings,
    pub request_timeout_seconds: u64,
    pub request_timeout_seconds_device_reports: u64,
}

// The admin key and pepper must never reach logs, so Debug is written by
// hand instead of derived.
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("database_url", &self.database_url)
            .field("admin_key", &"<redacted>")
            .field("token_pepper", &"<redacted>")
            .field("max_body_bytes_default", &self.max_body_bytes_default)
            .field(
                "max_body_bytes_device_reports",
                &self.max_body_bytes_device_reports,
            )
            .field("max_report_items", &self.max_report_items)
            .field("max_report_log_events", &self.max_report_log_events)
            .field("rate_limit", &self.rate_limit)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field(
                "request_timeout_seconds_device_reports",
                &self.request_timeout_seconds_device_reports,
            )
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub reports_per_minute: u32,
    pub reports_burst: u32,
    pub reports_ip_per_minute: u32,
    pub reports_ip_burst: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("type mismatch for {0}: expected {1}")]
    TypeMismatch(String, String),
    #[error("value out of range for {0}: {1}")]
    OutOfRange(String, String),
}

/// Env namespaces this service owns. A variable under one of these that is
/// not in the settings table is a typo, not someone else's configuration.
const RECOGNIZED_PREFIXES: &[&str] = &["BASELINER_", "RATE_LIMIT_", "MAX_REQUEST_"];

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut values = HashMap::new();
        for (key, value) in std::env::vars() {
            let owned_prefix = RECOGNIZED_PREFIXES
                .iter()
                .any(|prefix| key.starts_with(prefix));
            if owned_prefix || setting_item(&key).is_some() {
                values.insert(key, value);
            }
        }
        Self::from_map(&values)
    }

    pub fn from_map(values: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort();
        for key in keys {
            if setting_item(key).is_none() {
                return Err(ConfigError::UnknownKey(key.clone()));
            }
        }

        let admin_key = get_string(values, "BASELINER_ADMIN_KEY");
        if admin_key.trim().is_empty() {
            return Err(ConfigError::Missing("BASELINER_ADMIN_KEY"));
        }
        let token_pepper = get_string(values, "BASELINER_TOKEN_PEPPER");
        if token_pepper.trim().is_empty() {
            return Err(ConfigError::Missing("BASELINER_TOKEN_PEPPER"));
        }

        Ok(Self {
            database_url: get_string(values, "DATABASE_URL"),
            admin_key,
            token_pepper,
            max_body_bytes_default: get_number(values, "MAX_REQUEST_BODY_BYTES_DEFAULT")? as usize,
            max_body_bytes_device_reports: get_number(values, "MAX_REQUEST_BODY_BYTES_DEVICE_REPORTS")?
                as usize,
            max_report_items: get_number(values, "MAX_REPORT_ITEMS")? as usize,
            max_report_log_events: get_number(values, "MAX_REPORT_LOG_EVENTS")? as usize,
            rate_limit: RateLimitSettings {
                enabled: get_bool(values, "RATE_LIMIT_ENABLED")?,
                reports_per_minute: get_number(values, "RATE_LIMIT_REPORTS_PER_MINUTE")? as u32,
                reports_burst: get_number(values, "RATE_LIMIT_REPORTS_BURST")? as u32,
                reports_ip_per_minute: get_number(values, "RATE_LIMIT_REPORTS_IP_PER_MINUTE")? as u32,
                reports_ip_burst: get_number(values, "RATE_LIMIT_REPORTS_IP_BURST")? as u32,
            },
            request_timeout_seconds: get_number(values, "REQUEST_TIMEOUT_SECONDS")? as u64,
            request_timeout_seconds_device_reports: get_number(
                values,
                "REQUEST_TIMEOUT_SECONDS_DEVICE_REPORTS",
            )? as u64,
        })
    }

    /// Resolve DATABASE_URL to a path rusqlite can open.
    pub fn sqlite_path(&self) -> &str {
        let raw = self.database_url.trim();
        raw.strip_prefix("sqlite://")
            .or_else(|| raw.strip_prefix("sqlite:"))
            .unwrap_or(raw)
    }
}

fn setting_item(key: &str) -> Option<&'static SettingItem> {
    SETTINGS_TABLE.iter().find(|item| item.key == key)
}

fn get_string(values: &HashMap<String, String>, key: &str) -> String {
    values
        .get(key)
        .cloned()
        .or_else(|| setting_item(key).map(|item| item.default_value.to_string()))
        .unwrap_or_default()
}

fn get_number(values: &HashMap<String, String>, key: &str) -> Result<i64, ConfigError> {
    let raw = get_string(values, key);
    let value = raw
        .trim()
        .parse::<i64>()
        .map_err(|_| ConfigError::TypeMismatch(key.to_string(), "number".to_string()))?;
    if value < 0 {
        return Err(ConfigError::OutOfRange(key.to_string(), raw));
    }
    Ok(value)
}

fn get_bool(values: &HashMap<String, String>, key: &str) -> Result<bool, ConfigError> {
    let raw = get_string(values, key);
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::TypeMismatch(key.to_string(), "boolean".to_string())),
    }
}
