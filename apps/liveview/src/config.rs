use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context};
use chrono::TimeDelta;
use serde::Deserialize;
use shared::domain::GeoPoint;
use tracker_core::{FreshnessPolicy, SubscriberConfig};

const ENV_PREFIX: &str = "LIVEVIEW__";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_url: String,
    pub page_size: Option<u32>,
    pub broker_url: String,
    pub database_url: String,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub delivered_window_hours: i64,
    pub restore_window_secs: i64,
    pub warehouse_lat: Option<f64>,
    pub warehouse_lng: Option<f64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:9001/api/public/shippings".into(),
            page_size: None,
            broker_url: "ws://localhost:9001/ws".into(),
            database_url: "sqlite://./data/liveview.db".into(),
            reconnect_delay_secs: 5,
            connect_timeout_secs: 10,
            sweep_interval_secs: 60 * 60,
            delivered_window_hours: 24,
            restore_window_secs: 16_416,
            warehouse_lat: None,
            warehouse_lng: None,
        }
    }
}

/// Optional overrides read from `liveview.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    api_url: Option<String>,
    page_size: Option<u32>,
    broker_url: Option<String>,
    database_url: Option<String>,
    reconnect_delay_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    delivered_window_hours: Option<i64>,
    restore_window_secs: Option<i64>,
    warehouse_lat: Option<f64>,
    warehouse_lng: Option<f64>,
}

impl Settings {
    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.api_url {
            self.api_url = v;
        }
        if let Some(v) = file.broker_url {
            self.broker_url = v;
        }
        if let Some(v) = file.database_url {
            self.database_url = v;
        }
        if let Some(v) = file.reconnect_delay_secs {
            self.reconnect_delay_secs = v;
        }
        if let Some(v) = file.connect_timeout_secs {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = file.sweep_interval_secs {
            self.sweep_interval_secs = v;
        }
        if let Some(v) = file.delivered_window_hours {
            self.delivered_window_hours = v;
        }
        if let Some(v) = file.restore_window_secs {
            self.restore_window_secs = v;
        }
        if file.page_size.is_some() {
            self.page_size = file.page_size;
        }
        if file.warehouse_lat.is_some() {
            self.warehouse_lat = file.warehouse_lat;
        }
        if file.warehouse_lng.is_some() {
            self.warehouse_lng = file.warehouse_lng;
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| env(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("API_URL") {
            self.api_url = v;
        }
        if let Some(v) = var("BROKER_URL") {
            self.broker_url = v;
        }
        if let Some(v) = var("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = var("PAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.page_size = Some(v);
        }
        if let Some(v) = var("RECONNECT_DELAY_SECS").and_then(|v| v.parse().ok()) {
            self.reconnect_delay_secs = v;
        }
        if let Some(v) = var("CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = var("SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.sweep_interval_secs = v;
        }
        if let Some(v) = var("DELIVERED_WINDOW_HOURS").and_then(|v| v.parse().ok()) {
            self.delivered_window_hours = v;
        }
        if let Some(v) = var("RESTORE_WINDOW_SECS").and_then(|v| v.parse().ok()) {
            self.restore_window_secs = v;
        }
        if let Some(v) = var("WAREHOUSE_LAT").and_then(|v| v.parse().ok()) {
            self.warehouse_lat = Some(v);
        }
        if let Some(v) = var("WAREHOUSE_LNG").and_then(|v| v.parse().ok()) {
            self.warehouse_lng = Some(v);
        }
    }

    /// Fails when a window is negative or too large for a `TimeDelta`.
    pub fn freshness_policy(&self) -> anyhow::Result<FreshnessPolicy> {
        if self.delivered_window_hours < 0 {
            bail!("delivered_window_hours must not be negative");
        }
        if self.restore_window_secs < 0 {
            bail!("restore_window_secs must not be negative");
        }
        let delivered_window = TimeDelta::try_hours(self.delivered_window_hours)
            .context("delivered_window_hours is out of range")?;
        let restore_window = TimeDelta::try_seconds(self.restore_window_secs)
            .context("restore_window_secs is out of range")?;
        Ok(FreshnessPolicy {
            delivered_window,
            restore_window,
        })
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            ..SubscriberConfig::new(self.broker_url.clone())
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Configured warehouse pin, if both coordinates are set and in range.
    pub fn warehouse(&self) -> Option<GeoPoint> {
        GeoPoint::new(self.warehouse_lat?, self.warehouse_lng?)
    }
}

/// Defaults, then `path` if it exists, then `LIVEVIEW__*` variables.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    settings_from(raw.as_deref(), |name| std::env::var(name).ok())
        .with_context(|| format!("invalid settings in '{}'", path.display()))
}

fn settings_from(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    if let Some(raw) = file {
        settings.apply_file(toml::from_str::<FileSettings>(raw)?);
    }
    settings.apply_env(env);
    settings.database_url = normalize_database_url(&settings.database_url);
    settings.freshness_policy()?;
    Ok(settings)
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite:") && !raw_database_url.starts_with("sqlite://") {
        if raw_database_url.starts_with("sqlite::memory:") {
            return raw_database_url.to_string();
        }
        let path = raw_database_url.trim_start_matches("sqlite:").replace('\\', "/");
        return format!("sqlite://{path}");
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
