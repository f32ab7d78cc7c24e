// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod duration;
pub mod store;
pub mod wildcard;

use std::env;
use std::time::Duration;

use tracing::error;

use crate::config::duration::{parse_duration, MinimumUnit};
use crate::config::store::{ConfigValues, SettingKey};
use crate::constants::{
    DEFAULT_ANALYTICS_PAYLOAD_MAX_BYTES, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_FLUSH_INTERVAL,
    DEFAULT_FLUSH_TIMEOUT, DEFAULT_HOSTINFO_INTERVAL_TICKS, DEFAULT_NOTIFY_HOST,
};

/// Static settings, fixed for the lifetime of a coordinator.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub license_key: String,
    pub app_name: String,
    pub app_version: String,
    pub environment: String,
    /// Base URL of the collector.
    pub notify_host: String,
    /// Base URL analytics payloads go to instead of `notify_host`.
    pub analytics_notify_host: Option<String>,
    pub notify_proxy: Option<String>,
    /// Overrides the detected OS hostname.
    pub hostname: Option<String>,
    pub tags: Vec<String>,
    /// Local opt-in for analytics. The collector must also enable the feature.
    pub analytics: bool,
    pub flush_interval: Duration,
    pub hostinfo_interval_ticks: u64,
    pub flush_timeout: Duration,
    pub event_queue_capacity: usize,
    pub analytics_payload_max_bytes: usize,
    /// Initial values of the hot-reloadable settings.
    pub values: ConfigValues,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            license_key: String::new(),
            app_name: String::new(),
            app_version: String::new(),
            environment: String::new(),
            notify_host: DEFAULT_NOTIFY_HOST.to_string(),
            analytics_notify_host: None,
            notify_proxy: None,
            hostname: None,
            tags: Vec::new(),
            analytics: false,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            hostinfo_interval_ticks: DEFAULT_HOSTINFO_INTERVAL_TICKS,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            analytics_payload_max_bytes: DEFAULT_ANALYTICS_PAYLOAD_MAX_BYTES,
            values: ConfigValues::default(),
        }
    }
}

impl Config {
    /// Reads `APM_*` environment variables on top of the defaults.
    ///
    /// Invalid values are logged and the default is kept.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(v) = env_string("APM_LICENSE_KEY") {
            config.license_key = v;
        }
        if let Some(v) = env_string("APM_APP_NAME") {
            config.app_name = v;
        }
        if let Some(v) = env_string("APM_APP_VERSION") {
            config.app_version = v;
        }
        if let Some(v) = env_string("APM_ENVIRONMENT") {
            config.environment = v;
        }
        if let Some(v) = env_string("APM_NOTIFY_HOST") {
            config.notify_host = v.trim_end_matches('/').to_string();
        }
        config.analytics_notify_host = env_string("APM_ANALYTICS_NOTIFY_HOST")
            .map(|v| v.trim_end_matches('/').to_string());
        config.notify_proxy = env_string("APM_NOTIFY_PROXY").or_else(|| env_string("HTTPS_PROXY"));
        config.hostname = env_string("APM_HOSTNAME");
        if let Some(v) = env_string("APM_TAGS") {
            config.tags = parse_tags(&v);
        }
        if let Some(v) = env_string("APM_ANALYTICS") {
            match v.to_ascii_lowercase().parse::<bool>() {
                Ok(enabled) => config.analytics = enabled,
                Err(e) => error!("CONFIG | invalid APM_ANALYTICS {v:?}: {e}"),
            }
        }
        if let Some(v) = env_string("APM_FLUSH_INTERVAL") {
            match parse_duration(&v, MinimumUnit::Millisecond) {
                Ok(interval) if !interval.is_zero() => config.flush_interval = interval,
                Ok(_) => error!("CONFIG | APM_FLUSH_INTERVAL must be greater than zero"),
                Err(e) => error!("CONFIG | invalid APM_FLUSH_INTERVAL: {e}"),
            }
        }

        for key in SettingKey::ALL {
            let var = key.env_var();
            if let Some(raw) = env_string(&var) {
                match key.parse_value(&raw) {
                    Ok(value) => value.apply(&mut config.values),
                    Err(e) => error!("CONFIG | invalid {var}, keeping default: {e}"),
                }
            }
        }

        config
    }

    /// Whether the identity needed to talk to the collector is present.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        !self.license_key.is_empty() && !self.app_name.is_empty()
    }

    /// Base URL analytics payloads are sent to.
    #[must_use]
    pub fn analytics_host(&self) -> &str {
        self.analytics_notify_host
            .as_deref()
            .unwrap_or(&self.notify_host)
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Comma separated tags, empty entries dropped.
fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}
