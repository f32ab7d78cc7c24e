// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free store for hot-reloadable settings.
//!
//! The current [`ConfigSnapshot`] lives behind an [`ArcSwap`]. Reads are a single atomic load and
//! never wait on writers. Writes copy the current snapshot, apply a mutation and publish the copy
//! with a compare-and-swap, retrying against the newer snapshot when another writer won the race.
//!
//! Every setting has a "local" reset closure registered when the store is created. Remote updates
//! overlay values on top of the local ones; a key that stops being sent remotely is reset through its
//! local closure.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, error, warn};

use crate::config::duration::{parse_duration, MinimumUnit};
use crate::config::wildcard::{WildcardMatchers, DEFAULT_SANITIZE_FIELD_NAMES};
use crate::constants::DEFAULT_TRACE_THRESHOLD_MS;
use crate::errors::ConfigError;

/// Which transactions may carry a captured request body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaptureBodyMode {
    #[default]
    Off,
    Errors,
    Transactions,
    All,
}

impl CaptureBodyMode {
    /// Whether request bodies of successful transactions may be captured.
    #[must_use]
    pub fn captures_transactions(self) -> bool {
        matches!(self, CaptureBodyMode::Transactions | CaptureBodyMode::All)
    }

    /// Whether request bodies attached to errors may be captured.
    #[must_use]
    pub fn captures_errors(self) -> bool {
        matches!(self, CaptureBodyMode::Errors | CaptureBodyMode::All)
    }
}

impl FromStr for CaptureBodyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(CaptureBodyMode::Off),
            "errors" => Ok(CaptureBodyMode::Errors),
            "transactions" => Ok(CaptureBodyMode::Transactions),
            "all" => Ok(CaptureBodyMode::All),
            other => Err(format!(
                "invalid value {other:?} (expected off, errors, transactions or all)"
            )),
        }
    }
}

/// Every hot-reloadable setting.
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigValues {
    pub recording: bool,
    pub capture_body: CaptureBodyMode,
    pub capture_headers: bool,
    pub transaction_max_spans: usize,
    pub transaction_sample_rate: f64,
    /// Maximum number of stack frames kept per error. Negative keeps every frame.
    pub stack_trace_limit: i64,
    pub span_frames_min_duration: Duration,
    pub exit_span_min_duration: Duration,
    pub sanitize_field_names: WildcardMatchers,
    pub transaction_ignore_urls: WildcardMatchers,
    /// Transactions slower than this are captured as traces.
    pub trace_threshold: Duration,
}

impl Default for ConfigValues {
    fn default() -> Self {
        ConfigValues {
            recording: true,
            capture_body: CaptureBodyMode::Off,
            capture_headers: true,
            transaction_max_spans: 500,
            transaction_sample_rate: 1.0,
            stack_trace_limit: 50,
            span_frames_min_duration: Duration::from_millis(5),
            exit_span_min_duration: Duration::ZERO,
            sanitize_field_names: WildcardMatchers::parse(DEFAULT_SANITIZE_FIELD_NAMES),
            transaction_ignore_urls: WildcardMatchers::default(),
            trace_threshold: Duration::from_millis(DEFAULT_TRACE_THRESHOLD_MS),
        }
    }
}

/// Name of a hot-reloadable setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SettingKey {
    Recording,
    CaptureBody,
    CaptureHeaders,
    TransactionMaxSpans,
    TransactionSampleRate,
    StackTraceLimit,
    SpanFramesMinDuration,
    ExitSpanMinDuration,
    SanitizeFieldNames,
    TransactionIgnoreUrls,
    TraceThreshold,
}

impl SettingKey {
    pub const ALL: [SettingKey; 11] = [
        SettingKey::Recording,
        SettingKey::CaptureBody,
        SettingKey::CaptureHeaders,
        SettingKey::TransactionMaxSpans,
        SettingKey::TransactionSampleRate,
        SettingKey::StackTraceLimit,
        SettingKey::SpanFramesMinDuration,
        SettingKey::ExitSpanMinDuration,
        SettingKey::SanitizeFieldNames,
        SettingKey::TransactionIgnoreUrls,
        SettingKey::TraceThreshold,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SettingKey::Recording => "recording",
            SettingKey::CaptureBody => "capture_body",
            SettingKey::CaptureHeaders => "capture_headers",
            SettingKey::TransactionMaxSpans => "transaction_max_spans",
            SettingKey::TransactionSampleRate => "transaction_sample_rate",
            SettingKey::StackTraceLimit => "stack_trace_limit",
            SettingKey::SpanFramesMinDuration => "span_frames_min_duration",
            SettingKey::ExitSpanMinDuration => "exit_span_min_duration",
            SettingKey::SanitizeFieldNames => "sanitize_field_names",
            SettingKey::TransactionIgnoreUrls => "transaction_ignore_urls",
            SettingKey::TraceThreshold => "trace_threshold",
        }
    }

    /// Environment variable the local value of this setting is read from.
    #[must_use]
    pub fn env_var(self) -> String {
        format!("APM_{}", self.as_str().to_ascii_uppercase())
    }

    /// Parses a raw value for this setting.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] or [`ConfigError::OutOfRange`] when the value is invalid.
    pub fn parse_value(self, raw: &str) -> Result<SettingValue, ConfigError> {
        let raw = raw.trim();
        let parse_error = |message: String| ConfigError::Parse {
            key: self.as_str().to_string(),
            message,
        };

        let value = match self {
            SettingKey::Recording => SettingValue::Recording(parse_bool(raw).map_err(parse_error)?),
            SettingKey::CaptureBody => {
                SettingValue::CaptureBody(raw.parse().map_err(parse_error)?)
            }
            SettingKey::CaptureHeaders => {
                SettingValue::CaptureHeaders(parse_bool(raw).map_err(parse_error)?)
            }
            SettingKey::TransactionMaxSpans => SettingValue::TransactionMaxSpans(
                raw.parse()
                    .map_err(|e: std::num::ParseIntError| parse_error(e.to_string()))?,
            ),
            SettingKey::TransactionSampleRate => {
                let rate: f64 = raw
                    .parse()
                    .map_err(|e: std::num::ParseFloatError| parse_error(e.to_string()))?;
                if !(0.0..=1.0).contains(&rate) {
                    return Err(ConfigError::OutOfRange {
                        key: self.as_str().to_string(),
                        value: raw.to_string(),
                        reason: "must be between 0.0 and 1.0".to_string(),
                    });
                }
                SettingValue::TransactionSampleRate(rate)
            }
            SettingKey::StackTraceLimit => SettingValue::StackTraceLimit(
                raw.parse()
                    .map_err(|e: std::num::ParseIntError| parse_error(e.to_string()))?,
            ),
            SettingKey::SpanFramesMinDuration => SettingValue::SpanFramesMinDuration(
                parse_duration(raw, MinimumUnit::Millisecond).map_err(parse_error)?,
            ),
            SettingKey::ExitSpanMinDuration => SettingValue::ExitSpanMinDuration(
                parse_duration(raw, MinimumUnit::Microsecond).map_err(parse_error)?,
            ),
            SettingKey::SanitizeFieldNames => {
                SettingValue::SanitizeFieldNames(WildcardMatchers::parse(raw))
            }
            SettingKey::TransactionIgnoreUrls => {
                SettingValue::TransactionIgnoreUrls(WildcardMatchers::parse(raw))
            }
            SettingKey::TraceThreshold => {
                // A bare number is milliseconds.
                let threshold = match raw.parse::<u64>() {
                    Ok(ms) => Duration::from_millis(ms),
                    Err(_) => parse_duration(raw, MinimumUnit::Millisecond).map_err(parse_error)?,
                };
                SettingValue::TraceThreshold(threshold)
            }
        };
        Ok(value)
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SettingKey::ALL
            .into_iter()
            .find(|key| key.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnsupportedKey(wanted.to_string()))
    }
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    raw.to_ascii_lowercase()
        .parse::<bool>()
        .map_err(|e| format!("{e}: {raw:?}"))
}

/// A parsed value for one setting.
#[derive(Clone, Debug, PartialEq)]
pub enum SettingValue {
    Recording(bool),
    CaptureBody(CaptureBodyMode),
    CaptureHeaders(bool),
    TransactionMaxSpans(usize),
    TransactionSampleRate(f64),
    StackTraceLimit(i64),
    SpanFramesMinDuration(Duration),
    ExitSpanMinDuration(Duration),
    SanitizeFieldNames(WildcardMatchers),
    TransactionIgnoreUrls(WildcardMatchers),
    TraceThreshold(Duration),
}

impl SettingValue {
    /// Captures the current value of `key` from `values`.
    #[must_use]
    pub fn capture(key: SettingKey, values: &ConfigValues) -> Self {
        match key {
            SettingKey::Recording => SettingValue::Recording(values.recording),
            SettingKey::CaptureBody => SettingValue::CaptureBody(values.capture_body),
            SettingKey::CaptureHeaders => SettingValue::CaptureHeaders(values.capture_headers),
            SettingKey::TransactionMaxSpans => {
                SettingValue::TransactionMaxSpans(values.transaction_max_spans)
            }
            SettingKey::TransactionSampleRate => {
                SettingValue::TransactionSampleRate(values.transaction_sample_rate)
            }
            SettingKey::StackTraceLimit => SettingValue::StackTraceLimit(values.stack_trace_limit),
            SettingKey::SpanFramesMinDuration => {
                SettingValue::SpanFramesMinDuration(values.span_frames_min_duration)
            }
            SettingKey::ExitSpanMinDuration => {
                SettingValue::ExitSpanMinDuration(values.exit_span_min_duration)
            }
            SettingKey::SanitizeFieldNames => {
                SettingValue::SanitizeFieldNames(values.sanitize_field_names.clone())
            }
            SettingKey::TransactionIgnoreUrls => {
                SettingValue::TransactionIgnoreUrls(values.transaction_ignore_urls.clone())
            }
            SettingKey::TraceThreshold => SettingValue::TraceThreshold(values.trace_threshold),
        }
    }

    #[must_use]
    pub fn key(&self) -> SettingKey {
        match self {
            SettingValue::Recording(_) => SettingKey::Recording,
            SettingValue::CaptureBody(_) => SettingKey::CaptureBody,
            SettingValue::CaptureHeaders(_) => SettingKey::CaptureHeaders,
            SettingValue::TransactionMaxSpans(_) => SettingKey::TransactionMaxSpans,
            SettingValue::TransactionSampleRate(_) => SettingKey::TransactionSampleRate,
            SettingValue::StackTraceLimit(_) => SettingKey::StackTraceLimit,
            SettingValue::SpanFramesMinDuration(_) => SettingKey::SpanFramesMinDuration,
            SettingValue::ExitSpanMinDuration(_) => SettingKey::ExitSpanMinDuration,
            SettingValue::SanitizeFieldNames(_) => SettingKey::SanitizeFieldNames,
            SettingValue::TransactionIgnoreUrls(_) => SettingKey::TransactionIgnoreUrls,
            SettingValue::TraceThreshold(_) => SettingKey::TraceThreshold,
        }
    }

    pub fn apply(&self, values: &mut ConfigValues) {
        match self {
            SettingValue::Recording(v) => values.recording = *v,
            SettingValue::CaptureBody(v) => values.capture_body = *v,
            SettingValue::CaptureHeaders(v) => values.capture_headers = *v,
            SettingValue::TransactionMaxSpans(v) => values.transaction_max_spans = *v,
            SettingValue::TransactionSampleRate(v) => values.transaction_sample_rate = *v,
            SettingValue::StackTraceLimit(v) => values.stack_trace_limit = *v,
            SettingValue::SpanFramesMinDuration(v) => values.span_frames_min_duration = *v,
            SettingValue::ExitSpanMinDuration(v) => values.exit_span_min_duration = *v,
            SettingValue::SanitizeFieldNames(v) => values.sanitize_field_names = v.clone(),
            SettingValue::TransactionIgnoreUrls(v) => values.transaction_ignore_urls = v.clone(),
            SettingValue::TraceThreshold(v) => values.trace_threshold = *v,
        }
    }
}

/// Closure restoring one setting to its locally resolved value.
pub type LocalReset = Arc<dyn Fn(&mut ConfigValues) + Send + Sync>;

/// Immutable view of the settings at one point in time.
#[derive(Clone)]
pub struct ConfigSnapshot {
    values: ConfigValues,
    local: Arc<HashMap<SettingKey, LocalReset>>,
    remote: HashMap<SettingKey, String>,
}

impl ConfigSnapshot {
    #[must_use]
    pub fn values(&self) -> &ConfigValues {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ConfigValues {
        &mut self.values
    }

    /// Keys whose value currently comes from remote configuration.
    #[must_use]
    pub fn remote_keys(&self) -> BTreeSet<SettingKey> {
        self.remote.keys().copied().collect()
    }

    #[must_use]
    pub fn is_remote(&self, key: SettingKey) -> bool {
        self.remote.contains_key(&key)
    }

    /// Whether transactions for `url` should not be recorded.
    #[must_use]
    pub fn ignored_transaction_url(&self, url: &str) -> bool {
        self.values.transaction_ignore_urls.match_any(url)
    }

    /// Whether the value of a field or header named `name` must be redacted.
    #[must_use]
    pub fn sanitize_field(&self, name: &str) -> bool {
        self.values.sanitize_field_names.match_any(name)
    }
}

impl PartialEq for ConfigSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values && self.remote == other.remote
    }
}

impl fmt::Debug for ConfigSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigSnapshot")
            .field("values", &self.values)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

/// Cloneable handle to the shared settings.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<ArcSwap<ConfigSnapshot>>,
}

impl ConfigStore {
    /// Creates a store whose local reset closures restore every key to its value in `values`.
    #[must_use]
    pub fn new(values: ConfigValues) -> Self {
        let local = SettingKey::ALL
            .into_iter()
            .map(|key| {
                let captured = SettingValue::capture(key, &values);
                let reset: LocalReset = Arc::new(move |v: &mut ConfigValues| captured.apply(v));
                (key, reset)
            })
            .collect();

        ConfigStore {
            inner: Arc::new(ArcSwap::from_pointee(ConfigSnapshot {
                values,
                local: Arc::new(local),
                remote: HashMap::new(),
            })),
        }
    }

    /// Returns the current snapshot. Never blocks.
    #[must_use]
    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.inner.load_full()
    }

    /// Applies `f` to a copy of the current snapshot and publishes it.
    ///
    /// `f` may run more than once when writers race. Returns the snapshot that was replaced.
    pub fn update<F>(&self, mut f: F) -> Arc<ConfigSnapshot>
    where
        F: FnMut(&mut ConfigSnapshot),
    {
        self.inner.rcu(|current| {
            let mut next = ConfigSnapshot::clone(current);
            f(&mut next);
            next
        })
    }

    /// Replaces the local reset closure of `key` and applies it unless `key` is remote-controlled.
    pub fn set_local<F>(&self, key: SettingKey, f: F)
    where
        F: Fn(&mut ConfigValues) + Send + Sync + 'static,
    {
        let reset: LocalReset = Arc::new(f);
        self.update(|snapshot| {
            let mut local = HashMap::clone(&snapshot.local);
            local.insert(key, Arc::clone(&reset));
            snapshot.local = Arc::new(local);
            if !snapshot.remote.contains_key(&key) {
                reset(&mut snapshot.values);
            }
        });
    }

    /// Overlays a remote configuration update.
    ///
    /// Keys that fail to parse are logged and left out of the remote set, so they fall back to their
    /// local value. Keys that were remote before but are missing from `attrs` are reverted. Returns
    /// the rejected keys.
    pub fn apply_remote(&self, attrs: &HashMap<String, String>) -> Vec<ConfigError> {
        let mut rejected = Vec::new();
        let mut accepted: Vec<(SettingValue, String)> = Vec::with_capacity(attrs.len());

        for (name, raw) in attrs {
            let key = match name.parse::<SettingKey>() {
                Ok(key) => key,
                Err(e) => {
                    warn!("CONFIG | ignoring remote setting: {e}");
                    rejected.push(e);
                    continue;
                }
            };
            match key.parse_value(raw) {
                Ok(value) => accepted.push((value, raw.clone())),
                Err(e) => {
                    error!("CONFIG | rejecting remote value for {key}: {e}");
                    rejected.push(e);
                }
            }
        }

        let previous = self.update(|snapshot| {
            let mut remote = HashMap::with_capacity(accepted.len());
            for (value, raw) in &accepted {
                value.apply(&mut snapshot.values);
                remote.insert(value.key(), raw.clone());
            }
            for key in snapshot.remote.keys() {
                if !remote.contains_key(key) {
                    if let Some(reset) = snapshot.local.get(key) {
                        reset(&mut snapshot.values);
                    }
                }
            }
            snapshot.remote = remote;
        });

        for key in previous.remote_keys() {
            if !accepted.iter().any(|(value, _)| value.key() == key) {
                debug!("CONFIG | {key} reverted to its local value");
            }
        }
        rejected
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        ConfigStore::new(ConfigValues::default())
    }
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConfigStore").field(&self.load()).finish()
    }
}
