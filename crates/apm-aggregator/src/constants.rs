// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Capacity limits and defaults shared by the aggregation pipeline.

use std::time::Duration;

/// Maximum number of captured errors retained per window.
pub const MAX_ERRORS: usize = 20;

/// Maximum number of sampled HTTP failure requests retained per window, across all keys.
pub const MAX_ERROR_REQUESTS: usize = 20;

/// Maximum number of metrics snapshots retained per window.
pub const MAX_METRICS_SNAPSHOTS: usize = 20;

/// Maximum number of analytics records retained per window.
pub const MAX_ANALYTICS_RECORDS: usize = 10_000;

/// Capacity of the deduplicated primary trace set of each traffic class.
pub const PRIMARY_TRACE_CAPACITY: usize = 5;

/// Capacity of the secondary trace set of each traffic class.
pub const SECONDARY_TRACE_CAPACITY: usize = 4;

/// Number of traces the flush selection aims to send per window.
pub const TRACES_PER_FLUSH: usize = 5;

/// Default trace capture threshold in milliseconds.
pub const DEFAULT_TRACE_THRESHOLD_MS: u64 = 2000;

/// Ceiling for the cumulative approximate size of one analytics payload (6 MiB).
pub const DEFAULT_ANALYTICS_PAYLOAD_MAX_BYTES: usize = 6 * 1024 * 1024;

/// Maximum number of characters of a request body kept on an analytics record.
pub const MAX_REQUEST_BODY_CHARS: usize = 1024;

/// Default flush tick period.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Host-info is exchanged every this many ticks (tick 0 included).
pub const DEFAULT_HOSTINFO_INTERVAL_TICKS: u64 = 30;

/// Consecutive idle ticks after which the coordinator reports itself inactive.
pub const ACTIVE_IDLE_TICKS: u64 = 3600 / 30;

/// Default per-request timeout for collector calls.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default capacity of each producer queue.
///
/// Producers wait once a queue holds this many events.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1000;

/// Default collector base URL.
pub const DEFAULT_NOTIFY_HOST: &str = "http://localhost:8200";

/// Value written in place of sanitized header values.
pub const REDACTED: &str = "[REDACTED]";
