// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod analytics;
pub mod batch;
pub mod error;
pub mod layer;
pub mod request;
pub mod trace;

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, zero for times before it.
#[must_use]
pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
