// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsing of human-written durations such as `500us`, `5ms`, `2s` or `1m`.

use std::time::Duration;

/// Smallest unit a duration setting accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MinimumUnit {
    Microsecond,
    Millisecond,
}

/// Parses a duration with a mandatory unit suffix (`us`, `ms`, `s`, `m`).
///
/// Units smaller than `minimum` are rejected.
pub fn parse_duration(value: &str, minimum: MinimumUnit) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration {value:?} (allowed: ms, s, m)"))?;
    let (digits, unit) = value.split_at(split);
    if digits.is_empty() {
        return Err(format!("invalid duration {value:?}"));
    }
    let amount: u64 = digits
        .parse()
        .map_err(|e| format!("invalid duration {value:?}: {e}"))?;

    match unit.to_ascii_lowercase().as_str() {
        "us" if minimum == MinimumUnit::Microsecond => Ok(Duration::from_micros(amount)),
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount.saturating_mul(60))),
        other => Err(format!("invalid unit {other:?} in duration {value:?}")),
    }
}
