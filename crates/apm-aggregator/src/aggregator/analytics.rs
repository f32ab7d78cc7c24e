// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction analytics records and their size-bounded chunking.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::aggregator::layer::duration_ms;
use crate::aggregator::request::default_port;
use crate::aggregator::unix_millis;
use crate::config::store::ConfigValues;
use crate::constants::{MAX_REQUEST_BODY_CHARS, REDACTED};
use crate::model::{Header, RequestUrl, TransactionFinished};

// Fixed overhead of the non-string fields of a record.
const TIMESTAMP_SIZE: usize = 8;
const NUMBER_SIZE: usize = 4;
const NUMERIC_FIELDS: usize = 5;
const STATUS_CODE_SIZE: usize = 2;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    pub timestamp: i64,
    pub txn_id: String,
    pub trace_id: String,
    pub name: String,
    pub duration: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub request_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_body: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub response_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_email: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_data: BTreeMap<String, serde_json::Value>,
    /// Approximate serialized size in bytes.
    #[serde(skip)]
    pub size: usize,
}

impl AnalyticsRecord {
    pub fn build(event: &TransactionFinished, values: &ConfigValues) -> Self {
        let (request_headers, response_headers) = if values.capture_headers {
            (
                first_values(&event.request.headers, values),
                first_values(&event.response.headers, values),
            )
        } else {
            (BTreeMap::new(), BTreeMap::new())
        };

        let user_agent = event
            .request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
            .and_then(|(_, values)| values.first().cloned())
            .unwrap_or_default();

        let request_body = match &event.request.body {
            Some(body) if values.capture_body.captures_transactions() => {
                body.chars().take(MAX_REQUEST_BODY_CHARS).collect()
            }
            _ => String::new(),
        };

        let mut record = AnalyticsRecord {
            timestamp: unix_millis(event.timestamp),
            txn_id: event.transaction_id.clone(),
            trace_id: event.trace_id.clone(),
            name: event.key.name.clone(),
            duration: duration_ms(event.duration),
            status_code: Some(event.response.status_code).filter(|c| *c != 0),
            method: event.request.method.clone(),
            url: reconstruct_url(&event.request.url),
            user_agent,
            ip: event.request.remote_address.clone().unwrap_or_default(),
            request_headers,
            request_body,
            response_headers,
            user_id: event.user.id.clone(),
            user_name: event.user.username.clone(),
            user_email: event.user.email.clone(),
            custom_data: event.custom_data.clone(),
            size: 0,
        };
        record.size = record.approximate_size();
        record
    }

    /// Structural overhead plus the length of every string field, header and custom-data entry.
    #[must_use]
    pub fn approximate_size(&self) -> usize {
        let strings = [
            &self.txn_id,
            &self.trace_id,
            &self.name,
            &self.method,
            &self.url,
            &self.user_agent,
            &self.ip,
            &self.request_body,
            &self.user_id,
        ]
        .iter()
        .map(|s| s.len())
        .sum::<usize>();

        let headers = self
            .request_headers
            .iter()
            .chain(self.response_headers.iter())
            .map(|(k, v)| k.len() + v.len())
            .sum::<usize>();

        let custom = self
            .custom_data
            .iter()
            .map(|(k, v)| {
                k.len()
                    + match v {
                        serde_json::Value::String(s) => s.len(),
                        _ => NUMBER_SIZE,
                    }
            })
            .sum::<usize>();

        TIMESTAMP_SIZE + NUMBER_SIZE * NUMERIC_FIELDS + STATUS_CODE_SIZE + strings + headers + custom
    }
}

/// First value of each header, the first occurrence of a name winning. Sanitized names are redacted.
fn first_values(headers: &[Header], values: &ConfigValues) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, header_values) in headers {
        let Some(first) = header_values.first() else {
            continue;
        };
        let value = if values.sanitize_field_names.match_any(name) {
            REDACTED.to_string()
        } else {
            first.clone()
        };
        out.entry(name.clone()).or_insert(value);
    }
    out
}

/// Rebuilds the request URL, leaving out the port when it is the scheme default.
#[must_use]
pub fn reconstruct_url(url: &RequestUrl) -> String {
    let mut out = String::new();
    if !url.protocol.is_empty() {
        out.push_str(&url.protocol);
        out.push_str("://");
    }
    out.push_str(&url.hostname);

    if let Some(port) = url.port.as_deref().filter(|p| !p.is_empty()) {
        let is_default = port
            .parse::<u16>()
            .ok()
            .zip(default_port(&url.protocol))
            .is_some_and(|(port, default)| port == default);
        if !is_default {
            out.push(':');
            out.push_str(port);
        }
    }

    out.push_str(&url.path);
    let search = url.search.trim_start_matches('?');
    if !search.is_empty() {
        out.push('?');
        out.push_str(search);
    }
    let hash = url.hash.trim_start_matches('#');
    if !hash.is_empty() {
        out.push('#');
        out.push_str(hash);
    }
    out
}

/// Splits `records` into consecutive chunks whose summed size stays below `max_bytes`.
///
/// Records are accumulated greedily; once adding the next record would reach `max_bytes` the current
/// chunk is closed and a new one starts with that record. A single record at or over the ceiling is
/// sent on its own.
#[must_use]
pub fn chunk_by_size(records: &[AnalyticsRecord], max_bytes: usize) -> Vec<&[AnalyticsRecord]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut total = 0;

    for (i, record) in records.iter().enumerate() {
        total += record.size;
        if total >= max_bytes {
            if start < i {
                chunks.push(&records[start..i]);
            }
            start = i;
            total = record.size;
        }
    }
    if start < records.len() {
        chunks.push(&records[start..]);
    }
    chunks
}
