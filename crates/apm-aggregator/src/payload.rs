// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! JSON bodies sent to, and received from, the collector.
//!
//! Every request body starts with the shared [`Header`]. Window payloads add the start and end of the
//! window in Unix milliseconds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregator::analytics::AnalyticsRecord;
use crate::aggregator::batch::ErrorRequest;
use crate::aggregator::error::ErrorRecord;
use crate::aggregator::layer::{Layer, LayerKey, TransactionAggregate};
use crate::aggregator::request::RequestSummary;
use crate::aggregator::trace::TraceRecord;
use crate::config::Config;
use crate::host::HostIdentity;
use crate::model::TransactionKey;
use crate::{AGENT_NAME, AGENT_VERSION};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// Identity shared by every payload of a flush.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub agent: AgentInfo,
    pub hostname: String,
    pub unique_hostname: String,
    pub container_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "version", skip_serializing_if = "String::is_empty")]
    pub app_version: String,
    #[serde(rename = "releaseStage", skip_serializing_if = "String::is_empty")]
    pub environment: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app_name: String,
}

impl Header {
    #[must_use]
    pub fn new(config: &Config, host: &HostIdentity) -> Self {
        Header {
            agent: AgentInfo {
                name: AGENT_NAME,
                version: AGENT_VERSION,
            },
            hostname: config
                .hostname
                .clone()
                .unwrap_or_else(|| host.hostname.clone()),
            unique_hostname: host.unique_host_id().to_string(),
            container_id: host.container_id.clone(),
            tags: config.tags.clone(),
            app_version: config.app_version.clone(),
            environment: config.environment.clone(),
            app_name: config.app_name.clone(),
        }
    }
}

/// Start and end of the flushed window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Window {
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostEnvironment {
    pub host_details: BTreeMap<String, String>,
    pub settings: BTreeMap<&'static str, serde_json::Value>,
    pub libraries: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct HostInfoPayload<'a> {
    #[serde(flatten)]
    pub header: &'a Header,
    pub timestamp: i64,
    pub language: &'static str,
    pub environment: HostEnvironment,
    pub active: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload<'a> {
    #[serde(flatten)]
    pub header: &'a Header,
    pub errors: &'a [ErrorRecord],
}

/// A layer in wire form: identity plus `[count, sum, min, max]`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LayerMetric<'a> {
    pub name: &'a str,
    #[serde(rename = "type")]
    pub layer_type: &'a str,
    pub kind: &'a str,
    pub background: bool,
    pub durations: [f64; 4],
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionMetric<'a> {
    #[serde(flatten)]
    pub root: LayerMetric<'a>,
    #[serde(rename = "traces")]
    pub layers: Vec<LayerMetric<'a>>,
}

impl<'a> TransactionMetric<'a> {
    #[must_use]
    pub fn new(key: &'a TransactionKey, aggregate: &'a TransactionAggregate) -> Self {
        let mut layers: Vec<(&LayerKey, &Layer)> = aggregate.layers.iter().collect();
        layers.sort_by(|a, b| a.0.cmp(b.0));
        TransactionMetric {
            root: LayerMetric {
                name: &key.name,
                layer_type: &key.txn_type,
                kind: &key.kind,
                background: key.background,
                durations: durations(&aggregate.root),
            },
            layers: layers
                .into_iter()
                .map(|(k, l)| LayerMetric {
                    name: &k.name,
                    layer_type: &k.layer_type,
                    kind: &k.kind,
                    background: false,
                    durations: durations(l),
                })
                .collect(),
        }
    }
}

fn durations(layer: &Layer) -> [f64; 4] {
    #[allow(clippy::cast_precision_loss)]
    let count = layer.count as f64;
    [count, layer.sum, layer.min, layer.max]
}

#[derive(Debug, Serialize)]
pub struct TransactionPayload<'a> {
    #[serde(flatten)]
    pub header: &'a Header,
    #[serde(flatten)]
    pub window: Window,
    pub transactions: Vec<TransactionMetric<'a>>,
}

#[derive(Debug, Serialize)]
pub struct AnalyticsPayload<'a> {
    #[serde(flatten)]
    pub header: &'a Header,
    #[serde(flatten)]
    pub window: Window,
    pub requests: &'a [AnalyticsRecord],
}

/// Carries exactly one trace.
#[derive(Debug, Serialize)]
pub struct TracePayload<'a> {
    #[serde(flatten)]
    pub header: &'a Header,
    #[serde(flatten)]
    pub window: Window,
    pub traces: [&'a TraceRecord; 1],
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetric<'a> {
    pub name: &'a str,
    #[serde(rename = "type")]
    pub txn_type: &'a str,
    pub kind: &'a str,
    pub background: bool,
    pub status_codes: BTreeMap<String, u64>,
}

impl<'a> ErrorMetric<'a> {
    #[must_use]
    pub fn new(key: &'a TransactionKey, counts: &BTreeMap<u16, u64>) -> Self {
        ErrorMetric {
            name: &key.name,
            txn_type: &key.txn_type,
            kind: &key.kind,
            background: key.background,
            status_codes: counts
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorRequestRecord<'a> {
    pub name: &'a str,
    #[serde(rename = "type")]
    pub txn_type: &'a str,
    pub kind: &'a str,
    pub background: bool,
    pub request: &'a RequestSummary,
}

impl<'a> From<&'a ErrorRequest> for ErrorRequestRecord<'a> {
    fn from(sample: &'a ErrorRequest) -> Self {
        ErrorRequestRecord {
            name: &sample.key.name,
            txn_type: &sample.key.txn_type,
            kind: &sample.key.kind,
            background: sample.key.background,
            request: &sample.request,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMetricPayload<'a> {
    #[serde(flatten)]
    pub header: &'a Header,
    #[serde(flatten)]
    pub window: Window,
    pub error_metrics: Vec<ErrorMetric<'a>>,
    pub error_requests: Vec<ErrorRequestRecord<'a>>,
}

#[derive(Debug, Serialize)]
pub struct MetricsPayload<'a> {
    #[serde(flatten)]
    pub header: &'a Header,
    #[serde(flatten)]
    pub window: Window,
    #[serde(rename = "rust")]
    pub metrics: &'a [BTreeMap<String, f64>],
}

/// Body of a 400 response from any collector path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlockedResponse {
    pub blocked: bool,
    pub error_message: String,
    pub error_code: String,
}

/// Body of a 200 response from the host-info path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostInfoResponse {
    pub analytics: bool,
    pub capture_percentiles: bool,
}
