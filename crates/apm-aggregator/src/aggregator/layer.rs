// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Duration rollups for transactions and their child layers.

use std::collections::HashMap;
use std::time::Duration;

use crate::model::SpanFinished;
use crate::AGENT_LANGUAGE;

/// Identity of a child layer within a transaction breakdown.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerKey {
    pub name: String,
    pub layer_type: String,
    pub kind: String,
}

impl LayerKey {
    pub fn new(
        name: impl Into<String>,
        layer_type: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            layer_type: layer_type.into(),
            kind: kind.into(),
        }
    }

    /// Key of a span, with subtype and type mapped to their display forms.
    #[must_use]
    pub fn from_span(span: &SpanFinished) -> Self {
        Self::new(
            span.name.clone(),
            display_span_type(&span.subtype),
            display_span_kind(&span.span_type),
        )
    }
}

/// Aggregated duration statistics in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Layer {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Layer {
    /// A layer holding a single observation.
    #[must_use]
    pub fn single(duration_ms: f64) -> Self {
        Self {
            count: 1,
            sum: duration_ms,
            min: duration_ms,
            max: duration_ms,
        }
    }

    /// Sums counts and durations, keeps the smallest min and the largest max.
    pub fn merge(&mut self, other: &Layer) {
        self.count += other.count;
        self.sum += other.sum;
        if other.min < self.min {
            self.min = other.min;
        }
        if other.max > self.max {
            self.max = other.max;
        }
    }
}

/// A transaction root layer with its one-level breakdown.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionAggregate {
    pub root: Layer,
    pub layers: HashMap<LayerKey, Layer>,
}

impl TransactionAggregate {
    #[must_use]
    pub fn new(duration_ms: f64) -> Self {
        Self {
            root: Layer::single(duration_ms),
            layers: HashMap::new(),
        }
    }

    /// Inserts an unseen layer as is, merges into a seen one.
    pub fn add_layer(&mut self, key: LayerKey, layer: Layer) {
        self.layers
            .entry(key)
            .and_modify(|existing| existing.merge(&layer))
            .or_insert(layer);
    }

    pub fn merge(&mut self, other: TransactionAggregate) {
        self.root.merge(&other.root);
        for (key, layer) in other.layers {
            self.add_layer(key, layer);
        }
    }

    /// Attributes time not covered by child layers to a runtime layer named after `txn_type`.
    ///
    /// Nothing is added when the children already account for the whole duration, even when they
    /// exceed it.
    pub fn derive_runtime_layer(&mut self, txn_type: &str) {
        let accounted: f64 = self.layers.values().map(|l| l.sum).sum();
        let total = self.root.sum;
        if total > accounted {
            self.add_layer(
                LayerKey::new(txn_type, AGENT_LANGUAGE, AGENT_LANGUAGE),
                Layer::single(round_three_decimals(total - accounted)),
            );
        }
    }
}

/// Milliseconds with microsecond precision. Negative durations cannot occur with [`Duration`].
#[must_use]
pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

/// Rounds half up to three decimal places.
#[must_use]
pub fn round_three_decimals(value: f64) -> f64 {
    let scaled = value * 1000.0;
    let rounded = if scaled.fract() >= 0.5 {
        scaled.ceil()
    } else {
        scaled.floor()
    };
    rounded / 1000.0
}

/// Maps a span subtype to the name shown for its layer type.
#[must_use]
pub fn display_span_type(subtype: &str) -> String {
    let mapped = match subtype.to_ascii_lowercase().as_str() {
        "sql" => "SQL",
        "mysql" => "MySQL",
        "postgresql" => "Postgres",
        "mssql" => "MS SQL",
        "mongodb" => "MongoDB",
        "redis" => "Redis",
        "graphql" => "GraphQL",
        "elasticsearch" => "Elasticsearch",
        "cassandra" => "Cassandra",
        "sqlite" => "SQLite",
        "sqlite3" => "SQLite3",
        "http" | "https" | "http2" => "External Requests",
        _ => return subtype.to_string(),
    };
    mapped.to_string()
}

/// Maps a span type to the kind shown for its layer.
#[must_use]
pub fn display_span_kind(span_type: &str) -> String {
    let mapped = match span_type.to_ascii_lowercase().as_str() {
        "db" | "cache" => "Database",
        "ext" | "external" | "websocket" => "Remote",
        "template" => "Template",
        _ => return span_type.to_string(),
    };
    mapped.to_string()
}
