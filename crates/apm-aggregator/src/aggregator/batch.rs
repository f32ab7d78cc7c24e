// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-window accumulator.
//!
//! A [`WindowBatch`] is owned by the coordinator task and mutated only there. When a flush tick
//! fires the batch is swapped for an empty one and the closed batch is handed to the flusher
//! unchanged.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use tracing::debug;

use crate::aggregator::analytics::AnalyticsRecord;
use crate::aggregator::error::ErrorRecord;
use crate::aggregator::layer::{duration_ms, Layer, LayerKey, TransactionAggregate};
use crate::aggregator::request::RequestSummary;
use crate::aggregator::trace::{TraceRecord, TraceSelector};
use crate::config::store::ConfigValues;
use crate::constants::{
    MAX_ANALYTICS_RECORDS, MAX_ERRORS, MAX_ERROR_REQUESTS, MAX_METRICS_SNAPSHOTS,
};
use crate::model::{
    ErrorCaptured, MetricsSnapshot, SpanFinished, TransactionFinished, TransactionKey,
};

/// A sampled request of a failed transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorRequest {
    pub key: TransactionKey,
    pub request: RequestSummary,
}

/// Counts of what a batch currently holds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub transactions: usize,
    pub pending_spans: usize,
    pub traces: usize,
    pub errors: usize,
    pub error_metrics: usize,
    pub error_requests: usize,
    pub analytics: usize,
    pub metrics: usize,
}

#[derive(Debug)]
pub struct WindowBatch {
    begin: SystemTime,
    pub(crate) transactions: HashMap<TransactionKey, TransactionAggregate>,
    pending_spans: HashMap<String, Vec<SpanFinished>>,
    pub(crate) traces: TraceSelector,
    pub(crate) errors: Vec<ErrorRecord>,
    pub(crate) error_metrics: HashMap<TransactionKey, BTreeMap<u16, u64>>,
    pub(crate) error_requests: Vec<ErrorRequest>,
    pub(crate) analytics: Vec<AnalyticsRecord>,
    pub(crate) metrics: Vec<BTreeMap<String, f64>>,
}

impl Default for WindowBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl WindowBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    #[must_use]
    pub fn starting_at(begin: SystemTime) -> Self {
        WindowBatch {
            begin,
            transactions: HashMap::new(),
            pending_spans: HashMap::new(),
            traces: TraceSelector::default(),
            errors: Vec::new(),
            error_metrics: HashMap::new(),
            error_requests: Vec::new(),
            analytics: Vec::new(),
            metrics: Vec::new(),
        }
    }

    #[must_use]
    pub fn begin(&self) -> SystemTime {
        self.begin
    }

    /// Buffers a span until its transaction finishes. Spans without a transaction id are dropped.
    pub fn add_span(&mut self, span: SpanFinished) {
        if span.transaction_id.is_empty() {
            debug!("AGGREGATOR | dropping span {:?} without a transaction id", span.name);
            return;
        }
        self.pending_spans
            .entry(span.transaction_id.clone())
            .or_default()
            .push(span);
    }

    /// Rolls a finished transaction into the window.
    ///
    /// `analytics` is true when the feature is both enabled by the collector and opted into locally.
    pub fn add_transaction(
        &mut self,
        event: &TransactionFinished,
        values: &ConfigValues,
        analytics: bool,
    ) {
        let duration = duration_ms(event.duration);
        let request = RequestSummary::build(&event.request, &event.response);
        let spans = self
            .pending_spans
            .remove(&event.transaction_id)
            .unwrap_or_default();

        let mut aggregate = TransactionAggregate::new(duration);
        for span in &spans {
            aggregate.add_layer(LayerKey::from_span(span), Layer::single(duration_ms(span.duration)));
        }
        aggregate.derive_runtime_layer(&event.key.txn_type);

        match self.transactions.get_mut(&event.key) {
            Some(existing) => existing.merge(aggregate),
            None => {
                self.transactions.insert(event.key.clone(), aggregate);
            }
        }

        if duration > duration_ms(values.trace_threshold) {
            self.traces
                .insert(TraceRecord::build(event, &spans, request.clone()));
        }

        if analytics {
            if self.analytics.len() < MAX_ANALYTICS_RECORDS {
                self.analytics.push(AnalyticsRecord::build(event, values));
            } else {
                debug!("AGGREGATOR | analytics capacity reached, dropping record");
            }
        }

        let status = event.response.status_code;
        if status >= 400 && status != 404 {
            *self
                .error_metrics
                .entry(event.key.clone())
                .or_default()
                .entry(status)
                .or_default() += 1;

            if self.error_requests.len() < MAX_ERROR_REQUESTS {
                self.error_requests.push(ErrorRequest {
                    key: event.key.clone(),
                    request,
                });
            } else {
                debug!("AGGREGATOR | error request capacity reached, dropping sample");
            }
        }
    }

    pub fn add_error(&mut self, event: &ErrorCaptured, values: &ConfigValues) {
        if self.errors.len() < MAX_ERRORS {
            self.errors
                .push(ErrorRecord::build(event, values.stack_trace_limit));
        } else {
            debug!("AGGREGATOR | error capacity reached, dropping error");
        }
    }

    /// Flattens the sample sets of a snapshot into one map and keeps it.
    pub fn add_metrics(&mut self, snapshot: MetricsSnapshot) {
        if self.metrics.len() >= MAX_METRICS_SNAPSHOTS {
            debug!("AGGREGATOR | metrics capacity reached, dropping snapshot");
            return;
        }
        let flattened = snapshot.sets.into_iter().flatten().collect();
        self.metrics.push(flattened);
    }

    #[must_use]
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            transactions: self.transactions.len(),
            pending_spans: self.pending_spans.values().map(Vec::len).sum(),
            traces: self.traces.len(),
            errors: self.errors.len(),
            error_metrics: self.error_metrics.len(),
            error_requests: self.error_requests.len(),
            analytics: self.analytics.len(),
            metrics: self.metrics.len(),
        }
    }

    /// Whether the window holds anything worth sending. Buffered spans do not count.
    #[must_use]
    pub fn has_data(&self) -> bool {
        !self.transactions.is_empty()
            || !self.traces.is_empty()
            || !self.errors.is_empty()
            || !self.error_metrics.is_empty()
            || !self.analytics.is_empty()
            || !self.metrics.is_empty()
    }

    #[must_use]
    pub fn transactions(&self) -> &HashMap<TransactionKey, TransactionAggregate> {
        &self.transactions
    }

    #[must_use]
    pub fn traces(&self) -> &TraceSelector {
        &self.traces
    }

    #[must_use]
    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    #[must_use]
    pub fn error_metrics(&self) -> &HashMap<TransactionKey, BTreeMap<u16, u64>> {
        &self.error_metrics
    }

    #[must_use]
    pub fn error_requests(&self) -> &[ErrorRequest] {
        &self.error_requests
    }

    #[must_use]
    pub fn analytics(&self) -> &[AnalyticsRecord] {
        &self.analytics
    }

    #[must_use]
    pub fn metrics(&self) -> &[BTreeMap<String, f64>] {
        &self.metrics
    }
}
