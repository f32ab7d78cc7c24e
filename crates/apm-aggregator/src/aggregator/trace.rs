// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Slow-trace exemplars and the bounded, duration-ranked structures that retain them.
//!
//! Each traffic class (foreground and background) has a primary [`TraceSet`] of five records,
//! deduplicated by [`TransactionKey`], and a secondary set of four records without deduplication.
//! A record only reaches the secondary set when its key is already in the primary set and the
//! primary set still has room, so in steady state the secondary set is rarely populated.

use std::collections::HashMap;
use std::time::SystemTime;

use fnv::FnvHashMap;
use serde::Serialize;

use crate::aggregator::layer::{duration_ms, LayerKey};
use crate::aggregator::request::RequestSummary;
use crate::aggregator::unix_millis;
use crate::constants::{PRIMARY_TRACE_CAPACITY, SECONDARY_TRACE_CAPACITY, TRACES_PER_FLUSH};
use crate::model::{SpanFinished, TransactionFinished, TransactionKey};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryLayer {
    pub name: String,
    #[serde(rename = "type")]
    pub layer_type: String,
    pub kind: String,
    pub background: bool,
}

/// One span on a trace timeline. All entries sit at level 1.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceEntry {
    /// Index into [`TraceRecord::funcs`].
    #[serde(rename = "i")]
    pub func_index: usize,
    #[serde(rename = "lv")]
    pub level: u32,
    /// Milliseconds between the transaction start and the span start.
    #[serde(rename = "so")]
    pub start_offset: f64,
    #[serde(rename = "du")]
    pub duration: f64,
    #[serde(rename = "ly")]
    pub layer: EntryLayer,
    #[serde(rename = "dt", skip_serializing_if = "Option::is_none")]
    pub data: Option<HashMap<&'static str, String>>,
}

/// A captured exemplar of one slow transaction.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TraceRecord {
    #[serde(skip)]
    pub key: TransactionKey,
    pub name: String,
    #[serde(rename = "type")]
    pub txn_type: String,
    pub kind: String,
    pub background: bool,
    #[serde(rename = "start")]
    pub start_time: i64,
    pub duration: f64,
    pub request: RequestSummary,
    pub entries: Vec<TraceEntry>,
    pub funcs: Vec<String>,
    pub partial: bool,
}

impl TraceRecord {
    /// Builds a trace from a finished transaction and the spans buffered for it.
    pub fn build(
        event: &TransactionFinished,
        spans: &[SpanFinished],
        request: RequestSummary,
    ) -> Self {
        let mut funcs: Vec<String> = Vec::new();
        let mut func_index: FnvHashMap<&str, usize> = FnvHashMap::default();

        let entries = spans
            .iter()
            .map(|span| {
                let index = *func_index.entry(span.name.as_str()).or_insert_with(|| {
                    funcs.push(span.name.clone());
                    funcs.len() - 1
                });

                // Spans reported as starting before the transaction keep a zero offset.
                let start_offset = span
                    .timestamp
                    .duration_since(event.timestamp)
                    .map(duration_ms)
                    .unwrap_or(0.0);

                let layer = LayerKey::from_span(span);
                TraceEntry {
                    func_index: index,
                    level: 1,
                    start_offset,
                    duration: duration_ms(span.duration),
                    layer: EntryLayer {
                        name: layer.name,
                        layer_type: layer.layer_type,
                        kind: layer.kind,
                        background: false,
                    },
                    data: span.database.as_ref().map(|db| {
                        HashMap::from([
                            ("query", db.statement.clone()),
                            ("type", db.db_type.clone()),
                            ("user", db.user.clone()),
                        ])
                    }),
                }
            })
            .collect();

        TraceRecord {
            key: event.key.clone(),
            name: event.key.name.clone(),
            txn_type: event.key.txn_type.clone(),
            kind: event.key.kind.clone(),
            background: event.key.background,
            start_time: unix_millis(event.timestamp),
            duration: duration_ms(event.duration),
            request,
            entries,
            funcs,
            partial: false,
        }
    }

    /// Start of the transaction, for callers holding only the record.
    #[must_use]
    pub fn started_at(&self) -> SystemTime {
        let millis = u64::try_from(self.start_time).unwrap_or_default();
        SystemTime::UNIX_EPOCH + std::time::Duration::from_millis(millis)
    }
}

/// Capacity-bounded collection of traces ranked by duration.
#[derive(Clone, Debug)]
pub struct TraceSet {
    capacity: usize,
    unique: bool,
    traces: Vec<TraceRecord>,
    index: HashMap<TransactionKey, usize>,
    lowest_duration: f64,
    lowest_index: usize,
}

impl TraceSet {
    #[must_use]
    pub fn new(capacity: usize, unique: bool) -> Self {
        Self {
            capacity,
            unique,
            traces: Vec::with_capacity(capacity),
            index: HashMap::new(),
            lowest_duration: 0.0,
            lowest_index: 0,
        }
    }

    /// Bounded insert.
    ///
    /// Below capacity the record is appended. At capacity it replaces the current minimum when its
    /// duration is strictly greater, and is discarded otherwise.
    pub fn insert(&mut self, trace: TraceRecord) {
        if self.traces.len() < self.capacity {
            if self.traces.is_empty() {
                self.lowest_duration = trace.duration;
                self.lowest_index = 0;
            }
            if self.unique {
                self.index.insert(trace.key.clone(), self.traces.len());
            }
            if trace.duration < self.lowest_duration {
                self.lowest_duration = trace.duration;
                self.lowest_index = self.traces.len();
            }
            self.traces.push(trace);
            return;
        }

        if trace.duration <= self.lowest_duration {
            return;
        }

        let slot = self.lowest_index;
        if self.unique {
            self.index.remove(&self.traces[slot].key);
            self.index.insert(trace.key.clone(), slot);
        }
        self.traces[slot] = trace;
        self.rescan_lowest();
    }

    /// Replaces the record stored for `key` when `trace` is strictly slower.
    fn replace_if_slower(&mut self, key: &TransactionKey, trace: TraceRecord) {
        let Some(&slot) = self.index.get(key) else {
            return;
        };
        if trace.duration > self.traces[slot].duration {
            self.traces[slot] = trace;
            self.rescan_lowest();
        }
    }

    fn rescan_lowest(&mut self) {
        if let Some((i, trace)) = self
            .traces
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.duration.total_cmp(&b.duration))
        {
            self.lowest_duration = trace.duration;
            self.lowest_index = i;
        }
    }

    #[must_use]
    pub fn contains_key(&self, key: &TransactionKey) -> bool {
        self.index.contains_key(key)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.traces.len() >= self.capacity
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    /// Current minimum duration and its slot, if any record is stored.
    #[must_use]
    pub fn lowest(&self) -> Option<(f64, usize)> {
        (!self.traces.is_empty()).then_some((self.lowest_duration, self.lowest_index))
    }

    #[must_use]
    pub fn traces(&self) -> &[TraceRecord] {
        &self.traces
    }

    /// Records sorted by duration, slowest first.
    fn into_sorted_desc(self) -> Vec<TraceRecord> {
        let mut traces = self.traces;
        traces.sort_by(|a, b| b.duration.total_cmp(&a.duration));
        traces
    }
}

#[derive(Clone, Debug)]
struct TrafficClass {
    primary: TraceSet,
    secondary: TraceSet,
}

impl TrafficClass {
    fn new() -> Self {
        Self {
            primary: TraceSet::new(PRIMARY_TRACE_CAPACITY, true),
            secondary: TraceSet::new(SECONDARY_TRACE_CAPACITY, false),
        }
    }

    fn insert(&mut self, trace: TraceRecord) {
        if !self.primary.contains_key(&trace.key) {
            self.primary.insert(trace);
        } else if !self.primary.is_full() {
            self.secondary.insert(trace);
        } else {
            let key = trace.key.clone();
            self.primary.replace_if_slower(&key, trace);
        }
    }

    fn len(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }
}

/// Foreground and background trace retention for one window.
#[derive(Clone, Debug)]
pub struct TraceSelector {
    foreground: TrafficClass,
    background: TrafficClass,
}

impl Default for TraceSelector {
    fn default() -> Self {
        Self {
            foreground: TrafficClass::new(),
            background: TrafficClass::new(),
        }
    }
}

impl TraceSelector {
    pub fn insert(&mut self, trace: TraceRecord) {
        if trace.key.background {
            self.background.insert(trace);
        } else {
            self.foreground.insert(trace);
        }
    }

    /// Number of records held across all four sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.foreground.len() + self.background.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn foreground_primary(&self) -> &TraceSet {
        &self.foreground.primary
    }

    #[must_use]
    pub fn foreground_secondary(&self) -> &TraceSet {
        &self.foreground.secondary
    }

    #[must_use]
    pub fn background_primary(&self) -> &TraceSet {
        &self.background.primary
    }

    #[must_use]
    pub fn background_secondary(&self) -> &TraceSet {
        &self.background.secondary
    }

    /// Picks the traces to send for this window.
    ///
    /// Every foreground primary record is taken, even beyond the target. Any shortfall below the
    /// target is backfilled, slowest first, from the foreground secondary set, then the background
    /// primary set, then the background secondary set.
    #[must_use]
    pub fn select(self) -> Vec<TraceRecord> {
        let mut selected = self.foreground.primary.traces;
        for source in [
            self.foreground.secondary,
            self.background.primary,
            self.background.secondary,
        ] {
            let shortfall = TRACES_PER_FLUSH.saturating_sub(selected.len());
            if shortfall == 0 {
                break;
            }
            selected.extend(source.into_sorted_desc().into_iter().take(shortfall));
        }
        selected
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DatabaseContext, HttpRequest, HttpResponse, UserIdentity};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn trace(name: &str, duration: f64, background: bool) -> TraceRecord {
        TraceRecord {
            key: TransactionKey::new(name, "request", "Rust", background),
            name: name.to_string(),
            txn_type: "request".to_string(),
            kind: "Rust".to_string(),
            background,
            start_time: 0,
            duration,
            request: RequestSummary::default(),
            entries: vec![],
            funcs: vec![],
            partial: false,
        }
    }

    fn durations(traces: &[TraceRecord]) -> Vec<f64> {
        traces.iter().map(|t| t.duration).collect()
    }

    #[test]
    fn test_bounded_insert_tracks_and_evicts_minimum() {
        let mut set = TraceSet::new(5, true);
        for (i, d) in [50.0, 70.0, 20.0, 90.0, 10.0].into_iter().enumerate() {
            set.insert(trace(&format!("t{i}"), d, false));
        }
        assert_eq!(set.lowest(), Some((10.0, 4)));

        set.insert(trace("t5", 60.0, false));
        assert_eq!(durations(set.traces()), vec![50.0, 70.0, 20.0, 90.0, 60.0]);
        assert_eq!(set.lowest(), Some((20.0, 2)));
        assert!(set.contains_key(&TransactionKey::new("t5", "request", "Rust", false)));
        assert!(!set.contains_key(&TransactionKey::new("t4", "request", "Rust", false)));
    }

    #[test]
    fn test_bounded_insert_discards_not_greater_than_minimum() {
        let mut set = TraceSet::new(2, false);
        set.insert(trace("a", 30.0, false));
        set.insert(trace("b", 40.0, false));
        set.insert(trace("c", 30.0, false));
        assert_eq!(durations(set.traces()), vec![30.0, 40.0]);
    }

    #[test]
    fn test_repeated_key_goes_to_secondary_while_primary_has_room() {
        let mut selector = TraceSelector::default();
        selector.insert(trace("a", 10.0, false));
        selector.insert(trace("a", 30.0, false));
        assert_eq!(selector.foreground_primary().len(), 1);
        assert_eq!(selector.foreground_secondary().len(), 1);
    }

    #[test]
    fn test_repeated_key_replaces_only_when_slower_once_primary_full() {
        let mut selector = TraceSelector::default();
        for (i, d) in [50.0, 60.0, 70.0, 80.0, 90.0].into_iter().enumerate() {
            selector.insert(trace(&format!("t{i}"), d, false));
        }
        selector.insert(trace("t0", 40.0, false));
        assert_eq!(
            durations(selector.foreground_primary().traces()),
            vec![50.0, 60.0, 70.0, 80.0, 90.0]
        );

        selector.insert(trace("t0", 100.0, false));
        assert_eq!(
            durations(selector.foreground_primary().traces()),
            vec![100.0, 60.0, 70.0, 80.0, 90.0]
        );
        assert_eq!(selector.foreground_primary().lowest(), Some((60.0, 1)));
        assert!(selector.foreground_secondary().is_empty());
    }

    #[test]
    fn test_background_routed_separately() {
        let mut selector = TraceSelector::default();
        selector.insert(trace("job", 10.0, true));
        assert!(selector.foreground_primary().is_empty());
        assert_eq!(selector.background_primary().len(), 1);
    }

    #[test]
    fn test_select_full_primary_needs_no_backfill() {
        let mut selector = TraceSelector::default();
        // Three repeats of "a" land in the secondary set before the primary fills up.
        for d in [5.0, 6.0, 7.0, 8.0] {
            selector.insert(trace("a", d, false));
        }
        for (i, d) in [20.0, 30.0, 40.0, 50.0, 60.0].into_iter().enumerate() {
            selector.insert(trace(&format!("u{i}"), d, false));
        }
        assert_eq!(selector.foreground_secondary().len(), 3);

        let selected = selector.select();
        assert_eq!(selected.len(), 5);
        assert_eq!(durations(&selected), vec![60.0, 20.0, 30.0, 40.0, 50.0]);
    }

    #[test]
    fn test_select_backfills_from_secondary_by_duration() {
        let mut selector = TraceSelector::default();
        for d in [1.0, 4.0, 9.0, 2.0, 7.0] {
            selector.insert(trace("a", d, false));
        }
        selector.insert(trace("b", 3.0, false));
        selector.insert(trace("c", 5.0, false));
        assert_eq!(selector.foreground_primary().len(), 3);
        assert_eq!(selector.foreground_secondary().len(), 4);

        let selected = selector.select();
        assert_eq!(durations(&selected), vec![1.0, 3.0, 5.0, 9.0, 7.0]);
    }

    #[test]
    fn test_select_backfills_from_background() {
        let mut selector = TraceSelector::default();
        selector.insert(trace("web", 10.0, false));
        for (i, d) in [3.0, 8.0, 5.0].into_iter().enumerate() {
            selector.insert(trace(&format!("job{i}"), d, true));
        }
        selector.insert(trace("job0", 1.0, true));
        selector.insert(trace("job0", 2.0, true));

        let selected = selector.select();
        assert_eq!(durations(&selected), vec![10.0, 8.0, 5.0, 3.0, 2.0]);
    }

    #[test]
    fn test_select_backfills_when_foreground_primary_empty() {
        let mut selector = TraceSelector::default();
        selector.insert(trace("job0", 3.0, true));
        selector.insert(trace("job1", 8.0, true));
        selector.insert(trace("job0", 1.0, true));
        selector.insert(trace("job0", 2.0, true));
        assert!(selector.foreground_primary().is_empty());
        assert!(selector.foreground_secondary().is_empty());

        let selected = selector.select();
        assert_eq!(durations(&selected), vec![8.0, 3.0, 2.0, 1.0]);
    }

    #[test]
    fn test_build_dedups_funcs_and_offsets() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let event = TransactionFinished {
            key: TransactionKey::new("GET /", "request", "Rust", false),
            transaction_id: "t".to_string(),
            trace_id: "tr".to_string(),
            duration: Duration::from_millis(3000),
            timestamp: start,
            request: HttpRequest::default(),
            response: HttpResponse::default(),
            user: UserIdentity::default(),
            custom_data: BTreeMap::new(),
        };
        let span = |name: &str, offset_ms: i64| SpanFinished {
            transaction_id: "t".to_string(),
            name: name.to_string(),
            span_type: "db".to_string(),
            subtype: "postgresql".to_string(),
            duration: Duration::from_millis(10),
            timestamp: if offset_ms >= 0 {
                start + Duration::from_millis(offset_ms.unsigned_abs())
            } else {
                start - Duration::from_millis(offset_ms.unsigned_abs())
            },
            database: None,
        };
        let mut spans = vec![span("SELECT", 5), span("INSERT", -3), span("SELECT", 20)];
        spans[0].database = Some(DatabaseContext {
            statement: "SELECT 1".to_string(),
            db_type: "sql".to_string(),
            user: "app".to_string(),
            ..Default::default()
        });

        let record = TraceRecord::build(&event, &spans, RequestSummary::default());
        assert_eq!(record.funcs, vec!["SELECT", "INSERT"]);
        let indexes: Vec<usize> = record.entries.iter().map(|e| e.func_index).collect();
        assert_eq!(indexes, vec![0, 1, 0]);
        let offsets: Vec<f64> = record.entries.iter().map(|e| e.start_offset).collect();
        assert_eq!(offsets, vec![5.0, 0.0, 20.0]);
        assert!(record.entries.iter().all(|e| e.level == 1));
        assert_eq!(record.entries[0].layer.layer_type, "Postgres");
        assert_eq!(record.entries[0].layer.kind, "Database");
        assert_eq!(record.entries[0].data.as_ref().unwrap()["query"], "SELECT 1");
        assert!(record.entries[1].data.is_none());
        assert_eq!(record.started_at(), start);
    }
}
