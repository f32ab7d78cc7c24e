// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Events handed to the coordinator by instrumentation adapters.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use derive_more::Display;

/// Aggregation identity of a transaction.
///
/// Kept as a structured key so names containing `:` can never collide. The delimited form from
/// [`Display`] is only produced when a payload is serialized.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{name}:{txn_type}:{kind}:{background}")]
pub struct TransactionKey {
    pub name: String,
    pub txn_type: String,
    pub kind: String,
    pub background: bool,
}

impl TransactionKey {
    pub fn new(
        name: impl Into<String>,
        txn_type: impl Into<String>,
        kind: impl Into<String>,
        background: bool,
    ) -> Self {
        Self {
            name: name.into(),
            txn_type: txn_type.into(),
            kind: kind.into(),
            background,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: String,
    pub username: String,
    pub email: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestUrl {
    pub protocol: String,
    pub hostname: String,
    pub port: Option<String>,
    pub path: String,
    pub search: String,
    pub hash: String,
}

/// Header name with all of its values, in arrival order.
pub type Header = (String, Vec<String>);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: RequestUrl,
    pub headers: Vec<Header>,
    pub remote_address: Option<String>,
    pub body: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
    pub headers: Vec<Header>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DatabaseContext {
    pub instance: String,
    pub statement: String,
    pub db_type: String,
    pub user: String,
    pub rows_affected: i64,
}

/// A completed span, buffered until its transaction finishes.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanFinished {
    pub transaction_id: String,
    pub name: String,
    /// Broad category such as `db` or `external`.
    pub span_type: String,
    /// Technology such as `postgresql` or `http`.
    pub subtype: String,
    pub duration: Duration,
    pub timestamp: SystemTime,
    pub database: Option<DatabaseContext>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransactionFinished {
    pub key: TransactionKey,
    pub transaction_id: String,
    pub trace_id: String,
    pub duration: Duration,
    pub timestamp: SystemTime,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub user: UserIdentity,
    pub custom_data: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    /// Fully qualified function path, e.g. `my_app::handlers::checkout`.
    pub function: String,
    pub line: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Exception {
    pub message: String,
    pub class: String,
    pub frames: Vec<StackFrame>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ErrorCaptured {
    pub timestamp: SystemTime,
    pub transaction_name: String,
    pub transaction_type: String,
    pub user: UserIdentity,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub exception: Exception,
}

/// Named numeric samples, grouped the way the metrics source produced them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub sets: Vec<BTreeMap<String, f64>>,
}
