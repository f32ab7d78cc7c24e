// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The flush protocol.
//!
//! A [`Flusher`] turns one closed [`WindowBatch`] into collector payloads. Every payload is sent at
//! most once. A failure on one payload is logged and does not stop the others, except for the
//! collector's `blocked` answer, which abandons the rest of the cycle. The agent then stays blocked,
//! sending nothing, until the next host-info exchange.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::aggregator::analytics::chunk_by_size;
use crate::aggregator::batch::WindowBatch;
use crate::aggregator::unix_millis;
use crate::config::store::ConfigStore;
use crate::config::Config;
use crate::errors::FlushError;
use crate::host::HostIdentity;
use crate::payload::{
    AnalyticsPayload, BlockedResponse, ErrorMetric, ErrorMetricPayload, ErrorPayload, Header,
    HostEnvironment, HostInfoPayload, HostInfoResponse, MetricsPayload, TracePayload,
    TransactionMetric, TransactionPayload, Window,
};
use crate::transport::{Endpoint, Response, Transport};
use crate::{AGENT_LANGUAGE, AGENT_VERSION};

/// Collector-controlled features, renegotiated on host-info ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureFlags {
    pub analytics: bool,
    pub capture_percentiles: bool,
    /// Set by a `blocked` host-info answer; cleared by the next exchange.
    pub blocked: bool,
}

impl FeatureFlags {
    fn blocked() -> Self {
        FeatureFlags {
            blocked: true,
            ..Default::default()
        }
    }
}

impl From<HostInfoResponse> for FeatureFlags {
    fn from(response: HostInfoResponse) -> Self {
        FeatureFlags {
            analytics: response.analytics,
            capture_percentiles: response.capture_percentiles,
            blocked: false,
        }
    }
}

/// Coordinator state a flush runs against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushContext {
    /// Tick counter, starting at 0.
    pub tick: u64,
    /// Features in effect when the flush started.
    pub features: FeatureFlags,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    MissingIdentity,
    Blocked { message: String, code: String },
    /// An earlier host-info exchange blocked the agent and none has happened since.
    StillBlocked,
}

/// What a flush did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Set when host-info was exchanged this cycle.
    pub features: Option<FeatureFlags>,
    pub aborted: Option<AbortReason>,
    /// Payloads the collector accepted.
    pub sent: usize,
    /// Payloads that failed to serialize, send, or were refused.
    pub failed: usize,
}

impl FlushOutcome {
    fn record(&mut self, delivered: bool) {
        if delivered {
            self.sent += 1;
        } else {
            self.failed += 1;
        }
    }
}

pub struct FlusherConfig {
    pub config: Arc<Config>,
    pub store: ConfigStore,
    pub transport: Arc<dyn Transport>,
    pub host: HostIdentity,
    /// Installed library inventory reported with host-info.
    pub libraries: BTreeMap<String, String>,
}

pub struct Flusher {
    config: Arc<Config>,
    store: ConfigStore,
    transport: Arc<dyn Transport>,
    host: HostIdentity,
    libraries: BTreeMap<String, String>,
}

impl Flusher {
    #[must_use]
    pub fn new(config: FlusherConfig) -> Self {
        Flusher {
            config: config.config,
            store: config.store,
            transport: config.transport,
            host: config.host,
            libraries: config.libraries,
        }
    }

    /// Sends the contents of a closed window.
    pub async fn flush(&self, mut batch: WindowBatch, ctx: FlushContext) -> FlushOutcome {
        let mut outcome = FlushOutcome::default();

        if !self.config.has_identity() {
            error!("FLUSHER | license key or application name not set, skipping flush");
            outcome.aborted = Some(AbortReason::MissingIdentity);
            return outcome;
        }

        let header = Header::new(&self.config, &self.host);
        let mut features = ctx.features;

        let interval = self.config.hostinfo_interval_ticks.max(1);
        let host_info_tick = ctx.tick % interval == 0;
        if ctx.features.blocked && !host_info_tick {
            debug!("FLUSHER | agent is blocked, skipping flush of tick {}", ctx.tick);
            outcome.aborted = Some(AbortReason::StillBlocked);
            return outcome;
        }

        if host_info_tick {
            features = FeatureFlags::default();
            match self.exchange_host_info(&header, ctx.active).await {
                Ok(HostInfoExchange::Features(negotiated)) => {
                    debug!("FLUSHER | negotiated features: {negotiated:?}");
                    features = negotiated;
                    outcome.record(true);
                }
                Ok(HostInfoExchange::Blocked(blocked)) => {
                    outcome.record(false);
                    if blocked.blocked {
                        warn!(
                            "FLUSHER | collector blocked this agent: {} ({})",
                            blocked.error_message, blocked.error_code
                        );
                        outcome.features = Some(FeatureFlags::blocked());
                        outcome.aborted = Some(AbortReason::Blocked {
                            message: blocked.error_message,
                            code: blocked.error_code,
                        });
                        return outcome;
                    }
                    error!("FLUSHER | host-info rejected: {}", blocked.error_message);
                }
                Err(e) => {
                    error!("FLUSHER | host-info failed: {e}");
                    outcome.record(false);
                }
            }
            outcome.features = Some(features);
        }

        let window = Window {
            start_time: unix_millis(batch.begin()),
            end_time: unix_millis(SystemTime::now()),
        };

        if !batch.errors.is_empty() {
            let payload = ErrorPayload {
                header: &header,
                errors: &batch.errors,
            };
            outcome.record(self.deliver(Endpoint::Error, &payload).await);
        }

        if !batch.transactions.is_empty() {
            let mut transactions: Vec<_> = batch.transactions.iter().collect();
            transactions.sort_by(|a, b| a.0.cmp(b.0));
            let payload = TransactionPayload {
                header: &header,
                window,
                transactions: transactions
                    .into_iter()
                    .map(|(key, aggregate)| TransactionMetric::new(key, aggregate))
                    .collect(),
            };
            outcome.record(self.deliver(Endpoint::Transaction, &payload).await);
        }

        if features.analytics && !batch.analytics.is_empty() {
            for chunk in chunk_by_size(&batch.analytics, self.config.analytics_payload_max_bytes) {
                let payload = AnalyticsPayload {
                    header: &header,
                    window,
                    requests: chunk,
                };
                outcome.record(self.deliver(Endpoint::Analytics, &payload).await);
            }
        }

        for trace in std::mem::take(&mut batch.traces).select() {
            let payload = TracePayload {
                header: &header,
                window,
                traces: [&trace],
            };
            outcome.record(self.deliver(Endpoint::Trace, &payload).await);
        }

        if !batch.error_metrics.is_empty() {
            let mut counts: Vec<_> = batch.error_metrics.iter().collect();
            counts.sort_by(|a, b| a.0.cmp(b.0));
            let payload = ErrorMetricPayload {
                header: &header,
                window,
                error_metrics: counts
                    .into_iter()
                    .map(|(key, codes)| ErrorMetric::new(key, codes))
                    .collect(),
                error_requests: batch.error_requests.iter().map(Into::into).collect(),
            };
            outcome.record(self.deliver(Endpoint::ErrorMetric, &payload).await);
        }

        if !batch.metrics.is_empty() {
            let payload = MetricsPayload {
                header: &header,
                window,
                metrics: &batch.metrics,
            };
            outcome.record(self.deliver(Endpoint::Metrics, &payload).await);
        }

        debug!(
            "FLUSHER | flush of tick {} done, {} sent, {} failed",
            ctx.tick, outcome.sent, outcome.failed
        );
        outcome
    }

    async fn exchange_host_info(
        &self,
        header: &Header,
        active: bool,
    ) -> Result<HostInfoExchange, FlushError> {
        let payload = HostInfoPayload {
            header,
            timestamp: unix_millis(SystemTime::now()),
            language: AGENT_LANGUAGE,
            environment: HostEnvironment {
                host_details: self.host.details.clone(),
                settings: self.settings(),
                libraries: self.libraries.clone(),
            },
            active,
        };
        let path = Endpoint::HostInfo.path();
        let response = self.post(Endpoint::HostInfo, &payload).await?;
        match response.status {
            StatusCode::OK => Ok(HostInfoExchange::Features(
                parse_response::<HostInfoResponse>(path, &response)?.into(),
            )),
            StatusCode::BAD_REQUEST => Ok(HostInfoExchange::Blocked(parse_response(
                path, &response,
            )?)),
            status => Err(FlushError::UnexpectedStatus { path, status }),
        }
    }

    fn settings(&self) -> BTreeMap<&'static str, serde_json::Value> {
        let threshold = self.store.load().values().trace_threshold;
        let threshold_ms = u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX);
        BTreeMap::from([
            ("appName", self.config.app_name.clone().into()),
            ("appVersion", self.config.app_version.clone().into()),
            ("agentVersion", AGENT_VERSION.into()),
            ("analytics", self.config.analytics.into()),
            ("environment", self.config.environment.clone().into()),
            ("traceThreshold", threshold_ms.into()),
            ("language", AGENT_LANGUAGE.into()),
        ])
    }

    async fn post<T: Serialize>(
        &self,
        endpoint: Endpoint,
        payload: &T,
    ) -> Result<Response, FlushError> {
        let body = serde_json::to_vec(payload).map_err(|source| FlushError::Serialize {
            path: endpoint.path(),
            source,
        })?;
        Ok(self.transport.send(endpoint, body).await?)
    }

    /// Sends one payload, logging any failure. Returns whether the collector accepted it.
    async fn deliver<T: Serialize>(&self, endpoint: Endpoint, payload: &T) -> bool {
        let path = endpoint.path();
        match self.post(endpoint, payload).await {
            Ok(response) if response.status.is_success() => {
                debug!("FLUSHER | {path} accepted with {}", response.status);
                true
            }
            Ok(response) if response.status == StatusCode::BAD_REQUEST => {
                match parse_response::<BlockedResponse>(path, &response) {
                    Ok(blocked) => error!(
                        "FLUSHER | {path} rejected (blocked: {}): {}",
                        blocked.blocked, blocked.error_message
                    ),
                    Err(e) => error!("FLUSHER | {path} rejected: {e}"),
                }
                false
            }
            Ok(response) => {
                let e = FlushError::UnexpectedStatus {
                    path,
                    status: response.status,
                };
                error!("FLUSHER | {e}");
                false
            }
            Err(e) => {
                error!("FLUSHER | {e}");
                false
            }
        }
    }
}

enum HostInfoExchange {
    Features(FeatureFlags),
    Blocked(BlockedResponse),
}

fn parse_response<T: DeserializeOwned>(
    path: &'static str,
    response: &Response,
) -> Result<T, FlushError> {
    serde_json::from_slice(&response.body).map_err(|source| FlushError::Response { path, source })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::store::ConfigValues;
    use crate::errors::TransportError;
    use crate::model::{
        ErrorCaptured, Exception, HttpRequest, HttpResponse, MetricsSnapshot, TransactionFinished,
        TransactionKey, UserIdentity,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tracing_test::traced_test;

    /// Records every call and answers from a fixed table, 200 with `{}` by default.
    #[derive(Default)]
    struct RecordingTransport {
        calls: Mutex<Vec<(Endpoint, serde_json::Value)>>,
        responses: HashMap<Endpoint, (StatusCode, &'static str)>,
        /// Held until notified for payloads whose window starts at this time.
        hold: Option<(i64, Arc<Notify>)>,
    }

    impl RecordingTransport {
        fn respond(mut self, endpoint: Endpoint, status: StatusCode, body: &'static str) -> Self {
            self.responses.insert(endpoint, (status, body));
            self
        }

        fn endpoints(&self) -> Vec<Endpoint> {
            self.calls.lock().unwrap().iter().map(|c| c.0).collect()
        }

        fn bodies(&self, endpoint: Endpoint) -> Vec<serde_json::Value> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.0 == endpoint)
                .map(|c| c.1.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            endpoint: Endpoint,
            body: Vec<u8>,
        ) -> Result<Response, TransportError> {
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            if let Some((start, notify)) = &self.hold {
                if json["startTime"] == *start {
                    notify.notified().await;
                }
            }
            self.calls.lock().unwrap().push((endpoint, json));
            let (status, body) = self
                .responses
                .get(&endpoint)
                .copied()
                .unwrap_or((StatusCode::OK, "{}"));
            Ok(Response {
                status,
                body: body.as_bytes().to_vec(),
            })
        }
    }

    fn config() -> Config {
        Config {
            license_key: "lic".to_string(),
            app_name: "shop".to_string(),
            hostinfo_interval_ticks: 30,
            ..Default::default()
        }
    }

    fn flusher(config: Config, transport: Arc<RecordingTransport>) -> Flusher {
        Flusher::new(FlusherConfig {
            store: ConfigStore::new(config.values.clone()),
            config: Arc::new(config),
            transport,
            host: HostIdentity {
                hostname: "web-1".to_string(),
                ..Default::default()
            },
            libraries: BTreeMap::from([("tokio".to_string(), "1.37".to_string())]),
        })
    }

    fn txn(name: &str, millis: u64, status: u16) -> TransactionFinished {
        TransactionFinished {
            key: TransactionKey::new(name, "request", AGENT_LANGUAGE, false),
            transaction_id: format!("{name}-{millis}"),
            trace_id: String::new(),
            duration: Duration::from_millis(millis),
            timestamp: SystemTime::now(),
            request: HttpRequest::default(),
            response: HttpResponse {
                status_code: status,
                headers: vec![],
            },
            user: UserIdentity::default(),
            custom_data: BTreeMap::new(),
        }
    }

    fn full_batch() -> WindowBatch {
        let values = ConfigValues::default();
        let mut batch = WindowBatch::new();
        batch.add_transaction(&txn("GET /", 10, 200), &values, true);
        batch.add_transaction(&txn("GET /slow", 2500, 500), &values, true);
        batch.add_transaction(&txn("GET /slower", 3000, 200), &values, true);
        batch.add_error(
            &ErrorCaptured {
                timestamp: SystemTime::now(),
                transaction_name: "GET /".to_string(),
                transaction_type: "request".to_string(),
                user: UserIdentity::default(),
                request: HttpRequest::default(),
                response: HttpResponse::default(),
                exception: Exception {
                    message: "boom".to_string(),
                    ..Default::default()
                },
            },
            &values,
        );
        batch.add_metrics(MetricsSnapshot {
            sets: vec![BTreeMap::from([("heap".to_string(), 1.0)])],
        });
        batch
    }

    fn ctx(tick: u64, analytics: bool) -> FlushContext {
        FlushContext {
            tick,
            features: FeatureFlags {
                analytics,
                ..Default::default()
            },
            active: true,
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_identity_sends_nothing() {
        let transport = Arc::new(RecordingTransport::default());
        let mut config = config();
        config.license_key.clear();
        let outcome = flusher(config, transport.clone())
            .flush(full_batch(), ctx(0, true))
            .await;

        assert_eq!(outcome.aborted, Some(AbortReason::MissingIdentity));
        assert!(transport.endpoints().is_empty());
        assert!(logs_contain("license key or application name not set"));
    }

    #[tokio::test]
    async fn test_payload_order_and_one_call_per_trace() {
        let transport = Arc::new(
            RecordingTransport::default().respond(
                Endpoint::HostInfo,
                StatusCode::OK,
                r#"{"analytics":true,"capturePercentiles":true}"#,
            ),
        );
        let outcome = flusher(config(), transport.clone())
            .flush(full_batch(), ctx(0, false))
            .await;

        assert_eq!(
            transport.endpoints(),
            vec![
                Endpoint::HostInfo,
                Endpoint::Error,
                Endpoint::Transaction,
                Endpoint::Analytics,
                Endpoint::Trace,
                Endpoint::Trace,
                Endpoint::ErrorMetric,
                Endpoint::Metrics,
            ]
        );
        assert_eq!(
            outcome.features,
            Some(FeatureFlags {
                analytics: true,
                capture_percentiles: true,
                blocked: false,
            })
        );
        assert_eq!(outcome.sent, 8);
        assert_eq!(outcome.failed, 0);

        let traces = transport.bodies(Endpoint::Trace);
        assert_eq!(traces[0]["traces"].as_array().unwrap().len(), 1);
        assert_eq!(traces[0]["traces"][0]["name"], "GET /slow");
        assert_eq!(traces[1]["traces"][0]["name"], "GET /slower");
        assert_eq!(traces[0]["appName"], "shop");

        let host_info = &transport.bodies(Endpoint::HostInfo)[0];
        assert_eq!(host_info["environment"]["settings"]["traceThreshold"], 2000);
        assert_eq!(host_info["environment"]["libraries"]["tokio"], "1.37");
        assert_eq!(host_info["active"], true);
    }

    #[tokio::test]
    async fn test_host_info_only_on_interval_ticks() {
        let transport = Arc::new(RecordingTransport::default());
        let flusher = flusher(config(), transport.clone());

        for tick in [1, 7] {
            let outcome = flusher.flush(WindowBatch::new(), ctx(tick, false)).await;
            assert_eq!(outcome.features, None);
        }
        assert!(transport.endpoints().is_empty());

        let outcome = flusher.flush(WindowBatch::new(), ctx(30, true)).await;
        assert_eq!(outcome.features, Some(FeatureFlags::default()));
        assert_eq!(transport.endpoints(), vec![Endpoint::HostInfo]);
    }

    #[tokio::test]
    async fn test_analytics_skipped_without_feature() {
        let transport = Arc::new(RecordingTransport::default());
        flusher(config(), transport.clone())
            .flush(full_batch(), ctx(1, false))
            .await;
        assert!(!transport.endpoints().contains(&Endpoint::Analytics));
    }

    #[tokio::test]
    async fn test_analytics_chunked_by_size() {
        let transport = Arc::new(RecordingTransport::default());
        let mut config = config();
        config.analytics_payload_max_bytes = 1;
        flusher(config, transport.clone())
            .flush(full_batch(), ctx(1, true))
            .await;
        assert_eq!(transport.bodies(Endpoint::Analytics).len(), 3);
    }

    #[tokio::test]
    async fn test_unexpected_host_info_status_resets_features() {
        let transport = Arc::new(RecordingTransport::default().respond(
            Endpoint::HostInfo,
            StatusCode::INTERNAL_SERVER_ERROR,
            "",
        ));
        let outcome = flusher(config(), transport.clone())
            .flush(full_batch(), ctx(0, true))
            .await;
        assert_eq!(outcome.features, Some(FeatureFlags::default()));
        assert_eq!(outcome.aborted, None);
        assert!(!transport.endpoints().contains(&Endpoint::Analytics));
        assert!(transport.endpoints().contains(&Endpoint::Transaction));
    }

    #[tokio::test]
    async fn test_blocked_aborts_remaining_payloads() {
        let transport = Arc::new(RecordingTransport::default().respond(
            Endpoint::HostInfo,
            StatusCode::BAD_REQUEST,
            r#"{"blocked":true,"errorMessage":"over quota","errorCode":"E1"}"#,
        ));
        let outcome = flusher(config(), transport.clone())
            .flush(full_batch(), ctx(0, true))
            .await;

        assert_eq!(transport.endpoints(), vec![Endpoint::HostInfo]);
        assert_eq!(
            outcome.aborted,
            Some(AbortReason::Blocked {
                message: "over quota".to_string(),
                code: "E1".to_string()
            })
        );
        assert_eq!(outcome.features, Some(FeatureFlags::blocked()));
    }

    #[tokio::test]
    async fn test_blocked_agent_stays_silent_until_next_host_info() {
        let blocked_transport = Arc::new(RecordingTransport::default().respond(
            Endpoint::HostInfo,
            StatusCode::BAD_REQUEST,
            r#"{"blocked":true,"errorMessage":"over quota","errorCode":"E1"}"#,
        ));
        let blocked_flusher = flusher(config(), blocked_transport.clone());
        let first = blocked_flusher.flush(full_batch(), ctx(0, true)).await;
        let features = first.features.unwrap();
        assert!(features.blocked);

        let mut next = ctx(1, false);
        next.features = features;
        let second = blocked_flusher.flush(full_batch(), next).await;
        assert_eq!(second.aborted, Some(AbortReason::StillBlocked));
        assert_eq!(second.features, None);
        assert_eq!(blocked_transport.endpoints(), vec![Endpoint::HostInfo]);

        // The collector lifts the block at the next host-info tick.
        let transport = Arc::new(RecordingTransport::default());
        let mut resumed = ctx(30, false);
        resumed.features = features;
        let third = flusher(config(), transport.clone())
            .flush(full_batch(), resumed)
            .await;
        assert_eq!(third.aborted, None);
        assert_eq!(third.features, Some(FeatureFlags::default()));
        assert_eq!(
            transport.endpoints(),
            vec![
                Endpoint::HostInfo,
                Endpoint::Error,
                Endpoint::Transaction,
                Endpoint::Trace,
                Endpoint::Trace,
                Endpoint::ErrorMetric,
                Endpoint::Metrics,
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_payload_does_not_stop_others() {
        let transport = Arc::new(
            RecordingTransport::default()
                .respond(Endpoint::Error, StatusCode::BAD_GATEWAY, "")
                .respond(Endpoint::Transaction, StatusCode::BAD_REQUEST, "{}"),
        );
        let outcome = flusher(config(), transport.clone())
            .flush(full_batch(), ctx(1, false))
            .await;

        assert_eq!(outcome.failed, 2);
        assert!(transport.endpoints().contains(&Endpoint::Metrics));
        assert!(transport.endpoints().contains(&Endpoint::ErrorMetric));
    }

    #[tokio::test]
    async fn test_error_metric_payload_shape() {
        let transport = Arc::new(RecordingTransport::default());
        flusher(config(), transport.clone())
            .flush(full_batch(), ctx(1, false))
            .await;
        let body = &transport.bodies(Endpoint::ErrorMetric)[0];
        assert_eq!(body["errorMetrics"][0]["name"], "GET /slow");
        assert_eq!(body["errorMetrics"][0]["statusCodes"]["500"], 1);
        assert_eq!(body["errorRequests"].as_array().unwrap().len(), 1);
        assert!(body["startTime"].as_i64().unwrap() <= body["endTime"].as_i64().unwrap());
    }

    // Overlapping flushes are not serialized: a later window may reach the collector first.
    #[tokio::test]
    async fn test_concurrent_flushes_may_arrive_out_of_order() {
        let gate = Arc::new(Notify::new());
        let first_start = SystemTime::UNIX_EPOCH + Duration::from_millis(1_000);
        let second_start = SystemTime::UNIX_EPOCH + Duration::from_millis(2_000);
        let transport = Arc::new(RecordingTransport {
            hold: Some((1_000, gate.clone())),
            ..Default::default()
        });
        let flusher = Arc::new(flusher(config(), transport.clone()));

        let window = |begin| {
            let mut batch = WindowBatch::starting_at(begin);
            batch.add_metrics(MetricsSnapshot::default());
            batch
        };

        let first = tokio::spawn({
            let flusher = flusher.clone();
            let batch = window(first_start);
            async move { flusher.flush(batch, ctx(1, false)).await }
        });
        let second = flusher.flush(window(second_start), ctx(2, false)).await;
        assert_eq!(second.sent, 1);

        gate.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.sent, 1);

        let starts: Vec<_> = transport
            .bodies(Endpoint::Metrics)
            .iter()
            .map(|b| b["startTime"].as_i64().unwrap())
            .collect();
        assert_eq!(starts, vec![2_000, 1_000]);
    }
}
