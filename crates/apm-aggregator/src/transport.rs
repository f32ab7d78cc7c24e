// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of serialized payloads to the collector.
//!
//! [`Transport`] is the seam between the flush protocol and the network. [`HttpTransport`] posts
//! JSON bodies with reqwest; tests and integrators may provide their own implementation.

use std::error::Error;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tracing::{debug, error};

use crate::config::Config;
use crate::errors::TransportError;
use crate::{AGENT_NAME, AGENT_VERSION};

/// Collector paths, one per payload type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    HostInfo,
    Error,
    ErrorMetric,
    Transaction,
    Trace,
    Metrics,
    Analytics,
}

impl Endpoint {
    #[must_use]
    pub const fn path(self) -> &'static str {
        match self {
            Endpoint::HostInfo => "/track/apm/hostinfo",
            Endpoint::Error => "/track/apm/error",
            Endpoint::ErrorMetric => "/track/apm/error_metric",
            Endpoint::Transaction => "/track/apm/txn",
            Endpoint::Trace => "/track/apm/trace",
            Endpoint::Metrics => "/track/apm/metric",
            Endpoint::Analytics => "/track/apm/analytics/txn",
        }
    }
}

/// Status and raw body of a collector response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Posts one JSON body to `endpoint`.
    ///
    /// Only failures to get any response are errors. Non-success statuses are returned as is.
    async fn send(&self, endpoint: Endpoint, body: Vec<u8>) -> Result<Response, TransportError>;
}

/// reqwest-backed [`Transport`].
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    notify_host: String,
    analytics_host: String,
    license_key: String,
}

impl HttpTransport {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        HttpTransport {
            client: get_client(config),
            notify_host: config.notify_host.trim_end_matches('/').to_string(),
            analytics_host: config.analytics_host().trim_end_matches('/').to_string(),
            license_key: config.license_key.clone(),
        }
    }

    fn url(&self, endpoint: Endpoint) -> String {
        let host = match endpoint {
            Endpoint::Analytics => &self.analytics_host,
            _ => &self.notify_host,
        };
        format!("{host}{}", endpoint.path())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: Endpoint, body: Vec<u8>) -> Result<Response, TransportError> {
        let path = endpoint.path();
        let request = self
            .client
            .post(self.url(endpoint))
            .query(&[
                ("licenseKey", self.license_key.as_str()),
                ("agent_name", AGENT_NAME),
                ("agent_version", AGENT_VERSION),
            ])
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .build()
            .map_err(|source| TransportError::Request { path, source })?;

        debug!("TRANSPORT | sending payload to {path}");
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|source| TransportError::Network { path, source })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|source| TransportError::Body { path, source })?
            .to_vec();
        Ok(Response { status, body })
    }
}

/// Builds the collector client, falling back to a direct connection when the proxy is unusable.
#[must_use]
pub fn get_client(config: &Config) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!("TRANSPORT | unable to configure proxy: {e}, falling back to direct connection");
            build_client(config, false).unwrap_or_else(|inner| {
                error!("TRANSPORT | failed to build HTTP client: {inner}, using reqwest defaults");
                reqwest::Client::new()
            })
        }
    }
}

fn build_client(config: &Config, allow_proxy: bool) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.flush_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(proxy) = &config.notify_proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
        }
    }

    Ok(builder.build()?)
}
