// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every failure class of the pipeline.
//!
//! None of these are fatal: the coordinator loop and the config store keep running after any of
//! them. Capacity overflows are not errors at all and are only logged.

use reqwest::StatusCode;

/// Failure to parse or validate a configuration value.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse {key}: {message}")]
    Parse { key: String, message: String },

    #[error("invalid value for {key}: {value} ({reason})")]
    OutOfRange {
        key: String,
        value: String,
        reason: String,
    },

    #[error("unsupported config: {0}")]
    UnsupportedKey(String),
}

/// Failure to deliver one request to the collector.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to build request for {path}: {source}")]
    Request {
        path: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("sending request to {path} failed: {source}")]
    Network {
        path: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to read response body from {path}: {source}")]
    Body {
        path: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Failure of one payload within a flush cycle.
#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("failed to serialize {path} payload: {source}")]
    Serialize {
        path: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{path} responded with unexpected status {status}")]
    UnexpectedStatus {
        path: &'static str,
        status: StatusCode,
    },

    #[error("failed to parse {path} response: {source}")]
    Response {
        path: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure to hand an event to the coordinator.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("coordinator has shut down, {0} event dropped")]
    Closed(&'static str),

    #[error("coordinator did not answer the {0} request")]
    NoResponse(&'static str),
}

/// Failure while reading a host identity source.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is empty")]
    Empty(String),
}
