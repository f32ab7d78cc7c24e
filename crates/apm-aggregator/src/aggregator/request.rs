// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Serialize;

use crate::model::{HttpRequest, HttpResponse};

/// Sanitized request details attached to traces, errors and error requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSummary {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub accept: String,
    #[serde(rename = "accept-encoding", skip_serializing_if = "String::is_empty")]
    pub accept_encoding: String,
    #[serde(rename = "accept-language", skip_serializing_if = "String::is_empty")]
    pub accept_language: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub referer: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl RequestSummary {
    pub fn build(request: &HttpRequest, response: &HttpResponse) -> Self {
        let mut summary = RequestSummary {
            method: request.method.clone(),
            host: request.url.hostname.clone(),
            port: request
                .url
                .port
                .as_deref()
                .and_then(|p| p.parse::<u16>().ok())
                .filter(|p| *p != 0)
                .or_else(|| default_port(&request.url.protocol)),
            path: request.url.path.clone(),
            ip: request.remote_address.clone().unwrap_or_default(),
            status_code: Some(response.status_code).filter(|c| *c != 0),
            ..Default::default()
        };

        for (name, values) in &request.headers {
            let Some(first) = values.first() else {
                continue;
            };
            let slot = match name.to_ascii_lowercase().as_str() {
                "accept" => &mut summary.accept,
                "accept-encoding" => &mut summary.accept_encoding,
                "accept-language" => &mut summary.accept_language,
                "referer" => &mut summary.referer,
                "user-agent" => &mut summary.user_agent,
                _ => continue,
            };
            slot.clone_from(first);
        }

        summary
    }
}

/// Port implied by a URL scheme.
pub(crate) fn default_port(protocol: &str) -> Option<u16> {
    match protocol {
        "http" => Some(80),
        "https" => Some(443),
        _ => None,
    }
}
