// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use apm_aggregator::config::store::ConfigStore;
use apm_aggregator::config::Config;
use apm_aggregator::coordinator::{CoordinatorHandle, EventCoordinator};
use apm_aggregator::flusher::{Flusher, FlusherConfig};
use apm_aggregator::host::HostIdentity;
use apm_aggregator::model::{
    DatabaseContext, ErrorCaptured, Exception, HttpRequest, HttpResponse, RequestUrl,
    SpanFinished, StackFrame, TransactionFinished, TransactionKey, UserIdentity,
};
use apm_aggregator::transport::HttpTransport;
use apm_aggregator::{AGENT_LANGUAGE, AGENT_NAME, AGENT_VERSION};
use mockito::Matcher;
use tokio::task::JoinHandle;

pub const LICENSE_KEY: &str = "mock-license-key";

pub fn config(url: &str) -> Config {
    Config {
        license_key: LICENSE_KEY.to_string(),
        app_name: "checkout".to_string(),
        app_version: "2.4.0".to_string(),
        environment: "staging".to_string(),
        notify_host: url.to_string(),
        analytics: true,
        ..Default::default()
    }
}

/// Wires a coordinator to the collector at `config.notify_host` and starts it.
pub fn start(config: Config) -> (CoordinatorHandle, ConfigStore, JoinHandle<()>) {
    let config = Arc::new(config);
    let store = ConfigStore::new(config.values.clone());
    let flusher = Flusher::new(FlusherConfig {
        config: Arc::clone(&config),
        store: store.clone(),
        transport: Arc::new(HttpTransport::new(&config)),
        host: HostIdentity {
            hostname: "web-1".to_string(),
            machine_id: "6f1c2a7e-0000-4000-8000-000000000001".to_string(),
            ..Default::default()
        },
        libraries: BTreeMap::from([("tokio".to_string(), "1.37.0".to_string())]),
    });
    let (coordinator, handle) = EventCoordinator::new(config, store.clone(), Arc::new(flusher));
    let task = tokio::spawn(coordinator.run());
    (handle, store, task)
}

/// Lets the coordinator drain everything already queued.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub fn identity_query() -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("licenseKey".into(), LICENSE_KEY.into()),
        Matcher::UrlEncoded("agent_name".into(), AGENT_NAME.into()),
        Matcher::UrlEncoded("agent_version".into(), AGENT_VERSION.into()),
    ])
}

pub fn transaction(name: &str, id: &str, millis: u64, status: u16) -> TransactionFinished {
    TransactionFinished {
        key: TransactionKey::new(name, "request", AGENT_LANGUAGE, false),
        transaction_id: id.to_string(),
        trace_id: format!("trace-{id}"),
        duration: Duration::from_millis(millis),
        timestamp: SystemTime::now() - Duration::from_millis(millis),
        request: HttpRequest {
            method: "GET".to_string(),
            url: RequestUrl {
                protocol: "https".to_string(),
                hostname: "shop.example.com".to_string(),
                path: "/cart".to_string(),
                ..Default::default()
            },
            headers: vec![
                ("User-Agent".to_string(), vec!["curl/8.0".to_string()]),
                ("Authorization".to_string(), vec!["Bearer secret".to_string()]),
            ],
            remote_address: Some("10.0.0.7".to_string()),
            body: None,
        },
        response: HttpResponse {
            status_code: status,
            headers: vec![],
        },
        user: UserIdentity {
            id: "u-1".to_string(),
            ..Default::default()
        },
        custom_data: BTreeMap::new(),
    }
}

pub fn query_span(transaction_id: &str, millis: u64) -> SpanFinished {
    SpanFinished {
        transaction_id: transaction_id.to_string(),
        name: "SELECT cart_items".to_string(),
        span_type: "db".to_string(),
        subtype: "postgresql".to_string(),
        duration: Duration::from_millis(millis),
        timestamp: SystemTime::now(),
        database: Some(DatabaseContext {
            instance: "shop".to_string(),
            statement: "SELECT * FROM cart_items WHERE cart_id = $1".to_string(),
            db_type: "sql".to_string(),
            user: "app".to_string(),
            rows_affected: 3,
        }),
    }
}

pub fn error(message: &str) -> ErrorCaptured {
    ErrorCaptured {
        timestamp: SystemTime::now(),
        transaction_name: "GET /cart".to_string(),
        transaction_type: "request".to_string(),
        user: UserIdentity::default(),
        request: HttpRequest::default(),
        response: HttpResponse {
            status_code: 500,
            headers: vec![],
        },
        exception: Exception {
            message: message.to_string(),
            class: "CartError".to_string(),
            frames: vec![StackFrame {
                file: "/srv/shop/src/cart.rs".to_string(),
                function: "shop::cart::load".to_string(),
                line: 42,
            }],
        },
    }
}
