// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use serde::Serialize;

use crate::aggregator::request::RequestSummary;
use crate::aggregator::unix_millis;
use crate::model::{ErrorCaptured, StackFrame, UserIdentity};
use crate::AGENT_LANGUAGE;

/// Crates whose frames are never part of the instrumented project.
const LIBRARY_ROOTS: &[&str] = &["std", "core", "alloc", "proc_macro", "test"];

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameRecord {
    #[serde(rename = "f", skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(rename = "p", skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(rename = "m", skip_serializing_if = "String::is_empty")]
    pub function: String,
    #[serde(rename = "ln", skip_serializing_if = "is_zero")]
    pub line: u32,
    #[serde(rename = "inp", skip_serializing_if = "std::ops::Not::not")]
    pub in_project: bool,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExceptionRecord {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(rename = "stacktrace")]
    pub frames: Vec<FrameRecord>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "userName", skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(rename = "userEmail", skip_serializing_if = "String::is_empty")]
    pub email: String,
}

impl From<&UserIdentity> for UserRecord {
    fn from(user: &UserIdentity) -> Self {
        Self {
            id: user.id.clone(),
            username: user.username.clone(),
            email: user.email.clone(),
        }
    }
}

/// A captured error normalized into a single stack-frame group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub timestamp: i64,
    #[serde(rename = "transaction")]
    pub transaction_name: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    pub kind: String,
    pub background: bool,
    pub user: UserRecord,
    pub request: RequestSummary,
    pub exceptions: Vec<ExceptionRecord>,
}

impl ErrorRecord {
    /// Normalizes `event`, keeping at most `stack_trace_limit` frames when the limit is not negative.
    pub fn build(event: &ErrorCaptured, stack_trace_limit: i64) -> Self {
        let class = if event.exception.class.is_empty() {
            "Error".to_string()
        } else {
            event.exception.class.clone()
        };

        let limit = usize::try_from(stack_trace_limit).unwrap_or(usize::MAX);
        let frames = event
            .exception
            .frames
            .iter()
            .take(limit)
            .map(FrameRecord::from)
            .collect();

        ErrorRecord {
            timestamp: unix_millis(event.timestamp),
            transaction_name: event.transaction_name.clone(),
            transaction_type: event.transaction_type.clone(),
            kind: AGENT_LANGUAGE.to_string(),
            background: false,
            user: UserRecord::from(&event.user),
            request: RequestSummary::build(&event.request, &event.response),
            exceptions: vec![ExceptionRecord {
                class,
                message: event.exception.message.clone(),
                frames,
            }],
        }
    }
}

impl From<&StackFrame> for FrameRecord {
    fn from(frame: &StackFrame) -> Self {
        let (file, path) = if frame.file.is_empty() {
            (String::new(), String::new())
        } else {
            let as_path = Path::new(&frame.file);
            let base = as_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| frame.file.clone());
            let absolute = if as_path.is_absolute() {
                frame.file.clone()
            } else {
                String::new()
            };
            (base, absolute)
        };

        let (package, _) = split_function_name(&frame.function);
        FrameRecord {
            file,
            path,
            function: frame.function.clone(),
            line: frame.line,
            in_project: !is_library_package(package) && !is_dependency_file(&frame.file),
        }
    }
}

/// Splits `crate::module::function` into `("crate::module", "function")`.
#[must_use]
pub fn split_function_name(function: &str) -> (&str, &str) {
    function.rsplit_once("::").unwrap_or(("", function))
}

/// Whether a package path belongs to the standard library.
#[must_use]
pub fn is_library_package(package: &str) -> bool {
    let root = package
        .trim_start_matches('<')
        .split("::")
        .next()
        .unwrap_or_default();
    LIBRARY_ROOTS.contains(&root)
}

fn is_dependency_file(file: &str) -> bool {
    file.contains("/.cargo/registry/") || file.contains("/.cargo/git/") || file.starts_with("/rustc/")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Exception, HttpRequest, HttpResponse};
    use std::time::{Duration, SystemTime};

    fn event(frames: Vec<StackFrame>) -> ErrorCaptured {
        ErrorCaptured {
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123),
            transaction_name: "GET /orders".to_string(),
            transaction_type: "request".to_string(),
            user: UserIdentity {
                id: "42".to_string(),
                ..Default::default()
            },
            request: HttpRequest::default(),
            response: HttpResponse::default(),
            exception: Exception {
                message: "boom".to_string(),
                class: String::new(),
                frames,
            },
        }
    }

    fn frame(file: &str, function: &str) -> StackFrame {
        StackFrame {
            file: file.to_string(),
            function: function.to_string(),
            line: 7,
        }
    }

    #[test]
    fn test_class_defaults_to_error() {
        let record = ErrorRecord::build(&event(vec![]), 50);
        assert_eq!(record.exceptions[0].class, "Error");
        assert_eq!(record.timestamp, 1_700_000_000_123);
        assert_eq!(record.kind, AGENT_LANGUAGE);
    }

    #[test]
    fn test_frame_file_and_absolute_path() {
        let record = ErrorRecord::build(
            &event(vec![
                frame("/srv/app/src/orders.rs", "shop::orders::load"),
                frame("src/main.rs", "shop::main"),
            ]),
            50,
        );
        let frames = &record.exceptions[0].frames;
        assert_eq!(frames[0].file, "orders.rs");
        assert_eq!(frames[0].path, "/srv/app/src/orders.rs");
        assert_eq!(frames[1].file, "main.rs");
        assert_eq!(frames[1].path, "");
    }

    #[test]
    fn test_frame_classification() {
        let record = ErrorRecord::build(
            &event(vec![
                frame("/srv/app/src/orders.rs", "shop::orders::load"),
                frame("/rustc/abc/library/core/src/result.rs", "core::result::unwrap_failed"),
                frame(
                    "/home/u/.cargo/registry/src/tokio-1.37.0/src/runtime/task.rs",
                    "tokio::runtime::task::poll",
                ),
            ]),
            50,
        );
        let in_project: Vec<bool> = record.exceptions[0]
            .frames
            .iter()
            .map(|f| f.in_project)
            .collect();
        assert_eq!(in_project, vec![true, false, false]);
    }

    #[test]
    fn test_stack_trace_limit() {
        let frames = vec![frame("a.rs", "app::a"); 10];
        assert_eq!(ErrorRecord::build(&event(frames.clone()), 3).exceptions[0].frames.len(), 3);
        assert_eq!(ErrorRecord::build(&event(frames.clone()), 0).exceptions[0].frames.len(), 0);
        assert_eq!(ErrorRecord::build(&event(frames), -1).exceptions[0].frames.len(), 10);
    }

    #[test]
    fn test_serialized_shape() {
        let record = ErrorRecord::build(&event(vec![frame("src/lib.rs", "app::run")]), 50);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["transaction"], "GET /orders");
        assert_eq!(json["user"]["id"], "42");
        assert_eq!(json["exceptions"][0]["stacktrace"][0]["f"], "lib.rs");
        assert_eq!(json["exceptions"][0]["stacktrace"][0]["inp"], true);
        assert!(json["exceptions"][0]["stacktrace"][0].get("p").is_none());
    }
}
