// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log formatting for the aggregator.
//!
//! Every line is prefixed with `APM_AGGREGATOR` so agent output can be told apart from the
//! instrumented application's own logs:
//!
//! ```text
//! APM_AGGREGATOR | LEVEL | [outer{fields} > inner{fields}: ]message {event_fields}
//! ```
//!
//! ```text
//! APM_AGGREGATOR | DEBUG | AGGREGATOR | applying features from tick 30
//! APM_AGGREGATOR | ERROR | flush{tick=3}: FLUSHER | license key or application name not set
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Prefix written at the start of every log line.
pub const LOG_PREFIX: &str = "APM_AGGREGATOR";

/// Event formatter that prefixes messages with [`LOG_PREFIX`].
#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(writer, "{LOG_PREFIX} | {} | ", event.metadata().level())?;
        write_span_scope(ctx, &mut writer)?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Writes the spans enclosing the current event, outermost first, followed by `": "`.
fn write_span_scope<S, N>(
    ctx: &FmtContext<'_, S, N>,
    writer: &mut format::Writer<'_>,
) -> fmt::Result
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    let Some(scope) = ctx.event_scope() else {
        return Ok(());
    };
    let mut separator = "";
    for span in scope.from_root() {
        write!(writer, "{separator}{}", span.name())?;
        // Populated by the fmt layer when the span is created.
        let extensions = span.extensions();
        if let Some(fields) = extensions
            .get::<FormattedFields<N>>()
            .filter(|fields| !fields.is_empty())
        {
            write!(writer, "{{{fields}}}")?;
        }
        separator = " > ";
    }
    if separator.is_empty() {
        Ok(())
    } else {
        write!(writer, ": ")
    }
}

/// Installs a global fmt subscriber using [`Formatter`].
///
/// `directives` follows `EnvFilter` syntax, e.g. `"warn"` or `"apm_aggregator=debug"`.
///
/// # Errors
///
/// Returns an error if the directives cannot be parsed or a global subscriber is already set.
pub fn init(directives: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_new(directives)?;
    tracing_subscriber::fmt()
        .event_format(Formatter)
        .with_env_filter(filter)
        .try_init()
}
