// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing output for the access-log agent.
//!
//! Every line is prefixed with `ACCESS_LOG` so the subsystem's own diagnostics
//! are easy to tell apart from the access logs it moves:
//!
//! ```text
//! ACCESS_LOG | INFO | ACCESS_LOG_QUEUE | queue capacity changed 10000 -> 20000
//! ACCESS_LOG | WARN | search{day=20240115}: ACCESS_LOG_QUERY | shard 2 timed out
//! ```

use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::errors::ConfigError;

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
        let metadata = event.metadata();
        write!(&mut writer, "ACCESS_LOG | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Builds the `EnvFilter` used by the agent, silencing chatty dependencies.
pub fn env_filter(log_level: &str) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(format!("h2=off,hyper=off,{log_level}"))
        .map_err(|e| ConfigError::InvalidConfig(format!("could not parse log level: {e}")))
}

/// Installs the global subscriber. Fails when one is already installed.
pub fn init(log_level: &str) -> Result<(), ConfigError> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(log_level)?)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ConfigError::InvalidConfig(format!("setting default subscriber failed: {e}")))
}
