//! Log initialization and setup
//!
//! Two kinds of subscriber are built from the same [`Builder`]: the process-wide one installed by
//! the binary at startup, and the audit sink a replica reset batch installs for the duration of
//! one run (see [`Builder::dispatch`]).

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod cli;
pub mod config;
pub mod test_util;

pub use config::*;

use thiserror::Error;
use tracing::{Dispatch, Subscriber};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    filter::ParseError,
    fmt::{self, MakeWriter, writer::BoxMakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log filter '{filter}': {source}")]
    InvalidFilter {
        filter: String,
        #[source]
        source: ParseError,
    },

    #[error("Cannot set global tracing subscriber")]
    SetGlobalDefault(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builder for logging.
#[derive(Debug)]
pub struct Builder {
    log_format: LogFormat,
    log_filter: Option<String>,
    // used when log_filter is none.
    default_log_filter: String,
    make_writer: BoxMakeWriter,
    with_ansi: bool,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Console,
            log_filter: None,
            default_log_filter: Self::DEFAULT_LOG_FILTER.to_string(),
            make_writer: BoxMakeWriter::new(std::io::stderr),
            with_ansi: true,
        }
    }
}

impl Builder {
    pub const DEFAULT_LOG_FILTER: &'static str = "info";

    pub fn new() -> Self {
        Self::default()
    }

    /// Set log_filter using a simple numeric "verbosity level".
    ///
    /// 0 means, keep existing `log_filter` value.
    pub fn with_log_verbose_count(self, log_verbose_count: u8) -> Self {
        let log_filter = match log_verbose_count {
            0 => self.log_filter,
            1 => Some("info".to_string()),
            2 => Some("debug,hyper=info,reqwest=info".to_string()),
            _ => Some("trace,hyper=info,h2=info".to_string()),
        };
        Self { log_filter, ..self }
    }

    pub fn with_log_filter(self, log_filter: Option<&str>) -> Result<Self> {
        let log_filter = log_filter.map(validate_filter).transpose()?;
        Ok(Self { log_filter, ..self })
    }

    pub fn with_default_log_filter(self, default_log_filter: impl AsRef<str>) -> Result<Self> {
        let default_log_filter = validate_filter(default_log_filter.as_ref())?;
        Ok(Self {
            default_log_filter,
            ..self
        })
    }

    pub fn with_log_format(self, log_format: LogFormat) -> Self {
        Self { log_format, ..self }
    }

    pub fn with_log_destination(self, log_destination: LogDestination) -> Self {
        match log_destination {
            LogDestination::Stdout => self.with_writer(std::io::stdout),
            LogDestination::Stderr => self.with_writer(std::io::stderr),
        }
    }

    pub fn with_writer<W>(self, make_writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        Self {
            make_writer: BoxMakeWriter::new(make_writer),
            ..self
        }
    }

    /// Enable/disable ANSI encoding for console formatted events (i.e. colors).
    ///
    /// Defaults to true. JSON output never carries ANSI codes.
    pub fn with_ansi(self, with_ansi: bool) -> Self {
        Self { with_ansi, ..self }
    }

    /// The filter directive that will be applied
    pub fn log_filter(&self) -> &str {
        self.log_filter
            .as_deref()
            .unwrap_or(self.default_log_filter.as_str())
    }

    /// Build a formatting layer for any registry-backed subscriber
    pub fn build<S>(self) -> Result<Box<dyn Layer<S> + Send + Sync + 'static>>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
    {
        let filter_directive = self.log_filter().to_string();
        let filter = EnvFilter::try_new(&filter_directive).map_err(|source| {
            Error::InvalidFilter {
                filter: filter_directive,
                source,
            }
        })?;

        let layer = match self.log_format {
            LogFormat::Console => fmt::layer()
                .with_writer(self.make_writer)
                .with_target(false)
                .with_ansi(self.with_ansi)
                .with_filter(filter)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(self.make_writer)
                .with_target(false)
                .with_ansi(false)
                .with_filter(filter)
                .boxed(),
        };
        Ok(layer)
    }

    /// Build a standalone subscriber, to be scoped to a unit of work with
    /// [`tracing::dispatcher::with_default`] or
    /// [`WithSubscriber`](tracing::instrument::WithSubscriber).
    pub fn dispatch(self) -> Result<Dispatch> {
        let subscriber = Registry::default().with(self.build()?);
        Ok(Dispatch::new(subscriber))
    }

    /// Install the built subscriber as the process-wide default
    pub fn install_global(self) -> Result<()> {
        let subscriber = Registry::default().with(self.build()?);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(())
    }
}

fn validate_filter(filter: &str) -> Result<String> {
    EnvFilter::try_new(filter)
        .map(|_| filter.to_string())
        .map_err(|source| Error::InvalidFilter {
            filter: filter.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use tracing::{debug, info};

    use super::*;
    use crate::test_util::CapturedWriter;

    #[test]
    fn json_records_carry_structured_fields() {
        let writer = CapturedWriter::default();
        let dispatch = Builder::new()
            .with_log_format(LogFormat::Json)
            .with_writer(writer.clone())
            .dispatch()
            .unwrap();

        tracing::dispatcher::with_default(&dispatch, || {
            info!(table = "doc.events", state = "monitoring_leases", "waiting");
            debug!("filtered out at the default level");
        });

        let lines = writer.lines();
        assert_eq!(lines.len(), 1);
        let record: Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["message"], "waiting");
        assert_eq!(record["table"], "doc.events");
        assert_eq!(record["state"], "monitoring_leases");
    }

    #[test]
    fn console_records_are_single_lines() {
        let writer = CapturedWriter::default();
        let dispatch = Builder::new()
            .with_ansi(false)
            .with_writer(writer.clone())
            .dispatch()
            .unwrap();

        tracing::dispatcher::with_default(&dispatch, || {
            info!(table = "doc.events", "replicas restored");
        });

        let contents = writer.contents();
        assert!(contents.contains("INFO"), "{contents}");
        assert!(contents.contains("replicas restored"), "{contents}");
        assert!(contents.contains("table=\"doc.events\""), "{contents}");
        assert!(serde_json::from_str::<Value>(contents.trim()).is_err());
    }

    #[test]
    fn verbose_count() {
        let builder = Builder::new()
            .with_log_filter(Some("warn"))
            .unwrap()
            .with_log_verbose_count(0);
        assert_eq!(builder.log_filter(), "warn");
        assert_eq!(builder.with_log_verbose_count(3).log_filter(), "trace,hyper=info,h2=info");
    }

    #[test]
    fn invalid_filter_is_an_error() {
        let err = Builder::new().with_log_filter(Some("xlens=notalevel")).unwrap_err();
        assert!(matches!(err, Error::InvalidFilter { .. }), "{err}");
    }
}
