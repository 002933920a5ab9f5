//! Common CLI flags for logging
use crate::{Builder, LogDestination, LogFormat, Result};

/// CLI config for the logging related subset of options.
#[derive(Debug, Clone, Default, clap::Parser)]
pub struct LoggingConfig {
    /// Logs: filter directive
    ///
    /// Configures log severity level filter, by target.
    ///
    /// Simplest options: error, warn, info, debug, trace
    ///
    /// Levels for different modules can be specified. For example
    /// `debug,hyper=info` specifies debug logging for all modules
    /// except for the `hyper' module which will only display info
    /// level logging.
    ///
    /// Overridden by `-v`.
    #[clap(long = "log-filter", env = "LOG_FILTER", action)]
    pub log_filter: Option<String>,

    /// Logs: filter short-hand
    ///
    /// Convenient way to set log severity level filter.
    /// Overrides `--log-filter`.
    ///
    /// -v   'info'
    ///
    /// -vv  'debug,hyper=info,reqwest=info'
    ///
    /// -vvv 'trace,hyper=info,h2=info'
    #[clap(
        short = 'v',
        long = "verbose",
        action = clap::ArgAction::Count,
        verbatim_doc_comment
    )]
    pub log_verbose_count: u8,

    /// Logs: destination
    ///
    /// Can be one of: stdout, stderr
    #[clap(
        long = "log-destination",
        env = "LOG_DESTINATION",
        default_value = "stderr",
        action
    )]
    pub log_destination: LogDestination,

    #[rustfmt::skip]
    /// Logs: message format
    ///
    /// Can be one of:
    ///
    /// console: human-readable, single line
    ///
    ///   2024-01-01T12:55:47.815Z  INFO table="doc.events" state="monitoring_leases" original_replicas=1 waiting 15s
    ///
    /// json: machine-parseable, one object per line
    ///
    ///   {"timestamp":"2024-01-01T12:55:47.815Z","level":"INFO","message":"waiting 15s","table":"doc.events","state":"monitoring_leases","original_replicas":1}
    #[clap(
        long = "log-format",
        env = "LOG_FORMAT",
        default_value = "console",
        verbatim_doc_comment,
        action
    )]
    pub log_format: LogFormat,
}

impl LoggingConfig {
    pub fn to_builder(&self) -> Result<Builder> {
        self.with_builder(Builder::new())
    }

    pub fn with_builder(&self, builder: Builder) -> Result<Builder> {
        Ok(builder
            .with_log_filter(self.log_filter.as_deref())?
            // with_log_verbose_count goes after with_log_filter because our CLI flag states
            // that -v overrides --log-filter.
            .with_log_verbose_count(self.log_verbose_count)
            .with_log_destination(self.log_destination)
            .with_log_format(self.log_format))
    }
}

/// Extends the [`crate::Builder`] API.
pub trait LoggingConfigBuilderExt: Sized {
    /// Applies all config entries from a [`LoggingConfig`] to a [`crate::Builder`].
    fn with_logging_config(self, config: &LoggingConfig) -> Result<Builder>;
}

impl LoggingConfigBuilderExt for Builder {
    fn with_logging_config(self, config: &LoggingConfig) -> Result<Builder> {
        config.with_builder(self)
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[clap(flatten)]
        logging: LoggingConfig,
    }

    #[test]
    fn defaults() {
        let cli = TestCli::try_parse_from(["cli"]).unwrap();
        assert_eq!(cli.logging.log_filter, None);
        assert_eq!(cli.logging.log_verbose_count, 0);
        assert_eq!(cli.logging.log_destination, LogDestination::Stderr);
        assert_eq!(cli.logging.log_format, LogFormat::Console);
    }

    #[test]
    fn flags() {
        let cli = TestCli::try_parse_from([
            "cli",
            "-vv",
            "--log-format",
            "json",
            "--log-destination",
            "stdout",
        ])
        .unwrap();
        assert_eq!(cli.logging.log_verbose_count, 2);
        assert_eq!(cli.logging.log_format, LogFormat::Json);
        assert_eq!(cli.logging.log_destination, LogDestination::Stdout);
    }

    #[test]
    fn rejects_unknown_format() {
        let err = TestCli::try_parse_from(["cli", "--log-format", "logfmt"]).unwrap_err();
        assert!(err.to_string().contains("Invalid log format 'logfmt'"));
    }

    #[test]
    fn verbose_overrides_filter() {
        let config = LoggingConfig {
            log_filter: Some("warn".into()),
            log_verbose_count: 2,
            ..Default::default()
        };
        let builder = config.to_builder().unwrap();
        assert_eq!(builder.log_filter(), "debug,hyper=info,reqwest=info");
    }
}
