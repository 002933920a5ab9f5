//! Sequential replica resets over a batch of candidate tables

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{info, instrument::WithSubscriber, warn};
use xlens_logging::{Builder, LogFormat};

use crate::{CandidateTable, SqlExecutor, TableIdentity, TableResetProcessor, TableResetState};

/// Process exit codes for a replica reset run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchExitCode {
    /// Nothing to do, or every table completed
    Success = 0,
    /// The run failed before any table was classified
    Failure = 1,
    /// Every table failed
    CompleteFailure = 2,
    /// Some tables completed and some failed
    PartialFailure = 3,
}

impl BatchExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    NothingToDo,
    AllSucceeded,
    PartialFailure,
    CompleteFailure,
}

impl BatchOutcome {
    pub fn exit_code(self) -> BatchExitCode {
        match self {
            Self::NothingToDo | Self::AllSucceeded => BatchExitCode::Success,
            Self::PartialFailure => BatchExitCode::PartialFailure,
            Self::CompleteFailure => BatchExitCode::CompleteFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub dry_run: bool,
    /// Upper bound on the time spent waiting for one table's retention leases
    pub max_wait: Duration,
    /// Format of the audit trail written while the batch runs
    pub log_format: LogFormat,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            max_wait: Duration::from_secs(720),
            log_format: LogFormat::Console,
        }
    }
}

/// How one table's reset ended
#[derive(Debug, Clone, PartialEq)]
pub struct TableOutcome {
    pub identity: TableIdentity,
    pub display_name: String,
    pub success: bool,
    pub state: TableResetState,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult {
    /// One entry per candidate, in processing order
    pub tables: Vec<TableOutcome>,
    pub elapsed: Duration,
}

impl BatchResult {
    pub fn attempted(&self) -> usize {
        self.tables.len()
    }

    pub fn succeeded(&self) -> usize {
        self.tables.iter().filter(|t| t.success).count()
    }

    pub fn failed(&self) -> usize {
        self.attempted() - self.succeeded()
    }

    pub fn failed_tables(&self) -> impl Iterator<Item = &TableOutcome> {
        self.tables.iter().filter(|t| !t.success)
    }

    pub fn outcome(&self) -> BatchOutcome {
        match (self.succeeded(), self.failed()) {
            (0, 0) => BatchOutcome::NothingToDo,
            (_, 0) => BatchOutcome::AllSucceeded,
            (0, _) => BatchOutcome::CompleteFailure,
            _ => BatchOutcome::PartialFailure,
        }
    }

    pub fn exit_code(&self) -> BatchExitCode {
        self.outcome().exit_code()
    }
}

/// Runs one [`TableResetProcessor`] per candidate, one table at a time
#[derive(Debug)]
pub struct BatchOrchestrator {
    executor: Arc<dyn SqlExecutor>,
    options: BatchOptions,
    audit_log: Option<Builder>,
}

impl BatchOrchestrator {
    pub fn new(executor: Arc<dyn SqlExecutor>, options: BatchOptions) -> Self {
        Self {
            executor,
            options,
            audit_log: None,
        }
    }

    /// Write the run's audit trail through `builder` instead of the current subscriber
    ///
    /// The builder's format is overridden by [`BatchOptions::log_format`].
    pub fn with_audit_log(self, builder: Builder) -> Self {
        Self {
            audit_log: Some(builder),
            ..self
        }
    }

    pub async fn run(self, candidates: Vec<CandidateTable>) -> BatchResult {
        let dispatch = self.audit_log.and_then(|builder| {
            match builder.with_log_format(self.options.log_format).dispatch() {
                Ok(dispatch) => Some(dispatch),
                Err(error) => {
                    warn!(%error, "could not configure the audit log, using the current one");
                    None
                }
            }
        });

        let batch = run_batch(self.executor, self.options, candidates);
        match dispatch {
            Some(dispatch) => batch.with_subscriber(dispatch).await,
            None => batch.await,
        }
    }
}

async fn run_batch(
    executor: Arc<dyn SqlExecutor>,
    options: BatchOptions,
    candidates: Vec<CandidateTable>,
) -> BatchResult {
    let started = Instant::now();
    let mut tables = Vec::with_capacity(candidates.len());

    if candidates.is_empty() {
        info!("no tables selected for a replica reset");
    } else {
        info!(
            tables = candidates.len(),
            dry_run = options.dry_run,
            max_wait_secs = options.max_wait.as_secs(),
            "starting replica reset batch"
        );
    }

    for candidate in candidates {
        let mut processor = TableResetProcessor::new(
            Arc::clone(&executor),
            candidate,
            options.dry_run,
            options.max_wait,
        );
        let success = processor.process().await;
        tables.push(TableOutcome {
            identity: processor.identity().clone(),
            display_name: processor.display_name(),
            success,
            state: processor.state(),
            error_message: processor.error_message().map(ToString::to_string),
        });
    }

    let result = BatchResult {
        tables,
        elapsed: started.elapsed(),
    };
    info!(
        attempted = result.attempted(),
        succeeded = result.succeeded(),
        failed = result.failed(),
        elapsed_secs = result.elapsed.as_secs_f64(),
        exit_code = result.exit_code().code(),
        "replica reset batch finished"
    );
    result
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use xlens_logging::test_util::CapturedWriter;

    use super::*;
    use crate::test_util::{Reply, ScriptedExecutor};

    fn candidate(table: &str) -> CandidateTable {
        CandidateTable {
            identity: TableIdentity::new("doc", table),
            max_uncommitted_mb: 2048.5,
            adaptive_config_mb: 1024.0,
            adaptive_threshold_mb: 1126.4,
            total_primary_shards: 3,
            current_replicas: 1,
        }
    }

    fn cleared() -> Reply {
        Reply::Rows(vec![vec![json!(1)]])
    }

    #[test]
    fn exit_codes() {
        assert_eq!(BatchExitCode::Success.code(), 0);
        assert_eq!(BatchExitCode::Failure.code(), 1);
        assert_eq!(BatchExitCode::CompleteFailure.code(), 2);
        assert_eq!(BatchExitCode::PartialFailure.code(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_succeeds() {
        let executor = Arc::new(ScriptedExecutor::new());
        let result = BatchOrchestrator::new(Arc::clone(&executor) as _, BatchOptions::default())
            .run(vec![])
            .await;

        assert_eq!(result.outcome(), BatchOutcome::NothingToDo);
        assert_eq!(result.exit_code(), BatchExitCode::Success);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn all_succeed() {
        let executor = Arc::new(ScriptedExecutor::new().on("retention_leases", cleared()));
        let result = BatchOrchestrator::new(Arc::clone(&executor) as _, BatchOptions::default())
            .run(vec![candidate("a"), candidate("b")])
            .await;

        assert_eq!(result.attempted(), 2);
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.exit_code(), BatchExitCode::Success);
        let names: Vec<_> = result.tables.iter().map(|t| t.display_name.as_str()).collect();
        assert_eq!(names, vec!["doc.a", "doc.b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_failure_is_complete_failure() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .on("retention_leases", Reply::Rows(vec![vec![json!(2)]])),
        );
        let options = BatchOptions {
            max_wait: Duration::from_secs(20),
            ..Default::default()
        };
        let result = BatchOrchestrator::new(Arc::clone(&executor) as _, options)
            .run(vec![candidate("stuck")])
            .await;

        assert_eq!(result.outcome(), BatchOutcome::CompleteFailure);
        assert_eq!(result.exit_code().code(), 2);
        let failed: Vec<_> = result.failed_tables().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].state, TableResetState::Failed);
        assert!(
            failed[0]
                .error_message
                .as_deref()
                .is_some_and(|m| m.starts_with("Timeout after 20s"))
        );
        assert_eq!(
            executor
                .statements_containing(r#""number_of_replicas" = 1)"#)
                .len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn one_failure_among_successes_is_partial() {
        let executor = Arc::new(
            ScriptedExecutor::new()
                .on(r#"ALTER TABLE "doc"."b""#, Reply::Error("blocked".into()))
                .on("retention_leases", cleared()),
        );
        let result = BatchOrchestrator::new(executor as _, BatchOptions::default())
            .run(vec![candidate("a"), candidate("b"), candidate("c")])
            .await;

        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.outcome(), BatchOutcome::PartialFailure);
        assert_eq!(result.exit_code(), BatchExitCode::PartialFailure);
        assert_eq!(result.failed_tables().next().unwrap().display_name, "doc.b");
    }

    #[tokio::test(start_paused = true)]
    async fn json_audit_trail() {
        let writer = CapturedWriter::default();
        let executor = Arc::new(ScriptedExecutor::new());
        let options = BatchOptions {
            dry_run: true,
            log_format: LogFormat::Json,
            ..Default::default()
        };

        let result = BatchOrchestrator::new(Arc::clone(&executor) as _, options)
            .with_audit_log(Builder::new().with_writer(writer.clone()))
            .run(vec![candidate("events")])
            .await;

        assert_eq!(result.exit_code(), BatchExitCode::Success);
        assert!(executor.calls().is_empty());

        let records: Vec<Value> = writer
            .lines()
            .iter()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let states: Vec<_> = records
            .iter()
            .filter(|r| {
                r["message"]
                    .as_str()
                    .is_some_and(|m| m.starts_with("State transition"))
            })
            .map(|r| r["state"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            states,
            vec![
                "setting_replicas_zero",
                "monitoring_leases",
                "restoring_replicas",
                "completed"
            ]
        );
        assert!(records.iter().all(|r| r["level"].is_string()));
        let transition = records
            .iter()
            .find(|r| r["state"] == "completed")
            .unwrap();
        assert_eq!(transition["table"], "doc.events");
        assert_eq!(transition["original_replicas"], 1);
        assert!(
            records
                .iter()
                .any(|r| r["message"] == "replica reset batch finished" && r["exit_code"] == 0)
        );
    }
}
