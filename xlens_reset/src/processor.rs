//! The replica reset state machine for a single table or partition
//!
//! A reset disables replication on the entity, waits until the cluster has released the
//! retention leases held for the dropped replicas, then restores the replica count captured
//! when the processor was created:
//!
//! ```text
//! detected -> setting_replicas_zero -> monitoring_leases -> restoring_replicas -> completed
//!                      |                       |                    |
//!                      +-----------------------+--------------------+--> failed
//! ```
//!
//! A failure while monitoring leases is followed by a single best-effort restore of the original
//! replica count. A failure while restoring is critical and left to the operator.

use std::{fmt::Display, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    CandidateTable, SqlExecutor, TableIdentity,
    backoff::{MAX_WAIT_LIMIT, backoff_delays},
    row,
    sql::{IdentifierError, alter_replicas_sql, partition_scope, retention_lease_query},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableResetState {
    Detected,
    SettingReplicasZero,
    MonitoringLeases,
    RestoringReplicas,
    Completed,
    Failed,
}

impl TableResetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::SettingReplicasZero => "setting_replicas_zero",
            Self::MonitoringLeases => "monitoring_leases",
            Self::RestoringReplicas => "restoring_replicas",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Display for TableResetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outstanding retention leases across the shards of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseReading {
    /// Highest lease count of any shard
    Count(u64),
    /// The lease query failed; never treated as cleared
    Unavailable,
}

impl LeaseReading {
    /// Only the primary's own lease is left on every shard
    pub fn is_cleared(self) -> bool {
        matches!(self, Self::Count(count) if count <= 1)
    }
}

impl Display for LeaseReading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::Unavailable => f.write_str("unknown"),
        }
    }
}

/// Why a reset step failed; the text becomes the table's error message
#[derive(Debug, Error)]
enum StepError {
    #[error("Invalid table identifier: {0}")]
    InvalidIdentifier(IdentifierError),

    #[error("Failed to set replicas to 0: {0}")]
    SetReplicasZero(xlens_client::Error),

    #[error("Timeout after {}s - {reading} retention leases remaining", .max_wait.as_secs())]
    LeaseTimeout {
        max_wait: Duration,
        reading: LeaseReading,
    },

    #[error("CRITICAL: Invalid table identifier: {0}")]
    RestoreIdentifier(IdentifierError),

    #[error("CRITICAL: Failed to restore replicas: {0}")]
    RestoreReplicas(xlens_client::Error),
}

/// Drives one [`CandidateTable`] through a replica reset
#[derive(Debug)]
pub struct TableResetProcessor {
    executor: Arc<dyn SqlExecutor>,
    table: CandidateTable,
    /// Captured before any change is made; every restore uses it
    original_replicas: u32,
    dry_run: bool,
    max_wait: Duration,
    state: TableResetState,
    error_message: Option<String>,
    started: Option<Instant>,
}

impl TableResetProcessor {
    pub fn new(
        executor: Arc<dyn SqlExecutor>,
        table: CandidateTable,
        dry_run: bool,
        max_wait: Duration,
    ) -> Self {
        let original_replicas = table.current_replicas;
        Self {
            executor,
            table,
            original_replicas,
            dry_run,
            max_wait: max_wait.min(MAX_WAIT_LIMIT),
            state: TableResetState::Detected,
            error_message: None,
            started: None,
        }
    }

    pub fn state(&self) -> TableResetState {
        self.state
    }

    /// Why the reset failed, set only in [`TableResetState::Failed`]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn identity(&self) -> &TableIdentity {
        &self.table.identity
    }

    pub fn display_name(&self) -> String {
        self.table.display_name()
    }

    /// Run the reset to completion. Returns whether it succeeded; the processor always ends in
    /// a terminal state.
    pub async fn process(&mut self) -> bool {
        let started = Instant::now();
        self.started = Some(started);

        if let Err(e) = self.set_replicas_to_zero().await {
            self.fail(e).await;
            return false;
        }
        if let Err(e) = self.monitor_retention_leases().await {
            self.fail(e).await;
            return false;
        }
        if let Err(e) = self.restore_replicas().await {
            self.fail(e).await;
            return false;
        }

        self.transition(TableResetState::Completed);
        self.log_info(format_args!(
            "Successfully completed replica reset in {:.1}s",
            started.elapsed().as_secs_f64()
        ));
        true
    }

    async fn set_replicas_to_zero(&mut self) -> Result<(), StepError> {
        self.transition(TableResetState::SettingReplicasZero);

        // the lease checks must be scoped like the statement before anything changes
        partition_scope(&self.table.identity).map_err(StepError::InvalidIdentifier)?;
        let sql =
            alter_replicas_sql(&self.table.identity, 0).map_err(StepError::InvalidIdentifier)?;
        self.log_info(format_args!(
            "Setting replicas to 0 (original: {})",
            self.original_replicas
        ));
        self.run_statement(&sql)
            .await
            .map_err(StepError::SetReplicasZero)
    }

    async fn monitor_retention_leases(&mut self) -> Result<(), StepError> {
        self.transition(TableResetState::MonitoringLeases);

        let delays = backoff_delays(self.max_wait);
        let started = Instant::now();

        for (attempt, delay) in delays.iter().enumerate() {
            let reading = self.check_retention_leases().await;
            if reading.is_cleared() {
                self.log_info(format_args!(
                    "Retention leases cleared after {:.1}s ({} attempts)",
                    started.elapsed().as_secs_f64(),
                    attempt + 1
                ));
                return Ok(());
            }

            self.log_info(format_args!(
                "Attempt {}/{}: {reading} leases remaining, waiting {}s",
                attempt + 1,
                delays.len(),
                delay.as_secs()
            ));
            tokio::time::sleep(*delay).await;
        }

        let reading = self.check_retention_leases().await;
        if reading.is_cleared() {
            self.log_info(format_args!(
                "Retention leases cleared after {:.1}s (final check)",
                started.elapsed().as_secs_f64()
            ));
            return Ok(());
        }

        Err(StepError::LeaseTimeout {
            max_wait: self.max_wait,
            reading,
        })
    }

    async fn restore_replicas(&mut self) -> Result<(), StepError> {
        self.transition(TableResetState::RestoringReplicas);

        let sql = alter_replicas_sql(&self.table.identity, self.original_replicas)
            .map_err(StepError::RestoreIdentifier)?;
        self.log_info(format_args!(
            "Restoring replicas to {}",
            self.original_replicas
        ));
        self.run_statement(&sql)
            .await
            .map_err(StepError::RestoreReplicas)
    }

    /// Highest lease count over the entity's shards; no shards reads as zero
    async fn check_retention_leases(&self) -> LeaseReading {
        if self.dry_run {
            self.log_info("DRY RUN: Simulating retention leases cleared");
            return LeaseReading::Count(0);
        }

        let (stmt, args) = match retention_lease_query(&self.table.identity) {
            Ok(query) => query,
            Err(e) => {
                self.log_error(format_args!("Cannot query retention leases: {e}"));
                return LeaseReading::Unavailable;
            }
        };

        match self.executor.execute(&stmt, &args).await {
            Ok(resp) => LeaseReading::Count(
                resp.rows
                    .iter()
                    .map(|r| row::unsigned(r, 0).unwrap_or(0))
                    .max()
                    .unwrap_or(0),
            ),
            Err(e) => {
                self.log_error(format_args!("Error checking retention leases: {e}"));
                LeaseReading::Unavailable
            }
        }
    }

    async fn fail(&mut self, error: StepError) {
        let message = error.to_string();
        let previous = self.state;
        self.transition(TableResetState::Failed);
        self.log_error(&message);
        self.error_message = Some(message);

        match previous {
            TableResetState::MonitoringLeases => self.rollback().await,
            TableResetState::SettingReplicasZero => {
                self.log_info("Replicas were not changed, nothing to roll back");
            }
            _ => {}
        }
    }

    /// Best-effort restore of the original replica count; never changes the outcome
    async fn rollback(&self) {
        if self.dry_run {
            self.log_info("DRY RUN: Would attempt rollback to original replica count");
            return;
        }

        self.log_info(format_args!(
            "Attempting rollback: restoring {} replicas",
            self.original_replicas
        ));
        let result = match alter_replicas_sql(&self.table.identity, self.original_replicas) {
            Ok(sql) => self.run_statement(&sql).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => self.log_info("Rollback successful"),
            Err(e) => self.log_error(format_args!(
                "MANUAL INTERVENTION REQUIRED: Rollback failed - {e}"
            )),
        }
    }

    async fn run_statement(&self, sql: &str) -> xlens_client::Result<()> {
        if self.dry_run {
            self.log_info(format_args!("DRY RUN: Would execute: {sql}"));
            return Ok(());
        }
        self.log_info(format_args!("Executing: {sql}"));
        self.executor.execute(sql, &[]).await.map(|_| ())
    }

    fn transition(&mut self, state: TableResetState) {
        let previous = self.state;
        self.state = state;
        let elapsed = self
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or_default();
        self.log_info(format_args!(
            "State transition: {previous} -> {state} ({elapsed:.1}s)"
        ));
    }

    fn log_info(&self, message: impl Display) {
        info!(
            table = %self.table.identity,
            state = %self.state,
            original_replicas = self.original_replicas,
            dry_run = self.dry_run,
            "{message}"
        );
    }

    fn log_error(&self, message: impl Display) {
        error!(
            table = %self.table.identity,
            state = %self.state,
            original_replicas = self.original_replicas,
            dry_run = self.dry_run,
            "{message}"
        );
    }
}
