//! Adaptive replica resets for tables whose replicas are stuck on large uncommitted translogs.
//!
//! A run goes through four stages:
//!
//! 1. [`discovery`] finds replica shards whose uncommitted translog exceeds an operator
//!    baseline, and the tables and partitions they belong to.
//! 2. [`AdaptiveThresholdResolver`] derives each entity's own threshold from its configured
//!    `translog.flush_threshold_size` plus a 10% buffer, and
//!    [`Discovery::apply_adaptive_thresholds`] drops what is within it.
//! 3. [`CandidateSelector`] keeps the entities that exceed a percentage of that threshold and
//!    records the replica count each of them must return to.
//! 4. [`BatchOrchestrator`] runs a [`TableResetProcessor`] per candidate, one at a time, and
//!    turns the outcomes into a [`BatchResult`] and a process exit code.
//!
//! Instead of step 4, [`ManualPlan`] prints the statements for an operator to run by hand.

pub mod backoff;
pub mod discovery;
pub mod executor;
pub mod manual;
pub mod orchestrator;
pub mod processor;
pub mod selector;
pub mod sql;
pub mod threshold;
pub mod types;

mod row;
#[cfg(test)]
mod test_util;

pub use discovery::{Discovery, ProblematicShard};
pub use executor::SqlExecutor;
pub use manual::ManualPlan;
pub use orchestrator::{
    BatchExitCode, BatchOptions, BatchOrchestrator, BatchOutcome, BatchResult, TableOutcome,
};
pub use processor::{LeaseReading, TableResetProcessor, TableResetState};
pub use selector::{CandidateSelector, ReplicaLookupError, Selection, SkipReason, SkippedTable};
pub use sql::IdentifierError;
pub use threshold::{AdaptiveThresholdResolver, ResolvedThresholds, ThresholdInfo};
pub use types::{AdaptiveSummary, CandidateTable, TableIdentity, TranslogSummary};
