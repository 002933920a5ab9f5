//! Percentage-based selection of the tables a replica reset runs against

use std::{cmp::Ordering, fmt::Display, sync::Arc};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    AdaptiveSummary, CandidateTable, SqlExecutor, TableIdentity, TranslogSummary,
    sql::{IdentifierError, replica_count_query},
    threshold::{ResolvedThresholds, ThresholdInfo},
};

/// Why the replica count of a table could not be read
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicaLookupError {
    #[error("{0}")]
    Query(String),

    #[error("no metadata row")]
    NoRow,

    #[error("unparseable value {0}")]
    Unparseable(String),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),
}

/// Why a table over the percentage threshold is left out of the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The replica count could not be read, so there is nothing known to restore to
    UnknownReplicas(ReplicaLookupError),
    /// Replication is already disabled
    ZeroReplicas,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownReplicas(e) => write!(f, "unknown replica count ({e})"),
            Self::ZeroReplicas => write!(f, "replicas already set to 0"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedTable {
    pub identity: TableIdentity,
    pub ratio_percent: f64,
    pub reason: SkipReason,
}

/// Outcome of a percentage filter pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub candidates: Vec<CandidateTable>,
    pub skipped: Vec<SkippedTable>,
}

#[derive(Debug)]
pub struct CandidateSelector {
    executor: Arc<dyn SqlExecutor>,
    baseline_mb: f64,
}

impl CandidateSelector {
    pub fn new(executor: Arc<dyn SqlExecutor>, baseline_mb: f64) -> Self {
        Self {
            executor,
            baseline_mb,
        }
    }

    /// Attach each summary's adaptive threshold, using the baseline for entities
    /// `thresholds` has no entry for
    pub fn compute_thresholds(
        &self,
        summaries: Vec<TranslogSummary>,
        thresholds: &ResolvedThresholds,
    ) -> Vec<AdaptiveSummary> {
        summaries
            .into_iter()
            .map(|summary| {
                let info = thresholds
                    .lookup(&summary.identity)
                    .unwrap_or_else(|| ThresholdInfo::from_config_mb(self.baseline_mb));
                AdaptiveSummary {
                    summary,
                    adaptive_config_mb: info.config_mb,
                    adaptive_threshold_mb: info.threshold_mb,
                }
            })
            .collect()
    }

    /// Keep tables whose peak translog is strictly more than `percent` of their adaptive
    /// threshold, and read the replica count each of them must be restored to.
    ///
    /// Tables whose replica count is unknown or already zero are reported in
    /// [`Selection::skipped`] rather than selected. A NaN `percent` selects nothing.
    pub async fn filter_by_percentage(
        &self,
        tables: Vec<AdaptiveSummary>,
        percent: f64,
    ) -> Selection {
        let mut selection = Selection::default();

        for table in tables {
            let Some(ratio) = table.ratio_percent() else {
                debug!(table = %table.identity(), "non-positive threshold, never exceeded");
                continue;
            };
            if ratio.partial_cmp(&percent) != Some(Ordering::Greater) {
                continue;
            }
            self.classify(table, ratio, &mut selection).await;
        }

        selection
    }

    /// Every table with a known, non-zero replica count, regardless of its ratio
    pub async fn with_known_replicas(&self, tables: Vec<AdaptiveSummary>) -> Selection {
        let mut selection = Selection::default();
        for table in tables {
            let ratio = table.ratio_percent().unwrap_or_default();
            self.classify(table, ratio, &mut selection).await;
        }
        selection
    }

    async fn classify(&self, table: AdaptiveSummary, ratio: f64, selection: &mut Selection) {
        match self.current_replicas(table.identity()).await {
            Ok(0) => {
                warn!(table = %table.identity(), "replicas already set to 0, skipping");
                selection.skipped.push(SkippedTable {
                    identity: table.identity().clone(),
                    ratio_percent: ratio,
                    reason: SkipReason::ZeroReplicas,
                });
            }
            Ok(replicas) => {
                selection
                    .candidates
                    .push(CandidateTable::from_adaptive(table, replicas));
            }
            Err(error) => {
                warn!(
                    table = %table.identity(),
                    %error,
                    "could not determine replica count, skipping"
                );
                selection.skipped.push(SkippedTable {
                    identity: table.identity().clone(),
                    ratio_percent: ratio,
                    reason: SkipReason::UnknownReplicas(error),
                });
            }
        }
    }

    /// Current replica count of a table or partition
    pub async fn current_replicas(
        &self,
        identity: &TableIdentity,
    ) -> Result<u32, ReplicaLookupError> {
        let (stmt, args) = replica_count_query(identity)?;
        let resp = self
            .executor
            .execute(stmt, &args)
            .await
            .map_err(|e| ReplicaLookupError::Query(e.to_string()))?;
        let value = resp.first_value().ok_or(ReplicaLookupError::NoRow)?;
        parse_replicas(value).ok_or_else(|| ReplicaLookupError::Unparseable(value.to_string()))
    }
}

/// Parse a `number_of_replicas` setting
///
/// Auto-expanding ranges such as `0-1` or `1-all` resolve to their lower bound.
pub fn parse_replicas(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => {
            let s = s.trim();
            let lower = s.split_once('-').map_or(s, |(lower, _)| lower);
            lower.trim().parse().ok()
        }
        _ => None,
    }
}
