//! Discovery of tables and partitions whose replicas carry large uncommitted translogs

use std::collections::HashSet;

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{ResolvedThresholds, SqlExecutor, TableIdentity, TranslogSummary, row};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to query problematic translogs: {0}")]
    Query(#[from] xlens_client::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Per table or partition: replica shards over the baseline and the entity's shard totals.
/// Only STARTED shards are counted.
const SUMMARY_QUERY: &str = "\
SELECT
    all_shards.schema_name,
    all_shards.table_name,
    translate(p.values::text, ':{}', '=()') AS partition_values,
    p.partition_ident,
    COUNT(CASE WHEN all_shards.primary = FALSE
        AND COALESCE(all_shards.translog_stats['uncommitted_size'], 0) > ? * 1024^2 THEN 1 END)
        AS problematic_replica_shards,
    MAX(CASE WHEN all_shards.primary = FALSE
        AND COALESCE(all_shards.translog_stats['uncommitted_size'], 0) > ? * 1024^2
        THEN COALESCE(all_shards.translog_stats['uncommitted_size'] / 1024^2, 0) END)
        AS max_translog_uncommitted_mb,
    COUNT(CASE WHEN all_shards.primary = TRUE THEN 1 END) AS total_primary_shards,
    COUNT(CASE WHEN all_shards.primary = FALSE THEN 1 END) AS total_replica_shards,
    SUM(CASE WHEN all_shards.primary = TRUE
        THEN COALESCE(all_shards.size / 1024^3, 0) ELSE 0 END) AS total_primary_size_gb,
    SUM(CASE WHEN all_shards.primary = FALSE
        THEN COALESCE(all_shards.size / 1024^3, 0) ELSE 0 END) AS total_replica_size_gb
FROM sys.shards AS all_shards
LEFT JOIN information_schema.table_partitions p
    ON all_shards.table_name = p.table_name
    AND all_shards.schema_name = p.table_schema
    AND all_shards.partition_ident = p.partition_ident
WHERE all_shards.state = 'STARTED'
    AND all_shards.schema_name || '.' || all_shards.table_name
        || COALESCE(all_shards.partition_ident, '') IN (
        SELECT DISTINCT sh.schema_name || '.' || sh.table_name || COALESCE(sh.partition_ident, '')
        FROM sys.shards AS sh
        WHERE sh.state = 'STARTED'
            AND COALESCE(sh.translog_stats['uncommitted_size'], 0) > ? * 1024^2
            AND sh.primary = FALSE
    )
GROUP BY all_shards.schema_name, all_shards.table_name, partition_values, p.partition_ident
ORDER BY max_translog_uncommitted_mb DESC";

/// Every STARTED replica shard over the baseline, largest translog first
const SHARDS_QUERY: &str = "\
SELECT
    sh.schema_name,
    sh.table_name,
    translate(p.values::text, ':{}', '=()') AS partition_values,
    p.partition_ident,
    sh.id AS shard_id,
    COALESCE(node['name'], 'unknown-' || COALESCE(node['id'], 'corrupted')) AS node_name,
    COALESCE(sh.translog_stats['uncommitted_size'] / 1024^2, 0) AS translog_uncommitted_mb
FROM sys.shards AS sh
LEFT JOIN information_schema.table_partitions p
    ON sh.table_name = p.table_name
    AND sh.schema_name = p.table_schema
    AND sh.partition_ident = p.partition_ident
WHERE sh.state = 'STARTED'
    AND COALESCE(sh.translog_stats['uncommitted_size'], 0) > ? * 1024^2
    AND sh.primary = FALSE
ORDER BY COALESCE(sh.translog_stats['uncommitted_size'], 0) DESC";

/// One replica shard whose uncommitted translog is over its threshold
#[derive(Debug, Clone, PartialEq)]
pub struct ProblematicShard {
    pub identity: TableIdentity,
    pub shard_id: u64,
    pub node_name: String,
    pub translog_mb: f64,
    /// The threshold the shard was found to exceed
    pub threshold_mb: f64,
}

/// Problematic replica shards and the per-entity summaries they roll up into
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub shards: Vec<ProblematicShard>,
    pub summaries: Vec<TranslogSummary>,
}

impl Discovery {
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Keep the shards over their entity's effective threshold, and the summaries of the
    /// entities that still have one
    ///
    /// The effective threshold is the larger of `baseline_mb` and the entity's resolved
    /// threshold; an entity without one is judged against the baseline alone.
    pub fn apply_adaptive_thresholds(
        self,
        thresholds: &ResolvedThresholds,
        baseline_mb: f64,
    ) -> Self {
        let shards: Vec<_> = self
            .shards
            .into_iter()
            .filter_map(|mut shard| {
                let threshold_mb = thresholds
                    .lookup(&shard.identity)
                    .map_or(baseline_mb, |info| info.threshold_mb)
                    .max(baseline_mb);
                shard.threshold_mb = threshold_mb;
                if shard.translog_mb > threshold_mb {
                    Some(shard)
                } else {
                    debug!(
                        table = %shard.identity,
                        shard_id = shard.shard_id,
                        translog_mb = shard.translog_mb,
                        threshold_mb,
                        "replica within its adaptive threshold"
                    );
                    None
                }
            })
            .collect();

        let retained: HashSet<&TableIdentity> = shards.iter().map(|s| &s.identity).collect();
        let summaries = self
            .summaries
            .into_iter()
            .filter(|s| retained.contains(&s.identity))
            .collect();

        Self { shards, summaries }
    }
}

/// Problematic replica shards and per-entity summaries, both over `min_size_mb`
pub async fn discover(executor: &dyn SqlExecutor, min_size_mb: f64) -> Result<Discovery> {
    let shards = discover_problematic_shards(executor, min_size_mb).await?;
    let summaries = discover_problematic(executor, min_size_mb).await?;
    Ok(Discovery { shards, summaries })
}

/// Replica shards whose uncommitted translog exceeds `min_size_mb`, largest first
pub async fn discover_problematic_shards(
    executor: &dyn SqlExecutor,
    min_size_mb: f64,
) -> Result<Vec<ProblematicShard>> {
    let resp = executor
        .execute(SHARDS_QUERY, &[Value::from(min_size_mb)])
        .await?;

    let shards: Vec<_> = resp
        .rows
        .iter()
        .filter_map(|r| {
            let shard = shard_from_row(r, min_size_mb);
            if shard.is_none() {
                warn!(row = ?r, "ignoring unreadable problematic shard row");
            }
            shard
        })
        .collect();
    debug!(found = shards.len(), min_size_mb, "discovered problematic replica shards");
    Ok(shards)
}

fn shard_from_row(r: &[Value], min_size_mb: f64) -> Option<ProblematicShard> {
    let mut identity = TableIdentity::new(row::string(r, 0)?, row::string(r, 1)?);
    identity.partition_values = row::string(r, 2);
    identity.partition_ident = row::string(r, 3);

    Some(ProblematicShard {
        identity,
        shard_id: row::unsigned(r, 4)?,
        node_name: row::string(r, 5)?,
        translog_mb: row::float(r, 6).unwrap_or_default(),
        threshold_mb: min_size_mb,
    })
}

/// Tables and partitions with at least one replica whose uncommitted translog exceeds
/// `min_size_mb`, largest first
pub async fn discover_problematic(
    executor: &dyn SqlExecutor,
    min_size_mb: f64,
) -> Result<Vec<TranslogSummary>> {
    let args = [Value::from(min_size_mb), Value::from(min_size_mb), Value::from(min_size_mb)];
    let resp = executor.execute(SUMMARY_QUERY, &args).await?;

    let summaries: Vec<_> = resp
        .rows
        .iter()
        .filter_map(|r| {
            let summary = summary_from_row(r);
            if summary.is_none() {
                warn!(row = ?r, "ignoring unreadable translog summary row");
            }
            summary
        })
        .collect();
    debug!(found = summaries.len(), min_size_mb, "discovered problematic translogs");
    Ok(summaries)
}

fn summary_from_row(r: &[Value]) -> Option<TranslogSummary> {
    let mut identity = TableIdentity::new(row::string(r, 0)?, row::string(r, 1)?);
    identity.partition_values = row::string(r, 2);
    identity.partition_ident = row::string(r, 3);

    Some(TranslogSummary {
        identity,
        problematic_replica_shards: row::unsigned(r, 4).unwrap_or_default(),
        max_uncommitted_mb: row::float(r, 5).unwrap_or_default(),
        total_primary_shards: row::unsigned(r, 6).unwrap_or_default(),
        total_replica_shards: row::unsigned(r, 7).unwrap_or_default(),
        total_primary_size_gb: row::float(r, 8).unwrap_or_default(),
        total_replica_size_gb: row::float(r, 9).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        ThresholdInfo,
        test_util::{Reply, ScriptedExecutor},
    };

    #[tokio::test]
    async fn reads_summary_rows() {
        let executor = ScriptedExecutor::new().on(
            "FROM sys.shards AS all_shards",
            Reply::Rows(vec![
                vec![
                    json!("doc"),
                    json!("parted"),
                    json!("(\"day\"='2024-01-01')"),
                    json!("04732"),
                    json!(2),
                    json!(2048.5),
                    json!(3),
                    json!(3),
                    json!(12.5),
                    json!(12.25),
                ],
                vec![
                    json!("doc"),
                    json!("events"),
                    json!(null),
                    json!(null),
                    json!(1),
                    json!(700.0),
                    json!(6),
                    json!(6),
                    json!(1.0),
                    json!(1.0),
                ],
                vec![json!(null), json!("broken")],
            ]),
        );

        let summaries = discover_problematic(&executor, 512.0).await.unwrap();

        assert_eq!(summaries.len(), 2);
        let parted = &summaries[0];
        assert_eq!(
            parted.identity,
            TableIdentity::new("doc", "parted").with_partition("(\"day\"='2024-01-01')", "04732")
        );
        assert_eq!(parted.identity.partition_ident(), Some("04732"));
        assert_eq!(parted.problematic_replica_shards, 2);
        assert_eq!(parted.max_uncommitted_mb, 2048.5);
        assert_eq!(parted.total_replica_size_gb, 12.25);
        assert!(!summaries[1].identity.has_partition());

        let calls = executor.calls();
        assert_eq!(calls[0].args, vec![json!(512.0), json!(512.0), json!(512.0)]);
    }

    #[tokio::test]
    async fn query_failure_is_an_error() {
        let executor = ScriptedExecutor::new()
            .on("sys.shards", Reply::Error("SQLActionException".into()));

        let err = discover_problematic(&executor, 512.0).await.unwrap_err();

        assert!(err.to_string().contains("SQLActionException"), "{err}");
    }

    fn shard(identity: TableIdentity, shard_id: u64, translog_mb: f64) -> ProblematicShard {
        ProblematicShard {
            identity,
            shard_id,
            node_name: format!("data-{shard_id}"),
            translog_mb,
            threshold_mb: 512.0,
        }
    }

    #[tokio::test]
    async fn reads_shard_rows() {
        let executor = ScriptedExecutor::new().on(
            "AS node_name",
            Reply::Rows(vec![
                vec![
                    json!("doc"),
                    json!("parted"),
                    json!("(\"day\"='2024-01-01')"),
                    json!("04732"),
                    json!(3),
                    json!("data-2"),
                    json!(2048.5),
                ],
                vec![
                    json!("doc"),
                    json!("events"),
                    json!(null),
                    json!(null),
                    json!(0),
                    json!("unknown-corrupted"),
                    json!(700.0),
                ],
                vec![json!("doc"), json!("broken"), json!(null), json!(null), json!(null)],
            ]),
        );

        let discovery = discover(&executor, 512.0).await.unwrap();

        assert_eq!(discovery.shards.len(), 2);
        let first = &discovery.shards[0];
        assert_eq!(first.identity.partition_ident(), Some("04732"));
        assert_eq!(first.shard_id, 3);
        assert_eq!(first.node_name, "data-2");
        assert_eq!(first.translog_mb, 2048.5);
        assert_eq!(first.threshold_mb, 512.0);
        assert!(discovery.summaries.is_empty());

        let calls = executor.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].args, vec![json!(512.0)]);
        assert!(calls[1].stmt.contains("AS all_shards"));
    }

    #[test]
    fn adaptive_thresholds_refilter_shards_and_summaries() {
        let events = TableIdentity::new("doc", "events");
        let logs = TableIdentity::new("doc", "logs");
        let unknown = TableIdentity::new("doc", "unknown");

        let mut thresholds = ResolvedThresholds::default();
        // 1 GiB configured, 1126.4 MB with the buffer
        thresholds.insert("doc.events", ThresholdInfo::from_config_mb(1024.0));
        // configured below the baseline
        thresholds.insert("doc.logs", ThresholdInfo::from_config_mb(100.0));

        let discovery = Discovery {
            shards: vec![
                shard(events.clone(), 0, 2048.5),
                shard(events.clone(), 1, 900.0),
                shard(logs.clone(), 0, 520.0),
                shard(unknown.clone(), 0, 600.0),
            ],
            summaries: vec![
                TranslogSummary::new(events.clone(), 2048.5),
                TranslogSummary::new(logs.clone(), 520.0),
                TranslogSummary::new(unknown.clone(), 600.0),
            ],
        };
        let adaptive = discovery.apply_adaptive_thresholds(&thresholds, 512.0);

        let kept: Vec<_> = adaptive
            .shards
            .iter()
            .map(|s| (s.identity.table.as_str(), s.shard_id, s.threshold_mb))
            .collect();
        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].0, "events");
        assert!((kept[0].2 - 1126.4).abs() < 1e-9);
        assert_eq!(kept[1], ("logs", 0, 512.0));
        assert_eq!(kept[2], ("unknown", 0, 512.0));
        assert_eq!(adaptive.summaries.len(), 3);

        // over the baseline, under its own configured threshold
        let within = Discovery {
            shards: vec![shard(events.clone(), 0, 900.0)],
            summaries: vec![TranslogSummary::new(events, 900.0)],
        }
        .apply_adaptive_thresholds(&thresholds, 512.0);
        assert!(within.is_empty());
        assert!(within.summaries.is_empty());
    }
}
