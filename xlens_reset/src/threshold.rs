//! Per-entity "translog too large" thresholds derived from each entity's own
//! `translog.flush_threshold_size` setting.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{SqlExecutor, TableIdentity, row};

/// Flush threshold the database applies when a table carries no explicit setting (512 MiB)
pub const DEFAULT_FLUSH_THRESHOLD_BYTES: u64 = 536_870_912;

/// Headroom added on top of the configured flush threshold
pub const THRESHOLD_BUFFER: f64 = 1.1;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Configured flush threshold of one entity, and the threshold derived from it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdInfo {
    pub config_mb: f64,
    pub threshold_mb: f64,
}

impl ThresholdInfo {
    pub fn from_config_mb(config_mb: f64) -> Self {
        Self {
            config_mb,
            threshold_mb: config_mb * THRESHOLD_BUFFER,
        }
    }

    pub fn from_bytes(bytes: f64) -> Self {
        Self::from_config_mb(bytes / BYTES_PER_MB)
    }
}

/// Thresholds keyed by `schema.table` and `schema.table.partitionValues`
///
/// Entities the metadata queries returned no row for are absent; callers fall back to the
/// operator baseline for those.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedThresholds {
    entries: HashMap<String, ThresholdInfo>,
}

impl ResolvedThresholds {
    pub fn insert(&mut self, key: impl Into<String>, info: ThresholdInfo) {
        self.entries.insert(key.into(), info);
    }

    pub fn get(&self, key: &str) -> Option<ThresholdInfo> {
        self.entries.get(key).copied()
    }

    /// The partition's own entry, else its table's entry
    pub fn lookup(&self, identity: &TableIdentity) -> Option<ThresholdInfo> {
        identity
            .partition_key()
            .and_then(|key| self.get(&key))
            .or_else(|| self.get(&identity.table_key()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Looks up the configured flush threshold of a set of tables and partitions with at most two
/// batched metadata queries.
#[derive(Debug)]
pub struct AdaptiveThresholdResolver {
    executor: Arc<dyn SqlExecutor>,
}

impl AdaptiveThresholdResolver {
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    /// Resolve thresholds for `identities`
    ///
    /// A failing metadata query is logged and contributes no entries; it never fails the whole
    /// resolution.
    pub async fn resolve(&self, identities: &[TableIdentity]) -> ResolvedThresholds {
        let mut resolved = ResolvedThresholds::default();

        let tables: BTreeSet<(&str, &str)> = identities
            .iter()
            .map(|i| (i.schema.as_str(), i.table.as_str()))
            .collect();
        let partitioned: BTreeSet<(&str, &str)> = identities
            .iter()
            .filter(|i| i.has_partition())
            .map(|i| (i.schema.as_str(), i.table.as_str()))
            .collect();

        if !tables.is_empty() {
            let (stmt, args) = table_thresholds_query(&tables);
            match self.executor.execute(&stmt, &args).await {
                Ok(resp) => {
                    for row in &resp.rows {
                        let (Some(schema), Some(table), Some(bytes)) =
                            (row::string(row, 0), row::string(row, 1), row::float(row, 2))
                        else {
                            debug!(?row, "skipping unreadable table threshold row");
                            continue;
                        };
                        resolved.insert(format!("{schema}.{table}"), ThresholdInfo::from_bytes(bytes));
                    }
                }
                Err(error) => {
                    warn!(%error, "could not read table flush thresholds, using the baseline");
                }
            }
        }

        if !partitioned.is_empty() {
            let (stmt, args) = partition_thresholds_query(&partitioned);
            match self.executor.execute(&stmt, &args).await {
                Ok(resp) => {
                    for row in &resp.rows {
                        let (Some(schema), Some(table), Some(values), Some(bytes)) = (
                            row::string(row, 0),
                            row::string(row, 1),
                            row::string(row, 2),
                            row::float(row, 3),
                        ) else {
                            debug!(?row, "skipping unreadable partition threshold row");
                            continue;
                        };
                        resolved.insert(
                            format!("{schema}.{table}.{values}"),
                            ThresholdInfo::from_bytes(bytes),
                        );
                    }
                }
                Err(error) => {
                    warn!(%error, "could not read partition flush thresholds, using the baseline");
                }
            }
        }

        debug!(entries = resolved.len(), "resolved adaptive thresholds");
        resolved
    }
}

fn table_conditions(tables: &BTreeSet<(&str, &str)>) -> (String, Vec<Value>) {
    let conditions = vec!["(table_schema = ? AND table_name = ?)"; tables.len()].join(" OR ");
    let args = tables
        .iter()
        .flat_map(|(schema, table)| [Value::from(*schema), Value::from(*table)])
        .collect();
    (conditions, args)
}

fn table_thresholds_query(tables: &BTreeSet<(&str, &str)>) -> (String, Vec<Value>) {
    let (conditions, args) = table_conditions(tables);
    let stmt = format!(
        "SELECT table_schema, table_name, \
         COALESCE(settings['translog']['flush_threshold_size'], {DEFAULT_FLUSH_THRESHOLD_BYTES}) \
         AS flush_threshold_bytes \
         FROM information_schema.tables \
         WHERE {conditions}"
    );
    (stmt, args)
}

fn partition_thresholds_query(tables: &BTreeSet<(&str, &str)>) -> (String, Vec<Value>) {
    let (conditions, args) = table_conditions(tables);
    let stmt = format!(
        "SELECT table_schema, table_name, \
         translate(values::text, ':{{}}', '=()') AS partition_values, \
         COALESCE(settings['translog']['flush_threshold_size'], {DEFAULT_FLUSH_THRESHOLD_BYTES}) \
         AS flush_threshold_bytes \
         FROM information_schema.table_partitions \
         WHERE {conditions}"
    );
    (stmt, args)
}
