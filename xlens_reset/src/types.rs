//! Tables, partitions and the per-run records derived from them

use std::{
    fmt::Display,
    hash::{Hash, Hasher},
};

/// Value the database reports in place of a missing partition attribute
pub const PARTITION_NULL_VALUE: &str = "NULL";

/// A table, or one partition of a partitioned table
///
/// Two identities refer to the same entity iff schema, table and partition values match; the
/// partition ident is carried along for the queries that filter by it but is not part of the key.
#[derive(Debug, Clone, Eq)]
pub struct TableIdentity {
    pub schema: String,
    pub table: String,
    /// Partition predicate exactly as rendered by the database, e.g. `("day"='2024-01-01')`
    pub partition_values: Option<String>,
    /// Opaque partition identifier from `sys.shards`/`information_schema.table_partitions`
    pub partition_ident: Option<String>,
}

impl TableIdentity {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            partition_values: None,
            partition_ident: None,
        }
    }

    pub fn with_partition(
        mut self,
        partition_values: impl Into<String>,
        partition_ident: impl Into<String>,
    ) -> Self {
        self.partition_values = Some(partition_values.into());
        self.partition_ident = Some(partition_ident.into());
        self
    }

    /// The partition predicate, if this identity names a partition
    pub fn partition(&self) -> Option<&str> {
        present(self.partition_values.as_deref())
    }

    /// The partition ident, if known
    pub fn partition_ident(&self) -> Option<&str> {
        present(self.partition_ident.as_deref())
    }

    pub fn has_partition(&self) -> bool {
        self.partition().is_some()
    }

    /// `schema.table`
    pub fn table_key(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// `schema.table.partitionValues`, for partitions only
    pub fn partition_key(&self) -> Option<String> {
        self.partition()
            .map(|values| format!("{}.{}.{values}", self.schema, self.table))
    }

    /// `schema.table` or `schema.table PARTITION (…)`
    pub fn display_name(&self) -> String {
        self.to_string()
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty() && *v != PARTITION_NULL_VALUE)
}

impl PartialEq for TableIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.schema == other.schema
            && self.table == other.table
            && self.partition() == other.partition()
    }
}

impl Hash for TableIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.schema.hash(state);
        self.table.hash(state);
        self.partition().hash(state);
    }
}

impl Display for TableIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)?;
        if let Some(values) = self.partition() {
            write!(f, " PARTITION {values}")?;
        }
        Ok(())
    }
}

/// One row of problematic-translog discovery: a table or partition with at least one replica
/// whose uncommitted translog exceeds the operator baseline
#[derive(Debug, Clone, PartialEq)]
pub struct TranslogSummary {
    pub identity: TableIdentity,
    pub problematic_replica_shards: u64,
    /// Peak uncommitted translog across the problematic replicas
    pub max_uncommitted_mb: f64,
    pub total_primary_shards: u64,
    pub total_replica_shards: u64,
    pub total_primary_size_gb: f64,
    pub total_replica_size_gb: f64,
}

impl TranslogSummary {
    /// A summary with only the fields the reset workflow looks at
    pub fn new(identity: TableIdentity, max_uncommitted_mb: f64) -> Self {
        Self {
            identity,
            problematic_replica_shards: 0,
            max_uncommitted_mb,
            total_primary_shards: 0,
            total_replica_shards: 0,
            total_primary_size_gb: 0.0,
            total_replica_size_gb: 0.0,
        }
    }
}

/// A summary with the adaptive threshold of its entity attached
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveSummary {
    pub summary: TranslogSummary,
    pub adaptive_config_mb: f64,
    pub adaptive_threshold_mb: f64,
}

impl AdaptiveSummary {
    pub fn identity(&self) -> &TableIdentity {
        &self.summary.identity
    }

    /// Observed peak as a percentage of the adaptive threshold
    ///
    /// `None` for a non-positive threshold, which never counts as exceeded.
    pub fn ratio_percent(&self) -> Option<f64> {
        (self.adaptive_threshold_mb > 0.0)
            .then(|| self.summary.max_uncommitted_mb / self.adaptive_threshold_mb * 100.0)
    }
}

/// A table selected for a replica reset, with the replica count to restore afterwards
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateTable {
    pub identity: TableIdentity,
    pub max_uncommitted_mb: f64,
    pub adaptive_config_mb: f64,
    pub adaptive_threshold_mb: f64,
    pub total_primary_shards: u64,
    /// Replica count read from the cluster at selection time
    pub current_replicas: u32,
}

impl CandidateTable {
    pub fn from_adaptive(table: AdaptiveSummary, current_replicas: u32) -> Self {
        let AdaptiveSummary {
            summary,
            adaptive_config_mb,
            adaptive_threshold_mb,
        } = table;
        Self {
            identity: summary.identity,
            max_uncommitted_mb: summary.max_uncommitted_mb,
            adaptive_config_mb,
            adaptive_threshold_mb,
            total_primary_shards: summary.total_primary_shards,
            current_replicas,
        }
    }

    pub fn display_name(&self) -> String {
        self.identity.display_name()
    }
}
