//! Statements for an operator to run a replica reset by hand
//!
//! The plan pauses rebalancing, cancels every problematic replica allocation, then walks each
//! table through the same set-zero, wait, restore sequence [`crate::TableResetProcessor`]
//! executes, and finally re-enables rebalancing.

use std::fmt::Display;

use tracing::warn;

use crate::{
    CandidateTable,
    discovery::ProblematicShard,
    sql::{
        DISABLE_REBALANCE, ENABLE_REBALANCE, alter_replicas_sql, render_for_display,
        reroute_cancel_sql, retention_lease_query,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TablePlan {
    pub display_name: String,
    pub set_zero: String,
    pub monitor_leases: String,
    pub restore: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManualPlan {
    pub reroute_cancel: Vec<String>,
    pub tables: Vec<TablePlan>,
}

impl ManualPlan {
    /// Entities whose identifiers cannot be quoted are left out with a warning
    pub fn build(shards: &[ProblematicShard], candidates: &[CandidateTable]) -> Self {
        let reroute_cancel = shards
            .iter()
            .filter_map(|shard| {
                reroute_cancel_sql(&shard.identity, shard.shard_id, &shard.node_name)
                    .inspect_err(|error| {
                        warn!(table = %shard.identity, %error, "no REROUTE CANCEL for shard");
                    })
                    .ok()
            })
            .collect();

        let tables = candidates
            .iter()
            .filter_map(|candidate| {
                let plan = table_plan(candidate);
                if let Err(error) = &plan {
                    warn!(table = %candidate.identity, %error, "no reset statements for table");
                }
                plan.ok()
            })
            .collect();

        Self {
            reroute_cancel,
            tables,
        }
    }
}

fn table_plan(candidate: &CandidateTable) -> Result<TablePlan, crate::sql::IdentifierError> {
    let identity = &candidate.identity;
    let (stmt, args) = retention_lease_query(identity)?;
    Ok(TablePlan {
        display_name: candidate.display_name(),
        set_zero: alter_replicas_sql(identity, 0)?,
        monitor_leases: render_for_display(&stmt, &args),
        restore: alter_replicas_sql(identity, candidate.current_replicas)?,
    })
}

impl Display for ManualPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "1. Stop automatic shard rebalancing:")?;
        writeln!(f, "{DISABLE_REBALANCE}")?;
        writeln!(f)?;

        writeln!(f, "2. REROUTE CANCEL commands:")?;
        writeln!(f, "-- CANCEL SHARD is deprecated on some CrateDB versions")?;
        for stmt in &self.reroute_cancel {
            writeln!(f, "{stmt}")?;
        }
        writeln!(f)?;

        for table in &self.tables {
            writeln!(f, "-- For {}:", table.display_name)?;
            writeln!(f)?;
            writeln!(f, "3. Set replicas to 0:")?;
            writeln!(f, "{}", table.set_zero)?;
            writeln!(f)?;
            writeln!(f, "4. Monitor retention leases:")?;
            writeln!(f, "{}", table.monitor_leases)?;
            writeln!(f)?;
            writeln!(f, "5. Restore replicas to the original value:")?;
            writeln!(f, "{}", table.restore)?;
            writeln!(f)?;
            writeln!(f, "{}", "-".repeat(80))?;
            writeln!(f)?;
        }

        writeln!(f, "6. Re-enable automatic shard rebalancing:")?;
        writeln!(f, "{ENABLE_REBALANCE}")?;
        writeln!(f)?;

        let tables = self.tables.len();
        writeln!(f, "Total commands:")?;
        writeln!(f, "  1 rebalancing disable command")?;
        writeln!(f, "  {} REROUTE CANCEL commands", self.reroute_cancel.len())?;
        writeln!(f, "  {tables} set replicas to 0 commands")?;
        writeln!(f, "  {tables} retention lease queries (for monitoring)")?;
        writeln!(f, "  {tables} restore replicas commands")?;
        write!(f, "  1 rebalancing enable command")
    }
}
