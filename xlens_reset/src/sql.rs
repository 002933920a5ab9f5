//! Statements the reset workflow sends, or prints for an operator to run

use serde_json::Value;
use thiserror::Error;

use crate::TableIdentity;

pub const DISABLE_REBALANCE: &str =
    r#"SET GLOBAL PERSISTENT "cluster.routing.rebalance.enable" = 'none';"#;
pub const ENABLE_REBALANCE: &str =
    r#"SET GLOBAL PERSISTENT "cluster.routing.rebalance.enable" = 'all';"#;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("identifier cannot be empty")]
    Empty,

    #[error("identifier contains invalid character: {0}")]
    InvalidCharacter(String),

    #[error("partition {0} has no partition ident")]
    MissingPartitionIdent(String),
}

fn validate_identifier(identifier: &str) -> Result<&str, IdentifierError> {
    if identifier.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if identifier.contains('"') {
        return Err(IdentifierError::InvalidCharacter(identifier.to_string()));
    }
    Ok(identifier)
}

/// The partition ident to scope metadata and shard queries by, `None` for a whole table
///
/// Decided by the partition predicate, as for the `ALTER TABLE` statements built here. A
/// predicate without an ident cannot be scoped.
pub fn partition_scope(identity: &TableIdentity) -> Result<Option<&str>, IdentifierError> {
    match (identity.partition(), identity.partition_ident()) {
        (None, _) => Ok(None),
        (Some(_), Some(ident)) => Ok(Some(ident)),
        (Some(values), None) => Err(IdentifierError::MissingPartitionIdent(values.to_string())),
    }
}

/// `ALTER TABLE "schema"."table"[ PARTITION (...)]`, the predicate inserted as rendered by the
/// database
fn alter_table_prefix(identity: &TableIdentity) -> Result<String, IdentifierError> {
    let schema = validate_identifier(&identity.schema)?;
    let table = validate_identifier(&identity.table)?;

    let mut sql = format!(r#"ALTER TABLE "{schema}"."{table}""#);
    if let Some(values) = identity.partition() {
        sql.push_str(" PARTITION ");
        sql.push_str(values);
    }
    Ok(sql)
}

/// `ALTER TABLE` statement setting the replica count of a table or partition
pub fn alter_replicas_sql(
    identity: &TableIdentity,
    replicas: u32,
) -> Result<String, IdentifierError> {
    Ok(format!(
        r#"{} SET ("number_of_replicas" = {replicas});"#,
        alter_table_prefix(identity)?
    ))
}

/// Cancel one replica shard allocation on `node`
pub fn reroute_cancel_sql(
    identity: &TableIdentity,
    shard_id: u64,
    node: &str,
) -> Result<String, IdentifierError> {
    Ok(format!(
        "{} REROUTE CANCEL SHARD {shard_id} ON '{}' WITH (allow_primary = false);",
        alter_table_prefix(identity)?,
        node.replace('\'', "''")
    ))
}

/// Retention lease count of every shard of a table or partition
pub fn retention_lease_query(
    identity: &TableIdentity,
) -> Result<(String, Vec<Value>), IdentifierError> {
    let mut stmt = String::from(
        "SELECT array_length(retention_leases['leases'], 1) AS cnt_leases \
         FROM sys.shards \
         WHERE table_name = ? AND schema_name = ?",
    );
    let mut args = vec![
        Value::from(identity.table.as_str()),
        Value::from(identity.schema.as_str()),
    ];
    if let Some(ident) = partition_scope(identity)? {
        stmt.push_str(" AND partition_ident = ?");
        args.push(Value::from(ident));
    }
    Ok((stmt, args))
}

/// `number_of_replicas` of a table or partition
pub fn replica_count_query(
    identity: &TableIdentity,
) -> Result<(&'static str, Vec<Value>), IdentifierError> {
    let mut args = vec![
        Value::from(identity.schema.as_str()),
        Value::from(identity.table.as_str()),
    ];
    let stmt = match partition_scope(identity)? {
        Some(ident) => {
            args.push(Value::from(ident));
            "SELECT number_of_replicas \
             FROM information_schema.table_partitions \
             WHERE table_schema = ? AND table_name = ? AND partition_ident = ?"
        }
        None => {
            "SELECT number_of_replicas \
             FROM information_schema.tables \
             WHERE table_schema = ? AND table_name = ?"
        }
    };
    Ok((stmt, args))
}

/// Inline `args` into a parameterized statement for an operator to copy. Never executed.
pub fn render_for_display(stmt: &str, args: &[Value]) -> String {
    let mut rendered = String::with_capacity(stmt.len());
    let mut args = args.iter();
    for c in stmt.chars() {
        if c != '?' {
            rendered.push(c);
            continue;
        }
        match args.next() {
            Some(Value::String(s)) => {
                rendered.push('\'');
                rendered.push_str(&s.replace('\'', "''"));
                rendered.push('\'');
            }
            Some(other) => rendered.push_str(&other.to_string()),
            None => rendered.push(c),
        }
    }
    rendered.push(';');
    rendered
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn partition() -> TableIdentity {
        TableIdentity::new("doc", "events").with_partition(r#"("day"='2024-01-01')"#, "04732")
    }

    #[test]
    fn alter_statements() {
        let plain = TableIdentity::new("doc", "events");
        assert_eq!(
            alter_replicas_sql(&plain, 0).unwrap(),
            r#"ALTER TABLE "doc"."events" SET ("number_of_replicas" = 0);"#
        );
        assert_eq!(
            alter_replicas_sql(&partition(), 2).unwrap(),
            r#"ALTER TABLE "doc"."events" PARTITION ("day"='2024-01-01') SET ("number_of_replicas" = 2);"#
        );

        assert_eq!(
            alter_replicas_sql(&TableIdentity::new("", "events"), 0),
            Err(IdentifierError::Empty)
        );
        assert!(matches!(
            alter_replicas_sql(&TableIdentity::new("doc", r#"ev"ents"#), 0),
            Err(IdentifierError::InvalidCharacter(_))
        ));
    }

    #[test]
    fn reroute_cancel() {
        assert_eq!(
            reroute_cancel_sql(&partition(), 3, "data-1").unwrap(),
            r#"ALTER TABLE "doc"."events" PARTITION ("day"='2024-01-01') REROUTE CANCEL SHARD 3 ON 'data-1' WITH (allow_primary = false);"#
        );
        assert_eq!(
            reroute_cancel_sql(&TableIdentity::new("doc", "events"), 0, "o'neil").unwrap(),
            r#"ALTER TABLE "doc"."events" REROUTE CANCEL SHARD 0 ON 'o''neil' WITH (allow_primary = false);"#
        );
    }

    #[test]
    fn scope_follows_the_partition_predicate() {
        assert_eq!(partition_scope(&partition()), Ok(Some("04732")));
        assert_eq!(partition_scope(&TableIdentity::new("doc", "events")), Ok(None));

        // an ident without a predicate is a whole table, like its ALTER TABLE
        let mut ident_only = TableIdentity::new("doc", "events");
        ident_only.partition_ident = Some("04732".into());
        assert_eq!(partition_scope(&ident_only), Ok(None));
        let (stmt, args) = replica_count_query(&ident_only).unwrap();
        assert!(stmt.contains("FROM information_schema.tables"));
        assert_eq!(args.len(), 2);

        let mut values_only = TableIdentity::new("doc", "events");
        values_only.partition_values = Some(r#"("day"=1)"#.into());
        assert!(matches!(
            partition_scope(&values_only),
            Err(IdentifierError::MissingPartitionIdent(_))
        ));
        assert!(retention_lease_query(&values_only).is_err());
        assert!(replica_count_query(&values_only).is_err());
    }

    #[test]
    fn display_rendering() {
        let (stmt, args) = retention_lease_query(&partition()).unwrap();
        assert_eq!(
            render_for_display(&stmt, &args),
            "SELECT array_length(retention_leases['leases'], 1) AS cnt_leases FROM sys.shards \
             WHERE table_name = 'events' AND schema_name = 'doc' AND partition_ident = '04732';"
        );
        assert_eq!(
            render_for_display("SELECT ? + ?", &[json!("it's"), json!(2)]),
            "SELECT 'it''s' + 2;"
        );
    }
}
