//! The seam between the reset workflow and the database

use async_trait::async_trait;
use serde_json::Value;
use xlens_client::{Client, SqlResponse};

/// Executes SQL statements against the cluster
///
/// Implementations hold no per-statement state, so a single executor is shared by every
/// component of a run.
#[async_trait]
pub trait SqlExecutor: std::fmt::Debug + Send + Sync + 'static {
    async fn execute(&self, stmt: &str, args: &[Value]) -> xlens_client::Result<SqlResponse>;
}

#[async_trait]
impl SqlExecutor for Client {
    async fn execute(&self, stmt: &str, args: &[Value]) -> xlens_client::Result<SqlResponse> {
        Client::execute(self, stmt, args).await
    }
}
