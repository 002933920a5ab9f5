use clap::Parser;
use tracing::debug;
use xlens_logging::cli::LoggingConfig;

use super::common::CrateDbConfig;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Client(#[from] xlens_client::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    crate_config: CrateDbConfig,

    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let client = config.crate_config.client()?;
    debug!(url = %client.sql_url(), "testing connection");

    let resp = client.execute("SELECT name FROM sys.cluster", &[]).await?;
    let name = resp
        .first_value()
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    println!(
        "Connected to CrateDB cluster '{name}' at {}",
        config.crate_config.host_url
    );
    Ok(())
}
