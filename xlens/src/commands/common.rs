use std::time::Duration;

use clap::Parser;
use secrecy::{ExposeSecret, Secret};
use url::Url;
use xlens_client::Client;

#[derive(Debug, Parser)]
pub(crate) struct CrateDbConfig {
    /// URL of a CrateDB node or load balancer
    #[clap(
        short = 'H',
        long = "host",
        env = "CRATE_CONNECTION_STRING",
        default_value = "http://localhost:4200"
    )]
    pub(crate) host_url: Url,

    /// User for HTTP basic authentication
    #[clap(long = "username", env = "CRATE_USERNAME")]
    pub(crate) username: Option<String>,

    /// Password for HTTP basic authentication
    #[clap(long = "password", env = "CRATE_PASSWORD", hide_env_values = true)]
    pub(crate) password: Option<Secret<String>>,

    /// Verify the server's TLS certificate
    #[clap(
        long = "ssl-verify",
        env = "CRATE_SSL_VERIFY",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub(crate) ssl_verify: bool,

    /// Timeout for each statement, e.g. `30s` or `2m`
    #[clap(
        long = "timeout",
        env = "CRATE_QUERY_TIMEOUT",
        default_value = "30s",
        value_parser = humantime::parse_duration
    )]
    pub(crate) timeout: Duration,
}

impl CrateDbConfig {
    pub(crate) fn client(&self) -> Result<Client, xlens_client::Error> {
        let mut client = Client::new(self.host_url.clone())?
            .with_tls_verification(self.ssl_verify)?
            .with_timeout(self.timeout)?;
        if let Some(username) = &self.username {
            client = client.with_basic_auth(
                username.as_str(),
                self.password.as_ref().map(|p| p.expose_secret().as_str()),
            );
        }
        Ok(client)
    }
}
