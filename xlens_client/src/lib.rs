//! Client for the CrateDB HTTP `/_sql` endpoint
//!
//! Every statement is sent as a single `POST` carrying the statement text and its positional
//! arguments. Successful responses carry column names and rows of JSON values; failed ones carry
//! an `error` object whose message is surfaced verbatim through [`Error`].

use std::time::Duration;

pub use reqwest::StatusCode;

use reqwest::{IntoUrl, Method};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Path of the SQL endpoint, relative to the cluster URL
const SQL_PATH: &str = "_sql";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Primary error type for the [`Client`]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("base URL error: {0}")]
    BaseUrl(#[source] reqwest::Error),

    #[error("request URL error: {0}")]
    RequestUrl(#[from] url::ParseError),

    #[error("failed to build the HTTP client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("failed to parse JSON response: {0}")]
    Json(#[source] reqwest::Error),

    #[error("failed to read the response body: {0}")]
    Text(#[source] reqwest::Error),

    #[error("server responded with error [{code}]: {message}")]
    ApiError { code: StatusCode, message: String },

    #[error("failed to send {method} {url} request: {source}")]
    RequestSend {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl Error {
    fn request_send(method: Method, url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::RequestSend {
            method,
            url: url.into(),
            source,
        }
    }

    /// The message reported by the database, if the server answered with an error
    pub fn api_message(&self) -> Option<&str> {
        match self {
            Self::ApiError { message, .. } => Some(message),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The result of a successfully executed statement
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SqlResponse {
    /// Column names, in the order values appear in each row
    #[serde(default)]
    pub cols: Vec<String>,
    /// Result rows
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    /// Number of rows returned or affected
    #[serde(default)]
    pub rowcount: Option<i64>,
    /// Server side execution time in milliseconds
    #[serde(default)]
    pub duration: Option<f64>,
}

impl SqlResponse {
    /// The first column of the first row, if any
    pub fn first_value(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

#[derive(Debug, Serialize)]
struct SqlRequest<'a> {
    stmt: &'a str,
    #[serde(skip_serializing_if = "no_args")]
    args: &'a [Value],
}

fn no_args(args: &&[Value]) -> bool {
    args.is_empty()
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

#[derive(Debug, Clone)]
struct Credentials {
    username: String,
    password: Secret<String>,
}

/// The CrateDB SQL client
///
/// For programmatic access to the `/_sql` HTTP API of a CrateDB cluster
#[derive(Debug, Clone)]
pub struct Client {
    /// The URL that statements are posted to
    sql_url: Url,
    /// Basic auth credentials; only sent when both user and password were provided
    credentials: Option<Credentials>,
    /// Skip TLS certificate verification
    accept_invalid_certs: bool,
    timeout: Duration,
    /// A [`reqwest::Client`] for handling HTTP requests
    http_client: reqwest::Client,
}

impl Client {
    /// Create a new [`Client`]
    ///
    /// The URL may point at the cluster root (`https://host:4200`) or at the SQL endpoint itself
    /// (`https://host:4200/_sql`).
    pub fn new<U: IntoUrl>(base_url: U) -> Result<Self> {
        let base_url = base_url.into_url().map_err(Error::BaseUrl)?;
        let sql_url = sql_endpoint(base_url)?;
        Ok(Self {
            sql_url,
            credentials: None,
            accept_invalid_certs: false,
            timeout: DEFAULT_TIMEOUT,
            http_client: build_http_client(false, DEFAULT_TIMEOUT)?,
        })
    }

    /// Authenticate each request with HTTP basic auth
    ///
    /// A user without a password (e.g. the default `crate` superuser) is sent unauthenticated.
    ///
    /// # Example
    /// ```
    /// # use xlens_client::Client;
    /// # fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    /// let client = Client::new("http://localhost:4200")?
    ///     .with_basic_auth("admin", Some("secret-password"));
    /// # Ok(())
    /// # }
    /// ```
    pub fn with_basic_auth<U, P>(mut self, username: U, password: Option<P>) -> Self
    where
        U: Into<String>,
        P: Into<String>,
    {
        self.credentials = password.map(|password| Credentials {
            username: username.into(),
            password: Secret::new(password.into()),
        });
        self
    }

    /// Enable or disable TLS certificate verification
    pub fn with_tls_verification(mut self, verify: bool) -> Result<Self> {
        self.accept_invalid_certs = !verify;
        self.http_client = build_http_client(self.accept_invalid_certs, self.timeout)?;
        Ok(self)
    }

    /// Set the timeout applied to each statement
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.timeout = timeout;
        self.http_client = build_http_client(self.accept_invalid_certs, self.timeout)?;
        Ok(self)
    }

    /// The URL statements are sent to
    pub fn sql_url(&self) -> &Url {
        &self.sql_url
    }

    /// Execute a single statement with positional (`?`) arguments
    ///
    /// # Example
    /// ```no_run
    /// # use xlens_client::Client;
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    /// let client = Client::new("http://localhost:4200")?;
    /// let resp = client
    ///     .execute(
    ///         "SELECT number_of_replicas FROM information_schema.tables WHERE table_name = ?",
    ///         &["events".into()],
    ///     )
    ///     .await?;
    /// println!("{:?}", resp.first_value());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute(&self, stmt: &str, args: &[Value]) -> Result<SqlResponse> {
        let mut req = self
            .http_client
            .post(self.sql_url.clone())
            .json(&SqlRequest { stmt, args });
        if let Some(Credentials { username, password }) = &self.credentials {
            req = req.basic_auth(username, Some(password.expose_secret()));
        }
        let resp = req
            .send()
            .await
            .map_err(|src| Error::request_send(Method::POST, self.sql_url.as_str(), src))?;
        let status = resp.status();
        if status.is_success() {
            resp.json().await.map_err(Error::Json)
        } else {
            let body = resp.text().await.map_err(Error::Text)?;
            Err(Error::ApiError {
                code: status,
                message: error_message(&body),
            })
        }
    }
}

fn build_http_client(accept_invalid_certs: bool, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(accept_invalid_certs)
        .timeout(timeout)
        .build()
        .map_err(Error::Build)
}

fn sql_endpoint(base_url: Url) -> Result<Url> {
    if base_url.path().trim_end_matches('/').ends_with(SQL_PATH) {
        return Ok(base_url);
    }
    let mut base_url = base_url;
    if !base_url.path().ends_with('/') {
        let path = format!("{}/", base_url.path());
        base_url.set_path(&path);
    }
    Ok(base_url.join(SQL_PATH)?)
}

/// Pull the database's message out of an error body, falling back to the raw text
fn error_message(body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.trim().to_string())
}
