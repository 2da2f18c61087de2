//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default deadline applied to connecting and to each request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a [`ClientSession`](super::ClientSession).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Ingestion endpoint, `http://host[:port]` or `https://host[:port]`.
    pub server_url: String,
    /// API token sent as the `token` base field of every request.
    pub api_key: String,
    /// Agent version advertised in the User-Agent header.
    pub agent_version: String,
    /// Deadline for connecting and for each request on the wire.
    pub request_timeout: Duration,
    /// PEM bundle the server certificate must chain to. Certificate
    /// verification is disabled when unset.
    pub ca_file: Option<PathBuf>,
    /// Suppress the construction-time log line naming the endpoint.
    pub quiet: bool,
}

impl SessionConfig {
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            ca_file: None,
            quiet: false,
        }
    }

    pub fn with_agent_version(mut self, version: impl Into<String>) -> Self {
        self.agent_version = version.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}
