use std::fmt;

use thiserror::Error;

/// The configured server URL could not be parsed.
#[derive(Debug, Clone, Error)]
#[error("invalid server address `{given}`: {reason}")]
pub struct InvalidServerAddress {
    given: String,
    reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Http,
    Https,
}

/// Parsed `scheme://host[:port]` ingestion endpoint.
///
/// Only `http` and `https` are accepted and the address must name a bare
/// host, so a stray path or credential in the configuration fails loudly at
/// session construction rather than as a misdirected request.
#[derive(Debug, Clone)]
pub struct ServerAddress {
    url: String,
    scheme: Scheme,
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn parse(url: &str) -> Result<Self, InvalidServerAddress> {
        let invalid = |reason: &str| InvalidServerAddress {
            given: url.trim().to_string(),
            reason: reason.to_string(),
        };
        let lowered = url.trim().to_ascii_lowercase();
        let (scheme, rest) = if let Some(rest) = lowered.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = lowered.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(invalid("the scheme must be http:// or https://"));
        };
        if rest.contains('/') {
            return Err(invalid("a path is not allowed"));
        }
        let (host, port) = match rest.split_once(':') {
            None => (rest, default_port(scheme)),
            Some((host, port_text)) => {
                if port_text.is_empty() || !port_text.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid("the port must be numeric"));
                }
                let port = port_text
                    .parse::<u16>()
                    .map_err(|_| invalid("the port is out of range"))?;
                (host, port)
            }
        };
        if host.is_empty() {
            return Err(invalid("the host is missing"));
        }
        Ok(Self {
            url: url.trim().to_string(),
            scheme,
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

fn default_port(scheme: Scheme) -> u16 {
    match scheme {
        Scheme::Http => 80,
        Scheme::Https => 443,
    }
}
