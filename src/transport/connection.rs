use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

use log::debug;
use native_tls::{Certificate, TlsConnector, TlsStream};
use thiserror::Error;

use super::http::{self, HttpResponse};

/// Errors surfaced by [`TransportConnection`].
#[derive(Debug, Error)]
pub enum TransportError {
    /// The host name did not resolve to any address.
    #[error("failed to resolve host {host}")]
    Dns { host: String },
    /// Every resolved address refused the connection.
    #[error("connection refused by {address}")]
    Refused { address: String },
    /// The connect deadline passed before any address accepted.
    #[error("timed out connecting to {address}")]
    TimedOut { address: String },
    /// The server certificate failed verification against the CA bundle.
    #[error("certificate verification failed: {detail}")]
    CertificateVerification { detail: String },
    /// Any other TLS setup or handshake failure.
    #[error("TLS error: {detail}")]
    Tls { detail: String },
    /// The CA bundle could not be read or held no certificates.
    #[error("failed to load CA bundle {bundle}: {detail}", bundle = .path.display())]
    CaBundle { path: PathBuf, detail: String },
    /// Socket I/O failure outside the cases above.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The connection was closed and cannot be used again.
    #[error("connection is closed")]
    Closed,
}

/// Server certificate policy for HTTPS connections.
///
/// With a CA bundle the server's chain must verify against the bundle alone;
/// the platform's built-in roots are not consulted. Without one the stream is
/// encrypted but the server's identity goes unverified.
#[derive(Clone, Debug, Default)]
pub struct TlsPolicy {
    pub ca_bundle: Option<PathBuf>,
}

impl TlsPolicy {
    fn connector(&self) -> Result<TlsConnector, TransportError> {
        let mut builder = TlsConnector::builder();
        match &self.ca_bundle {
            Some(path) => {
                builder.disable_built_in_roots(true);
                for certificate in load_ca_bundle(path)? {
                    builder.add_root_certificate(certificate);
                }
            }
            None => {
                builder.danger_accept_invalid_certs(true);
                builder.danger_accept_invalid_hostnames(true);
            }
        }
        builder.build().map_err(|error| TransportError::Tls {
            detail: error.to_string(),
        })
    }
}

enum ActiveStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Read for ActiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ActiveStream::Plain(stream) => stream.read(buf),
            ActiveStream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for ActiveStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ActiveStream::Plain(stream) => stream.write(buf),
            ActiveStream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ActiveStream::Plain(stream) => stream.flush(),
            ActiveStream::Tls(stream) => stream.flush(),
        }
    }
}

/// One HTTP(S) connection with an explicit deadline on every operation.
pub struct TransportConnection {
    host: String,
    port: u16,
    tls: Option<TlsPolicy>,
    timeout: Duration,
    stream: Option<ActiveStream>,
    closed: bool,
}

impl TransportConnection {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        tls: Option<TlsPolicy>,
        timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            timeout,
            stream: None,
            closed: false,
        }
    }

    /// Resolve, connect and (for HTTPS) complete the TLS handshake.
    ///
    /// # Errors
    ///
    /// Connect failures come back classified: [`TransportError::Dns`],
    /// [`TransportError::Refused`], [`TransportError::TimedOut`],
    /// [`TransportError::CertificateVerification`], [`TransportError::Tls`]
    /// or [`TransportError::Io`]. A closed connection fails
    /// [`TransportError::Closed`] without touching the network.
    pub fn connect(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.connect_tcp()?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        let active = match &self.tls {
            Some(policy) => ActiveStream::Tls(Box::new(self.handshake(policy, stream)?)),
            None => ActiveStream::Plain(stream),
        };
        self.stream = Some(active);
        debug!("connected to {}:{}", self.host, self.port);
        Ok(())
    }

    /// Issue one HTTP/1.1 request and read the complete response.
    pub fn request(
        &mut self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<HttpResponse, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let host_header = self.host_header();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| TransportError::Io(io::ErrorKind::NotConnected.into()))?;
        http::write_request(stream, method, path, &host_header, headers, body)?;
        let response = http::read_response(stream)?;
        Ok(response)
    }

    /// Close the connection; it can never be used again.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let ActiveStream::Tls(mut tls) = stream {
                let _ = tls.shutdown();
            }
            debug!("closed connection to {}:{}", self.host, self.port);
        }
        self.closed = true;
    }

    fn connect_tcp(&self) -> Result<TcpStream, TransportError> {
        let address = format!("{}:{}", self.host, self.port);
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| TransportError::Dns {
                host: self.host.clone(),
            })?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::Dns {
                host: self.host.clone(),
            });
        }
        let mut last_error = io::Error::from(io::ErrorKind::AddrNotAvailable);
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = error,
            }
        }
        Err(classify_connect_error(last_error, &address))
    }

    fn handshake(
        &self,
        policy: &TlsPolicy,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, TransportError> {
        let connector = policy.connector()?;
        connector
            .connect(&self.host, stream)
            .map_err(|error| classify_handshake_error(&error.to_string()))
    }

    /// `Host` header value; the port is omitted when it is the scheme
    /// default.
    fn host_header(&self) -> String {
        let default_port = if self.tls.is_some() { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn classify_connect_error(error: io::Error, address: &str) -> TransportError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => TransportError::Refused {
            address: address.to_string(),
        },
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::TimedOut {
            address: address.to_string(),
        },
        _ => TransportError::Io(error),
    }
}

/// Certificate failures are recognised by message because the TLS backend
/// reports them as a generic handshake error.
fn classify_handshake_error(detail: &str) -> TransportError {
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("certificate") {
        TransportError::CertificateVerification {
            detail: detail.to_string(),
        }
    } else {
        TransportError::Tls {
            detail: detail.to_string(),
        }
    }
}

/// Parse every certificate in a PEM bundle.
fn load_ca_bundle(path: &Path) -> Result<Vec<Certificate>, TransportError> {
    let bundle_error = |detail: String| TransportError::CaBundle {
        path: path.to_path_buf(),
        detail,
    };
    let pem = std::fs::read(path).map_err(|error| bundle_error(error.to_string()))?;
    let mut certificates = Vec::new();
    for block in split_pem_blocks(&pem) {
        certificates
            .push(Certificate::from_pem(block).map_err(|error| bundle_error(error.to_string()))?);
    }
    if certificates.is_empty() {
        return Err(bundle_error("no certificates found".to_string()));
    }
    Ok(certificates)
}

/// Split a PEM file into one slice per `-----BEGIN` block.
fn split_pem_blocks(pem: &[u8]) -> Vec<&[u8]> {
    const BEGIN: &[u8] = b"-----BEGIN";
    let mut starts = Vec::new();
    let mut offset = 0;
    while let Some(found) = find_subslice(&pem[offset..], BEGIN) {
        starts.push(offset + found);
        offset += found + BEGIN.len();
    }
    let mut blocks = Vec::with_capacity(starts.len());
    for (index, &start) in starts.iter().enumerate() {
        let end = starts.get(index + 1).copied().unwrap_or(pem.len());
        blocks.push(&pem[start..end]);
    }
    blocks
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
