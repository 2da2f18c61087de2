use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL_SAFE};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use serde_json::Value;

use crate::request::{AddEventsRequest, DEFAULT_MAX_REQUEST_SIZE, JsonMap, RequestError};
use crate::timestamp::TimestampGenerator;
use crate::transport::{TlsPolicy, TransportConnection, TransportError};

use super::address::{InvalidServerAddress, ServerAddress};
use super::config::SessionConfig;
use super::status::{SendResult, SendStatus};
use super::throttle::WarningThrottle;
use super::user_agent;

pub type SecondsProvider = Box<dyn Fn() -> f64 + Send + Sync>;

const ADD_EVENTS_PATH: &str = "/addEvents";

/// Seconds a session refuses to reconnect after its connection closed.
const RECONNECT_COOLDOWN_SECS: f64 = 30.0;

/// Seconds between warnings that certificate verification is off.
const TLS_WARNING_INTERVAL_SECS: f64 = 86_400.0;

/// Longest server response excerpt quoted in a log line.
const MAX_LOGGED_RESPONSE: usize = 1_000;

/// Lifetime counters for one session. All values only ever grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub requests_sent: u64,
    pub requests_failed: u64,
    pub request_bytes_sent: u64,
    pub response_bytes_received: u64,
    /// Wall-clock time spent inside send attempts, accumulated.
    pub request_latency: Duration,
    pub connections_created: u64,
}

/// One upload session against an ingestion endpoint.
///
/// A session owns at most one [`TransportConnection`] at a time. Successful
/// sends keep the connection open for reuse; any failure closes it and arms
/// a reconnect cooldown during which sends return
/// [`SendStatus::ConnectionClosed`] without touching the network, so a
/// struggling server is not hammered by the upload loop's cadence.
///
/// All network and server failures come back as [`SendStatus`] values.
/// `Err` is reserved for misuse, such as sending a request that was already
/// closed.
pub struct ClientSession {
    address: ServerAddress,
    api_key: String,
    session_id: String,
    headers: Vec<(String, String)>,
    request_timeout: Duration,
    ca_file: Option<PathBuf>,
    connection: Option<TransportConnection>,
    last_success: Option<f64>,
    last_connection_close: Option<f64>,
    stats: SessionStats,
    timestamps: Arc<TimestampGenerator>,
    clock: SecondsProvider,
    tls_warning: WarningThrottle,
}

impl ClientSession {
    /// Create a session with its own timestamp generator and the system
    /// clock.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidServerAddress`] when the configured URL does not
    /// parse as `http(s)://host[:port]`.
    pub fn new(config: SessionConfig) -> Result<Self, InvalidServerAddress> {
        Self::with_timestamps(config, Arc::new(TimestampGenerator::new()))
    }

    /// Create a session stamping events from a shared timestamp generator.
    pub fn with_timestamps(
        config: SessionConfig,
        timestamps: Arc<TimestampGenerator>,
    ) -> Result<Self, InvalidServerAddress> {
        Self::with_clock(config, timestamps, Box::new(system_seconds_provider))
    }

    /// Create a session with a custom wall clock.
    pub fn with_clock(
        config: SessionConfig,
        timestamps: Arc<TimestampGenerator>,
        clock: SecondsProvider,
    ) -> Result<Self, InvalidServerAddress> {
        let address = ServerAddress::parse(&config.server_url)?;
        let verifying = address.is_https() && config.ca_file.is_some();
        let user_agent = user_agent::build(&config.agent_version, verifying);
        if !config.quiet {
            info!("using {address} as the telemetry upload endpoint");
        }
        Ok(Self {
            address,
            api_key: config.api_key,
            session_id: generate_session_id(),
            headers: vec![
                ("Connection".to_string(), "keep-alive".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
                ("User-Agent".to_string(), user_agent),
            ],
            request_timeout: config.request_timeout,
            ca_file: config.ca_file,
            connection: None,
            last_success: None,
            last_connection_close: None,
            stats: SessionStats::default(),
            timestamps,
            clock,
            tls_warning: WarningThrottle::new(TLS_WARNING_INTERVAL_SECS),
        })
    }

    /// Start a request bound to this session's identity.
    ///
    /// The base fields carry the API token and session id, plus
    /// `sessionInfo` when given; events and threads are appended by the
    /// caller and share the session's timestamp generator. The client time
    /// starts from the session's clock and is re-stamped on every send.
    pub fn new_request(
        &self,
        session_info: Option<&JsonMap>,
        max_size: usize,
    ) -> Result<AddEventsRequest, RequestError> {
        let mut base_fields = JsonMap::new();
        base_fields.insert("token".to_string(), Value::String(self.api_key.clone()));
        base_fields.insert(
            "session".to_string(),
            Value::String(self.session_id.clone()),
        );
        if let Some(info) = session_info {
            base_fields.insert("sessionInfo".to_string(), Value::Object(info.clone()));
        }
        let mut request =
            AddEventsRequest::with_timestamps(base_fields, max_size, Arc::clone(&self.timestamps))?;
        request.set_client_time((self.clock)() as i64)?;
        Ok(request)
    }

    /// Upload one request and classify the outcome.
    ///
    /// Within the reconnect cooldown this returns
    /// [`SendStatus::ConnectionClosed`] immediately, with no network
    /// activity and no counter movement. Otherwise the client time is
    /// stamped, the connection is opened if needed, and the response body
    /// decides the status; any non-success closes the connection and starts
    /// the cooldown.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Closed`] when `request` was already closed.
    /// Failures on the wire are never `Err`; they come back as the result's
    /// [`SendStatus`].
    pub fn send(&mut self, request: &mut AddEventsRequest) -> Result<SendResult, RequestError> {
        let now = (self.clock)();
        if let Some(closed_at) = self.last_connection_close
            && now - closed_at < RECONNECT_COOLDOWN_SECS
        {
            debug!(
                "withholding the request to {}; reconnect cooldown has {:.1}s left",
                self.address,
                RECONNECT_COOLDOWN_SECS - (now - closed_at)
            );
            return Ok(SendResult {
                status: SendStatus::ConnectionClosed,
                bytes_sent: 0,
                response: String::new(),
            });
        }
        request.set_client_time(now as i64)?;

        self.stats.requests_sent += 1;
        if self.address.is_https() && self.ca_file.is_none() && self.tls_warning.should_emit(now) {
            warn!(
                "certificate verification is disabled for {}; traffic is encrypted \
                 but the server's identity is not checked",
                self.address
            );
        }
        let started = Instant::now();
        let (status, bytes_sent, response) = self.dispatch(request, now)?;
        self.stats.request_latency += started.elapsed();
        self.stats.response_bytes_received += response.len() as u64;
        if !status.is_success() {
            self.stats.requests_failed += 1;
            self.close_connection(now);
        }
        Ok(SendResult {
            status,
            bytes_sent,
            response,
        })
    }

    /// Send an empty request to verify the address, key and connectivity.
    pub fn ping(&mut self) -> Result<SendStatus, RequestError> {
        let mut request = self.new_request(None, DEFAULT_MAX_REQUEST_SIZE)?;
        Ok(self.send(&mut request)?.status)
    }

    /// Close the connection, if one is open.
    ///
    /// The next send waits out the reconnect cooldown first, exactly as
    /// after a failed request.
    pub fn close(&mut self) {
        if self.connection.is_some() {
            let now = (self.clock)();
            self.close_connection(now);
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_address(&self) -> &ServerAddress {
        &self.address
    }

    /// Epoch seconds of the last parseable server response, if any.
    pub fn last_success(&self) -> Option<f64> {
        self.last_success
    }

    fn dispatch(
        &mut self,
        request: &mut AddEventsRequest,
        now: f64,
    ) -> Result<(SendStatus, usize, String), RequestError> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => match self.open_connection() {
                Ok(connection) => connection,
                Err(error) => {
                    self.log_connect_failure(&error);
                    return Ok((SendStatus::ConnectionFailed, 0, String::new()));
                }
            },
        };
        let connection = self.connection.insert(connection);

        let payload = request.payload()?;
        let payload_len = payload.len();
        self.stats.request_bytes_sent += payload_len as u64;
        trace!(
            "sending POST {ADD_EVENTS_PATH} ({payload_len} bytes): {}",
            String::from_utf8_lossy(payload)
        );
        match connection.request("POST", ADD_EVENTS_PATH, &self.headers, payload) {
            Ok(response) => {
                let text = response.body_text();
                trace!("response from {}: {text}", self.address);
                Ok(self.classify_response(now, text, payload_len))
            }
            Err(error) => {
                error!("request to {} failed: {error}", self.address);
                Ok((SendStatus::RequestFailed, payload_len, String::new()))
            }
        }
    }

    /// Dial the endpoint and count the connection once it is established.
    fn open_connection(&mut self) -> Result<TransportConnection, TransportError> {
        let mut connection = TransportConnection::new(
            self.address.host(),
            self.address.port(),
            self.tls_policy(),
            self.request_timeout,
        );
        connection.connect()?;
        self.stats.connections_created += 1;
        Ok(connection)
    }

    /// Decide the send status from the response body alone.
    ///
    /// The HTTP status code is deliberately ignored; the endpoint reports
    /// everything through the body's `status` field.
    fn classify_response(
        &mut self,
        now: f64,
        text: String,
        bytes_sent: usize,
    ) -> (SendStatus, usize, String) {
        if text.is_empty() {
            error!("received an empty response from {}", self.address);
            return (SendStatus::EmptyResponse, bytes_sent, text);
        }
        let parsed: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(error) => {
                error!(
                    "failed to parse the response from {}: {error} (response: {})",
                    self.address,
                    sanitise_for_log(&text)
                );
                return (SendStatus::ParseResponseFailed, bytes_sent, text);
            }
        };
        self.last_success = Some(now);
        let status = match parsed.get("status") {
            None => {
                error!(
                    "response from {} carried no status field (response: {})",
                    self.address,
                    sanitise_for_log(&text)
                );
                SendStatus::UnknownError
            }
            Some(Value::String(code)) if code == "success" => SendStatus::Success,
            Some(Value::String(code)) => {
                self.log_server_error(code, &text);
                SendStatus::ServerError(code.clone())
            }
            Some(other) => {
                let code = other.to_string();
                self.log_server_error(&code, &text);
                SendStatus::ServerError(code)
            }
        };
        (status, bytes_sent, text)
    }

    fn log_server_error(&self, code: &str, response: &str) {
        if code.starts_with("error/client/badParam") {
            error!(
                "{} rejected the request as a bad parameter; the API key is \
                 most likely wrong (status {code})",
                self.address
            );
        } else {
            error!(
                "{} declined the request with status {code} (response: {})",
                self.address,
                sanitise_for_log(response)
            );
        }
    }

    fn log_connect_failure(&self, error: &TransportError) {
        match error {
            TransportError::Dns { .. } => {
                error!("cannot resolve the server address {}: {error}", self.address);
            }
            TransportError::Refused { .. } => {
                error!(
                    "connection to {} was refused; is the address correct?",
                    self.address
                );
            }
            TransportError::TimedOut { .. } => {
                error!("timed out connecting to {}", self.address);
            }
            TransportError::CertificateVerification { .. } => {
                error!(
                    "certificate verification failed for {}: {error}; check the \
                     configured CA bundle",
                    self.address
                );
            }
            TransportError::Tls { .. } | TransportError::CaBundle { .. } => {
                error!("TLS failure connecting to {}: {error}", self.address);
            }
            _ => {
                error!("failed to connect to {}: {error}", self.address);
            }
        }
    }

    /// Drop the live connection, if any, and arm the reconnect cooldown.
    fn close_connection(&mut self, now: f64) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.last_connection_close = Some(now);
    }

    fn tls_policy(&self) -> Option<TlsPolicy> {
        self.address.is_https().then(|| TlsPolicy {
            ca_bundle: self.ca_file.clone(),
        })
    }
}

/// Returns the current time in seconds since the UNIX epoch.
///
/// Returns 0 if the system clock is before the UNIX epoch.
pub fn system_seconds_provider() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes[..]);
    BASE64_URL_SAFE.encode(bytes)
}

/// Flatten and bound a server response for quoting in one log line.
fn sanitise_for_log(response: &str) -> String {
    let mut flat: String = response
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.len() > MAX_LOGGED_RESPONSE {
        let mut end = MAX_LOGGED_RESPONSE;
        while !flat.is_char_boundary(end) {
            end -= 1;
        }
        flat.truncate(end);
        flat.push_str("...");
    }
    flat
}
