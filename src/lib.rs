//! Upload core for a host-resident telemetry agent.
//!
//! Event records produced elsewhere in the agent are batched into
//! size-bounded [`AddEventsRequest`] bodies and shipped to the ingestion
//! endpoint by a [`ClientSession`]. The session owns one connection at a
//! time, classifies every outcome as a [`SendStatus`] and, after any
//! failure, refuses to reconnect for a fixed cooldown so a struggling
//! server is not hammered. Event timestamps come from a process-wide
//! [`TimestampGenerator`] that never repeats or regresses, preserving event
//! order across sessions.
//!
//! Building a request is independent of any session:
//!
//! ```
//! use telemetry_uplink::{AddEventsRequest, DEFAULT_MAX_REQUEST_SIZE, JsonMap};
//! # fn main() -> Result<(), telemetry_uplink::RequestError> {
//! let mut base = JsonMap::new();
//! base.insert("token".into(), "an-api-key".into());
//! let mut request = AddEventsRequest::new(base, DEFAULT_MAX_REQUEST_SIZE)?;
//!
//! let mut event = JsonMap::new();
//! event.insert("message".into(), "agent started".into());
//! assert!(request.add_event(&event, None)?);
//! assert!(request.payload()?.starts_with(b"{"));
//! # Ok(())
//! # }
//! ```
//!
//! A session ties requests to an endpoint and an API key:
//!
//! ```no_run
//! use telemetry_uplink::{ClientSession, DEFAULT_MAX_REQUEST_SIZE, SessionConfig};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::new("https://ingest.example.com", "an-api-key")
//!     .with_agent_version("2.1.4");
//! let mut session = ClientSession::new(config)?;
//! let mut request = session.new_request(None, DEFAULT_MAX_REQUEST_SIZE)?;
//! let result = session.send(&mut request)?;
//! println!("upload finished with status {}", result.status);
//! # Ok(())
//! # }
//! ```

pub mod request;
pub mod session;
pub mod timestamp;
pub mod transport;

pub use request::{
    AddEventsRequest, DEFAULT_MAX_REQUEST_SIZE, JsonMap, Position, RequestError, ThreadDescriptor,
};
pub use session::{
    ClientSession, DEFAULT_REQUEST_TIMEOUT, InvalidServerAddress, SendResult, SendStatus,
    ServerAddress, SessionConfig, SessionStats,
};
pub use timestamp::TimestampGenerator;
pub use transport::{HttpResponse, TlsPolicy, TransportConnection, TransportError};
