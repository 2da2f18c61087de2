//! Blocking HTTP(S) transport owned by a client session.
//!
//! A [`TransportConnection`] wraps one TCP stream, optionally inside TLS,
//! with a single deadline applied to name resolution, connect, handshake and
//! every read or write. Connect failures are classified so the session can
//! log DNS, refusal, timeout and certificate problems distinctly. A closed
//! connection is never reusable; the session creates a fresh one when it
//! reconnects.

mod connection;
mod http;


pub use connection::{TlsPolicy, TransportConnection, TransportError};
pub use http::HttpResponse;
